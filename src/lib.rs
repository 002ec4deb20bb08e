pub mod config;
pub mod logging;
pub mod rpc;

pub use config::ServerConfig;
pub use rpc::{Method, MethodRegistry, Server};
