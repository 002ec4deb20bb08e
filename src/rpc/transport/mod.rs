//! Transport adapters.
//!
//! Each transport owns an accept loop over an already-bound listener and
//! spawns one worker task per accepted connection. Both front-ends feed the
//! same [`Dispatcher`].

mod http;
mod line;

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::task::TaskTracker;

use super::dispatch::Dispatcher;
use super::protocol::WireFormat;
use crate::config::{ServerConfig, TransportKind};

pub use http::HttpTransport;
pub use line::LineTransport;

/// Per-connection settings handed to every worker as plain values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub idle_timeout: Duration,
    pub max_request_bytes: usize,
    pub format: WireFormat,
}

impl From<&ServerConfig> for ConnectionSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            idle_timeout: config.idle_timeout(),
            max_request_bytes: config.max_request_bytes,
            format: config.line_format,
        }
    }
}

/// Why a single connection ended abnormally. Only ever logged.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection idle for {0:?}")]
    IdleTimeout(Duration),
    #[error("request exceeds {max} bytes")]
    TooLarge { max: usize },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Source of inbound connections for a transport.
#[async_trait]
pub trait Acceptor: Send + Sync {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl Acceptor for TcpListener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// A front-end protocol served on a bound listener.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Accept connections until accepting fails. Each connection runs in a
    /// task spawned on `workers`; this never waits for a worker to finish.
    async fn serve(
        &self,
        listener: Box<dyn Acceptor>,
        dispatcher: Arc<Dispatcher>,
        workers: TaskTracker,
    ) -> io::Result<()>;
}

/// Build the transport selected by the configuration.
pub fn for_config(config: &ServerConfig) -> Box<dyn Transport> {
    let settings = ConnectionSettings::from(config);
    match config.transport {
        TransportKind::Line => Box::new(LineTransport::new(settings)),
        TransportKind::Http => Box::new(HttpTransport::new(settings.max_request_bytes)),
    }
}
