//! Request/response server.
//!
//! Accepts TCP connections, runs each one in its own task, and dispatches
//! every request by name to a handler from a [`MethodRegistry`].
//!
//! ## Architecture
//!
//! - `protocol`: request/response types and the request parser
//! - `methods`: method registry and handler arity
//! - `dispatch`: lookup and invocation policy
//! - `transport`: line-framed TCP and HTTP front-ends
//! - `client`: clients for both front-ends
//!
//! The registry is moved into the server at [`Server::bind`] and is read-only
//! from then on, so connection tasks share it without locking.

pub mod client;
mod dispatch;
pub mod methods;
mod protocol;
mod transport;

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::broadcast;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::logging;

pub use client::{ClientError, HttpClient, LineClient};
pub use dispatch::{DispatchPolicy, Dispatcher};
pub use methods::{Arity, HandlerResult, Method, MethodRegistry, RegistryError};
pub use protocol::{ParseError, Request, Response, WireFormat, parse, parse_json, parse_tokens};
pub use transport::{
    Acceptor, ConnectionError, ConnectionSettings, HttpTransport, LineTransport, Transport,
};

const LISTEN_BACKLOG: u32 = 128;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to resolve {host}:{port}: {source}")]
    Resolve {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("no address found for {host}:{port}")]
    NoAddress { host: String, port: u16 },
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),
}

/// Server bound to its listening socket, ready to [`run`](Server::run).
pub struct Server {
    config: ServerConfig,
    listener: Box<dyn Acceptor>,
    dispatcher: Arc<Dispatcher>,
    transport: Box<dyn Transport>,
    workers: TaskTracker,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_rx: broadcast::Receiver<()>,
}

/// Cloneable handle for observing and stopping a running server.
#[derive(Clone)]
pub struct ServerHandle {
    shutdown_tx: broadcast::Sender<()>,
    workers: TaskTracker,
}

impl ServerHandle {
    /// Stop accepting connections. In-flight connections are not drained.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Number of connections currently being served.
    pub fn active_connections(&self) -> usize {
        self.workers.len()
    }
}

impl Server {
    /// Resolve the configured address, bind with address reuse and freeze
    /// the registry.
    pub async fn bind(config: ServerConfig, registry: MethodRegistry) -> Result<Self, ServerError> {
        let addr = resolve(&config.host, config.port).await?;
        let listener = bind_listener(addr).map_err(|source| ServerError::Bind { addr, source })?;

        let dispatcher = Arc::new(Dispatcher::new(registry, config.dispatch));
        let transport = transport::for_config(&config);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        Ok(Self {
            config,
            listener: Box::new(listener),
            dispatcher,
            transport,
            workers: TaskTracker::new(),
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shutdown_tx: self.shutdown_tx.clone(),
            workers: self.workers.clone(),
        }
    }

    /// Serve until SIGINT or SIGTERM, or until [`ServerHandle::shutdown`].
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(shutdown_signal()).await
    }

    /// Serve until `shutdown` resolves or [`ServerHandle::shutdown`] is called.
    ///
    /// Returns `Err` only when accepting fails; that is fatal and not retried.
    /// On shutdown the listener is dropped immediately and in-flight
    /// connections are left to finish or be torn down with the runtime.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let Server {
            config,
            listener,
            dispatcher,
            transport,
            workers,
            shutdown_tx: _shutdown_tx,
            shutdown_rx: mut requested,
        } = self;

        info!("{}", logging::banner(&config));
        let local = listener.local_addr().map_err(ServerError::Accept)?;
        info!(
            addr = %local,
            transport = transport.name(),
            policy = ?dispatcher.policy(),
            methods = dispatcher.registry().len(),
            "Listening"
        );

        let serve = transport.serve(listener, dispatcher, workers.clone());
        let result = tokio::select! {
            result = serve => result.map_err(ServerError::Accept),
            _ = shutdown => {
                info!("Interrupt received, shutting down");
                Ok(())
            }
            _ = requested.recv() => {
                info!("Shutdown requested");
                Ok(())
            }
        };

        workers.close();
        if !workers.is_empty() {
            debug!(abandoned = workers.len(), "Leaving in-flight connections");
        }
        if let Err(e) = &result {
            error!(error = %e, "Listener stopped");
        }
        result
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, ServerError> {
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|source| ServerError::Resolve {
            host: host.to_string(),
            port,
            source,
        })?;

    addrs.next().ok_or_else(|| ServerError::NoAddress {
        host: host.to_string(),
        port,
    })
}

fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

/// Drive `future` on a fresh multi-threaded runtime, then tear the runtime
/// down without waiting for handlers still running on the blocking pool.
pub fn block_on_abandoning<F: Future>(future: F) -> io::Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let output = runtime.block_on(future);
    runtime.shutdown_background();
    Ok(output)
}

/// Resolves on SIGINT, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for interrupt signal");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for terminate signal");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
