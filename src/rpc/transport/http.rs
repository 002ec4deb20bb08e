//! HTTP transport.
//!
//! Any method on any path is treated as an RPC call: the request body is a
//! JSON request object and the reply is `200 text/plain` carrying the
//! serialized response.

use async_trait::async_trait;
use axum::{
    Router,
    body::Bytes,
    extract::{DefaultBodyLimit, State, rejection::BytesRejection},
    http::{StatusCode, header},
    response::IntoResponse,
};
use std::future::IntoFuture;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_util::task::TaskTracker;
use tokio_util::task::task_tracker::TaskTrackerToken;
use tracing::{debug, info};

use super::{Acceptor, Transport};
use crate::rpc::dispatch::Dispatcher;
use crate::rpc::protocol::{ParseError, Response, WireFormat};

pub struct HttpTransport {
    max_request_bytes: usize,
}

impl HttpTransport {
    pub fn new(max_request_bytes: usize) -> Self {
        Self { max_request_bytes }
    }
}

/// Build the router that serves RPC calls.
pub fn router(dispatcher: Arc<Dispatcher>, max_request_bytes: usize) -> Router {
    Router::new()
        .fallback(handle_rpc)
        .layer(DefaultBodyLimit::max(max_request_bytes))
        .with_state(dispatcher)
}

async fn handle_rpc(
    State(dispatcher): State<Arc<Dispatcher>>,
    body: Result<Bytes, BytesRejection>,
) -> impl IntoResponse {
    let response = match body {
        Ok(body) => dispatcher.handle_raw(WireFormat::Json, &body).await,
        Err(rejection) if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE => {
            debug!("Rejected oversized body");
            Response::too_large()
        }
        Err(rejection) => {
            debug!(error = %rejection, "Failed to read body");
            ParseError::InvalidRequest.into()
        }
    };
    ([(header::CONTENT_TYPE, "text/plain")], response.to_json())
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn serve(
        &self,
        listener: Box<dyn Acceptor>,
        dispatcher: Arc<Dispatcher>,
        workers: TaskTracker,
    ) -> io::Result<()> {
        let (failed_tx, failed_rx) = oneshot::channel();
        let listener = SupervisedListener {
            inner: listener,
            failed: Some(failed_tx),
            workers,
        };
        let app = router(dispatcher, self.max_request_bytes);

        tokio::select! {
            result = axum::serve(listener, app).into_future() => result,
            Ok(e) = failed_rx => Err(e),
        }
    }
}

/// Listener handed to axum. Accept failures are reported to the supervisor
/// instead of being retried.
struct SupervisedListener {
    inner: Box<dyn Acceptor>,
    failed: Option<oneshot::Sender<io::Error>>,
    workers: TaskTracker,
}

impl axum::serve::Listener for SupervisedListener {
    type Io = TrackedStream;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match self.inner.accept().await {
                Ok((stream, peer)) => {
                    info!("Connection from {}", peer);
                    let stream = TrackedStream {
                        inner: stream,
                        _token: self.workers.token(),
                    };
                    debug!(peer = %peer, active = self.workers.len(), "Client connected");
                    return (stream, peer);
                }
                Err(e) => {
                    if let Some(failed) = self.failed.take() {
                        let _ = failed.send(e);
                    }
                    std::future::pending::<()>().await;
                }
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.inner.local_addr()
    }
}

/// A connection axum serves on its own task. The tracker token keeps the
/// connection counted until axum drops the stream.
struct TrackedStream {
    inner: TcpStream,
    _token: TaskTrackerToken,
}

impl AsyncRead for TrackedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
