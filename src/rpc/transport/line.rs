//! Raw TCP transport with line framing.
//!
//! Each accepted connection gets its own task. Requests on a connection are
//! strictly sequential: the next request is not parsed until the previous
//! response has been written.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, info, info_span};
use uuid::Uuid;

use super::{Acceptor, ConnectionError, ConnectionSettings, Transport};
use crate::rpc::dispatch::Dispatcher;
use crate::rpc::protocol::Response;

/// Size of a single socket read. A read shorter than this with no newline
/// in it ends the current message.
const READ_CHUNK: usize = 1024;

pub struct LineTransport {
    settings: ConnectionSettings,
}

impl LineTransport {
    pub fn new(settings: ConnectionSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Transport for LineTransport {
    fn name(&self) -> &'static str {
        "line"
    }

    async fn serve(
        &self,
        listener: Box<dyn Acceptor>,
        dispatcher: Arc<Dispatcher>,
        workers: TaskTracker,
    ) -> io::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let dispatcher = Arc::clone(&dispatcher);
            let settings = self.settings;
            let span = info_span!("conn", %peer, conn_id = %Uuid::now_v7());

            workers.spawn(
                async move {
                    info!("Connection from {}", peer);
                    let (reader, writer) = stream.into_split();
                    let result = run_connection(reader, writer, settings, &dispatcher).await;
                    log_connection_end(peer, result);
                }
                .instrument(span),
            );
        }
    }
}

fn log_connection_end(peer: SocketAddr, result: Result<(), ConnectionError>) {
    match result {
        Ok(()) => debug!(peer = %peer, "Client disconnected"),
        Err(ConnectionError::IdleTimeout(after)) => {
            debug!(peer = %peer, idle = ?after, "Closing idle connection")
        }
        Err(e) => debug!(peer = %peer, error = %e, "Connection error"),
    }
}

/// Serve one connection until the peer closes, a read fails or times out.
/// The writer is shut down on every exit path.
pub(crate) async fn run_connection<R, W>(
    reader: R,
    mut writer: W,
    settings: ConnectionSettings,
    dispatcher: &Dispatcher,
) -> Result<(), ConnectionError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut frames = FrameReader::new(reader, settings);
    let result = exchange(&mut frames, &mut writer, settings, dispatcher).await;
    let _ = writer.shutdown().await;
    result
}

async fn exchange<R, W>(
    frames: &mut FrameReader<R>,
    writer: &mut W,
    settings: ConnectionSettings,
    dispatcher: &Dispatcher,
) -> Result<(), ConnectionError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = match frames.next_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()),
            Err(e @ ConnectionError::TooLarge { .. }) => {
                write_response(writer, &Response::too_large()).await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let response = dispatcher.handle_raw(settings.format, &frame).await;
        write_response(writer, &response).await?;
    }
}

async fn write_response<W: AsyncWrite + Unpin>(writer: &mut W, response: &Response) -> io::Result<()> {
    let mut line = response.to_json();
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

/// Splits an inbound byte stream into request messages.
///
/// A message ends at `\n`, or at a short read when no newline has arrived.
/// Bytes after a newline stay buffered for the next message. If the read
/// that delivered them was short, they form a message of their own.
struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
    settings: ConnectionSettings,
    last_read_short: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    fn new(inner: R, settings: ConnectionSettings) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            settings,
            last_read_short: false,
        }
    }

    /// Next message, or `None` once the peer has closed with nothing pending.
    async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, ConnectionError> {
        let max = self.settings.max_request_bytes;
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                if pos > max {
                    return Err(ConnectionError::TooLarge { max });
                }
                let frame = self.buf.drain(..=pos).collect();
                return Ok(Some(frame));
            }
            if self.buf.len() > max {
                return Err(ConnectionError::TooLarge { max });
            }
            if self.last_read_short && !self.buf.is_empty() {
                return Ok(Some(std::mem::take(&mut self.buf)));
            }

            let n = timeout(self.settings.idle_timeout, self.inner.read(&mut chunk))
                .await
                .map_err(|_| ConnectionError::IdleTimeout(self.settings.idle_timeout))??;

            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(std::mem::take(&mut self.buf)));
            }

            self.buf.extend_from_slice(&chunk[..n]);
            self.last_read_short = n < READ_CHUNK;
        }
    }
}
