//! Clients for both front-ends.
//!
//! [`LineClient`] keeps one TCP connection open and issues requests on it
//! sequentially. [`HttpClient`] posts JSON request bodies.

use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};

use super::protocol::{Request, Response};

/// Error returned by client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to server: {0}")]
    Connect(#[source] std::io::Error),
    #[error("communication error: {0}")]
    Io(#[from] std::io::Error),
    #[error("server closed the connection")]
    Closed,
    #[error("failed to encode or decode a message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Client for the line transport.
pub struct LineClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl LineClient {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await.map_err(ClientError::Connect)?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    /// Send one raw request line and wait for its response.
    pub async fn send_line(&mut self, line: &str) -> Result<Response, ClientError> {
        let mut request = line.trim_end_matches('\n').to_string();
        request.push('\n');
        self.writer.write_all(request.as_bytes()).await?;

        let mut response_line = String::new();
        if self.reader.read_line(&mut response_line).await? == 0 {
            return Err(ClientError::Closed);
        }
        Ok(serde_json::from_str(&response_line)?)
    }

    /// Call `method` with token parameters.
    pub async fn call(&mut self, method: &str, params: &[&str]) -> Result<Response, ClientError> {
        let mut line = method.to_string();
        for param in params {
            line.push(' ');
            line.push_str(param);
        }
        self.send_line(&line).await
    }

    /// Send a JSON request object as one line (for `line_format = "json"`).
    pub async fn call_json(&mut self, method: &str, params: Option<Value>) -> Result<Response, ClientError> {
        let line = serde_json::to_string(&Request::new(method, params))?;
        self.send_line(&line).await
    }

    /// Close the write side and wait for the server to close its side.
    pub async fn close(mut self) -> Result<(), ClientError> {
        self.writer.shutdown().await?;
        let mut rest = String::new();
        while self.reader.read_line(&mut rest).await? > 0 {}
        Ok(())
    }
}

/// Client for the HTTP transport.
pub struct HttpClient {
    url: String,
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Post a raw body and decode the response.
    pub async fn send_body(&self, body: impl Into<String>) -> Result<Response, ClientError> {
        let text = self
            .client
            .post(&self.url)
            .body(body.into())
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(serde_json::from_str(&text)?)
    }

    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Response, ClientError> {
        let body = serde_json::to_string(&Request::new(method, params))?;
        self.send_body(body).await
    }
}
