//! Request/response types and the request parser.
//!
//! Requests arrive in one of two wire shapes:
//!
//! - token lines: `<method> <param1> <param2> ...`
//! - JSON objects: `{"method": <string>, "params": <any>}`
//!
//! Every response has the same shape on every transport:
//! `{"error": 0|1, "data": <any>}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Error flag for a successful response.
pub const OK: u8 = 0;
/// Error flag for a failed response.
pub const FAILED: u8 = 1;

/// How raw request bytes are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// Space-separated tokens; the first is the method name.
    #[default]
    Tokens,
    /// A single JSON object with `method` and optional `params`.
    Json,
}

/// A parsed request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Method name to invoke
    pub method: String,
    /// Optional parameters (token list or arbitrary JSON)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Response object written back for every request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// 0 on success, 1 on failure
    pub error: u8,
    /// Handler result on success, error description on failure
    pub data: Value,
}

/// Reasons raw bytes could not be turned into a [`Request`].
///
/// The `Display` text is what the client sees in `data`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty request")]
    Empty,
    #[error("invalid utf-8 request")]
    InvalidUtf8,
    #[error("invalid json request")]
    InvalidJson,
    #[error("request lacks method")]
    MissingMethod,
    #[error("invalid request")]
    InvalidRequest,
}

impl Request {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }

    /// Whether the caller actually supplied parameters.
    ///
    /// `null`, `[]`, `{}` and `""` count as absent.
    pub fn has_params(&self) -> bool {
        match &self.params {
            None | Some(Value::Null) => false,
            Some(Value::Array(items)) => !items.is_empty(),
            Some(Value::Object(map)) => !map.is_empty(),
            Some(Value::String(s)) => !s.is_empty(),
            Some(_) => true,
        }
    }
}

impl Response {
    /// Create a success response carrying the handler's result.
    pub fn success(data: Value) -> Self {
        Self { error: OK, data }
    }

    /// Create an error response with a human-readable description.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: FAILED,
            data: Value::String(message.into()),
        }
    }

    pub fn method_not_defined() -> Self {
        Self::error("method not defined")
    }

    pub fn expected_params() -> Self {
        Self::error("method expected params")
    }

    pub fn unexpected_params() -> Self {
        Self::error("method takes no params")
    }

    pub fn internal_error() -> Self {
        Self::error("internal error")
    }

    pub fn too_large() -> Self {
        Self::error("request too large")
    }

    pub fn is_success(&self) -> bool {
        self.error == OK
    }

    /// Serialize to compact JSON.
    ///
    /// Compact JSON never contains a raw newline, so the result is safe to
    /// frame with `\n`.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"error":1,"data":"internal error"}"#.to_string()
        })
    }
}

impl From<ParseError> for Response {
    fn from(err: ParseError) -> Self {
        Response::error(err.to_string())
    }
}

/// Parse raw request bytes according to `format`.
pub fn parse(format: WireFormat, raw: &[u8]) -> Result<Request, ParseError> {
    let text = std::str::from_utf8(raw).map_err(|_| ParseError::InvalidUtf8)?;
    match format {
        WireFormat::Tokens => parse_tokens(text),
        WireFormat::Json => parse_json(text),
    }
}

/// Parse a token line. Tokens are split on single spaces and passed on
/// verbatim, so `a  b` yields an empty middle token.
pub fn parse_tokens(text: &str) -> Result<Request, ParseError> {
    let line = text.trim();
    if line.is_empty() {
        return Err(ParseError::Empty);
    }

    let mut tokens = line.split(' ');
    let method = tokens.next().unwrap_or_default().to_string();
    let params: Vec<Value> = tokens.map(|t| Value::String(t.to_string())).collect();

    Ok(Request {
        method,
        params: Some(Value::Array(params)),
    })
}

/// Parse a JSON request object. A missing `params` key is tolerated.
pub fn parse_json(text: &str) -> Result<Request, ParseError> {
    let value: Value = serde_json::from_str(text).map_err(|_| ParseError::InvalidJson)?;

    let Value::Object(mut object) = value else {
        return Err(ParseError::InvalidRequest);
    };

    let method = match object.remove("method") {
        None => return Err(ParseError::MissingMethod),
        Some(Value::String(method)) => method,
        Some(_) => return Err(ParseError::InvalidRequest),
    };

    let params = match object.remove("params") {
        None | Some(Value::Null) => None,
        Some(params) => Some(params),
    };

    Ok(Request { method, params })
}
