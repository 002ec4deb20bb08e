//! Request dispatch.
//!
//! Looks up the requested method, resolves which calling form to use from the
//! method's declared arity and the dispatch policy, and runs the handler on
//! the blocking pool so a slow or panicking handler only affects its own
//! connection.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::methods::{Arity, MethodRegistry};
use super::protocol::{self, Request, Response, WireFormat};

/// How strictly parameter presence is matched against handler arity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DispatchPolicy {
    /// Parameters sent to a no-params handler are dropped and the handler
    /// is called bare.
    #[default]
    Lenient,
    /// Parameters sent to a no-params handler are rejected.
    Strict,
}

/// The calling form chosen for a request.
#[derive(Debug, Clone, PartialEq)]
enum Call {
    Bare,
    WithParams(serde_json::Value),
    Reject(Response),
}

/// Shared, read-only dispatcher. Cloned into every connection worker via `Arc`.
pub struct Dispatcher {
    registry: Arc<MethodRegistry>,
    policy: DispatchPolicy,
}

impl Dispatcher {
    pub fn new(registry: MethodRegistry, policy: DispatchPolicy) -> Self {
        Self {
            registry: Arc::new(registry),
            policy,
        }
    }

    pub fn policy(&self) -> DispatchPolicy {
        self.policy
    }

    pub fn registry(&self) -> &MethodRegistry {
        &self.registry
    }

    /// Parse raw request bytes and dispatch them. Parse failures become
    /// error responses.
    pub async fn handle_raw(&self, format: WireFormat, raw: &[u8]) -> Response {
        match protocol::parse(format, raw) {
            Ok(request) => self.dispatch(request).await,
            Err(e) => {
                warn!(error = %e, "Rejected request");
                e.into()
            }
        }
    }

    /// Dispatch a parsed request and return the response to write back.
    pub async fn dispatch(&self, request: Request) -> Response {
        let Some(method) = self.registry.lookup(&request.method) else {
            debug!(method = %request.method, "Method not defined");
            return Response::method_not_defined();
        };

        let call = self.resolve(method.arity(), &request);
        let params = match call {
            Call::Reject(response) => {
                debug!(method = %request.method, "Params do not fit method arity");
                return response;
            }
            Call::Bare => None,
            Call::WithParams(params) => Some(params),
        };

        let method = method.clone();
        let name = request.method;
        debug!(method = %name, with_params = params.is_some(), "Invoking method");

        match tokio::task::spawn_blocking(move || method.invoke(params)).await {
            Ok(Ok(data)) => Response::success(data),
            Ok(Err(e)) => {
                warn!(method = %name, error = %e, "Method failed");
                Response::error(e.to_string())
            }
            Err(e) => {
                error!(method = %name, error = %e, "Method panicked");
                Response::internal_error()
            }
        }
    }

    fn resolve(&self, arity: Arity, request: &Request) -> Call {
        let supplied = request.has_params();
        match (arity, supplied) {
            (Arity::Required | Arity::Optional, true) => {
                Call::WithParams(request.params.clone().unwrap_or_default())
            }
            (Arity::Required, false) => Call::Reject(Response::expected_params()),
            (Arity::Optional, false) => Call::Bare,
            (Arity::None, false) => Call::Bare,
            (Arity::None, true) => match self.policy {
                DispatchPolicy::Lenient => Call::Bare,
                DispatchPolicy::Strict => Call::Reject(Response::unexpected_params()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::methods::Method;
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry() -> MethodRegistry {
        MethodRegistry::new()
            .route("hello", Method::no_params(|| Ok("hello, world!")))
            .and_then(|r| r.route("echo", Method::with_params(Ok)))
            .and_then(|r| {
                r.route(
                    "myfunc",
                    Method::optional_params(|p: Option<Value>| {
                        Ok(format!("args={}", p.unwrap_or(Value::Null)))
                    }),
                )
            })
            .and_then(|r| {
                r.route(
                    "fail",
                    Method::no_params(|| -> anyhow::Result<()> { anyhow::bail!("boom") }),
                )
            })
            .and_then(|r| {
                r.route(
                    "panic",
                    Method::no_params(|| -> anyhow::Result<()> { panic!("handler bug") }),
                )
            })
            .unwrap()
    }

    fn lenient() -> Dispatcher {
        Dispatcher::new(registry(), DispatchPolicy::Lenient)
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let d = lenient();
        for params in [None, Some(json!(["a"])), Some(json!({"k": 1}))] {
            let resp = d.dispatch(Request::new("nope", params)).await;
            assert_eq!(resp, Response::error("method not defined"));
        }
    }

    #[tokio::test]
    async fn test_echo_returns_params() {
        let resp = lenient()
            .dispatch(Request::new("echo", Some(json!(["hello", "world"]))))
            .await;
        assert_eq!(resp, Response::success(json!(["hello", "world"])));
    }

    #[tokio::test]
    async fn test_required_params_missing() {
        let d = lenient();
        assert_eq!(
            d.dispatch(Request::new("echo", None)).await,
            Response::error("method expected params")
        );
        assert_eq!(
            d.dispatch(Request::new("echo", Some(json!([])))).await,
            Response::error("method expected params")
        );
    }

    #[tokio::test]
    async fn test_lenient_drops_extra_params() {
        let resp = lenient()
            .dispatch(Request::new("hello", Some(json!(["unused"]))))
            .await;
        assert_eq!(resp, Response::success(json!("hello, world!")));
    }

    #[tokio::test]
    async fn test_strict_rejects_extra_params() {
        let d = Dispatcher::new(registry(), DispatchPolicy::Strict);
        assert_eq!(
            d.dispatch(Request::new("hello", Some(json!(["unused"])))).await,
            Response::error("method takes no params")
        );
        assert!(d.dispatch(Request::new("hello", None)).await.is_success());
    }

    #[tokio::test]
    async fn test_optional_params() {
        let d = lenient();
        assert_eq!(
            d.dispatch(Request::new("myfunc", None)).await.data,
            json!("args=null")
        );
        assert_eq!(
            d.dispatch(Request::new("myfunc", Some(json!(["a"])))).await.data,
            json!(r#"args=["a"]"#)
        );
    }

    #[tokio::test]
    async fn test_handler_error_becomes_response() {
        assert_eq!(
            lenient().dispatch(Request::new("fail", None)).await,
            Response::error("boom")
        );
    }

    #[tokio::test]
    async fn test_handler_panic_is_contained() {
        let d = lenient();
        assert_eq!(
            d.dispatch(Request::new("panic", None)).await,
            Response::error("internal error")
        );
        // The dispatcher keeps working afterwards.
        assert!(d.dispatch(Request::new("hello", None)).await.is_success());
    }

    #[tokio::test]
    async fn test_invokes_exactly_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let registry = MethodRegistry::new()
            .route(
                "count",
                Method::optional_params(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .unwrap();
        let d = Dispatcher::new(registry, DispatchPolicy::Lenient);

        d.dispatch(Request::new("count", Some(json!(["x"])))).await;
        d.dispatch(Request::new("count", None)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_handle_raw_parse_failures() {
        let d = lenient();
        assert_eq!(
            d.handle_raw(WireFormat::Json, b"{not json").await,
            Response::error("invalid json request")
        );
        assert_eq!(
            d.handle_raw(WireFormat::Tokens, b"\n").await,
            Response::error("empty request")
        );
        assert_eq!(
            d.handle_raw(WireFormat::Tokens, b"echo hello world\n").await,
            Response::success(json!(["hello", "world"]))
        );
    }
}
