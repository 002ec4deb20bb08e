//! Method registry.
//!
//! Maps method names to handler callables with an explicitly declared arity.
//! The registry is mutable only while the server is being set up; once it is
//! handed to [`Server::bind`](super::Server::bind) it is frozen behind an `Arc`.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Result type every handler produces.
pub type HandlerResult = anyhow::Result<Value>;

type Callable = Arc<dyn Fn(Option<Value>) -> HandlerResult + Send + Sync>;

/// How many parameter arguments a handler accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    /// `fn() -> T`
    None,
    /// `fn(params) -> T`
    Required,
    /// `fn(Option<params>) -> T`
    Optional,
}

/// A registered handler together with its arity.
#[derive(Clone)]
pub struct Method {
    arity: Arity,
    call: Callable,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("invalid method name {name:?}: names must be non-empty and contain no whitespace")]
    InvalidName { name: String },
}

fn into_value<T: Serialize>(result: anyhow::Result<T>) -> HandlerResult {
    Ok(serde_json::to_value(result?)?)
}

impl Method {
    /// Handler that never takes parameters.
    pub fn no_params<F, T>(f: F) -> Self
    where
        F: Fn() -> anyhow::Result<T> + Send + Sync + 'static,
        T: Serialize,
    {
        Self {
            arity: Arity::None,
            call: Arc::new(move |_| into_value(f())),
        }
    }

    /// Handler that requires parameters.
    pub fn with_params<F, T>(f: F) -> Self
    where
        F: Fn(Value) -> anyhow::Result<T> + Send + Sync + 'static,
        T: Serialize,
    {
        Self {
            arity: Arity::Required,
            call: Arc::new(move |params| into_value(f(params.unwrap_or(Value::Null)))),
        }
    }

    /// Handler that works with or without parameters.
    pub fn optional_params<F, T>(f: F) -> Self
    where
        F: Fn(Option<Value>) -> anyhow::Result<T> + Send + Sync + 'static,
        T: Serialize,
    {
        Self {
            arity: Arity::Optional,
            call: Arc::new(move |params| into_value(f(params))),
        }
    }

    pub fn arity(&self) -> Arity {
        self.arity
    }

    /// Invoke the handler. `params` is ignored for [`Arity::None`].
    pub fn invoke(&self, params: Option<Value>) -> HandlerResult {
        match self.arity {
            Arity::None => (self.call)(None),
            Arity::Required | Arity::Optional => (self.call)(params),
        }
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method").field("arity", &self.arity).finish()
    }
}

/// Mapping from method name to handler. Last registration wins.
#[derive(Debug, Clone, Default)]
pub struct MethodRegistry {
    methods: HashMap<String, Method>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from a name → method mapping.
    pub fn from_methods<I, S>(methods: I) -> Result<Self, RegistryError>
    where
        I: IntoIterator<Item = (S, Method)>,
        S: Into<String>,
    {
        let mut registry = Self::new();
        for (name, method) in methods {
            registry.register(name, method)?;
        }
        Ok(registry)
    }

    /// Insert or overwrite the handler for `name`.
    ///
    /// Names containing whitespace are rejected because the line protocol
    /// could never address them.
    pub fn register(&mut self, name: impl Into<String>, method: Method) -> Result<(), RegistryError> {
        let name = name.into();
        if name.is_empty() || name.chars().any(char::is_whitespace) {
            return Err(RegistryError::InvalidName { name });
        }

        debug!(method = %name, arity = ?method.arity(), "Registering method");
        if self.methods.insert(name.clone(), method).is_some() {
            debug!(method = %name, "Replaced existing method");
        }
        Ok(())
    }

    /// Chaining form of [`register`](Self::register).
    pub fn route(mut self, name: impl Into<String>, method: Method) -> Result<Self, RegistryError> {
        self.register(name, method)?;
        Ok(self)
    }

    pub fn lookup(&self, name: &str) -> Option<&Method> {
        self.methods.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}
