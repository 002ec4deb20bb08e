//! Server configuration.
//!
//! Layered with figment, lowest priority first: built-in defaults, a TOML
//! file, `MURLOC_*` environment variables, then CLI overrides.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::rpc::{DispatchPolicy, WireFormat};

/// Config file picked up from the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "murloc.toml";
const ENV_PREFIX: &str = "MURLOC_";

/// Logging verbosity mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Default,
    Debug,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Debug => "debug",
        }
    }
}

/// Which front-end the server speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Newline-terminated requests over raw TCP
    #[default]
    Line,
    /// JSON request bodies over HTTP
    Http,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub version: String,
    pub host: String,
    pub port: u16,
    pub name: String,
    pub mode: Mode,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logfile: Option<PathBuf>,
    pub log_json: bool,
    pub transport: TransportKind,
    pub line_format: WireFormat,
    pub idle_timeout_secs: u64,
    pub max_request_bytes: usize,
    pub dispatch: DispatchPolicy,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            host: "127.0.0.1".to_string(),
            port: 8048,
            name: "murloc".to_string(),
            mode: Mode::Default,
            url: "https://github.com/chrisvarga/murloc".to_string(),
            logfile: None,
            log_json: false,
            transport: TransportKind::Line,
            line_format: WireFormat::Tokens,
            idle_timeout_secs: 10,
            max_request_bytes: 1024 * 1024,
            dispatch: DispatchPolicy::Lenient,
        }
    }
}

impl ServerConfig {
    /// Load the layered configuration.
    ///
    /// `file` defaults to [`DEFAULT_CONFIG_FILE`]; a missing file is not an
    /// error. `overrides` should skip unset fields so they do not mask lower
    /// layers.
    pub fn load<T: Serialize>(file: Option<&Path>, overrides: Option<&T>) -> Result<Self, ConfigError> {
        let file = file.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        let mut figment = Figment::from(Serialized::defaults(ServerConfig::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        let config: ServerConfig = figment.extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("name must not be empty".into()));
        }
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("host must not be empty".into()));
        }
        if self.idle_timeout_secs == 0 {
            return Err(ConfigError::Invalid("idle_timeout_secs must be positive".into()));
        }
        if self.max_request_bytes == 0 {
            return Err(ConfigError::Invalid("max_request_bytes must be positive".into()));
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn is_debug(&self) -> bool {
        self.mode == Mode::Debug
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}
