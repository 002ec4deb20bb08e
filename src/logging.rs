//! Logging and tracing initialization.
//!
//! Structured logging via the `tracing` ecosystem. Default mode prints terse
//! lines stamped with time and pid; debug mode adds targets and source locations. Output
//! goes to stdout unless a log file is configured.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::Level;
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{
        self,
        format::{FmtSpan, Writer},
        time::{FormatTime, SystemTime},
    },
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::config::ServerConfig;

/// Configuration for the logging system.
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// Output logs as JSON (for machine parsing)
    pub json: bool,
    /// DEBUG level plus targets and file:line on every event
    pub verbose: bool,
    /// Append to this file instead of stdout
    pub logfile: Option<PathBuf>,
}

impl From<&ServerConfig> for LogConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            json: config.log_json,
            verbose: config.is_debug(),
            logfile: config.logfile.clone(),
        }
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Timestamp followed by the process id, e.g. `2026-10-19T09:12:03.120Z [4711]`.
#[derive(Debug, Clone, Copy)]
struct TimeAndPid {
    pid: u32,
}

impl TimeAndPid {
    fn new() -> Self {
        Self {
            pid: std::process::id(),
        }
    }
}

impl FormatTime for TimeAndPid {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        SystemTime.format_time(w)?;
        write!(w, " [{}]", self.pid)
    }
}

/// Initialize the tracing subscriber with the given configuration.
///
/// Call once, early in `main()`. `RUST_LOG` overrides the default level.
/// If the log file cannot be opened, logs go to stdout and a warning is
/// emitted once the subscriber is up.
pub fn init(config: LogConfig) {
    let default_level = if config.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("murloc={}", default_level.as_str().to_lowercase()))
    });

    let (file, open_error) = match config.logfile.as_deref().map(open_logfile) {
        Some(Ok(file)) => (Some(file), None),
        Some(Err(e)) => (None, Some(e)),
        None => (None, None),
    };

    let layer = build_layer(&config, file);
    tracing_subscriber::registry()
        .with(layer)
        .with(env_filter)
        .init();

    if let (Some(path), Some(e)) = (&config.logfile, open_error) {
        tracing::warn!(path = %path.display(), error = %e, "Cannot open log file, logging to stdout");
    }
}

fn open_logfile(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn build_layer(config: &LogConfig, file: Option<File>) -> BoxedLayer {
    let base = fmt::layer()
        .with_target(config.verbose)
        .with_file(config.verbose)
        .with_line_number(config.verbose)
        .with_thread_ids(false);

    match (config.json, file) {
        (true, Some(file)) => base
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
            .with_writer(Mutex::new(file))
            .boxed(),
        (true, None) => base
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
            .boxed(),
        (false, Some(file)) => base
            .with_timer(TimeAndPid::new())
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .boxed(),
        (false, None) => base.with_timer(TimeAndPid::new()).boxed(),
    }
}

/// Boot banner logged once when the server starts.
pub fn banner(config: &ServerConfig) -> String {
    format!(
        r#"
     ___
    /\  \          {name} {version}
   /::\  \
  /:/\:\  \        Running in {mode} mode
 /:/__\:\__\       Port: {port}
 \:\  /:/  /       PID:  {pid}
  \:\/:/  /
   \::/  /         {url}
    \/__/
"#,
        name = config.name,
        version = config.version,
        mode = config.mode.as_str(),
        port = config.port,
        pid = std::process::id(),
        url = config.url,
    )
}
