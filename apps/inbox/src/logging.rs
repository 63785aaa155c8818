//! Global tracing subscriber for the `inbox` binary.
//!
//! Events are emitted under the `inbox::*`, `backend::*` and `change_bus`
//! targets. `--log-level debug` or `trace` raises those targets only; the
//! HTTP and websocket stacks stay at `info` unless `--trace-deps` is given.
//! `INBOX_LOG_FILTER` replaces the computed directives entirely.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;

use clap::ValueEnum;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Targets used by the workspace's own events.
const WORKSPACE_TARGETS: &[&str] = &["inbox", "backend", "change_bus"];

/// Crates linked through the REST and realtime clients.
const DEPENDENCY_TARGETS: &[&str] = &[
    "reqwest",
    "hyper",
    "rustls",
    "tokio_tungstenite",
    "tungstenite",
];

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
    /// Raise the HTTP and websocket crates to `level` as well.
    pub trace_deps: bool,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid INBOX_LOG_FILTER: {0}")]
    Filter(String),
    #[error("failed to install logger: {0}")]
    Install(String),
}

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber. Once a subscriber is installed, later
/// calls return without touching it.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if GUARD.get().is_some() {
        return Ok(());
    }
    let filter = match std::env::var("INBOX_LOG_FILTER") {
        Ok(custom) => {
            EnvFilter::try_new(&custom).map_err(|err| InitError::Filter(err.to_string()))?
        }
        Err(_) => EnvFilter::new(directives(config.level, config.trace_deps)),
    };

    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.level >= LogLevel::Debug)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| InitError::Install(err.to_string()))?;

    let _ = GUARD.set(guard);
    Ok(())
}

/// Filter directives for `level`. Below `debug` the level applies to
/// everything; at `debug` and `trace` only the workspace targets (and, with
/// `trace_deps`, the linked network crates) are raised above `info`.
pub(crate) fn directives(level: LogLevel, trace_deps: bool) -> String {
    if level < LogLevel::Debug {
        return level.as_str().to_owned();
    }
    let deps: &[&str] = if trace_deps { DEPENDENCY_TARGETS } else { &[] };
    let mut out = String::from("info");
    for target in WORKSPACE_TARGETS.iter().chain(deps) {
        out.push(',');
        out.push_str(target);
        out.push('=');
        out.push_str(level.as_str());
    }
    out
}
