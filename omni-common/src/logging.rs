//! Tracing subscriber setup for the agent.
//!
//! Console output goes to stderr (plain or JSON lines). An optional file sink
//! rotates daily under `<dir>/omnid.log.*` through a non-blocking writer; the
//! returned [`LoggingGuards`] must be held until shutdown so buffered lines
//! are flushed.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Logging options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Filter directive, e.g. `info` or `omnid=debug,tower_http=warn`.
    pub level: String,
    pub stderr: bool,
    pub json: bool,
    /// Directory for rotating log files.
    pub file_dir: Option<PathBuf>,
}

impl LogConfig {
    /// Level from `RUST_LOG`, then `OMNI_LOG_LEVEL`, then `default_level`.
    pub fn from_env(default_level: &str) -> Self {
        let level = std::env::var("RUST_LOG")
            .ok()
            .or_else(|| std::env::var("OMNI_LOG_LEVEL").ok())
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| default_level.to_string());
        Self {
            level,
            stderr: false,
            json: false,
            file_dir: None,
        }
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn with_stderr(mut self) -> Self {
        self.stderr = true;
        self
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    pub fn with_file(mut self, dir: impl Into<PathBuf>) -> Self {
        self.file_dir = Some(dir.into());
        self
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_new(&self.level).unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Keeps non-blocking writers alive.
#[must_use = "dropping the guards stops file logging"]
pub struct LoggingGuards {
    _guards: Vec<WorkerGuard>,
}

/// Install the global subscriber.
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuards> {
    let mut guards = Vec::new();

    let plain = (config.stderr && !config.json)
        .then(|| fmt::layer().with_writer(std::io::stderr).with_target(true));
    let json = (config.stderr && config.json).then(|| {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_current_span(false)
    });

    let file = match &config.file_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "omnid.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            guards.push(guard);
            Some(fmt::layer().with_writer(writer).with_ansi(false))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(config.filter())
        .with(plain)
        .with(json)
        .with(file)
        .try_init()
        .context("installing tracing subscriber")?;

    Ok(LoggingGuards { _guards: guards })
}
