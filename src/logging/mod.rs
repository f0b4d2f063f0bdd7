//! Logging setup
//!
//! One `tracing` subscriber for the whole process:
//!
//! ```text
//! Registry
//!   ├── EnvFilter (RUST_LOG, else logging.level)
//!   └── Fmt layer (pretty | compact | json) on stderr
//! ```
//!
//! Logs go to stderr so command output on stdout stays machine-readable.

use crate::config::LoggingConfig;
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Invalid log filter '{filter}': {message}")]
    InvalidFilter { filter: String, message: String },

    #[error("Unknown log format '{0}' (expected pretty, compact or json)")]
    UnknownFormat(String),

    #[error("Failed to set global subscriber (may already be initialized): {0}")]
    AlreadyInitialized(String),
}

/// Output format of the fmt layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "compact" | "text" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(LoggingError::UnknownFormat(other.to_string())),
        }
    }
}

/// Build the filter: RUST_LOG wins over the configured level
pub fn build_filter(level: &str) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(level).map_err(|e| LoggingError::InvalidFilter {
        filter: level.to_string(),
        message: e.to_string(),
    })
}

/// Install the global subscriber
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingError> {
    let format: LogFormat = config.format.parse()?;
    let env_filter = build_filter(&config.level)?;

    let result = match format {
        LogFormat::Pretty => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .pretty();
            tracing::subscriber::set_global_default(
                tracing_subscriber::registry().with(env_filter).with(fmt_layer),
            )
        }
        LogFormat::Compact => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact();
            tracing::subscriber::set_global_default(
                tracing_subscriber::registry().with(env_filter).with(fmt_layer),
            )
        }
        LogFormat::Json => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(true)
                .json();
            tracing::subscriber::set_global_default(
                tracing_subscriber::registry().with(env_filter).with(fmt_layer),
            )
        }
    };

    result.map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))
}
