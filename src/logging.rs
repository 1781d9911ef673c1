//! Structured logging setup.
//!
//! Installs a `tracing-subscriber` registry with one formatting layer:
//! - `Pretty`: multi-line and coloured, for interactive runs
//! - `Compact`: single-line, no colours, for cron jobs
//! - `Json`: one object per event, for log shipping
//!
//! `RUST_LOG` overrides the configured level when set.
//!
//! # Example
//! ```no_run
//! use rfw_scope_daq::{config::ScopeDaqConfig, logging};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ScopeDaqConfig::load()?;
//! logging::init_from_config(&config)?;
//! tracing::info!(zone = "R1M", "collection starting");
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::ScopeDaqConfig;

/// Output format for log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Pretty-printed with colours.
    #[default]
    Pretty,
    /// Single line per event.
    Compact,
    /// JSON objects.
    Json,
}

/// Logging options taken from the `application` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TracingConfig {
    /// Default level when `RUST_LOG` is unset.
    pub level: Level,
    /// Output format.
    pub format: OutputFormat,
}

impl TracingConfig {
    /// Options taken from the `application` section.
    pub fn from_config(config: &ScopeDaqConfig) -> Result<Self, String> {
        Ok(Self {
            level: parse_log_level(&config.application.log_level)?,
            format: config.application.log_format,
        })
    }
}

/// Initialize logging from the loaded configuration.
pub fn init_from_config(config: &ScopeDaqConfig) -> Result<(), String> {
    init(TracingConfig::from_config(config)?)
}

/// Initialize logging.
///
/// Idempotent: a second call, or a call after a test harness installed its own
/// subscriber, returns `Ok(())`.
pub fn init(config: TracingConfig) -> Result<(), String> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_to_filter_string(config.level)));

    let layer = match config.format {
        OutputFormat::Pretty => fmt::layer().pretty().with_filter(env_filter).boxed(),
        OutputFormat::Compact => fmt::layer()
            .compact()
            .with_ansi(false)
            .with_filter(env_filter)
            .boxed(),
        OutputFormat::Json => fmt::layer().json().with_filter(env_filter).boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .or_else(|e| {
            // Tests and embedding applications may have installed a subscriber already.
            if tracing::dispatcher::has_been_set() || e.to_string().contains("already") {
                Ok(())
            } else {
                Err(format!("Failed to initialize tracing: {e}"))
            }
        })
}

/// Parse a log level name, case-insensitively.
pub fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(format!(
            "Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error"
        )),
    }
}

fn level_to_filter_string(level: Level) -> String {
    match level {
        Level::TRACE => "trace".to_string(),
        Level::DEBUG => "debug".to_string(),
        Level::INFO => "info".to_string(),
        Level::WARN => "warn".to_string(),
        Level::ERROR => "error".to_string(),
    }
}
