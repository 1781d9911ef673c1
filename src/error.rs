//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the orchestrator. Each
//! collaborator seam has its own narrow error (`PvError`, `StabilityError`, `SinkError`,
//! `ReportError`); `DaqError` is what the run-level plumbing (configuration, startup,
//! device selection) surfaces to the binary.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment`, typically TOML syntax problems or type
//!   mismatches in the configuration file or environment overrides.
//! - **`Configuration`**: Semantic errors in a configuration that parsed fine but is
//!   logically wrong (threshold outside `[0, 1]`, empty signal list, ...).
//! - **`InvalidDevice`**: A device or zone name that does not follow the `R<linac><zone>[n]`
//!   naming scheme.
//! - **`Io`**: Wraps `std::io::Error`.
//! - **`Sink`**: A waveform sink could not be opened.
//!
//! Per-device acquisition problems are never raised as `DaqError`; they are captured as
//! failure records and summarised in the run result.

use thiserror::Error;

use crate::sink::SinkError;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Primary error type for orchestrator setup and configuration.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Configuration could not be loaded or deserialized.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration loaded but failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Device or zone name is not valid.
    #[error("Invalid device selection: {0}")]
    InvalidDevice(String),

    /// I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Waveform sink could not be created.
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),
}

impl From<figment::Error> for DaqError {
    fn from(value: figment::Error) -> Self {
        DaqError::Config(Box::new(value))
    }
}
