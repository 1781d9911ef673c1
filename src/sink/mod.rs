//! Waveform persistence.
//!
//! A sink receives captured waveforms one at a time, as device tasks finish, and
//! persists each one whole. Sinks are shared by every concurrent device task of a run,
//! so they take `&self` and must be `Send + Sync`.
//!
//! # Backends
//!
//! - [`file::TsvFileSink`] (feature `storage_csv`): one tab-separated file per waveform
//! - [`database::SqliteWaveformSink`] (feature `storage_sqlite`): one row per waveform
//! - [`memory::MemorySink`]: keeps waveforms in memory, for tests and dry runs

#[cfg(feature = "storage_sqlite")]
pub mod database;
#[cfg(feature = "storage_csv")]
pub mod file;
pub mod memory;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::device::Waveform;

/// Destination kind selectable from the command line and configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    /// Tab-separated files under the output directory.
    #[default]
    File,
    /// SQLite database.
    Database,
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkKind::File => f.write_str("file"),
            SinkKind::Database => f.write_str("database"),
        }
    }
}

impl FromStr for SinkKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "file" => Ok(SinkKind::File),
            "database" | "db" => Ok(SinkKind::Database),
            other => Err(format!("unknown output '{other}', expected 'file' or 'database'")),
        }
    }
}

/// Errors raised by sinks.
#[derive(Error, Debug)]
pub enum SinkError {
    /// Filesystem failure.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// File or directory involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// TSV encoding failure.
    #[cfg(feature = "storage_csv")]
    #[error("TSV encoding error: {0}")]
    Csv(#[from] csv::Error),

    /// Database failure.
    #[cfg(feature = "storage_sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON encoding failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The requested backend was compiled out.
    #[error("{0} output is not supported by this build")]
    Unsupported(SinkKind),

    /// The sink refused the waveform.
    #[error("write rejected: {0}")]
    Rejected(String),
}

/// Persists captured waveforms.
#[async_trait]
pub trait WaveformSink: Send + Sync {
    /// Persist one waveform. Either the whole waveform is stored or nothing is.
    async fn write(&self, waveform: &Waveform) -> Result<(), SinkError>;

    /// Short backend name for logs.
    fn kind(&self) -> &'static str;
}

/// Where a run's waveforms go.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkTarget {
    /// TSV files below `out_dir`.
    File {
        /// Run output directory, `<base_dir>/<date>/<zone>`.
        out_dir: PathBuf,
    },
    /// SQLite database.
    Database {
        /// sqlx connection URL.
        url: String,
        /// Maximum pooled connections.
        pool_size: u32,
        /// Run the rows belong to.
        run_id: Uuid,
    },
}

impl SinkTarget {
    /// Backend kind of this target.
    pub fn kind(&self) -> SinkKind {
        match self {
            SinkTarget::File { .. } => SinkKind::File,
            SinkTarget::Database { .. } => SinkKind::Database,
        }
    }
}

/// Open the sink for `target`.
pub async fn open_sink(target: &SinkTarget) -> Result<Arc<dyn WaveformSink>, SinkError> {
    match target {
        #[cfg(feature = "storage_csv")]
        SinkTarget::File { out_dir } => Ok(Arc::new(file::TsvFileSink::new(out_dir.clone()))),
        #[cfg(feature = "storage_sqlite")]
        SinkTarget::Database {
            url,
            pool_size,
            run_id,
        } => Ok(Arc::new(
            database::SqliteWaveformSink::connect(url, *pool_size, *run_id).await?,
        )),
        #[allow(unreachable_patterns)]
        other => Err(SinkError::Unsupported(other.kind())),
    }
}
