//! SQLite waveform store.
//!
//! Schema (created on [`SqliteWaveformSink::migrate`]):
//! ```sql
//! CREATE TABLE IF NOT EXISTS waveforms (
//!     id              INTEGER PRIMARY KEY AUTOINCREMENT,
//!     run_id          TEXT    NOT NULL,
//!     device          TEXT    NOT NULL,
//!     channel         TEXT    NOT NULL,
//!     captured_at     TEXT    NOT NULL,   -- RFC 3339
//!     window_start    TEXT    NOT NULL,
//!     window_end      TEXT    NOT NULL,
//!     sample_interval REAL    NOT NULL,
//!     samples_json    TEXT    NOT NULL,
//!     metadata_json   TEXT    NOT NULL
//! );
//! ```

use std::str::FromStr;

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{SinkError, WaveformSink};
use crate::device::Waveform;
use crate::limits::{DB_CONNECT_ATTEMPTS, DB_CONNECT_BACKOFF};

/// A waveform row read back from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredWaveform {
    /// Device name.
    pub device: String,
    /// Channel name.
    pub channel: String,
    /// RFC 3339 capture time.
    pub captured_at: String,
    /// Time between samples.
    pub sample_interval: f64,
    /// Samples.
    pub samples: Vec<f64>,
}

/// Inserts one row per waveform through a small connection pool.
#[derive(Debug, Clone)]
pub struct SqliteWaveformSink {
    pool: SqlitePool,
    run_id: Uuid,
}

impl SqliteWaveformSink {
    /// Connect to `url`, creating the database file and table if needed.
    pub async fn connect(url: &str, pool_size: u32, run_id: Uuid) -> Result<Self, SinkError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(pool_size.max(1))
            .acquire_timeout(DB_CONNECT_BACKOFF)
            .connect_with(options)
            .await?;
        let sink = Self { pool, run_id };
        sink.migrate().await?;
        Ok(sink)
    }

    /// Create the waveforms table if it does not exist.
    pub async fn migrate(&self) -> Result<(), SinkError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS waveforms (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id          TEXT    NOT NULL,
                device          TEXT    NOT NULL,
                channel         TEXT    NOT NULL,
                captured_at     TEXT    NOT NULL,
                window_start    TEXT    NOT NULL,
                window_end      TEXT    NOT NULL,
                sample_interval REAL    NOT NULL,
                samples_json    TEXT    NOT NULL,
                metadata_json   TEXT    NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS waveforms_run ON waveforms (run_id, device)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Rows written for this sink's run, in insertion order.
    pub async fn stored_waveforms(&self) -> Result<Vec<StoredWaveform>, SinkError> {
        let rows: Vec<(String, String, String, f64, String)> = sqlx::query_as(
            "SELECT device, channel, captured_at, sample_interval, samples_json
             FROM waveforms WHERE run_id = ? ORDER BY id",
        )
        .bind(self.run_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(device, channel, captured_at, sample_interval, samples)| {
                let samples: Vec<f64> = serde_json::from_str(&samples)?;
                Ok::<_, SinkError>(StoredWaveform {
                    device,
                    channel,
                    captured_at,
                    sample_interval,
                    samples,
                })
            })
            .collect()
    }

    /// Pooled connection, waiting for a busy pool to free one up.
    async fn acquire(&self) -> Result<PoolConnection<Sqlite>, SinkError> {
        let mut attempt = 1;
        loop {
            match self.pool.acquire().await {
                Ok(conn) => return Ok(conn),
                Err(sqlx::Error::PoolTimedOut) if attempt < DB_CONNECT_ATTEMPTS => {
                    debug!(attempt, "database pool busy, waiting");
                    tokio::time::sleep(DB_CONNECT_BACKOFF).await;
                    attempt += 1;
                }
                Err(err) => {
                    warn!(attempt, error = %err, "no database connection");
                    return Err(err.into());
                }
            }
        }
    }
}

#[async_trait]
impl WaveformSink for SqliteWaveformSink {
    async fn write(&self, waveform: &Waveform) -> Result<(), SinkError> {
        let samples = serde_json::to_string(&waveform.samples)?;
        let metadata = serde_json::to_string(waveform.metadata.as_ref())?;

        let mut conn = self.acquire().await?;
        sqlx::query(
            "INSERT INTO waveforms
                (run_id, device, channel, captured_at, window_start, window_end,
                 sample_interval, samples_json, metadata_json)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(self.run_id.to_string())
        .bind(waveform.device.as_str())
        .bind(&waveform.channel)
        .bind(waveform.captured_at.to_rfc3339())
        .bind(waveform.window.start.to_rfc3339())
        .bind(waveform.window.end.to_rfc3339())
        .bind(waveform.sample_interval)
        .bind(samples)
        .bind(metadata)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "database"
    }
}
