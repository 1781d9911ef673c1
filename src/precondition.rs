//! Run-level preconditions: free storage at the destination and machine power.
//!
//! Checked once per run, before any device is armed. Storage is checked first; a run
//! that cannot persist its data is not worth disturbing the machine for.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use sysinfo::Disks;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::aggregator::FailureReason;
use crate::limits::BYTES_PER_GIB;
use crate::pv::stable::{StabilityCriterion, StabilityGatedReader};

/// Measures free space at a destination path.
#[async_trait]
pub trait StorageGauge: Send + Sync {
    /// Bytes available to the process at `path`.
    async fn free_bytes(&self, path: &Path) -> io::Result<u64>;
}

/// Gauge backed by the host's mounted disks.
///
/// The disk whose mount point is the longest prefix of the path wins, so a
/// dedicated data partition mounted below `/` is measured rather than the root disk.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysinfoStorageGauge;

#[async_trait]
impl StorageGauge for SysinfoStorageGauge {
    async fn free_bytes(&self, path: &Path) -> io::Result<u64> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let disks = Disks::new_with_refreshed_list();
            disks
                .list()
                .iter()
                .filter(|disk| path.starts_with(disk.mount_point()))
                .max_by_key(|disk| disk.mount_point().as_os_str().len())
                .map(|disk| disk.available_space())
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("no mounted disk contains {}", path.display()),
                    )
                })
        })
        .await
        .map_err(io::Error::other)?
    }
}

/// Gauge reporting a fixed amount of free space.
#[derive(Debug, Clone, Copy)]
pub struct StaticStorageGauge {
    free_bytes: u64,
}

impl StaticStorageGauge {
    /// Gauge that always reports `free_gib` GiB.
    pub fn with_free_gib(free_gib: f64) -> Self {
        Self {
            free_bytes: (free_gib * BYTES_PER_GIB) as u64,
        }
    }
}

#[async_trait]
impl StorageGauge for StaticStorageGauge {
    async fn free_bytes(&self, _path: &Path) -> io::Result<u64> {
        Ok(self.free_bytes)
    }
}

/// Thresholds checked before a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreconditionLimits {
    /// PV carrying the machine power level.
    pub power_pv: String,
    /// Minimum power (inclusive).
    pub min_power: f64,
    /// Relative spread between two power samples still counted as settled.
    pub power_tolerance: f64,
    /// Minimum free space at the destination, GiB (inclusive).
    pub min_free_gib: f64,
    /// Path whose filesystem receives the data.
    pub storage_path: PathBuf,
}

/// What the gate saw.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreconditionSnapshot {
    /// Stable power reading, if one was obtained.
    pub power: Option<f64>,
    /// Free space at the destination, GiB, if measured.
    pub free_gib: Option<f64>,
    /// Thresholds applied.
    pub limits: PreconditionLimits,
    /// First failed check, if any.
    #[serde(skip)]
    pub failure: Option<FailureReason>,
}

impl PreconditionSnapshot {
    /// `true` when every check passed.
    pub fn passed(&self) -> bool {
        self.failure.is_none()
    }
}

/// Evaluates the run preconditions.
pub struct PreconditionGate {
    reader: StabilityGatedReader,
    gauge: Arc<dyn StorageGauge>,
    read_timeout: Duration,
}

impl PreconditionGate {
    /// Gate reading power through `reader` and storage through `gauge`.
    pub fn new(
        reader: StabilityGatedReader,
        gauge: Arc<dyn StorageGauge>,
        read_timeout: Duration,
    ) -> Self {
        Self {
            reader,
            gauge,
            read_timeout,
        }
    }

    /// Run every check and record the first failure.
    pub async fn evaluate(
        &self,
        limits: &PreconditionLimits,
        cancel: &CancellationToken,
    ) -> PreconditionSnapshot {
        let mut snapshot = PreconditionSnapshot {
            power: None,
            free_gib: None,
            limits: limits.clone(),
            failure: None,
        };

        let free_gib = match self.gauge.free_bytes(&limits.storage_path).await {
            Ok(bytes) => bytes as f64 / BYTES_PER_GIB,
            Err(err) => {
                warn!(path = %limits.storage_path.display(), error = %err, "free space unknown");
                0.0
            }
        };
        snapshot.free_gib = Some(free_gib);
        if free_gib < limits.min_free_gib {
            warn!(
                path = %limits.storage_path.display(),
                free_gib,
                min_free_gib = limits.min_free_gib,
                "insufficient free space"
            );
            snapshot.failure = Some(FailureReason::InsufficientStorage {
                free_gib,
                minimum_gib: limits.min_free_gib,
            });
            return snapshot;
        }

        let power = match self
            .reader
            .clone()
            .with_tolerance(limits.power_tolerance)
            .read_stable(
                &limits.power_pv,
                self.read_timeout,
                &StabilityCriterion::Settled,
                cancel,
            )
            .await
        {
            Ok(value) => value.as_f64(),
            Err(err) => {
                warn!(pv = %limits.power_pv, error = %err, "power level unavailable");
                snapshot.failure = Some(FailureReason::PowerUnavailable(err.to_string()));
                return snapshot;
            }
        };
        let Some(power) = power else {
            snapshot.failure = Some(FailureReason::PowerUnavailable(format!(
                "'{}' is not numeric",
                limits.power_pv
            )));
            return snapshot;
        };
        snapshot.power = Some(power);
        if power < limits.min_power {
            warn!(power, min_power = limits.min_power, "insufficient power");
            snapshot.failure = Some(FailureReason::InsufficientPower {
                measured: power,
                minimum: limits.min_power,
            });
            return snapshot;
        }

        info!(power, free_gib, "preconditions met");
        snapshot
    }
}
