//! Failure aggregation and the report verdict.
//!
//! Every failure during a run becomes a [`FailureRecord`]. Once all device tasks are
//! terminal the coordinator hands the complete list to [`FailureAggregator::conclude`],
//! which computes the failure ratio over distinct devices and decides whether a report
//! goes out. The comparison is strict: a ratio equal to the threshold never triggers.

use std::borrow::Cow;
use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::device::{DeviceId, SequencerState};

/// Why a device (or the whole run) failed.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureReason {
    /// The sequencer never confirmed the target state within the retry budget.
    UnstableAt(SequencerState),
    /// A channel waveform had the wrong shape.
    MalformedWaveform {
        /// Offending channel.
        channel: String,
        /// What was wrong.
        detail: String,
    },
    /// The run deadline fired before the device finished.
    DurationExceeded,
    /// The cavity was not in a state that allows a capture.
    DeviceNotReady(String),
    /// The scope system did not accept the collection settings.
    ScopeSetupFailed(String),
    /// The sink rejected a captured waveform.
    SinkWriteFailed(String),
    /// The driver task panicked.
    DriverPanicked(String),
    /// Machine power below the configured minimum.
    InsufficientPower {
        /// Stable power reading.
        measured: f64,
        /// Configured minimum.
        minimum: f64,
    },
    /// Machine power could not be read.
    PowerUnavailable(String),
    /// Not enough free space at the destination.
    InsufficientStorage {
        /// Measured free space, GiB.
        free_gib: f64,
        /// Configured minimum, GiB.
        minimum_gib: f64,
    },
}

impl FailureReason {
    /// Stable reason code, e.g. `unstable_at_armed`.
    pub fn code(&self) -> Cow<'static, str> {
        match self {
            FailureReason::UnstableAt(state) => Cow::Owned(format!("unstable_at_{}", state.name())),
            FailureReason::MalformedWaveform { .. } => Cow::Borrowed("malformed_waveform"),
            FailureReason::DurationExceeded => Cow::Borrowed("duration_exceeded"),
            FailureReason::DeviceNotReady(_) => Cow::Borrowed("device_not_ready"),
            FailureReason::ScopeSetupFailed(_) => Cow::Borrowed("scope_setup_failed"),
            FailureReason::SinkWriteFailed(_) => Cow::Borrowed("sink_write_failed"),
            FailureReason::DriverPanicked(_) => Cow::Borrowed("driver_panicked"),
            FailureReason::InsufficientPower { .. } => Cow::Borrowed("insufficient_power"),
            FailureReason::PowerUnavailable(_) => Cow::Borrowed("power_unavailable"),
            FailureReason::InsufficientStorage { .. } => Cow::Borrowed("insufficient_storage"),
        }
    }

    /// Low storage is reported whatever the threshold, since every later run would
    /// fail the same way until someone frees space.
    pub fn always_reported(&self) -> bool {
        matches!(self, FailureReason::InsufficientStorage { .. })
    }

    fn detail(&self) -> Option<String> {
        match self {
            FailureReason::UnstableAt(_) | FailureReason::DurationExceeded => None,
            FailureReason::MalformedWaveform { channel, detail } => {
                Some(format!("{channel}: {detail}"))
            }
            FailureReason::DeviceNotReady(detail)
            | FailureReason::ScopeSetupFailed(detail)
            | FailureReason::SinkWriteFailed(detail)
            | FailureReason::DriverPanicked(detail)
            | FailureReason::PowerUnavailable(detail) => Some(detail.clone()),
            FailureReason::InsufficientPower { measured, minimum } => {
                Some(format!("{measured} < {minimum}"))
            }
            FailureReason::InsufficientStorage {
                free_gib,
                minimum_gib,
            } => Some(format!("{free_gib:.2} GiB free < {minimum_gib:.2} GiB")),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.detail() {
            Some(detail) => write!(f, "{} ({detail})", self.code()),
            None => f.write_str(&self.code()),
        }
    }
}

/// Where in the run a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePhase {
    /// Run-level checks before any device is touched.
    Precondition,
    /// Per-device readiness checks.
    Readiness,
    /// Clearing an abandoned sequencer cycle.
    Recovery,
    /// Putting the scope system into collection settings.
    ScopeSetup,
    /// Moving into, or working in, a sequencer state.
    Sequencer(SequencerState),
    /// Persisting a captured waveform.
    Storage,
    /// The task running the driver.
    Supervision,
}

impl fmt::Display for FailurePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePhase::Precondition => f.write_str("precondition"),
            FailurePhase::Readiness => f.write_str("readiness"),
            FailurePhase::Recovery => f.write_str("recovery"),
            FailurePhase::ScopeSetup => f.write_str("scope_setup"),
            FailurePhase::Sequencer(state) => write!(f, "sequencer:{state}"),
            FailurePhase::Storage => f.write_str("storage"),
            FailurePhase::Supervision => f.write_str("supervision"),
        }
    }
}

/// One recorded failure.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureRecord {
    /// Failed device, or `None` when the whole run failed.
    pub device: Option<DeviceId>,
    /// Where it failed.
    pub phase: FailurePhase,
    /// Why it failed.
    pub reason: FailureReason,
    /// When it was recorded.
    pub at: DateTime<Utc>,
}

impl FailureRecord {
    /// Failure of a single device.
    pub fn device(device: DeviceId, phase: FailurePhase, reason: FailureReason) -> Self {
        Self {
            device: Some(device),
            phase,
            reason,
            at: Utc::now(),
        }
    }

    /// Failure of the whole run.
    pub fn whole_run(phase: FailurePhase, reason: FailureReason) -> Self {
        Self {
            device: None,
            phase,
            reason,
            at: Utc::now(),
        }
    }

    /// `true` for whole-run failures.
    pub fn is_whole_run(&self) -> bool {
        self.device.is_none()
    }
}

/// Outcome of aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Verdict {
    /// Devices considered (at least 1).
    pub total: usize,
    /// Distinct devices counted as failed.
    pub failed: usize,
    /// `failed / total`.
    pub ratio: f64,
    /// Threshold the ratio was compared against.
    pub threshold: f64,
    /// Whether a report must be sent.
    pub report_triggered: bool,
}

/// `true` iff `failed / total` is strictly greater than `threshold`.
pub fn exceeds_threshold(failed: usize, total: usize, threshold: f64) -> bool {
    let total = total.max(1);
    failed as f64 / total as f64 > threshold
}

/// Turns the failures of a run into a [`Verdict`].
#[derive(Debug, Clone, Copy)]
pub struct FailureAggregator {
    threshold: f64,
}

impl FailureAggregator {
    /// Aggregator reporting when the failure ratio exceeds `threshold`.
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// Configured threshold.
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Compute the verdict for a run of `total` devices.
    ///
    /// Several failures of one device count once. Any whole-run failure counts every
    /// device as failed. A whole-run failure whose reason is
    /// [`always_reported`](FailureReason::always_reported) triggers a report even when
    /// the ratio does not exceed the threshold.
    pub fn conclude(&self, total: usize, failures: &[FailureRecord]) -> Verdict {
        let total = total.max(1);
        let failed = if failures.iter().any(FailureRecord::is_whole_run) {
            total
        } else {
            failures
                .iter()
                .filter_map(|record| record.device.as_ref())
                .collect::<BTreeSet<_>>()
                .len()
                .min(total)
        };
        Verdict {
            total,
            failed,
            ratio: failed as f64 / total as f64,
            threshold: self.threshold,
            report_triggered: exceeds_threshold(failed, total, self.threshold)
                || failures
                    .iter()
                    .any(|record| record.is_whole_run() && record.reason.always_reported()),
        }
    }
}
