//! Devices, capture tasks and captured waveforms.
//!
//! - [`sequencer`]: the typed capture-state machine and per-device PV names
//! - [`driver`]: drives one device through the state machine and harvests its channels
//!
//! A [`DeviceTask`] is one device's capture attempt within a run. Its outcome is set
//! exactly once; attempts to overwrite a terminal outcome are rejected so a late
//! failure can never turn a finished task back into something else.

pub mod driver;
pub mod sequencer;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use crate::aggregator::FailureReason;
pub use driver::{DeviceSequencerDriver, DriverReport, DriverSettings};
pub use sequencer::{DevicePvs, ScopeSettings, SequencerState, Transition, TransitionMark};

/// Control-system name of one capture device, e.g. `R1M1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Wrap a device name. Use [`crate::validation::is_valid_device_name`] to check it.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The device name.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Zone the device belongs to (the name without its trailing device number).
    pub fn zone(&self) -> &str {
        self.0.get(..3).unwrap_or(&self.0)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Start and end of the hardware collection window for one capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureWindow {
    /// When the sequencer entered the capturing phase.
    pub start: DateTime<Utc>,
    /// When the sequencer entered the harvesting phase.
    pub end: DateTime<Utc>,
}

/// Machine state recorded alongside a capture.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaptureMetadata {
    /// Numeric metadata PVs.
    pub floats: BTreeMap<String, f64>,
    /// Non-numeric metadata PVs.
    pub strings: BTreeMap<String, String>,
}

/// One captured channel trace.
///
/// The sink's unit of write: a waveform is always persisted whole.
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    /// Device the trace came from.
    pub device: DeviceId,
    /// Channel (signal) name, e.g. `GMES`.
    pub channel: String,
    /// Fixed-length sample sequence.
    pub samples: Vec<f64>,
    /// When the trace was read back.
    pub captured_at: DateTime<Utc>,
    /// Hardware collection window shared by all channels of the capture.
    pub window: CaptureWindow,
    /// Time between samples, in the device's native unit (ms).
    pub sample_interval: f64,
    /// Metadata shared by all channels of the capture.
    pub metadata: Arc<CaptureMetadata>,
}

impl Waveform {
    /// Time axis for the samples: `0, dt, 2·dt, ...`.
    pub fn time_axis(&self) -> impl Iterator<Item = f64> + '_ {
        (0..self.samples.len()).map(move |i| i as f64 * self.sample_interval)
    }
}

/// Outcome of a device task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// Still running.
    Pending,
    /// All channels harvested.
    Succeeded,
    /// Capture failed.
    Failed(FailureReason),
}

impl TaskOutcome {
    /// `true` once the outcome can no longer change.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskOutcome::Pending)
    }
}

/// Attempt to change a task outcome that is already terminal.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("outcome of task for {device} is already {current:?}")]
pub struct OutcomeAlreadySet {
    /// Device whose task was already finished.
    pub device: DeviceId,
    /// The outcome that was kept.
    pub current: TaskOutcome,
}

/// One device's capture attempt within a run.
#[derive(Debug, Clone)]
pub struct DeviceTask {
    device: DeviceId,
    state: SequencerState,
    retries: u32,
    outcome: TaskOutcome,
}

impl DeviceTask {
    /// New pending task with the device assumed idle.
    pub fn new(device: DeviceId) -> Self {
        Self {
            device,
            state: SequencerState::Idle,
            retries: 0,
            outcome: TaskOutcome::Pending,
        }
    }

    /// Device this task drives.
    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    /// Last sequencer state confirmed for the device.
    pub fn state(&self) -> SequencerState {
        self.state
    }

    /// Attempts beyond the first, summed over all steps.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Current outcome.
    pub fn outcome(&self) -> &TaskOutcome {
        &self.outcome
    }

    /// `true` once the task has succeeded or failed.
    pub fn is_terminal(&self) -> bool {
        self.outcome.is_terminal()
    }

    pub(crate) fn enter(&mut self, state: SequencerState) {
        self.state = state;
    }

    pub(crate) fn record_attempts(&mut self, attempts: u32) {
        self.retries += attempts.saturating_sub(1);
    }

    /// Mark the task succeeded.
    pub fn succeed(&mut self) -> Result<(), OutcomeAlreadySet> {
        self.finish(TaskOutcome::Succeeded)
    }

    /// Mark the task failed.
    pub fn fail(&mut self, reason: FailureReason) -> Result<(), OutcomeAlreadySet> {
        self.finish(TaskOutcome::Failed(reason))
    }

    /// Set the outcome. Fails without changing anything if the task is already
    /// terminal; finishing with [`TaskOutcome::Pending`] is a no-op.
    pub fn finish(&mut self, outcome: TaskOutcome) -> Result<(), OutcomeAlreadySet> {
        if self.outcome.is_terminal() {
            return Err(OutcomeAlreadySet {
                device: self.device.clone(),
                current: self.outcome.clone(),
            });
        }
        self.outcome = outcome;
        Ok(())
    }
}
