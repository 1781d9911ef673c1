//! Capture-state machine of the scope-mode sequencer.
//!
//! The hardware sequencer cycles `Idle → Armed → Capturing → Harvesting → Idle`.
//! Each step is a single write to the device's control point; the value written
//! identifies the target state. Keeping the protocol in one table means the
//! driver never hard-codes control values.

use std::fmt;

use super::DeviceId;

/// Control value that arms the sequencer (also used to return it to armed after a harvest).
pub const CONTROL_ARM: i64 = 128;
/// Control value that starts the hardware collection window.
pub const CONTROL_CAPTURE: i64 = 256;
/// Control value that freezes the buffers for harvesting.
pub const CONTROL_HARVEST: i64 = 512;

/// Run status value meaning the sequencer was abandoned mid-cycle.
pub const RUN_STATUS_ABANDONED: i64 = -1;
/// Run status value written to clear an abandoned cycle.
pub const RUN_STATUS_CLEAR: i64 = 0;

/// Written to the run setting to reset the scope system before its settings change.
/// The setting reads back as [`RUN_STATUS_CLEAR`] once the reset has finished.
pub const SCOPE_RESET: i64 = -1;

/// `STAT1` bit set while the gradient is ramping.
pub const STATUS_RAMPING_BIT: i64 = 0x0800;
/// `CNTL2MODE` values under which the cavity is considered stable.
pub const STABLE_CONTROL_MODES: [i64; 2] = [4, 64];

/// Scope-system configuration of one device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScopeSettings {
    /// Run setting (`WFSCOPrun`); 3 is periodic scope mode.
    pub mode: i64,
    /// Time between samples (`TRGS1`).
    pub sample_interval: f64,
    /// Trigger delay (`TRGD1`).
    pub trigger_delay: f64,
    /// Periodic capture setting (`WFSCOPper`).
    pub periodic: f64,
    /// Waveform debug flag (`WFSdebug1`).
    pub debug: i64,
}

impl ScopeSettings {
    /// Settings every capture is taken under.
    pub const COLLECTION: ScopeSettings = ScopeSettings {
        mode: 3,
        sample_interval: 0.2,
        trigger_delay: 102.4,
        periodic: 0.1,
        debug: 1,
    };

    /// `true` when every field agrees, floats within a relative `tolerance`.
    pub fn matches(&self, other: &ScopeSettings, tolerance: f64) -> bool {
        let close = |a: f64, b: f64| (a - b).abs() <= tolerance * a.abs().max(b.abs()).max(1.0);
        self.mode == other.mode
            && self.debug == other.debug
            && close(self.sample_interval, other.sample_interval)
            && close(self.trigger_delay, other.trigger_delay)
            && close(self.periodic, other.periodic)
    }
}

/// Sequencer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SequencerState {
    /// Not collecting.
    Idle,
    /// Waiting for the capture window to open.
    Armed,
    /// Hardware buffers filling.
    Capturing,
    /// Buffers frozen; channel waveforms readable.
    Harvesting,
}

/// Marker written alongside a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionMark {
    /// Nothing extra.
    None,
    /// Record the capture start time.
    CaptureStart,
    /// Record the capture end time.
    CaptureEnd,
}

/// One step of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// State the step leaves.
    pub from: SequencerState,
    /// State the step enters.
    pub to: SequencerState,
    /// Value written to the control point.
    pub control_value: i64,
    /// Timestamp to write with the step.
    pub mark: TransitionMark,
}

impl SequencerState {
    /// The step leaving this state.
    pub fn transition(self) -> Transition {
        let (to, control_value, mark) = match self {
            SequencerState::Idle => (SequencerState::Armed, CONTROL_ARM, TransitionMark::None),
            SequencerState::Armed => (
                SequencerState::Capturing,
                CONTROL_CAPTURE,
                TransitionMark::CaptureStart,
            ),
            SequencerState::Capturing => (
                SequencerState::Harvesting,
                CONTROL_HARVEST,
                TransitionMark::CaptureEnd,
            ),
            SequencerState::Harvesting => {
                (SequencerState::Idle, CONTROL_ARM, TransitionMark::None)
            }
        };
        Transition {
            from: self,
            to,
            control_value,
            mark,
        }
    }

    /// Snake-case name used in failure reason codes.
    pub fn name(self) -> &'static str {
        match self {
            SequencerState::Idle => "idle",
            SequencerState::Armed => "armed",
            SequencerState::Capturing => "capturing",
            SequencerState::Harvesting => "harvesting",
        }
    }
}

impl fmt::Display for SequencerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Remote variable names for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePvs {
    prefix: String,
}

impl DevicePvs {
    /// Names for `device`.
    pub fn new(device: &DeviceId) -> Self {
        Self {
            prefix: device.as_str().to_string(),
        }
    }

    /// Sequencer control point.
    pub fn control(&self) -> String {
        format!("{}WFSCOPstp", self.prefix)
    }

    /// Sequencer run status, which doubles as the scope mode setting.
    pub fn run_status(&self) -> String {
        format!("{}WFSCOPrun", self.prefix)
    }

    /// Capture start timestamp.
    pub fn capture_start(&self) -> String {
        format!("{}WFSharvTake", self.prefix)
    }

    /// Capture end timestamp.
    pub fn capture_end(&self) -> String {
        format!("{}WFSharvDa", self.prefix)
    }

    /// Timestamp variable for a transition mark, if it has one.
    pub fn mark(&self, mark: TransitionMark) -> Option<String> {
        match mark {
            TransitionMark::None => None,
            TransitionMark::CaptureStart => Some(self.capture_start()),
            TransitionMark::CaptureEnd => Some(self.capture_end()),
        }
    }

    /// Waveform record for `signal`.
    pub fn channel(&self, signal: &str) -> String {
        format!("{}{}", self.prefix, signal)
    }

    /// Time between samples.
    pub fn sample_interval(&self) -> String {
        format!("{}TRGS1", self.prefix)
    }

    /// Trigger delay.
    pub fn trigger_delay(&self) -> String {
        format!("{}TRGD1", self.prefix)
    }

    /// Periodic capture setting.
    pub fn periodic(&self) -> String {
        format!("{}WFSCOPper", self.prefix)
    }

    /// Waveform debug flag.
    pub fn debug(&self) -> String {
        format!("{}WFSdebug1", self.prefix)
    }

    /// RF on readback.
    pub fn rf_on(&self) -> String {
        format!("{}RFONr", self.prefix)
    }

    /// Status word carrying the ramping bit.
    pub fn status(&self) -> String {
        format!("{}STAT1", self.prefix)
    }

    /// Control mode.
    pub fn control_mode(&self) -> String {
        format!("{}CNTL2MODE", self.prefix)
    }
}
