//! # RFW Scope DAQ Core Library
//!
//! This crate is the acquisition orchestrator behind the `rfw_scope_daq` binary. It drives
//! the scope-mode sequencers of a zone's RF cavities through a capture, reads back their
//! waveforms over a remote process-variable interface and persists them, while keeping
//! the machine and the operators safe from partial failures.
//!
//! ## Crate Structure
//!
//! - **`pv`**: The `RemoteVariableClient` seam, PV values and errors, the
//!   stability-gated reader and a simulated IOC.
//! - **`device`**: Device ids, capture tasks, waveforms, the sequencer state machine and
//!   the per-device driver.
//! - **`precondition`**: Run-level power and free-storage checks.
//! - **`session`**: Device selection, run description and the concurrent coordinator.
//! - **`aggregator`**: Failure records and the threshold verdict.
//! - **`report`**: Failure report rendering and delivery (`sendmail` or the log).
//! - **`sink`**: Waveform persistence to TSV files, SQLite or memory.
//! - **`config`**: Figment-based configuration loading and validation.
//! - **`logging`**: `tracing-subscriber` setup.
//! - **`error`**: The crate-level `DaqError`.
//! - **`error_recovery`**: Cancellable retry policy used by every driver step.
//! - **`validation`**: Device, zone and CLI value checks.
//! - **`limits`**: Shared constants.

pub mod aggregator;
pub mod config;
pub mod device;
pub mod error;
pub mod error_recovery;
pub mod limits;
pub mod logging;
pub mod precondition;
pub mod pv;
pub mod report;
pub mod session;
pub mod sink;
pub mod validation;

pub use error::{AppResult, DaqError};
pub use session::{CollectionRun, DeviceSelection, RunResult, SessionCoordinator};
