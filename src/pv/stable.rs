//! Stability-gated reads.
//!
//! Sequencer control points and waveform records pass through intermediate values while
//! the hardware moves between phases. A single `get` can therefore observe a value that
//! is mid-transition. [`StabilityGatedReader::read_stable`] samples a variable repeatedly
//! and only hands back a value once it has been observed as stable:
//!
//! - [`StabilityCriterion::Settled`]: two consecutive samples, `sample_interval` apart,
//!   compare equal.
//! - [`StabilityCriterion::Equals`]: a sample equals the expected terminal value.
//!
//! The reader gives up with [`StabilityError::Timeout`] once the caller's budget is spent
//! and never retries across that boundary; callers compose it with
//! [`crate::error_recovery::retry_with_policy`]. Every wait inside the polling loop is
//! raced against the run's cancellation token.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{bounded_get, PvError, PvValue, RemoteVariableClient, FLOAT_TOLERANCE};
use crate::error_recovery::Retryable;

/// What "stable" means for a particular read.
#[derive(Debug, Clone, PartialEq)]
pub enum StabilityCriterion {
    /// Two consecutive samples are equal.
    Settled,
    /// A sample equals the expected terminal value.
    Equals(PvValue),
}

/// Failure of a single stability-gated read.
#[derive(Error, Debug, Clone)]
pub enum StabilityError {
    /// The budget elapsed before a stable value was observed.
    #[error("'{name}' did not stabilise within {timeout:?} ({samples} samples){}", last_error_suffix(.last_error))]
    Timeout {
        /// Variable name.
        name: String,
        /// Budget that elapsed.
        timeout: Duration,
        /// Number of successful samples taken.
        samples: u32,
        /// Most recent transport error seen inside the window, if any.
        last_error: Option<PvError>,
    },

    /// The run was cancelled while polling.
    #[error("read of '{0}' cancelled")]
    Cancelled(String),
}

fn last_error_suffix(last_error: &Option<PvError>) -> String {
    match last_error {
        Some(err) => format!("; last error: {err}"),
        None => String::new(),
    }
}

impl Retryable for StabilityError {
    fn is_retryable(&self) -> bool {
        matches!(self, StabilityError::Timeout { .. })
    }
}

/// Polls remote variables until they are stable.
#[derive(Clone)]
pub struct StabilityGatedReader {
    client: Arc<dyn RemoteVariableClient>,
    sample_interval: Duration,
    tolerance: f64,
}

impl StabilityGatedReader {
    /// Create a reader sampling every `sample_interval`.
    pub fn new(client: Arc<dyn RemoteVariableClient>, sample_interval: Duration) -> Self {
        Self {
            client,
            sample_interval,
            tolerance: FLOAT_TOLERANCE,
        }
    }

    /// Override the relative tolerance used for float comparisons.
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Relative tolerance used for float comparisons.
    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    /// Underlying client, for plain writes.
    pub fn client(&self) -> &dyn RemoteVariableClient {
        self.client.as_ref()
    }

    /// Interval between consecutive samples.
    pub fn sample_interval(&self) -> Duration {
        self.sample_interval
    }

    /// Read `name` once it satisfies `criterion`, within `timeout`.
    ///
    /// Transport errors inside the window do not end the read: they reset the
    /// comparison and the loop keeps sampling until the budget is gone.
    pub async fn read_stable(
        &self,
        name: &str,
        timeout: Duration,
        criterion: &StabilityCriterion,
        cancel: &CancellationToken,
    ) -> Result<PvValue, StabilityError> {
        let deadline = Instant::now() + timeout;
        let mut previous: Option<PvValue> = None;
        let mut samples = 0u32;
        let mut last_error = None;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(StabilityError::Timeout {
                    name: name.to_string(),
                    timeout,
                    samples,
                    last_error,
                });
            }

            let sample = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StabilityError::Cancelled(name.to_string())),
                sample = bounded_get(self.client.as_ref(), name, remaining) => sample,
            };

            match sample {
                Ok(value) => {
                    samples += 1;
                    let stable = match criterion {
                        StabilityCriterion::Equals(expected) => {
                            value.approx_eq(expected, self.tolerance)
                        }
                        StabilityCriterion::Settled => previous
                            .as_ref()
                            .is_some_and(|prev| prev.approx_eq(&value, self.tolerance)),
                    };
                    if stable {
                        return Ok(value);
                    }
                    previous = Some(value);
                }
                Err(err) => {
                    debug!(pv = name, error = %err, "sample failed, still waiting for stability");
                    previous = None;
                    last_error = Some(err);
                }
            }

            let pause = self
                .sample_interval
                .min(deadline.saturating_duration_since(Instant::now()));
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StabilityError::Cancelled(name.to_string())),
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }
}
