//! Remote Process-Variable Access
//!
//! This module defines the seam between the orchestrator and the control-system transport.
//! The transport itself (its wire encoding, connection management and monitors) lives
//! outside this crate; everything here only needs request/response `get` and `put` on
//! named variables.
//!
//! # Contract
//!
//! - Implementations must be `Send + Sync`: every device task shares one client.
//! - `get` and `put` must honour the supplied timeout. The helpers [`bounded_get`] and
//!   [`bounded_put`] enforce it again on the caller side so a misbehaving client can
//!   never stall a device task past its budget.
//! - If the transport caps the number of outstanding requests it reports that cap via
//!   [`RemoteVariableClient::max_concurrent_requests`]; the session coordinator never runs
//!   more device tasks than that.
//!
//! # Submodules
//!
//! - [`stable`]: the stability-gated reader built on top of a client
//! - [`mock`]: a simulated scope IOC used by `--simulate` and the test suite

pub mod mock;
pub mod stable;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::error_recovery::Retryable;

/// Relative tolerance used when comparing floating point PV values.
pub const FLOAT_TOLERANCE: f64 = 1e-9;

/// A value read from or written to a remote variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PvValue {
    /// Integer/enum record value.
    Long(i64),
    /// Floating point record value.
    Double(f64),
    /// String record value.
    Text(String),
    /// Waveform record value.
    DoubleArray(Vec<f64>),
}

impl PvValue {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PvValue::Long(v) => Some(*v as f64),
            PvValue::Double(v) => Some(*v),
            PvValue::Text(_) | PvValue::DoubleArray(_) => None,
        }
    }

    /// Integer view of the value. Doubles are accepted only when integral.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PvValue::Long(v) => Some(*v),
            PvValue::Double(v) if v.fract() == 0.0 && v.is_finite() => Some(*v as i64),
            _ => None,
        }
    }

    /// Waveform view of the value.
    pub fn as_array(&self) -> Option<&[f64]> {
        match self {
            PvValue::DoubleArray(samples) => Some(samples),
            _ => None,
        }
    }

    /// Compare two values, treating numeric variants as interchangeable and
    /// comparing floats with a relative tolerance.
    pub fn approx_eq(&self, other: &PvValue, tolerance: f64) -> bool {
        match (self, other) {
            (PvValue::Text(a), PvValue::Text(b)) => a == b,
            (PvValue::DoubleArray(a), PvValue::DoubleArray(b)) => {
                a.len() == b.len()
                    && a.iter().zip(b).all(|(x, y)| floats_close(*x, *y, tolerance))
            }
            (PvValue::Long(a), PvValue::Long(b)) => a == b,
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => floats_close(a, b, tolerance),
                _ => false,
            },
        }
    }
}

impl fmt::Display for PvValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PvValue::Long(v) => write!(f, "{v}"),
            PvValue::Double(v) => write!(f, "{v}"),
            PvValue::Text(v) => write!(f, "\"{v}\""),
            PvValue::DoubleArray(v) => write!(f, "[{} samples]", v.len()),
        }
    }
}

impl From<i64> for PvValue {
    fn from(value: i64) -> Self {
        PvValue::Long(value)
    }
}

impl From<f64> for PvValue {
    fn from(value: f64) -> Self {
        PvValue::Double(value)
    }
}

impl From<String> for PvValue {
    fn from(value: String) -> Self {
        PvValue::Text(value)
    }
}

impl From<Vec<f64>> for PvValue {
    fn from(value: Vec<f64>) -> Self {
        PvValue::DoubleArray(value)
    }
}

fn floats_close(a: f64, b: f64, tolerance: f64) -> bool {
    if a == b {
        return true;
    }
    let scale = a.abs().max(b.abs()).max(1.0);
    (a - b).abs() <= tolerance * scale
}

/// Failure modes of a single remote-variable request.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PvError {
    /// No response within the request timeout.
    #[error("timed out after {timeout:?} accessing '{name}'")]
    Timeout {
        /// Variable name.
        name: String,
        /// Timeout that elapsed.
        timeout: Duration,
    },

    /// The transport does not know the variable.
    #[error("unknown remote variable '{0}'")]
    UnknownName(String),

    /// The response could not be interpreted.
    #[error("malformed value for '{name}': {detail}")]
    Malformed {
        /// Variable name.
        name: String,
        /// What was wrong with it.
        detail: String,
    },

    /// The server hosting the variable is unreachable.
    #[error("'{0}' is disconnected")]
    Disconnected(String),
}

impl Retryable for PvError {
    fn is_retryable(&self) -> bool {
        matches!(self, PvError::Timeout { .. } | PvError::Disconnected(_))
    }
}

/// Request/response access to named remote variables.
#[async_trait]
pub trait RemoteVariableClient: Send + Sync {
    /// Read the current value of `name`.
    async fn get(&self, name: &str, timeout: Duration) -> Result<PvValue, PvError>;

    /// Write `value` to `name` and wait for the server acknowledgement.
    async fn put(&self, name: &str, value: PvValue, timeout: Duration) -> Result<(), PvError>;

    /// Maximum number of outstanding requests the transport accepts, if limited.
    fn max_concurrent_requests(&self) -> Option<usize> {
        None
    }
}

/// `get` with the timeout enforced on the caller side as well.
pub async fn bounded_get(
    client: &dyn RemoteVariableClient,
    name: &str,
    timeout: Duration,
) -> Result<PvValue, PvError> {
    match tokio::time::timeout(timeout, client.get(name, timeout)).await {
        Ok(result) => result,
        Err(_) => Err(PvError::Timeout {
            name: name.to_string(),
            timeout,
        }),
    }
}

/// `put` with the timeout enforced on the caller side as well.
pub async fn bounded_put(
    client: &dyn RemoteVariableClient,
    name: &str,
    value: PvValue,
    timeout: Duration,
) -> Result<(), PvError> {
    match tokio::time::timeout(timeout, client.put(name, value, timeout)).await {
        Ok(result) => result,
        Err(_) => Err(PvError::Timeout {
            name: name.to_string(),
            timeout,
        }),
    }
}
