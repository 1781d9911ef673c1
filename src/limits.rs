//! Shared constants for the acquisition orchestrator.
//!
//! Defaults that also appear in the configuration layer live here so that the
//! config defaults, the simulated IOC and the tests agree on them.

use std::time::Duration;

// =============================================================================
// Device Layout
// =============================================================================

/// Number of devices in one zone. Device names are the zone name plus `1..=ZONE_SIZE`.
pub const ZONE_SIZE: usize = 8;

/// Number of samples in one channel waveform record.
pub const DEFAULT_WAVEFORM_LENGTH: usize = 8192;

// =============================================================================
// Timing
// =============================================================================

/// Default interval between stability samples.
pub const DEFAULT_STABILITY_INTERVAL: Duration = Duration::from_millis(50);

/// Harvests slower than this are logged as a warning.
pub const SLOW_HARVEST_WARNING: Duration = Duration::from_millis(1500);

// =============================================================================
// Preconditions
// =============================================================================

/// Relative spread of two consecutive power samples that still counts as settled.
/// The power PV is an analog reading and never repeats exactly.
pub const DEFAULT_POWER_TOLERANCE: f64 = 0.01;

// =============================================================================
// Storage
// =============================================================================

/// Bytes per GiB, used by the free-space precondition.
pub const BYTES_PER_GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Attempts made to obtain a pooled database connection before a write fails.
pub const DB_CONNECT_ATTEMPTS: u32 = 10;

/// Pause between attempts to obtain a pooled database connection.
pub const DB_CONNECT_BACKOFF: Duration = Duration::from_millis(100);
