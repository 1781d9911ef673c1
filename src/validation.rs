//! Checks for device names, zone names and command-line values.

use std::path::Path;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;

/// `R<linac><zone>` with the zone letters each linac actually has.
#[allow(clippy::expect_used)]
static ZONE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^R(0[234]|[12][2-9A-Q])$").expect("valid zone pattern"));

/// Zone followed by a cavity number. Zone `R02` only has cavities 7 and 8.
#[allow(clippy::expect_used)]
static DEVICE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^R(02[78]|0[34][1-8]|[12][2-9A-Q][1-8])$").expect("valid device pattern")
});

/// Validates a zone name such as `R1M`.
///
/// # Returns
///
/// * `Ok(())` if the zone exists.
/// * `Err(&'static str)` otherwise.
pub fn is_valid_zone_name(zone: &str) -> Result<(), &'static str> {
    if ZONE_PATTERN.is_match(zone) {
        Ok(())
    } else {
        Err("Zone must be R<linac><zone>, e.g. R1M (linac 0 has zones 2, 3 and 4)")
    }
}

/// Validates a device name such as `R1M1`.
///
/// # Returns
///
/// * `Ok(())` if the device exists.
/// * `Err(&'static str)` otherwise.
pub fn is_valid_device_name(device: &str) -> Result<(), &'static str> {
    if DEVICE_PATTERN.is_match(device) {
        Ok(())
    } else {
        Err("Device must be R<linac><zone><cavity>, e.g. R1M1 (zone R02 has cavities 7 and 8 only)")
    }
}

/// Validates if a given string is a usable directory path.
pub fn is_valid_path(path: &Path) -> Result<(), &'static str> {
    let text = path.as_os_str().to_string_lossy();
    if text.is_empty() {
        return Err("Path cannot be empty");
    }
    if text.contains('\0') {
        return Err("Path cannot contain null bytes");
    }
    Ok(())
}

/// Validates a run duration in minutes.
pub fn is_valid_duration_minutes(minutes: f64) -> Result<(), &'static str> {
    if minutes.is_finite() && minutes > 0.0 {
        Ok(())
    } else {
        Err("Duration must be a positive number of minutes")
    }
}

/// Converts a validated duration in minutes, rejecting values too large to represent.
pub fn duration_from_minutes(minutes: f64) -> Result<Duration, &'static str> {
    is_valid_duration_minutes(minutes)?;
    Duration::try_from_secs_f64(minutes * 60.0).map_err(|_| "Duration is too long")
}

/// Validates a mail address, loosely: something@something.
pub fn is_valid_email(address: &str) -> Result<(), &'static str> {
    match address.split_once('@') {
        Some((user, host)) if !user.is_empty() && !host.is_empty() && !host.contains('@') => Ok(()),
        _ => Err("Email address must look like user@host"),
    }
}
