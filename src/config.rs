//! Configuration loading with figment.
//!
//! Sources, later ones winning:
//! 1. built-in defaults
//! 2. a TOML file (`config/rfw-scope-daq.toml` unless `-f` names another)
//! 3. environment variables prefixed `RFW_SCOPE_DAQ_`, with `__` separating sections,
//!    e.g. `RFW_SCOPE_DAQ_REPORT__FAILURE_THRESHOLD=0.25`
//!
//! Command-line flags are applied on top by the binary.
//!
//! # Example
//! ```no_run
//! use rfw_scope_daq::config::ScopeDaqConfig;
//!
//! let config = ScopeDaqConfig::load().unwrap();
//! config.validate().unwrap();
//! println!("collecting for {:?}", config.acquisition.duration);
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{AppResult, DaqError};
use crate::limits::{DEFAULT_POWER_TOLERANCE, DEFAULT_STABILITY_INTERVAL, DEFAULT_WAVEFORM_LENGTH};
use crate::logging::OutputFormat;
use crate::pv::FLOAT_TOLERANCE;
use crate::sink::SinkKind;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/rfw-scope-daq.toml";

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "RFW_SCOPE_DAQ_";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeDaqConfig {
    /// Application settings.
    pub application: ApplicationConfig,
    /// Capture behaviour.
    pub acquisition: AcquisitionConfig,
    /// Run-level checks.
    pub preconditions: PreconditionsConfig,
    /// Where waveforms go.
    pub output: OutputConfig,
    /// Failure reporting.
    pub report: ReportConfig,
}

/// Application-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name.
    pub name: String,
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Log output format.
    pub log_format: OutputFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "RFWScopeDAQ".to_string(),
            log_level: "info".to_string(),
            log_format: OutputFormat::Pretty,
        }
    }
}

/// Capture behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Deadline for the whole run.
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// Budget of one stability-gated read.
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    /// Attempts per step, including the first.
    pub retries: u32,
    /// Pause between attempts.
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
    /// Interval between stability samples.
    #[serde(with = "humantime_serde")]
    pub stability_interval: Duration,
    /// Relative tolerance when comparing float samples of device records.
    pub stability_tolerance: f64,
    /// Cap on concurrently driven devices. Unset or 0 means one task per device.
    pub max_concurrent_devices: Option<usize>,
    /// Channels harvested from every device.
    pub signals: Vec<String>,
    /// Expected samples per channel.
    pub waveform_length: usize,
    /// PVs snapshotted with every capture.
    pub metadata_pvs: Vec<String>,
    /// Check RF state and control mode before arming.
    pub check_readiness: bool,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(5 * 60),
            read_timeout: Duration::from_secs(5),
            retries: 3,
            retry_backoff: Duration::from_millis(100),
            stability_interval: DEFAULT_STABILITY_INTERVAL,
            stability_tolerance: FLOAT_TOLERANCE,
            max_concurrent_devices: None,
            signals: vec!["GMES".to_string(), "PMES".to_string()],
            waveform_length: DEFAULT_WAVEFORM_LENGTH,
            metadata_pvs: Vec::new(),
            check_readiness: true,
        }
    }
}

/// Run-level checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreconditionsConfig {
    /// PV carrying the machine power level.
    pub power_pv: String,
    /// Minimum power (inclusive).
    pub min_power: f64,
    /// Relative spread between two power samples still counted as settled.
    pub power_tolerance: f64,
    /// Minimum free space at the destination, GiB (inclusive).
    pub min_free_gib: f64,
}

impl Default for PreconditionsConfig {
    fn default() -> Self {
        Self {
            power_pv: "R2XXITOT".to_string(),
            min_power: 0.0,
            power_tolerance: DEFAULT_POWER_TOLERANCE,
            min_free_gib: 10.0,
        }
    }
}

/// Destination settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Backend.
    pub kind: SinkKind,
    /// Root of the file tree; runs write to `<base_dir>/<YYYY_MM_DD>/<zone>`.
    pub base_dir: PathBuf,
    /// sqlx URL of the database, required for `database` output.
    pub database_url: Option<String>,
    /// Partition holding the database files, checked for free space.
    pub db_data_partition: PathBuf,
    /// Pooled database connections for multi-device runs.
    pub db_pool_size: u32,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            kind: SinkKind::File,
            base_dir: PathBuf::from("/tmp/rfw-scope-data"),
            database_url: None,
            db_data_partition: PathBuf::from("/"),
            db_pool_size: 4,
        }
    }
}

/// Failure reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// Failure ratio above which a report is sent.
    pub failure_threshold: f64,
    /// Report recipients. Empty disables mail; the summary is only logged.
    pub recipients: Vec<String>,
    /// Sender address.
    pub from_addr: String,
    /// Mail transfer program, fed with `-t`.
    pub sendmail_path: PathBuf,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 0.1,
            recipients: Vec::new(),
            from_addr: "rfwscopedaq@localhost".to_string(),
            sendmail_path: PathBuf::from("/usr/sbin/sendmail"),
        }
    }
}

impl ScopeDaqConfig {
    /// Load from the default file (if present) and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from `path` (if present) and the environment.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(Self::figment(path.as_ref()).extract()?)
    }

    /// The provider stack, exposed so callers can merge further sources.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(ScopeDaqConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Check the loaded values for consistency.
    pub fn validate(&self) -> AppResult<()> {
        let invalid = |msg: String| Err(DaqError::Configuration(msg));

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let threshold = self.report.failure_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return invalid(format!(
                "Invalid failure_threshold {threshold}. Must be within [0, 1]"
            ));
        }

        let acquisition = &self.acquisition;
        if acquisition.signals.is_empty() {
            return invalid("At least one signal must be configured".to_string());
        }
        let mut seen = HashSet::new();
        for signal in &acquisition.signals {
            if !seen.insert(signal) {
                return invalid(format!("Duplicate signal: {signal}"));
            }
        }
        if acquisition.waveform_length == 0 {
            return invalid("waveform_length must be greater than 0".to_string());
        }
        if acquisition.retries == 0 {
            return invalid("retries must be at least 1".to_string());
        }
        if acquisition.duration.is_zero() {
            return invalid("duration must be greater than 0".to_string());
        }
        if acquisition.read_timeout.is_zero() || acquisition.stability_interval.is_zero() {
            return invalid("read_timeout and stability_interval must be greater than 0".to_string());
        }

        for (name, tolerance) in [
            ("stability_tolerance", acquisition.stability_tolerance),
            ("power_tolerance", self.preconditions.power_tolerance),
        ] {
            if !tolerance.is_finite() || tolerance < 0.0 {
                return invalid(format!("{name} must be a non-negative number"));
            }
        }

        if self.preconditions.min_free_gib < 0.0 {
            return invalid("min_free_gib must not be negative".to_string());
        }

        if self.output.kind == SinkKind::Database {
            match &self.output.database_url {
                Some(url) if !url.trim().is_empty() => {}
                _ => return invalid("database output requires output.database_url".to_string()),
            }
            if self.output.db_pool_size == 0 {
                return invalid("db_pool_size must be at least 1".to_string());
            }
        }

        Ok(())
    }

    /// Path whose filesystem must have room for the run's data.
    pub fn storage_path(&self) -> &Path {
        match self.output.kind {
            SinkKind::File => &self.output.base_dir,
            SinkKind::Database => &self.output.db_data_partition,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_are_valid() {
        let config = ScopeDaqConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.acquisition.duration, Duration::from_secs(300));
        assert_eq!(config.report.failure_threshold, 0.1);
        assert_eq!(config.storage_path(), Path::new("/tmp/rfw-scope-data"));
    }

    #[test]
    fn file_and_env_override_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "daq.toml",
                r#"
                [acquisition]
                duration = "2m"
                signals = ["GMES", "PMES", "CRFP"]
                max_concurrent_devices = 4

                [output]
                kind = "database"
                database_url = "sqlite:///tmp/scope.db"
                "#,
            )?;
            jail.set_env("RFW_SCOPE_DAQ_REPORT__FAILURE_THRESHOLD", "0.25");

            let config = ScopeDaqConfig::load_from("daq.toml").expect("config loads");
            assert_eq!(config.acquisition.duration, Duration::from_secs(120));
            assert_eq!(config.acquisition.signals.len(), 3);
            assert_eq!(config.acquisition.max_concurrent_devices, Some(4));
            assert_eq!(config.output.kind, SinkKind::Database);
            assert_eq!(config.report.failure_threshold, 0.25);
            assert_eq!(config.acquisition.read_timeout, Duration::from_secs(5));
            assert!(config.validate().is_ok());
            Ok(())
        });
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        Jail::expect_with(|_| {
            let config = ScopeDaqConfig::load_from("absent.toml").expect("defaults load");
            assert_eq!(config, ScopeDaqConfig::default());
            Ok(())
        });
    }

    #[test]
    fn threshold_out_of_range_is_rejected() {
        let mut config = ScopeDaqConfig::default();
        config.report.failure_threshold = 1.5;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("failure_threshold"));
    }

    #[test]
    fn database_output_needs_url() {
        let mut config = ScopeDaqConfig::default();
        config.output.kind = SinkKind::Database;
        assert!(config.validate().is_err());

        config.output.database_url = Some("sqlite:///tmp/scope.db".into());
        assert!(config.validate().is_ok());
        assert_eq!(config.storage_path(), Path::new("/"));
    }

    #[test]
    fn duplicate_signals_are_rejected() {
        let mut config = ScopeDaqConfig::default();
        config.acquisition.signals = vec!["GMES".into(), "GMES".into()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn tolerances_load_and_must_be_non_negative() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "daq.toml",
                r#"
                [acquisition]
                stability_tolerance = 1e-6

                [preconditions]
                power_tolerance = 0.05
                "#,
            )?;
            let config = ScopeDaqConfig::load_from("daq.toml").expect("config loads");
            assert_eq!(config.acquisition.stability_tolerance, 1e-6);
            assert_eq!(config.preconditions.power_tolerance, 0.05);
            assert!(config.validate().is_ok());
            Ok(())
        });

        let mut config = ScopeDaqConfig::default();
        config.preconditions.power_tolerance = -0.1;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("power_tolerance"));
    }

    #[test]
    fn invalid_log_level_is_rejected() {
        let mut config = ScopeDaqConfig::default();
        config.application.log_level = "loud".into();
        assert!(config.validate().is_err());
    }
}
