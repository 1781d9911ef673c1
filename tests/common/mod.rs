//! Shared fixtures for the coordinator integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rfw_scope_daq::config::ScopeDaqConfig;
use rfw_scope_daq::precondition::StaticStorageGauge;
use rfw_scope_daq::pv::mock::SimulatedScopeIoc;
use rfw_scope_daq::pv::RemoteVariableClient;
use rfw_scope_daq::report::{ReportError, ReportSender, RunSummary};
use rfw_scope_daq::sink::WaveformSink;
use rfw_scope_daq::{CollectionRun, DeviceSelection, SessionCoordinator};
use tokio::sync::Mutex;

pub const SIGNALS: [&str; 2] = ["GMES", "PMES"];
pub const LENGTH: usize = 32;
pub const POWER_PV: &str = "R2XXITOT";

/// Configuration tuned for fast runs against the simulated IOC.
pub fn test_config(threshold: f64) -> ScopeDaqConfig {
    let mut config = ScopeDaqConfig::default();
    config.acquisition.duration = Duration::from_secs(60);
    config.acquisition.read_timeout = Duration::from_millis(200);
    config.acquisition.retries = 2;
    config.acquisition.retry_backoff = Duration::from_millis(10);
    config.acquisition.stability_interval = Duration::from_millis(10);
    config.acquisition.signals = SIGNALS.iter().map(|s| s.to_string()).collect();
    config.acquisition.waveform_length = LENGTH;
    config.preconditions.min_power = 10.0;
    config.preconditions.min_free_gib = 1.0;
    config.report.failure_threshold = threshold;
    config
}

/// A run over zone `R1M` with the given threshold.
pub fn zone_run(threshold: f64) -> CollectionRun {
    CollectionRun::from_config(&test_config(threshold), DeviceSelection::zone("R1M").unwrap())
        .unwrap()
}

/// An IOC serving every device of `zone` with healthy machine power.
pub async fn zone_ioc(zone: &str) -> Arc<SimulatedScopeIoc> {
    let ioc = SimulatedScopeIoc::new(SIGNALS.iter().map(|s| s.to_string()).collect(), LENGTH);
    ioc.add_zone(zone).await;
    ioc.set_value(POWER_PV, 50.0).await;
    Arc::new(ioc)
}

/// Keeps every summary it is asked to send; fails delivery when told to.
#[derive(Default)]
pub struct RecordingReporter {
    summaries: Mutex<Vec<RunSummary>>,
    fail: bool,
}

impl RecordingReporter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Self::default()
        })
    }

    pub async fn summaries(&self) -> Vec<RunSummary> {
        self.summaries.lock().await.clone()
    }
}

#[async_trait]
impl ReportSender for RecordingReporter {
    async fn send(&self, summary: &RunSummary) -> Result<(), ReportError> {
        self.summaries.lock().await.push(summary.clone());
        if self.fail {
            return Err(ReportError::Rejected {
                program: "sendmail".into(),
                status: "exit status: 75".into(),
                stderr: "no relay".into(),
            });
        }
        Ok(())
    }
}

/// Coordinator with plenty of free space.
pub fn coordinator(
    client: Arc<dyn RemoteVariableClient>,
    sink: Arc<dyn WaveformSink>,
    reporter: Arc<dyn ReportSender>,
) -> SessionCoordinator {
    coordinator_with_space(client, sink, reporter, 100.0)
}

pub fn coordinator_with_space(
    client: Arc<dyn RemoteVariableClient>,
    sink: Arc<dyn WaveformSink>,
    reporter: Arc<dyn ReportSender>,
    free_gib: f64,
) -> SessionCoordinator {
    SessionCoordinator::new(
        client,
        sink,
        reporter,
        Arc::new(StaticStorageGauge::with_free_gib(free_gib)),
    )
}
