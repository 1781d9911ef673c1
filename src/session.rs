//! Collection runs.
//!
//! A [`CollectionRun`] describes one acquisition: which devices, for how long, with
//! which thresholds and where the data goes. [`SessionCoordinator::run`] executes it:
//!
//! 1. resolve the device selection (a zone expands to its eight cavities)
//! 2. evaluate the precondition gate; a failure ends the run before any device is armed
//! 3. arm a deadline that cancels every driver when the requested duration has passed
//!    or when the caller's interrupt token fires
//! 4. spawn one [`DeviceSequencerDriver`] per device, at most `limit` at a time
//! 5. write each device's waveforms to the sink as its report arrives
//! 6. aggregate the failures and send a report if the threshold was exceeded
//!
//! A [`RunResult`] is always produced; per-device problems never abort the run.

use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use futures::FutureExt;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Instrument};
use uuid::Uuid;

use crate::aggregator::{FailureAggregator, FailurePhase, FailureReason, FailureRecord, Verdict};
use crate::config::ScopeDaqConfig;
use crate::device::{
    DeviceId, DeviceSequencerDriver, DeviceTask, DriverReport, DriverSettings, Waveform,
};
use crate::error::{AppResult, DaqError};
use crate::error_recovery::RetryPolicy;
use crate::limits::ZONE_SIZE;
use crate::precondition::{PreconditionGate, PreconditionLimits, PreconditionSnapshot, StorageGauge};
use crate::pv::stable::StabilityGatedReader;
use crate::pv::RemoteVariableClient;
use crate::report::{ReportSender, RunSummary};
use crate::sink::{SinkKind, SinkTarget, WaveformSink};
use crate::validation::{is_valid_device_name, is_valid_zone_name};

/// Devices requested for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSelection {
    /// Every cavity of a zone, e.g. `R1M`.
    Zone(String),
    /// A single device, e.g. `R1M1`.
    Device(DeviceId),
}

impl DeviceSelection {
    /// Select a zone, checking its name.
    pub fn zone(name: &str) -> AppResult<Self> {
        is_valid_zone_name(name).map_err(|e| DaqError::InvalidDevice(format!("{name}: {e}")))?;
        Ok(DeviceSelection::Zone(name.to_string()))
    }

    /// Select one device, checking its name.
    pub fn device(name: &str) -> AppResult<Self> {
        is_valid_device_name(name).map_err(|e| DaqError::InvalidDevice(format!("{name}: {e}")))?;
        Ok(DeviceSelection::Device(DeviceId::new(name)))
    }

    /// Devices this selection stands for, in cavity order.
    pub fn resolve(&self) -> Vec<DeviceId> {
        match self {
            DeviceSelection::Zone(zone) => (1..=ZONE_SIZE)
                .map(|cavity| format!("{zone}{cavity}"))
                .filter(|name| is_valid_device_name(name).is_ok())
                .map(DeviceId::new)
                .collect(),
            DeviceSelection::Device(device) => vec![device.clone()],
        }
    }

    /// Zone the selected devices belong to.
    pub fn zone_name(&self) -> &str {
        match self {
            DeviceSelection::Zone(zone) => zone,
            DeviceSelection::Device(device) => device.zone(),
        }
    }
}

impl fmt::Display for DeviceSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSelection::Zone(zone) => write!(f, "zone {zone}"),
            DeviceSelection::Device(device) => write!(f, "device {device}"),
        }
    }
}

/// Everything needed to execute one run. Built once, not changed afterwards.
#[derive(Debug, Clone)]
pub struct CollectionRun {
    /// Run id, also tagging database rows.
    pub run_id: Uuid,
    /// Requested devices.
    pub selection: DeviceSelection,
    /// Deadline for the whole run.
    pub duration: Duration,
    /// Per-device driver settings.
    pub driver: DriverSettings,
    /// Interval between stability samples.
    pub stability_interval: Duration,
    /// Relative tolerance of stability comparisons on device records.
    pub stability_tolerance: f64,
    /// Failure ratio above which a report is sent.
    pub failure_threshold: f64,
    /// Run-level checks.
    pub preconditions: PreconditionLimits,
    /// Where the waveforms go.
    pub sink: SinkTarget,
    /// Cap on concurrently driven devices; `None` or 0 means no cap.
    pub max_concurrent_devices: Option<usize>,
    /// When the run was requested.
    pub requested_at: DateTime<Utc>,
}

impl CollectionRun {
    /// Build a run for `selection` from a validated configuration.
    pub fn from_config(config: &ScopeDaqConfig, selection: DeviceSelection) -> AppResult<Self> {
        let run_id = Uuid::new_v4();
        let requested_at = Utc::now();
        let acquisition = &config.acquisition;

        let sink = match config.output.kind {
            SinkKind::File => SinkTarget::File {
                out_dir: output_dir(&config.output.base_dir, requested_at, selection.zone_name()),
            },
            SinkKind::Database => {
                let url = config.output.database_url.clone().ok_or_else(|| {
                    DaqError::Configuration("database output requires output.database_url".into())
                })?;
                let pool_size = match selection {
                    DeviceSelection::Device(_) => 1,
                    DeviceSelection::Zone(_) => config.output.db_pool_size,
                };
                SinkTarget::Database {
                    url,
                    pool_size,
                    run_id,
                }
            }
        };

        Ok(Self {
            run_id,
            duration: acquisition.duration,
            driver: DriverSettings {
                read_timeout: acquisition.read_timeout,
                retry: RetryPolicy {
                    max_attempts: acquisition.retries,
                    backoff_delay: acquisition.retry_backoff,
                },
                signals: acquisition.signals.clone(),
                waveform_length: acquisition.waveform_length,
                metadata_pvs: acquisition.metadata_pvs.clone(),
                check_readiness: acquisition.check_readiness,
            },
            stability_interval: acquisition.stability_interval,
            stability_tolerance: acquisition.stability_tolerance,
            failure_threshold: config.report.failure_threshold,
            preconditions: PreconditionLimits {
                power_pv: config.preconditions.power_pv.clone(),
                min_power: config.preconditions.min_power,
                power_tolerance: config.preconditions.power_tolerance,
                min_free_gib: config.preconditions.min_free_gib,
                storage_path: config.storage_path().to_path_buf(),
            },
            sink,
            max_concurrent_devices: acquisition.max_concurrent_devices,
            requested_at,
            selection,
        })
    }
}

/// `<base_dir>/<YYYY_MM_DD>/<zone>`, dated in local time.
pub fn output_dir(base_dir: &std::path::Path, at: DateTime<Utc>, zone: &str) -> PathBuf {
    base_dir
        .join(at.with_timezone(&Local).format("%Y_%m_%d").to_string())
        .join(zone)
}

/// Receipt for a waveform the sink accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectedWaveform {
    /// Device it came from.
    pub device: DeviceId,
    /// Channel name.
    pub channel: String,
    /// When it was read back.
    pub captured_at: DateTime<Utc>,
    /// Number of samples written.
    pub samples: usize,
}

impl From<&Waveform> for CollectedWaveform {
    fn from(waveform: &Waveform) -> Self {
        Self {
            device: waveform.device.clone(),
            channel: waveform.channel.clone(),
            captured_at: waveform.captured_at,
            samples: waveform.samples.len(),
        }
    }
}

/// What happened to the failure report.
#[derive(Debug, Clone, PartialEq)]
pub enum ReportStatus {
    /// The failure ratio stayed within the threshold.
    NotTriggered,
    /// Report handed to the sender successfully.
    Delivered,
    /// Report triggered but the sender failed.
    DeliveryFailed(String),
}

/// Result of a run, produced even when nothing was collected.
#[derive(Debug, Clone)]
pub struct RunResult {
    /// Run id.
    pub run_id: Uuid,
    /// Requested devices.
    pub selection: DeviceSelection,
    /// When the coordinator started the run.
    pub started_at: DateTime<Utc>,
    /// When every device task had finished.
    pub finished_at: DateTime<Utc>,
    /// Terminal tasks, in completion order. Empty when the preconditions failed.
    pub tasks: Vec<DeviceTask>,
    /// Waveforms the sink accepted.
    pub collected: Vec<CollectedWaveform>,
    /// Every failure, in the order it was observed.
    pub failures: Vec<FailureRecord>,
    /// Precondition readings.
    pub precondition: Option<PreconditionSnapshot>,
    /// Aggregated outcome.
    pub verdict: Verdict,
    /// Report delivery.
    pub report: ReportStatus,
}

impl RunResult {
    /// `true` when the run started and stayed within its failure threshold.
    pub fn succeeded(&self) -> bool {
        !self.verdict.report_triggered
            && self
                .precondition
                .as_ref()
                .is_some_and(PreconditionSnapshot::passed)
    }

    /// Devices with no failure recorded against them.
    pub fn successful_devices(&self) -> Vec<&DeviceId> {
        let failed: BTreeSet<&DeviceId> = self
            .failures
            .iter()
            .filter_map(|record| record.device.as_ref())
            .collect();
        self.tasks
            .iter()
            .map(DeviceTask::device)
            .filter(|device| !failed.contains(device))
            .collect()
    }
}

/// Number of devices driven at once: the device count, lowered by the requested cap
/// and by the transport's request limit. Zero means "no limit" for both.
pub fn concurrency_limit(devices: usize, requested: Option<usize>, transport: Option<usize>) -> usize {
    [requested, transport]
        .into_iter()
        .flatten()
        .filter(|limit| *limit > 0)
        .fold(devices.max(1), usize::min)
}

/// Executes collection runs against one set of collaborators.
pub struct SessionCoordinator {
    client: Arc<dyn RemoteVariableClient>,
    sink: Arc<dyn WaveformSink>,
    reporter: Arc<dyn ReportSender>,
    gauge: Arc<dyn StorageGauge>,
}

impl SessionCoordinator {
    /// Coordinator reading through `client`, persisting to `sink`, reporting through
    /// `reporter` and measuring free space with `gauge`.
    pub fn new(
        client: Arc<dyn RemoteVariableClient>,
        sink: Arc<dyn WaveformSink>,
        reporter: Arc<dyn ReportSender>,
        gauge: Arc<dyn StorageGauge>,
    ) -> Self {
        Self {
            client,
            sink,
            reporter,
            gauge,
        }
    }

    /// Execute `run` to completion.
    pub async fn run(&self, run: CollectionRun) -> RunResult {
        self.run_until(run, CancellationToken::new()).await
    }

    /// Execute `run`, stopping early once `interrupt` is cancelled.
    ///
    /// An interrupt ends the run the way its deadline does: unfinished devices are
    /// recorded as `duration_exceeded`, their scopes are restored and the failures are
    /// still aggregated and reported.
    #[instrument(
        name = "collection_run",
        skip_all,
        fields(run_id = %run.run_id, selection = %run.selection, sink = self.sink.kind())
    )]
    pub async fn run_until(&self, run: CollectionRun, interrupt: CancellationToken) -> RunResult {
        let started_at = Utc::now();
        let devices = run.selection.resolve();
        let total = devices.len();
        let reader = StabilityGatedReader::new(self.client.clone(), run.stability_interval)
            .with_tolerance(run.stability_tolerance);
        let aggregator = FailureAggregator::new(run.failure_threshold);
        info!(devices = total, duration = ?run.duration, "collection starting");

        let cancel = interrupt.child_token();
        let deadline = tokio::spawn(expire_after(run.duration, interrupt, cancel.clone()));

        let gate = PreconditionGate::new(reader.clone(), self.gauge.clone(), run.driver.read_timeout);
        let snapshot = gate.evaluate(&run.preconditions, &cancel).await;

        let mut tasks = Vec::with_capacity(total);
        let mut collected = Vec::new();
        let mut failures = Vec::new();

        if let Some(reason) = snapshot.failure.clone() {
            error!(reason = %reason, "preconditions not met, no device armed");
            failures.push(FailureRecord::whole_run(FailurePhase::Precondition, reason));
        } else {
            let limit = concurrency_limit(
                total,
                run.max_concurrent_devices,
                self.client.max_concurrent_requests(),
            );
            debug!(limit, "fanning out");
            let mut reports = self.fan_out(&devices, limit, reader, &run.driver, &cancel);
            let mut outstanding: BTreeSet<DeviceId> = devices.iter().cloned().collect();

            while let Some(report) = reports.receiver.recv().await {
                outstanding.remove(report.task.device());
                self.absorb(report, &mut tasks, &mut collected, &mut failures)
                    .await;
            }
            while let Some(joined) = reports.tasks.join_next().await {
                if let Err(err) = joined {
                    error!(error = %err, "device task ended abnormally");
                }
            }
            // A task that died before reporting still counts against the run.
            for device in outstanding {
                let report = panicked_report(device, "task ended without a report".into());
                self.absorb(report, &mut tasks, &mut collected, &mut failures)
                    .await;
            }
        }

        deadline.abort();
        let finished_at = Utc::now();
        let verdict = aggregator.conclude(total, &failures);
        info!(
            total = verdict.total,
            failed = verdict.failed,
            ratio = verdict.ratio,
            collected = collected.len(),
            "collection finished"
        );

        let mut result = RunResult {
            run_id: run.run_id,
            selection: run.selection,
            started_at,
            finished_at,
            tasks,
            collected,
            failures,
            precondition: Some(snapshot),
            verdict,
            report: ReportStatus::NotTriggered,
        };

        if verdict.report_triggered {
            let summary = RunSummary::from_result(&result);
            result.report = match self.reporter.send(&summary).await {
                Ok(()) => ReportStatus::Delivered,
                Err(err) => {
                    error!(error = %err, "failed to deliver failure report");
                    ReportStatus::DeliveryFailed(err.to_string())
                }
            };
        }

        result
    }

    fn fan_out(
        &self,
        devices: &[DeviceId],
        limit: usize,
        reader: StabilityGatedReader,
        settings: &DriverSettings,
        cancel: &CancellationToken,
    ) -> Reports {
        let semaphore = Arc::new(Semaphore::new(limit));
        let settings = Arc::new(settings.clone());
        let (sender, receiver) = mpsc::channel(devices.len().max(1));
        let mut tasks = JoinSet::new();

        for device in devices {
            let device = device.clone();
            let semaphore = semaphore.clone();
            let reader = reader.clone();
            let settings = settings.clone();
            let cancel = cancel.clone();
            let sender = sender.clone();

            tasks.spawn(
                async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return;
                    };
                    let driver =
                        DeviceSequencerDriver::new(device.clone(), reader, settings, cancel);
                    let report = match AssertUnwindSafe(driver.run()).catch_unwind().await {
                        Ok(report) => report,
                        Err(panic) => {
                            let message = panic_message(panic.as_ref());
                            error!(%device, panic = %message, "device driver panicked");
                            panicked_report(device, message)
                        }
                    };
                    if sender.send(report).await.is_err() {
                        warn!("coordinator stopped listening");
                    }
                }
                .in_current_span(),
            );
        }

        Reports { receiver, tasks }
    }

    async fn absorb(
        &self,
        report: DriverReport,
        tasks: &mut Vec<DeviceTask>,
        collected: &mut Vec<CollectedWaveform>,
        failures: &mut Vec<FailureRecord>,
    ) {
        let DriverReport {
            task,
            waveforms,
            failure,
        } = report;
        failures.extend(failure);

        for waveform in &waveforms {
            match self.sink.write(waveform).await {
                Ok(()) => collected.push(CollectedWaveform::from(waveform)),
                Err(err) => {
                    error!(
                        device = %waveform.device,
                        channel = %waveform.channel,
                        error = %err,
                        "sink write failed"
                    );
                    failures.push(FailureRecord::device(
                        waveform.device.clone(),
                        FailurePhase::Storage,
                        FailureReason::SinkWriteFailed(err.to_string()),
                    ));
                    break;
                }
            }
        }
        tasks.push(task);
    }
}

struct Reports {
    receiver: mpsc::Receiver<DriverReport>,
    tasks: JoinSet<()>,
}

/// Cancels `cancel` once `duration` has passed. `cancel` is a child of `interrupt`.
async fn expire_after(duration: Duration, interrupt: CancellationToken, cancel: CancellationToken) {
    tokio::select! {
        biased;
        _ = interrupt.cancelled() => {
            warn!("run interrupted, cancelling remaining devices");
        }
        _ = tokio::time::sleep(duration) => {
            warn!(?duration, "run deadline reached, cancelling remaining devices");
            cancel.cancel();
        }
    }
}

fn panicked_report(device: DeviceId, message: String) -> DriverReport {
    let reason = FailureReason::DriverPanicked(message);
    let mut task = DeviceTask::new(device.clone());
    if let Err(err) = task.fail(reason.clone()) {
        warn!(error = %err, "task already finished");
    }
    DriverReport {
        task,
        waveforms: Vec::new(),
        failure: Some(FailureRecord::device(device, FailurePhase::Supervision, reason)),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
