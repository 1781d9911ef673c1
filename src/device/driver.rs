//! Per-device capture driver.
//!
//! [`DeviceSequencerDriver::run`] takes one device from idle through a full capture:
//!
//! 1. readiness: RF on, gradient not ramping, control mode stable
//! 2. recovery: clear a sequencer left mid-cycle by an earlier run
//! 3. scope setup: switch to [`ScopeSettings::COLLECTION`] if the device differs
//! 4. transitions `Idle → Armed → Capturing → Harvesting`, each confirmed by a
//!    stability-gated readback of the control point
//! 5. harvest: one settled read per channel, checked against the expected length
//! 6. metadata snapshot
//! 7. re-arm, best effort
//! 8. scope restore, whenever step 3 changed anything
//!
//! Every step observes the run's cancellation token except the restore, which must
//! run after a deadline too. Failures end the task with a [`FailureRecord`]; they
//! never propagate to sibling devices.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::sequencer::{
    Transition, RUN_STATUS_ABANDONED, RUN_STATUS_CLEAR, SCOPE_RESET, STABLE_CONTROL_MODES,
    STATUS_RAMPING_BIT,
};
use super::{
    CaptureMetadata, CaptureWindow, DeviceId, DevicePvs, DeviceTask, ScopeSettings,
    SequencerState, Waveform,
};
use crate::aggregator::{FailurePhase, FailureReason, FailureRecord};
use crate::error_recovery::{retry_with_policy, RetryPolicy, Retryable};
use crate::limits::{DEFAULT_WAVEFORM_LENGTH, SLOW_HARVEST_WARNING};
use crate::pv::stable::{StabilityCriterion, StabilityError, StabilityGatedReader};
use crate::pv::{bounded_get, bounded_put, PvError, PvValue};

/// Format of the capture timestamps written to the device.
const CAPTURE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Settings shared by every driver of a run.
#[derive(Debug, Clone)]
pub struct DriverSettings {
    /// Budget for one stability-gated read or one plain request.
    pub read_timeout: Duration,
    /// Retry budget per step.
    pub retry: RetryPolicy,
    /// Channels harvested from every device.
    pub signals: Vec<String>,
    /// Expected samples per channel.
    pub waveform_length: usize,
    /// Extra PVs snapshotted with every capture.
    pub metadata_pvs: Vec<String>,
    /// Check RF state and control mode before arming.
    pub check_readiness: bool,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            signals: vec!["GMES".to_string()],
            waveform_length: DEFAULT_WAVEFORM_LENGTH,
            metadata_pvs: Vec::new(),
            check_readiness: true,
        }
    }
}

/// What a finished driver hands back to the coordinator.
#[derive(Debug)]
pub struct DriverReport {
    /// The terminal task.
    pub task: DeviceTask,
    /// One waveform per channel when the task succeeded.
    pub waveforms: Vec<Waveform>,
    /// Set when the task failed.
    pub failure: Option<FailureRecord>,
}

#[derive(Debug, Error)]
enum AttemptError {
    #[error(transparent)]
    Transport(#[from] PvError),
    #[error(transparent)]
    Unstable(#[from] StabilityError),
    #[error("{0}")]
    NotReady(String),
}

impl Retryable for AttemptError {
    fn is_retryable(&self) -> bool {
        match self {
            AttemptError::Transport(err) => err.is_retryable(),
            AttemptError::Unstable(err) => err.is_retryable(),
            AttemptError::NotReady(_) => true,
        }
    }
}

struct StepFailure {
    phase: FailurePhase,
    reason: FailureReason,
}

/// Drives one device through a capture.
pub struct DeviceSequencerDriver {
    device: DeviceId,
    pvs: DevicePvs,
    reader: StabilityGatedReader,
    settings: Arc<DriverSettings>,
    cancel: CancellationToken,
}

impl DeviceSequencerDriver {
    /// Driver for `device`. `cancel` fires when the run deadline passes.
    pub fn new(
        device: DeviceId,
        reader: StabilityGatedReader,
        settings: Arc<DriverSettings>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            pvs: DevicePvs::new(&device),
            device,
            reader,
            settings,
            cancel,
        }
    }

    /// Run the capture to a terminal outcome.
    #[instrument(name = "device_capture", skip(self), fields(device = %self.device))]
    pub async fn run(self) -> DriverReport {
        let mut task = DeviceTask::new(self.device.clone());
        let result = self.capture(&mut task).await;

        match result {
            Ok(waveforms) => {
                if let Err(err) = task.succeed() {
                    warn!(error = %err, "task already finished");
                }
                info!(
                    channels = waveforms.len(),
                    retries = task.retries(),
                    "capture complete"
                );
                DriverReport {
                    task,
                    waveforms,
                    failure: None,
                }
            }
            Err(StepFailure { phase, reason }) => {
                warn!(%phase, reason = %reason, retries = task.retries(), "capture failed");
                let record = FailureRecord::device(self.device.clone(), phase, reason.clone());
                if let Err(err) = task.fail(reason) {
                    warn!(error = %err, "task already finished");
                }
                DriverReport {
                    task,
                    waveforms: Vec::new(),
                    failure: Some(record),
                }
            }
        }
    }

    async fn capture(&self, task: &mut DeviceTask) -> Result<Vec<Waveform>, StepFailure> {
        if self.settings.check_readiness {
            let outcome = retry_with_policy(&self.settings.retry, &self.cancel, |_| {
                self.readiness_attempt()
            })
            .await;
            task.record_attempts(outcome.attempts);
            outcome.result.map_err(|err| {
                let detail = match &err {
                    AttemptError::NotReady(detail) => detail.clone(),
                    other => other.to_string(),
                };
                self.step_failure(
                    FailurePhase::Readiness,
                    FailureReason::DeviceNotReady(detail),
                    &err,
                )
            })?;
        }

        let outcome =
            retry_with_policy(&self.settings.retry, &self.cancel, |_| self.recovery_attempt())
                .await;
        task.record_attempts(outcome.attempts);
        let recovered = outcome.result.map_err(|err| {
            self.step_failure(
                FailurePhase::Recovery,
                FailureReason::UnstableAt(SequencerState::Idle),
                &err,
            )
        })?;
        if recovered {
            info!("cleared sequencer left mid-cycle");
        }

        let outcome =
            retry_with_policy(&self.settings.retry, &self.cancel, |_| self.scope_attempt()).await;
        task.record_attempts(outcome.attempts);
        let original = outcome.result.map_err(|err| self.scope_failure(&err))?;
        if original.matches(&ScopeSettings::COLLECTION, self.reader.tolerance()) {
            return self.cycle(task).await;
        }

        info!(?original, "switching scope to collection settings");
        let outcome = retry_with_policy(&self.settings.retry, &self.cancel, |_| {
            self.apply_scope(&ScopeSettings::COLLECTION, &self.cancel)
        })
        .await;
        task.record_attempts(outcome.attempts);
        let result = match outcome.result {
            Ok(()) => self.cycle(task).await,
            Err(err) => Err(self.scope_failure(&err)),
        };
        self.restore_scope(&original).await;
        result
    }

    async fn cycle(&self, task: &mut DeviceTask) -> Result<Vec<Waveform>, StepFailure> {
        let mut window_start = Utc::now();
        let mut window_end = window_start;
        while task.state() != SequencerState::Harvesting {
            let step = task.state().transition();
            let outcome = retry_with_policy(&self.settings.retry, &self.cancel, |attempt| {
                self.transition_attempt(step, attempt)
            })
            .await;
            task.record_attempts(outcome.attempts);
            let entered_at = outcome.result.map_err(|err| {
                self.step_failure(
                    FailurePhase::Sequencer(step.to),
                    FailureReason::UnstableAt(step.to),
                    &err,
                )
            })?;
            task.enter(step.to);
            match step.to {
                SequencerState::Capturing => window_start = entered_at,
                SequencerState::Harvesting => window_end = entered_at,
                SequencerState::Idle | SequencerState::Armed => {}
            }
        }

        let harvest_started = Instant::now();
        let waveforms = self
            .harvest(task, CaptureWindow {
                start: window_start,
                end: window_end,
            })
            .await?;
        let elapsed = harvest_started.elapsed();
        if elapsed > SLOW_HARVEST_WARNING {
            warn!(?elapsed, "slow harvest");
        }

        self.rearm(task).await;
        Ok(waveforms)
    }

    async fn harvest(
        &self,
        task: &mut DeviceTask,
        window: CaptureWindow,
    ) -> Result<Vec<Waveform>, StepFailure> {
        let harvesting = FailurePhase::Sequencer(SequencerState::Harvesting);
        let unstable = FailureReason::UnstableAt(SequencerState::Harvesting);
        let settled = StabilityCriterion::Settled;

        let interval_pv = self.pvs.sample_interval();
        let outcome = retry_with_policy(&self.settings.retry, &self.cancel, |_| {
            self.read_stable(&interval_pv, &settled)
        })
        .await;
        task.record_attempts(outcome.attempts);
        let interval = outcome
            .result
            .map_err(|err| self.step_failure(harvesting, unstable.clone(), &err))?;
        let sample_interval = interval.as_f64().ok_or_else(|| StepFailure {
            phase: harvesting,
            reason: FailureReason::MalformedWaveform {
                channel: interval_pv.clone(),
                detail: format!("expected a numeric sample interval, got {interval}"),
            },
        })?;

        let mut channels = Vec::with_capacity(self.settings.signals.len());
        for signal in &self.settings.signals {
            let pv = self.pvs.channel(signal);
            let outcome = retry_with_policy(&self.settings.retry, &self.cancel, |_| {
                self.read_stable(&pv, &settled)
            })
            .await;
            task.record_attempts(outcome.attempts);
            let value = outcome
                .result
                .map_err(|err| self.step_failure(harvesting, unstable.clone(), &err))?;
            let samples = self.check_shape(signal, value)?;
            debug!(channel = %signal, samples = samples.len(), "channel harvested");
            channels.push((signal.clone(), samples, Utc::now()));
        }

        let metadata = Arc::new(self.snapshot_metadata().await);
        Ok(channels
            .into_iter()
            .map(|(channel, samples, captured_at)| Waveform {
                device: self.device.clone(),
                channel,
                samples,
                captured_at,
                window,
                sample_interval,
                metadata: Arc::clone(&metadata),
            })
            .collect())
    }

    fn check_shape(&self, signal: &str, value: PvValue) -> Result<Vec<f64>, StepFailure> {
        let expected = self.settings.waveform_length;
        let detail = match value {
            PvValue::DoubleArray(samples) if samples.len() == expected => return Ok(samples),
            PvValue::DoubleArray(samples) => {
                format!("expected {expected} samples, got {}", samples.len())
            }
            other => format!("expected a waveform, got {other}"),
        };
        Err(StepFailure {
            phase: FailurePhase::Sequencer(SequencerState::Harvesting),
            reason: FailureReason::MalformedWaveform {
                channel: signal.to_string(),
                detail,
            },
        })
    }

    async fn snapshot_metadata(&self) -> CaptureMetadata {
        let mut floats = BTreeMap::new();
        let mut strings = BTreeMap::new();
        for name in &self.settings.metadata_pvs {
            match self.get(name).await {
                Ok(value) => match value.as_f64() {
                    Some(number) => {
                        floats.insert(name.clone(), number);
                    }
                    None => {
                        let text = match value {
                            PvValue::Text(text) => text,
                            other => other.to_string(),
                        };
                        strings.insert(name.clone(), text);
                    }
                },
                Err(err) => warn!(pv = %name, error = %err, "skipping unreadable metadata"),
            }
        }
        CaptureMetadata { floats, strings }
    }

    async fn rearm(&self, task: &mut DeviceTask) {
        let step = task.state().transition();
        match self
            .put(&self.pvs.control(), PvValue::Long(step.control_value))
            .await
        {
            Ok(()) => task.enter(step.to),
            Err(err) => warn!(error = %err, "could not re-arm after harvest"),
        }
    }

    /// Put the scope back as it was found. Runs detached from the run's cancellation.
    async fn restore_scope(&self, original: &ScopeSettings) {
        let detached = CancellationToken::new();
        let outcome = retry_with_policy(&self.settings.retry, &detached, |_| {
            self.apply_scope(original, &detached)
        })
        .await;
        match outcome.result {
            Ok(()) => info!("scope settings restored"),
            Err(err) => error!(?original, error = %err, "could not restore scope settings"),
        }
    }

    async fn scope_attempt(&self) -> Result<ScopeSettings, AttemptError> {
        Ok(ScopeSettings {
            mode: self.get_number(&self.pvs.run_status()).await? as i64,
            sample_interval: self.get_number(&self.pvs.sample_interval()).await?,
            trigger_delay: self.get_number(&self.pvs.trigger_delay()).await?,
            periodic: self.get_number(&self.pvs.periodic()).await?,
            debug: self.get_number(&self.pvs.debug()).await? as i64,
        })
    }

    /// Settings only change while the scope is reset; the mode goes back on last.
    async fn apply_scope(
        &self,
        settings: &ScopeSettings,
        cancel: &CancellationToken,
    ) -> Result<(), AttemptError> {
        let run_status = self.pvs.run_status();
        self.put_until(&run_status, PvValue::Long(SCOPE_RESET), cancel)
            .await?;
        self.read_stable_until(
            &run_status,
            &StabilityCriterion::Equals(PvValue::Long(RUN_STATUS_CLEAR)),
            cancel,
        )
        .await?;

        let parameters = [
            (self.pvs.sample_interval(), PvValue::Double(settings.sample_interval)),
            (self.pvs.trigger_delay(), PvValue::Double(settings.trigger_delay)),
            (self.pvs.periodic(), PvValue::Double(settings.periodic)),
            (self.pvs.debug(), PvValue::Long(settings.debug)),
        ];
        for (name, value) in &parameters {
            self.put_until(name, value.clone(), cancel).await?;
        }
        for (name, value) in parameters {
            self.read_stable_until(&name, &StabilityCriterion::Equals(value), cancel)
                .await?;
        }

        self.put_until(&run_status, PvValue::Long(settings.mode), cancel)
            .await?;
        self.read_stable_until(
            &run_status,
            &StabilityCriterion::Equals(PvValue::Long(settings.mode)),
            cancel,
        )
        .await?;
        Ok(())
    }

    async fn readiness_attempt(&self) -> Result<(), AttemptError> {
        let rf_on = self.get(&self.pvs.rf_on()).await?;
        if rf_on.as_i64() != Some(1) {
            return Err(AttemptError::NotReady(format!("RF is off ({rf_on})")));
        }

        let status = self.get(&self.pvs.status()).await?;
        match status.as_i64() {
            Some(word) if word & STATUS_RAMPING_BIT != 0 => {
                return Err(AttemptError::NotReady("gradient is ramping".to_string()));
            }
            Some(_) => {}
            None => {
                return Err(AttemptError::NotReady(format!(
                    "unexpected status word {status}"
                )));
            }
        }

        let mode = self.get(&self.pvs.control_mode()).await?;
        match mode.as_i64() {
            Some(mode) if STABLE_CONTROL_MODES.contains(&mode) => Ok(()),
            _ => Err(AttemptError::NotReady(format!("control mode {mode}"))),
        }
    }

    async fn recovery_attempt(&self) -> Result<bool, AttemptError> {
        let run_status = self.pvs.run_status();
        let status = self.get(&run_status).await?;
        if status.as_i64() != Some(RUN_STATUS_ABANDONED) {
            return Ok(false);
        }
        self.put(&run_status, PvValue::Long(RUN_STATUS_CLEAR)).await?;
        self.read_stable(
            &run_status,
            &StabilityCriterion::Equals(PvValue::Long(RUN_STATUS_CLEAR)),
        )
        .await?;
        Ok(true)
    }

    async fn transition_attempt(
        &self,
        step: Transition,
        attempt: u32,
    ) -> Result<DateTime<Utc>, AttemptError> {
        debug!(from = %step.from, to = %step.to, attempt, "writing control point");
        let control = self.pvs.control();
        self.put(&control, PvValue::Long(step.control_value)).await?;
        self.read_stable(
            &control,
            &StabilityCriterion::Equals(PvValue::Long(step.control_value)),
        )
        .await?;

        let entered_at = Utc::now();
        if let Some(mark) = self.pvs.mark(step.mark) {
            let stamp = entered_at.format(CAPTURE_TIMESTAMP_FORMAT).to_string();
            self.put(&mark, PvValue::Text(stamp)).await?;
        }
        Ok(entered_at)
    }

    async fn get(&self, name: &str) -> Result<PvValue, AttemptError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(StabilityError::Cancelled(name.to_string()).into()),
            result = bounded_get(self.reader.client(), name, self.settings.read_timeout) => {
                result.map_err(AttemptError::from)
            }
        }
    }

    async fn get_number(&self, name: &str) -> Result<f64, AttemptError> {
        let value = self.get(name).await?;
        value.as_f64().ok_or_else(|| {
            AttemptError::Transport(PvError::Malformed {
                name: name.to_string(),
                detail: format!("expected a number, got {value}"),
            })
        })
    }

    async fn put(&self, name: &str, value: PvValue) -> Result<(), AttemptError> {
        self.put_until(name, value, &self.cancel).await
    }

    async fn put_until(
        &self,
        name: &str,
        value: PvValue,
        cancel: &CancellationToken,
    ) -> Result<(), AttemptError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StabilityError::Cancelled(name.to_string()).into()),
            result = bounded_put(self.reader.client(), name, value, self.settings.read_timeout) => {
                result.map_err(AttemptError::from)
            }
        }
    }

    async fn read_stable(
        &self,
        name: &str,
        criterion: &StabilityCriterion,
    ) -> Result<PvValue, AttemptError> {
        self.read_stable_until(name, criterion, &self.cancel).await
    }

    async fn read_stable_until(
        &self,
        name: &str,
        criterion: &StabilityCriterion,
        cancel: &CancellationToken,
    ) -> Result<PvValue, AttemptError> {
        self.reader
            .read_stable(name, self.settings.read_timeout, criterion, cancel)
            .await
            .map_err(AttemptError::from)
    }

    fn scope_failure(&self, err: &AttemptError) -> StepFailure {
        self.step_failure(
            FailurePhase::ScopeSetup,
            FailureReason::ScopeSetupFailed(err.to_string()),
            err,
        )
    }

    fn step_failure(
        &self,
        phase: FailurePhase,
        reason: FailureReason,
        err: &AttemptError,
    ) -> StepFailure {
        let cancelled = self.cancel.is_cancelled()
            || matches!(err, AttemptError::Unstable(StabilityError::Cancelled(_)));
        let reason = if cancelled {
            FailureReason::DurationExceeded
        } else {
            debug!(error = %err, "step exhausted its retries");
            reason
        };
        StepFailure { phase, reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::TaskOutcome;
    use crate::pv::mock::{DeviceFault, SimulatedScopeIoc, SIMULATED_OPERATOR_SCOPE};

    const LENGTH: usize = 32;

    fn settings() -> Arc<DriverSettings> {
        Arc::new(DriverSettings {
            read_timeout: Duration::from_millis(200),
            retry: RetryPolicy {
                max_attempts: 2,
                backoff_delay: Duration::from_millis(10),
            },
            signals: vec!["GMES".into(), "PMES".into()],
            waveform_length: LENGTH,
            metadata_pvs: vec!["R1M1GSET".into(), "R1M1MODE".into(), "MISSING".into()],
            check_readiness: true,
        })
    }

    async fn ioc_with(device: &DeviceId) -> Arc<SimulatedScopeIoc> {
        let ioc = Arc::new(SimulatedScopeIoc::new(
            vec!["GMES".into(), "PMES".into()],
            LENGTH,
        ));
        ioc.add_device(device).await;
        ioc.set_value("R1M1GSET", 12.5).await;
        ioc.set_value("R1M1MODE", "GDR".to_string()).await;
        ioc
    }

    fn driver(ioc: Arc<SimulatedScopeIoc>, device: &DeviceId, cancel: CancellationToken) -> DeviceSequencerDriver {
        let reader = StabilityGatedReader::new(ioc, Duration::from_millis(10));
        DeviceSequencerDriver::new(device.clone(), reader, settings(), cancel)
    }

    fn control_writes(puts: &[(String, PvValue)]) -> Vec<i64> {
        puts.iter()
            .filter(|(name, _)| name.ends_with("WFSCOPstp"))
            .filter_map(|(_, value)| value.as_i64())
            .collect()
    }

    fn failure_code(report: &DriverReport) -> String {
        report
            .failure
            .as_ref()
            .map(|f| f.reason.code().into_owned())
            .unwrap_or_default()
    }

    #[tokio::test(start_paused = true)]
    async fn successful_capture_cycles_the_sequencer() {
        let device = DeviceId::new("R1M1");
        let ioc = ioc_with(&device).await;

        let report = driver(ioc.clone(), &device, CancellationToken::new()).run().await;

        assert_eq!(report.task.outcome(), &TaskOutcome::Succeeded);
        assert!(report.failure.is_none());
        assert_eq!(report.waveforms.len(), 2);
        for waveform in &report.waveforms {
            assert_eq!(waveform.samples.len(), LENGTH);
            assert!(waveform.window.start <= waveform.window.end);
        }
        let puts = ioc.puts().await;
        assert_eq!(control_writes(&puts), vec![128, 256, 512, 128]);
        assert!(puts.iter().any(|(name, _)| name == "R1M1WFSharvTake"));
        assert!(puts.iter().any(|(name, _)| name == "R1M1WFSharvDa"));
        assert_eq!(report.task.state(), SequencerState::Idle);
        assert_eq!(report.task.retries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn metadata_is_split_by_type_and_missing_pvs_skipped() {
        let device = DeviceId::new("R1M1");
        let ioc = ioc_with(&device).await;

        let report = driver(ioc, &device, CancellationToken::new()).run().await;
        let metadata = &report.waveforms[0].metadata;
        assert_eq!(metadata.floats.get("R1M1GSET"), Some(&12.5));
        assert_eq!(metadata.strings.get("R1M1MODE").map(String::as_str), Some("GDR"));
        assert!(!metadata.floats.contains_key("MISSING"));
        assert!(Arc::ptr_eq(metadata, &report.waveforms[1].metadata));
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_cycle_is_cleared_before_arming() {
        let device = DeviceId::new("R1M1");
        let ioc = ioc_with(&device).await;
        ioc.abandon_cycle(&device).await;

        let report = driver(ioc.clone(), &device, CancellationToken::new()).run().await;
        assert!(report.failure.is_none());

        let puts = ioc.puts().await;
        assert_eq!(puts[0], ("R1M1WFSCOPrun".to_string(), PvValue::Long(0)));
        assert_eq!(control_writes(&puts)[0], 128);
    }

    #[tokio::test(start_paused = true)]
    async fn unstable_control_fails_at_armed() {
        let device = DeviceId::new("R1M1");
        let ioc = ioc_with(&device).await;
        ioc.inject_fault(&device, DeviceFault::UnstableControl).await;

        let report = driver(ioc, &device, CancellationToken::new()).run().await;
        assert_eq!(failure_code(&report), "unstable_at_armed");
        assert_eq!(report.task.retries(), 1);
        assert_eq!(report.task.state(), SequencerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_harvest_write_fails_at_harvesting() {
        let device = DeviceId::new("R1M1");
        let ioc = ioc_with(&device).await;
        ioc.inject_fault(&device, DeviceFault::StallBeforeHarvest).await;

        let report = driver(ioc, &device, CancellationToken::new()).run().await;
        assert_eq!(failure_code(&report), "unstable_at_harvesting");
        assert_eq!(report.task.state(), SequencerState::Capturing);
    }

    #[tokio::test(start_paused = true)]
    async fn wrong_length_is_malformed_and_not_retried() {
        let device = DeviceId::new("R1M1");
        let ioc = ioc_with(&device).await;
        ioc.inject_fault(
            &device,
            DeviceFault::MalformedChannel {
                channel: "PMES".into(),
                length: 7,
            },
        )
        .await;

        let report = driver(ioc, &device, CancellationToken::new()).run().await;
        assert_eq!(failure_code(&report), "malformed_waveform");
        assert_eq!(report.task.retries(), 0);
        assert!(report.waveforms.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn channel_timeout_exhausts_retries() {
        let device = DeviceId::new("R1M1");
        let ioc = ioc_with(&device).await;
        ioc.inject_fault(&device, DeviceFault::ChannelTimeout("GMES".into()))
            .await;

        let report = driver(ioc, &device, CancellationToken::new()).run().await;
        assert_eq!(failure_code(&report), "unstable_at_harvesting");
        assert_eq!(report.task.retries(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rf_off_is_not_ready_and_never_arms() {
        let device = DeviceId::new("R1M1");
        let ioc = ioc_with(&device).await;
        ioc.set_value("R1M1RFONr", 0i64).await;

        let report = driver(ioc.clone(), &device, CancellationToken::new()).run().await;
        assert_eq!(failure_code(&report), "device_not_ready");
        assert!(ioc.puts().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn ramping_gradient_is_not_ready() {
        let device = DeviceId::new("R1M1");
        let ioc = ioc_with(&device).await;
        ioc.set_value("R1M1STAT1", 0x0800i64).await;

        let report = driver(ioc, &device, CancellationToken::new()).run().await;
        assert_eq!(failure_code(&report), "device_not_ready");
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_run_is_duration_exceeded() {
        let device = DeviceId::new("R1M1");
        let ioc = ioc_with(&device).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = driver(ioc, &device, cancel).run().await;
        assert_eq!(failure_code(&report), "duration_exceeded");
    }

    fn writes_to<'a>(puts: &'a [(String, PvValue)], name: &str) -> Vec<&'a PvValue> {
        puts.iter()
            .filter(|(pv, _)| pv == name)
            .map(|(_, value)| value)
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn scope_is_switched_for_the_capture_and_restored() {
        let device = DeviceId::new("R1M1");
        let ioc = ioc_with(&device).await;

        let report = driver(ioc.clone(), &device, CancellationToken::new()).run().await;
        assert!(report.failure.is_none());
        assert_eq!(report.waveforms[0].sample_interval, 0.2);

        let puts = ioc.puts().await;
        let arm = puts
            .iter()
            .position(|(name, _)| name == "R1M1WFSCOPstp")
            .unwrap();
        let collect_mode = puts
            .iter()
            .position(|(name, value)| name == "R1M1WFSCOPrun" && value.as_i64() == Some(3))
            .unwrap();
        assert!(collect_mode < arm);
        assert_eq!(
            writes_to(&puts, "R1M1TRGD1"),
            [&PvValue::Double(102.4), &PvValue::Double(0.0)]
        );
        assert_eq!(
            writes_to(&puts, "R1M1WFSCOPrun"),
            [
                &PvValue::Long(SCOPE_RESET),
                &PvValue::Long(3),
                &PvValue::Long(SCOPE_RESET),
                &PvValue::Long(SIMULATED_OPERATOR_SCOPE.mode),
            ]
        );
        assert_eq!(ioc.scope(&device).await, Some(SIMULATED_OPERATOR_SCOPE));
    }

    #[tokio::test(start_paused = true)]
    async fn scope_already_collecting_is_left_alone() {
        let device = DeviceId::new("R1M1");
        let ioc = ioc_with(&device).await;
        ioc.set_scope(&device, ScopeSettings::COLLECTION).await;

        let report = driver(ioc.clone(), &device, CancellationToken::new()).run().await;
        assert!(report.failure.is_none());
        let puts = ioc.puts().await;
        assert!(writes_to(&puts, "R1M1WFSCOPrun").is_empty());
        assert!(writes_to(&puts, "R1M1TRGS1").is_empty());
        assert_eq!(ioc.scope(&device).await, Some(ScopeSettings::COLLECTION));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_capture_restores_scope() {
        let device = DeviceId::new("R1M1");
        let ioc = ioc_with(&device).await;
        ioc.inject_fault(&device, DeviceFault::StallBeforeHarvest).await;

        let report = driver(ioc.clone(), &device, CancellationToken::new()).run().await;
        assert_eq!(failure_code(&report), "unstable_at_harvesting");
        assert_eq!(ioc.scope(&device).await, Some(SIMULATED_OPERATOR_SCOPE));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_capture_restores_scope() {
        let device = DeviceId::new("R1M1");
        let ioc = ioc_with(&device).await;
        ioc.inject_fault(&device, DeviceFault::StallBeforeHarvest).await;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let report = driver(ioc.clone(), &device, cancel).run().await;
        assert_eq!(failure_code(&report), "duration_exceeded");
        assert_eq!(ioc.scope(&device).await, Some(SIMULATED_OPERATOR_SCOPE));
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_scope_reset_fails_setup_without_arming() {
        let device = DeviceId::new("R1M1");
        let ioc = ioc_with(&device).await;
        ioc.inject_fault(&device, DeviceFault::StuckScopeReset).await;

        let report = driver(ioc.clone(), &device, CancellationToken::new()).run().await;
        assert_eq!(failure_code(&report), "scope_setup_failed");
        assert_eq!(
            report.failure.as_ref().map(|f| f.phase),
            Some(FailurePhase::ScopeSetup)
        );
        assert!(control_writes(&ioc.puts().await).is_empty());
    }
}
