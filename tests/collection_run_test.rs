//! End-to-end runs of the session coordinator against the simulated IOC.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::*;
use rfw_scope_daq::aggregator::FailurePhase;
use rfw_scope_daq::device::{DeviceId, SequencerState, TaskOutcome};
use rfw_scope_daq::pv::mock::{DeviceFault, SimulatedScopeIoc, SIMULATED_OPERATOR_SCOPE};
use rfw_scope_daq::pv::{PvError, PvValue, RemoteVariableClient};
use rfw_scope_daq::report::STORAGE_SUBJECT;
use rfw_scope_daq::session::ReportStatus;
use rfw_scope_daq::sink::memory::MemorySink;
use rfw_scope_daq::{CollectionRun, DeviceSelection};
use tokio_util::sync::CancellationToken;

fn codes_for(result: &rfw_scope_daq::RunResult, device: &str) -> Vec<String> {
    result
        .failures
        .iter()
        .filter(|record| record.device.as_ref().map(DeviceId::as_str) == Some(device))
        .map(|record| record.reason.code().into_owned())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn one_channel_timeout_out_of_eight_triggers_at_zero_threshold() {
    let ioc = zone_ioc("R1M").await;
    ioc.inject_fault(&DeviceId::new("R1M4"), DeviceFault::ChannelTimeout("GMES".into()))
        .await;
    let sink = Arc::new(MemorySink::new());
    let reporter = RecordingReporter::new();

    let result = coordinator(ioc, sink.clone(), reporter.clone())
        .run(zone_run(0.0))
        .await;

    assert_eq!(result.tasks.len(), 8);
    assert_eq!(result.successful_devices().len(), 7);
    assert_eq!(result.verdict.failed, 1);
    assert_eq!(result.verdict.total, 8);
    assert!(result.verdict.report_triggered);
    assert_eq!(result.report, ReportStatus::Delivered);
    assert_eq!(codes_for(&result, "R1M4"), ["unstable_at_harvesting"]);
    assert_eq!(result.collected.len(), 14);
    assert_eq!(sink.len().await, 14);
    assert!(!result.succeeded());

    let summaries = reporter.summaries().await;
    assert_eq!(summaries.len(), 1);
    let failed: Vec<&str> = summaries[0]
        .devices
        .iter()
        .filter(|device| device.failed)
        .map(|device| device.device.as_str())
        .collect();
    assert_eq!(failed, ["R1M4"]);
}

#[tokio::test(start_paused = true)]
async fn clean_zone_run_sends_no_report() {
    let ioc = zone_ioc("R1M").await;
    let sink = Arc::new(MemorySink::new());
    let reporter = RecordingReporter::new();

    let result = coordinator(ioc.clone(), sink.clone(), reporter.clone())
        .run(zone_run(0.1))
        .await;

    assert!(result.failures.is_empty());
    assert_eq!(result.verdict.ratio, 0.0);
    assert_eq!(result.report, ReportStatus::NotTriggered);
    assert!(result.succeeded());
    assert!(reporter.summaries().await.is_empty());
    assert!(result
        .tasks
        .iter()
        .all(|task| task.outcome() == &TaskOutcome::Succeeded));

    let waveforms = sink.waveforms().await;
    assert_eq!(waveforms.len(), 16);
    assert!(waveforms.iter().all(|w| w.samples.len() == LENGTH));
    assert!(result.precondition.as_ref().unwrap().passed());
    assert!(result.started_at <= result.finished_at);
}

#[tokio::test(start_paused = true)]
async fn insufficient_storage_stops_the_run_before_arming() {
    let ioc = zone_ioc("R1M").await;
    let sink = Arc::new(MemorySink::new());
    let reporter = RecordingReporter::new();

    let result = coordinator_with_space(ioc.clone(), sink.clone(), reporter.clone(), 0.5)
        .run(zone_run(0.1))
        .await;

    assert!(ioc.puts().await.is_empty());
    assert!(result.tasks.is_empty());
    assert!(sink.is_empty().await);
    assert_eq!(result.failures.len(), 1);
    let record = &result.failures[0];
    assert!(record.is_whole_run());
    assert_eq!(record.phase, FailurePhase::Precondition);
    assert_eq!(record.reason.code(), "insufficient_storage");
    assert_eq!(result.verdict.failed, result.verdict.total);
    assert!(result.verdict.report_triggered);

    let summaries = reporter.summaries().await;
    assert_eq!(summaries.len(), 1);
    assert!(summaries[0].storage_exhausted);
    assert_eq!(summaries[0].subject(), STORAGE_SUBJECT);
}

#[tokio::test(start_paused = true)]
async fn low_power_stops_the_run() {
    let ioc = zone_ioc("R1M").await;
    ioc.set_value(POWER_PV, 2.0).await;

    let result = coordinator(ioc.clone(), Arc::new(MemorySink::new()), RecordingReporter::new())
        .run(zone_run(0.1))
        .await;

    assert!(ioc.puts().await.is_empty());
    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].reason.code(), "insufficient_power");
    assert_eq!(result.precondition.as_ref().unwrap().power, Some(2.0));
}

#[tokio::test(start_paused = true)]
async fn whole_run_failure_at_full_threshold_is_not_reported() {
    let ioc = zone_ioc("R1M").await;
    ioc.set_value(POWER_PV, 2.0).await;
    let reporter = RecordingReporter::new();

    let result = coordinator(ioc, Arc::new(MemorySink::new()), reporter.clone())
        .run(zone_run(1.0))
        .await;

    assert_eq!(result.verdict.ratio, 1.0);
    assert!(!result.verdict.report_triggered);
    assert!(reporter.summaries().await.is_empty());
    assert!(!result.succeeded());
}

#[tokio::test(start_paused = true)]
async fn low_storage_is_reported_at_full_threshold() {
    let ioc = zone_ioc("R1M").await;
    let reporter = RecordingReporter::new();

    let result = coordinator_with_space(ioc, Arc::new(MemorySink::new()), reporter.clone(), 0.5)
        .run(zone_run(1.0))
        .await;

    assert_eq!(result.failures[0].reason.code(), "insufficient_storage");
    assert_eq!(result.verdict.ratio, 1.0);
    assert!(result.verdict.report_triggered);
    assert_eq!(result.report, ReportStatus::Delivered);
    let summaries = reporter.summaries().await;
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].subject(), STORAGE_SUBJECT);
}

#[tokio::test(start_paused = true)]
async fn unstable_control_point_fails_at_armed() {
    let ioc = zone_ioc("R1M").await;
    ioc.inject_fault(&DeviceId::new("R1M1"), DeviceFault::UnstableControl)
        .await;

    let result = coordinator(ioc, Arc::new(MemorySink::new()), RecordingReporter::new())
        .run(zone_run(0.5))
        .await;

    assert_eq!(codes_for(&result, "R1M1"), ["unstable_at_armed"]);
    let record = result
        .failures
        .iter()
        .find(|record| record.device == Some(DeviceId::new("R1M1")))
        .unwrap();
    assert_eq!(record.phase, FailurePhase::Sequencer(SequencerState::Armed));
    assert_eq!(result.successful_devices().len(), 7);
    assert!(!result.verdict.report_triggered);
}

#[tokio::test(start_paused = true)]
async fn abandoned_cycle_is_recovered() {
    let ioc = zone_ioc("R1M").await;
    let device = DeviceId::new("R1M5");
    ioc.abandon_cycle(&device).await;

    let result = coordinator(ioc.clone(), Arc::new(MemorySink::new()), RecordingReporter::new())
        .run(zone_run(0.0))
        .await;

    assert!(result.failures.is_empty());
    assert!(ioc
        .puts()
        .await
        .contains(&("R1M5WFSCOPrun".to_string(), PvValue::Long(0))));
    assert_eq!(ioc.value("R1M5WFSCOPrun").await, Some(PvValue::Long(0)));
}

#[tokio::test(start_paused = true)]
async fn wrong_length_is_malformed() {
    let ioc = zone_ioc("R1M").await;
    ioc.inject_fault(
        &DeviceId::new("R1M6"),
        DeviceFault::MalformedChannel {
            channel: "PMES".into(),
            length: LENGTH - 1,
        },
    )
    .await;
    let sink = Arc::new(MemorySink::new());

    let result = coordinator(ioc, sink.clone(), RecordingReporter::new())
        .run(zone_run(0.5))
        .await;

    assert_eq!(codes_for(&result, "R1M6"), ["malformed_waveform"]);
    assert!(sink
        .waveforms()
        .await
        .iter()
        .all(|w| w.device.as_str() != "R1M6"));
}

#[tokio::test(start_paused = true)]
async fn unreachable_device_is_not_ready() {
    let ioc = zone_ioc("R1M").await;
    ioc.inject_fault(&DeviceId::new("R1M2"), DeviceFault::Unreachable)
        .await;

    let result = coordinator(ioc, Arc::new(MemorySink::new()), RecordingReporter::new())
        .run(zone_run(0.5))
        .await;

    assert_eq!(codes_for(&result, "R1M2"), ["device_not_ready"]);
    assert_eq!(result.verdict.failed, 1);
}

#[tokio::test(start_paused = true)]
async fn deadline_cancels_devices_promptly() {
    let ioc = zone_ioc("R1M").await;
    let mut run = zone_run(0.1);
    run.duration = Duration::from_millis(30);

    let started = tokio::time::Instant::now();
    let result = coordinator(ioc, Arc::new(MemorySink::new()), RecordingReporter::new())
        .run(run)
        .await;

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(result.tasks.len(), 8);
    for task in &result.tasks {
        assert_eq!(
            codes_for(&result, task.device().as_str()),
            ["duration_exceeded"],
            "{}",
            task.device()
        );
    }
    assert!(result.collected.is_empty());
    assert_eq!(result.verdict.failed, 8);
}

#[tokio::test(start_paused = true)]
async fn interrupt_ends_the_run_and_still_reports() {
    let ioc = zone_ioc("R1M").await;
    for cavity in 1..=8 {
        ioc.inject_fault(&DeviceId::new(format!("R1M{cavity}")), DeviceFault::StallBeforeHarvest)
            .await;
    }
    let sink = Arc::new(MemorySink::new());
    let reporter = RecordingReporter::new();
    let mut run = zone_run(0.1);
    run.driver.read_timeout = Duration::from_secs(5);

    let interrupt = CancellationToken::new();
    let trigger = interrupt.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        trigger.cancel();
    });

    let started = tokio::time::Instant::now();
    let result = coordinator(ioc.clone(), sink.clone(), reporter.clone())
        .run_until(run, interrupt)
        .await;

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(result.tasks.len(), 8);
    for task in &result.tasks {
        let device = task.device();
        assert_eq!(codes_for(&result, device.as_str()), ["duration_exceeded"], "{device}");
        assert_eq!(ioc.scope(device).await, Some(SIMULATED_OPERATOR_SCOPE), "{device}");
    }
    assert!(sink.is_empty().await);
    assert_eq!(result.verdict.failed, 8);
    assert_eq!(result.report, ReportStatus::Delivered);
    assert_eq!(reporter.summaries().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn waveforms_are_stored_while_a_sibling_is_still_stalled() {
    let ioc = zone_ioc("R1M").await;
    ioc.inject_fault(&DeviceId::new("R1M8"), DeviceFault::StallBeforeHarvest)
        .await;
    let sink = Arc::new(MemorySink::new());
    let mut run = zone_run(0.5);
    run.driver.read_timeout = Duration::from_secs(10);

    let coordinator = coordinator(ioc, sink.clone(), RecordingReporter::new());
    let handle = tokio::spawn(async move { coordinator.run(run).await });

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(!handle.is_finished());
    let stored = sink.waveforms().await;
    assert_eq!(stored.len(), 14);
    assert!(stored.iter().all(|w| w.device.as_str() != "R1M8"));

    let result = handle.await.unwrap();
    assert_eq!(codes_for(&result, "R1M8"), ["unstable_at_harvesting"]);
    assert_eq!(result.collected.len(), 14);
    assert_eq!(sink.len().await, 14);
}

#[tokio::test(start_paused = true)]
async fn requested_cap_bounds_concurrency() {
    let ioc = zone_ioc("R1M").await;
    let mut run = zone_run(0.1);
    run.max_concurrent_devices = Some(2);

    let result = coordinator(ioc.clone(), Arc::new(MemorySink::new()), RecordingReporter::new())
        .run(run)
        .await;

    assert!(result.failures.is_empty());
    assert!(ioc.peak_in_flight() <= 2, "peak {}", ioc.peak_in_flight());
}

#[tokio::test(start_paused = true)]
async fn transport_limit_bounds_concurrency() {
    let ioc = SimulatedScopeIoc::new(SIGNALS.iter().map(|s| s.to_string()).collect(), LENGTH)
        .with_request_limit(3);
    ioc.add_zone("R1M").await;
    ioc.set_value(POWER_PV, 50.0).await;
    let ioc = Arc::new(ioc);

    let result = coordinator(ioc.clone(), Arc::new(MemorySink::new()), RecordingReporter::new())
        .run(zone_run(0.1))
        .await;

    assert!(result.failures.is_empty());
    assert!(ioc.peak_in_flight() <= 3, "peak {}", ioc.peak_in_flight());
}

#[tokio::test(start_paused = true)]
async fn rejected_write_counts_the_device_as_failed() {
    let ioc = zone_ioc("R1M").await;
    let sink = Arc::new(MemorySink::new());
    sink.reject_device(DeviceId::new("R1M2")).await;

    let result = coordinator(ioc, sink.clone(), RecordingReporter::new())
        .run(zone_run(0.1))
        .await;

    let record = result
        .failures
        .iter()
        .find(|record| record.device == Some(DeviceId::new("R1M2")))
        .unwrap();
    assert_eq!(record.phase, FailurePhase::Storage);
    assert_eq!(record.reason.code(), "sink_write_failed");

    let task = result
        .tasks
        .iter()
        .find(|task| task.device().as_str() == "R1M2")
        .unwrap();
    assert_eq!(task.outcome(), &TaskOutcome::Succeeded);
    assert_eq!(result.verdict.failed, 1);
    assert!(result.verdict.report_triggered);
    assert_eq!(sink.len().await, 14);
}

#[tokio::test(start_paused = true)]
async fn threshold_equality_does_not_report() {
    let ioc = zone_ioc("R1M").await;
    ioc.inject_fault(&DeviceId::new("R1M1"), DeviceFault::UnstableControl)
        .await;
    ioc.inject_fault(&DeviceId::new("R1M8"), DeviceFault::StallBeforeHarvest)
        .await;
    let reporter = RecordingReporter::new();

    let result = coordinator(ioc, Arc::new(MemorySink::new()), reporter.clone())
        .run(zone_run(0.25))
        .await;

    assert_eq!(result.verdict.failed, 2);
    assert_eq!(result.verdict.ratio, 0.25);
    assert!(!result.verdict.report_triggered);
    assert!(reporter.summaries().await.is_empty());
}

/// Panics on any request for one device.
struct PanickingClient {
    inner: Arc<SimulatedScopeIoc>,
    victim: &'static str,
}

#[async_trait]
impl RemoteVariableClient for PanickingClient {
    async fn get(&self, name: &str, timeout: Duration) -> Result<PvValue, PvError> {
        if name.starts_with(self.victim) {
            panic!("simulated driver bug");
        }
        self.inner.get(name, timeout).await
    }

    async fn put(&self, name: &str, value: PvValue, timeout: Duration) -> Result<(), PvError> {
        self.inner.put(name, value, timeout).await
    }
}

#[tokio::test(start_paused = true)]
async fn panicking_driver_is_contained() {
    let ioc = zone_ioc("R1M").await;
    let client = Arc::new(PanickingClient {
        inner: ioc,
        victim: "R1M3",
    });

    let result = coordinator(client, Arc::new(MemorySink::new()), RecordingReporter::new())
        .run(zone_run(0.5))
        .await;

    assert_eq!(result.tasks.len(), 8);
    assert_eq!(codes_for(&result, "R1M3"), ["driver_panicked"]);
    let record = result
        .failures
        .iter()
        .find(|record| record.device == Some(DeviceId::new("R1M3")))
        .unwrap();
    assert_eq!(record.phase, FailurePhase::Supervision);
    assert_eq!(result.successful_devices().len(), 7);
}

#[tokio::test(start_paused = true)]
async fn single_device_run() {
    let ioc = zone_ioc("R2Q").await;
    let run = CollectionRun::from_config(
        &test_config(0.0),
        DeviceSelection::device("R2Q4").unwrap(),
    )
    .unwrap();
    let sink = Arc::new(MemorySink::new());

    let result = coordinator(ioc.clone(), sink.clone(), RecordingReporter::new())
        .run(run)
        .await;

    assert!(result.succeeded());
    assert_eq!(result.tasks.len(), 1);
    assert_eq!(result.verdict.total, 1);
    assert!(sink
        .waveforms()
        .await
        .iter()
        .all(|w| w.device.as_str() == "R2Q4"));
    assert!(ioc
        .puts()
        .await
        .iter()
        .all(|(name, _)| name.starts_with("R2Q4")));
}
