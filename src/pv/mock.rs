//! Simulated Scope IOC
//!
//! An in-process stand-in for the control system's scope-mode records. It answers
//! `get`/`put` for every PV a device exposes and reproduces the sequencer's behaviour:
//! writing the harvest control value freezes a fresh waveform into every channel record.
//! All waits use `tokio::time::sleep`, so tests can run it under paused time.
//!
//! Faults are injected per device with [`DeviceFault`] to exercise the orchestrator's
//! failure paths without hardware.
//!
//! # Example
//!
//! ```rust,ignore
//! let ioc = SimulatedScopeIoc::new(vec!["GMES".into()], 8192);
//! ioc.add_zone("R1M").await;
//! ioc.inject_fault(&DeviceId::new("R1M3"), DeviceFault::UnstableControl).await;
//! ```

use std::collections::HashMap;
use std::f64::consts::PI;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, Duration};

use super::{PvError, PvValue, RemoteVariableClient};
use crate::device::sequencer::{
    CONTROL_HARVEST, RUN_STATUS_ABANDONED, RUN_STATUS_CLEAR, SCOPE_RESET,
};
use crate::device::{DeviceId, DevicePvs, ScopeSettings};
use crate::limits::ZONE_SIZE;

/// Scope settings a simulated device starts with, as operators would leave them.
pub const SIMULATED_OPERATOR_SCOPE: ScopeSettings = ScopeSettings {
    mode: RUN_STATUS_CLEAR,
    sample_interval: 0.4,
    trigger_delay: 0.0,
    periodic: 1.0,
    debug: 0,
};

/// Misbehaviour injected into one simulated device.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceFault {
    /// Control point writes are dropped, so the readback never reaches the target.
    UnstableControl,
    /// Reads of this channel hang until the request times out.
    ChannelTimeout(String),
    /// This channel harvests with the wrong number of samples.
    MalformedChannel {
        /// Affected channel.
        channel: String,
        /// Samples actually produced.
        length: usize,
    },
    /// Every request for the device fails as disconnected.
    Unreachable,
    /// The harvest control value is dropped; earlier steps work.
    StallBeforeHarvest,
    /// A scope reset is accepted but never finishes.
    StuckScopeReset,
}

struct IocState {
    values: HashMap<String, PvValue>,
    faults: HashMap<DeviceId, DeviceFault>,
}

impl IocState {
    fn fault_for(&self, name: &str) -> Option<(&DeviceId, &DeviceFault)> {
        self.faults
            .iter()
            .find(|(device, _)| name.starts_with(device.as_str()))
    }
}

/// Simulated scope-mode IOC serving any number of devices.
pub struct SimulatedScopeIoc {
    state: RwLock<IocState>,
    signals: Vec<String>,
    waveform_length: usize,
    latency: Duration,
    request_limit: Option<usize>,
    put_log: Mutex<Vec<(String, PvValue)>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl SimulatedScopeIoc {
    /// Create an IOC with no devices. Harvested channels carry `waveform_length` samples.
    pub fn new(signals: Vec<String>, waveform_length: usize) -> Self {
        Self {
            state: RwLock::new(IocState {
                values: HashMap::new(),
                faults: HashMap::new(),
            }),
            signals,
            waveform_length,
            latency: Duration::from_millis(1),
            request_limit: None,
            put_log: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Delay applied to every request.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Report a transport cap on outstanding requests.
    pub fn with_request_limit(mut self, limit: usize) -> Self {
        self.request_limit = Some(limit);
        self
    }

    /// Register a device with an idle sequencer and ready cavity.
    pub async fn add_device(&self, device: &DeviceId) {
        let pvs = DevicePvs::new(device);
        let mut state = self.state.write().await;
        let values = &mut state.values;
        let scope = SIMULATED_OPERATOR_SCOPE;
        values.insert(pvs.control(), PvValue::Long(1));
        values.insert(pvs.run_status(), PvValue::Long(scope.mode));
        values.insert(pvs.capture_start(), PvValue::Text(String::new()));
        values.insert(pvs.capture_end(), PvValue::Text(String::new()));
        values.insert(pvs.sample_interval(), PvValue::Double(scope.sample_interval));
        values.insert(pvs.trigger_delay(), PvValue::Double(scope.trigger_delay));
        values.insert(pvs.periodic(), PvValue::Double(scope.periodic));
        values.insert(pvs.debug(), PvValue::Long(scope.debug));
        values.insert(pvs.rf_on(), PvValue::Long(1));
        values.insert(pvs.status(), PvValue::Long(0));
        values.insert(pvs.control_mode(), PvValue::Long(4));
        for signal in &self.signals {
            values.insert(
                pvs.channel(signal),
                PvValue::DoubleArray(vec![0.0; self.waveform_length]),
            );
        }
    }

    /// Register every device of `zone`.
    pub async fn add_zone(&self, zone: &str) {
        for cavity in 1..=ZONE_SIZE {
            self.add_device(&DeviceId::new(format!("{zone}{cavity}")))
                .await;
        }
    }

    /// Put the device's scope system into `settings` directly.
    pub async fn set_scope(&self, device: &DeviceId, settings: ScopeSettings) {
        let pvs = DevicePvs::new(device);
        let mut state = self.state.write().await;
        let values = &mut state.values;
        values.insert(pvs.run_status(), PvValue::Long(settings.mode));
        values.insert(pvs.sample_interval(), PvValue::Double(settings.sample_interval));
        values.insert(pvs.trigger_delay(), PvValue::Double(settings.trigger_delay));
        values.insert(pvs.periodic(), PvValue::Double(settings.periodic));
        values.insert(pvs.debug(), PvValue::Long(settings.debug));
    }

    /// Scope settings the device currently holds, if it is registered.
    pub async fn scope(&self, device: &DeviceId) -> Option<ScopeSettings> {
        let pvs = DevicePvs::new(device);
        let state = self.state.read().await;
        let value = |name: String| state.values.get(&name).cloned();
        Some(ScopeSettings {
            mode: value(pvs.run_status())?.as_i64()?,
            sample_interval: value(pvs.sample_interval())?.as_f64()?,
            trigger_delay: value(pvs.trigger_delay())?.as_f64()?,
            periodic: value(pvs.periodic())?.as_f64()?,
            debug: value(pvs.debug())?.as_i64()?,
        })
    }

    /// Leave the device's sequencer as if a previous run was abandoned mid-cycle.
    pub async fn abandon_cycle(&self, device: &DeviceId) {
        self.set_value(
            &DevicePvs::new(device).run_status(),
            PvValue::Long(RUN_STATUS_ABANDONED),
        )
        .await;
    }

    /// Set (or create) any variable, e.g. the machine power PV.
    pub async fn set_value(&self, name: &str, value: impl Into<PvValue>) {
        self.state
            .write()
            .await
            .values
            .insert(name.to_string(), value.into());
    }

    /// Current value of a variable, bypassing latency and faults.
    pub async fn value(&self, name: &str) -> Option<PvValue> {
        self.state.read().await.values.get(name).cloned()
    }

    /// Make `device` misbehave.
    pub async fn inject_fault(&self, device: &DeviceId, fault: DeviceFault) {
        self.state
            .write()
            .await
            .faults
            .insert(device.clone(), fault);
    }

    /// Every accepted write, in arrival order.
    pub async fn puts(&self) -> Vec<(String, PvValue)> {
        self.put_log.lock().await.clone()
    }

    /// Highest number of requests that were outstanding at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight {
            counter: &self.in_flight,
        }
    }

    fn harvest(&self, pvs: &DevicePvs, fault: Option<&DeviceFault>) -> Vec<(String, PvValue)> {
        self.signals
            .iter()
            .enumerate()
            .map(|(index, signal)| {
                let length = match fault {
                    Some(DeviceFault::MalformedChannel { channel, length }) if channel == signal => {
                        *length
                    }
                    _ => self.waveform_length,
                };
                let amplitude = 1.0 + index as f64;
                let samples = (0..length)
                    .map(|i| amplitude * (2.0 * PI * i as f64 / length.max(1) as f64).sin())
                    .collect();
                (pvs.channel(signal), PvValue::DoubleArray(samples))
            })
            .collect()
    }
}

struct InFlight<'a> {
    counter: &'a AtomicUsize,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteVariableClient for SimulatedScopeIoc {
    async fn get(&self, name: &str, timeout: Duration) -> Result<PvValue, PvError> {
        let _guard = self.enter();
        sleep(self.latency).await;

        let state = self.state.read().await;
        let hang = match state.fault_for(name) {
            Some((_, DeviceFault::Unreachable)) => {
                return Err(PvError::Disconnected(name.to_string()));
            }
            Some((device, DeviceFault::ChannelTimeout(channel))) => {
                name == DevicePvs::new(device).channel(channel)
            }
            _ => false,
        };
        if hang {
            drop(state);
            sleep(timeout).await;
            return Err(PvError::Timeout {
                name: name.to_string(),
                timeout,
            });
        }
        state
            .values
            .get(name)
            .cloned()
            .ok_or_else(|| PvError::UnknownName(name.to_string()))
    }

    async fn put(&self, name: &str, value: PvValue, _timeout: Duration) -> Result<(), PvError> {
        let _guard = self.enter();
        sleep(self.latency).await;

        let mut state = self.state.write().await;
        if !state.values.contains_key(name) {
            return Err(PvError::UnknownName(name.to_string()));
        }

        let fault = state.fault_for(name).map(|(d, f)| (d.clone(), f.clone()));
        let mut harvested = Vec::new();
        let mut stored = value.clone();
        if let Some((device, fault)) = &fault {
            let pvs = DevicePvs::new(device);
            let is_control = name == pvs.control();
            match fault {
                DeviceFault::Unreachable => {
                    return Err(PvError::Disconnected(name.to_string()));
                }
                DeviceFault::UnstableControl if is_control => {
                    self.put_log.lock().await.push((name.to_string(), value));
                    return Ok(());
                }
                DeviceFault::StallBeforeHarvest
                    if is_control && value.as_i64() == Some(CONTROL_HARVEST) =>
                {
                    self.put_log.lock().await.push((name.to_string(), value));
                    return Ok(());
                }
                _ => {}
            }
        }

        if let Some(prefix) = name.strip_suffix("WFSCOPstp") {
            if value.as_i64() == Some(CONTROL_HARVEST) {
                let pvs = DevicePvs::new(&DeviceId::new(prefix));
                harvested = self.harvest(&pvs, fault.as_ref().map(|(_, f)| f));
            }
        }
        // A reset completes at once and reads back as cleared, unless it is stuck.
        if name.ends_with("WFSCOPrun") && value.as_i64() == Some(SCOPE_RESET) {
            let stuck = matches!(&fault, Some((_, DeviceFault::StuckScopeReset)));
            stored = PvValue::Long(if stuck { RUN_STATUS_ABANDONED } else { RUN_STATUS_CLEAR });
        }

        state.values.insert(name.to_string(), stored);
        state.values.extend(harvested);
        self.put_log.lock().await.push((name.to_string(), value));
        Ok(())
    }

    fn max_concurrent_requests(&self) -> Option<usize> {
        self.request_limit
    }
}
