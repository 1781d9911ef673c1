//! In-memory sink.

use std::collections::HashSet;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{SinkError, WaveformSink};
use crate::device::{DeviceId, Waveform};

/// Keeps every written waveform. Writes for devices marked with
/// [`MemorySink::reject_device`] fail, which lets tests exercise storage failures.
#[derive(Debug, Default)]
pub struct MemorySink {
    waveforms: Mutex<Vec<Waveform>>,
    rejected: Mutex<HashSet<DeviceId>>,
}

impl MemorySink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every future write for `device`.
    pub async fn reject_device(&self, device: DeviceId) {
        self.rejected.lock().await.insert(device);
    }

    /// Waveforms written so far.
    pub async fn waveforms(&self) -> Vec<Waveform> {
        self.waveforms.lock().await.clone()
    }

    /// Number of waveforms written so far.
    pub async fn len(&self) -> usize {
        self.waveforms.lock().await.len()
    }

    /// `true` if nothing was written.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl WaveformSink for MemorySink {
    async fn write(&self, waveform: &Waveform) -> Result<(), SinkError> {
        if self.rejected.lock().await.contains(&waveform.device) {
            return Err(SinkError::Rejected(format!(
                "{} is not accepted by this sink",
                waveform.device
            )));
        }
        self.waveforms.lock().await.push(waveform.clone());
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}
