//! Samples and the sink interface that receives them.

use std::sync::Mutex;

/// One finished interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    /// Name of the measured interval (e.g. `step.compute`).
    pub label: String,
    /// Nanoseconds from the measurer's origin to the end of the interval.
    pub offset_ns: u64,
    /// Length of the interval in nanoseconds.
    pub duration_ns: u64,
}

/// Receiver of finished samples.
///
/// Implementations must not block the caller on I/O: `on_sample` runs on
/// the thread that just finished the measured interval.
pub trait SampleSink: Send + Sync {
    /// Accept one sample. Each sample is delivered exactly once.
    fn on_sample(&self, sample: Sample);
}

/// Sink that keeps samples in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    samples: Mutex<Vec<Sample>>,
}

impl MemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every sample received so far, in arrival order.
    pub fn samples(&self) -> Vec<Sample> {
        let Ok(samples) = self.samples.lock() else {
            return Vec::new();
        };
        samples.clone()
    }

    /// Samples received so far under `label`.
    pub fn samples_for(&self, label: &str) -> Vec<Sample> {
        let Ok(samples) = self.samples.lock() else {
            return Vec::new();
        };
        samples.iter().filter(|s| s.label == label).cloned().collect()
    }

    /// Number of samples received so far.
    pub fn len(&self) -> usize {
        self.samples.lock().map_or(0, |samples| samples.len())
    }

    /// Whether no sample has been received yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SampleSink for MemorySink {
    fn on_sample(&self, sample: Sample) {
        if let Ok(mut samples) = self.samples.lock() {
            samples.push(sample);
        }
    }
}
