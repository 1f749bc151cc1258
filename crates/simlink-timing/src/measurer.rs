//! Named interval timer with percentile summaries.
//!
//! # Semantics
//!
//! - `start(label)` records the current instant, overwriting any
//!   unfinished start under the same label (last start wins).
//! - `stop(label)` closes the pending interval. Without a pending start it
//!   does nothing, so sample counts always match completed intervals.
//! - Summaries are recomputed from the stored durations on every call.
//!
//! The measurer is plain data and not synchronized; give each thread its
//! own or wrap it in a lock.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::sample::{Sample, SampleSink};

/// Count, mean, and percentiles over one label's durations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Summary {
    /// Number of recorded durations.
    pub count: usize,
    /// Arithmetic mean in nanoseconds.
    pub mean_ns: f64,
    /// Median in nanoseconds.
    pub p50_ns: u64,
    /// 95th percentile in nanoseconds.
    pub p95_ns: u64,
    /// 99th percentile in nanoseconds.
    pub p99_ns: u64,
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "n={} mean={:.0}ns p50={}ns p95={}ns p99={}ns",
            self.count, self.mean_ns, self.p50_ns, self.p95_ns, self.p99_ns
        )
    }
}

/// Nearest-rank percentile of an ascending slice.
///
/// The rank is `ceil(p * n)` clamped to `[1, n]` and read 1-indexed.
/// Returns 0 for an empty slice.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn percentile_sorted(sorted: &[u64], p: f64) -> u64 {
    let n = sorted.len();
    if n == 0 {
        return 0;
    }
    let rank = (p * n as f64).ceil().max(1.0) as usize;
    let rank = rank.clamp(1, n);
    sorted.get(rank.saturating_sub(1)).copied().unwrap_or(0)
}

/// Records named intervals and summarizes their durations.
pub struct TimeMeasurer {
    /// Instant that sample offsets are measured from.
    origin: Instant,
    /// Pending starts keyed by label.
    starts: HashMap<String, Instant>,
    /// Completed durations in nanoseconds, keyed by label.
    durations: HashMap<String, Vec<u64>>,
    /// Optional downstream sink for every completed interval.
    sink: Option<Arc<dyn SampleSink>>,
}

impl TimeMeasurer {
    /// Create a measurer without a sink.
    pub fn new() -> Self {
        Self::with_origin(Instant::now(), None)
    }

    /// Create a measurer that forwards every sample to `sink`.
    pub fn with_sink(sink: Arc<dyn SampleSink>) -> Self {
        Self::with_origin(Instant::now(), Some(sink))
    }

    /// Create a measurer with an explicit origin for sample offsets.
    pub fn with_origin(origin: Instant, sink: Option<Arc<dyn SampleSink>>) -> Self {
        Self {
            origin,
            starts: HashMap::new(),
            durations: HashMap::new(),
            sink,
        }
    }

    /// The instant sample offsets are measured from.
    pub const fn origin(&self) -> Instant {
        self.origin
    }

    /// Begin an interval under `label`, replacing any unfinished one.
    pub fn start(&mut self, label: &str) {
        self.starts.insert(label.to_owned(), Instant::now());
    }

    /// Finish the pending interval under `label`.
    ///
    /// Returns the elapsed time, or `None` when no start is pending.
    pub fn stop(&mut self, label: &str) -> Option<Duration> {
        let started = self.starts.remove(label)?;
        Some(self.record(label, started, Instant::now()))
    }

    /// Record an interval whose endpoints were captured elsewhere.
    ///
    /// An `ended` earlier than `started` is recorded as zero.
    pub fn record(&mut self, label: &str, started: Instant, ended: Instant) -> Duration {
        let elapsed = ended.saturating_duration_since(started);
        let duration_ns = nanos(elapsed);
        self.durations
            .entry(label.to_owned())
            .or_default()
            .push(duration_ns);

        if let Some(sink) = &self.sink {
            sink.on_sample(Sample {
                label: label.to_owned(),
                offset_ns: nanos(ended.saturating_duration_since(self.origin)),
                duration_ns,
            });
        }
        elapsed
    }

    /// Durations recorded under `label`, in nanoseconds and arrival order.
    pub fn samples(&self, label: &str) -> &[u64] {
        self.durations.get(label).map_or(&[], Vec::as_slice)
    }

    /// Summarize the durations currently recorded under `label`.
    ///
    /// Returns `None` when nothing has been recorded.
    #[allow(clippy::cast_precision_loss)]
    pub fn summary(&self, label: &str) -> Option<Summary> {
        let durations = self.durations.get(label)?;
        if durations.is_empty() {
            return None;
        }
        let mut sorted = durations.clone();
        sorted.sort_unstable();

        let total: u128 = sorted.iter().map(|&d| u128::from(d)).sum();
        let mean_ns = total as f64 / sorted.len() as f64;

        Some(Summary {
            count: sorted.len(),
            mean_ns,
            p50_ns: percentile_sorted(&sorted, 0.50),
            p95_ns: percentile_sorted(&sorted, 0.95),
            p99_ns: percentile_sorted(&sorted, 0.99),
        })
    }

    /// Summaries for every label with at least one sample, sorted by label.
    pub fn summaries(&self) -> BTreeMap<String, Summary> {
        self.durations
            .keys()
            .filter_map(|label| self.summary(label).map(|s| (label.clone(), s)))
            .collect()
    }
}

impl Default for TimeMeasurer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TimeMeasurer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeMeasurer")
            .field("pending", &self.starts.len())
            .field("labels", &self.durations.len())
            .field("has_sink", &self.sink.is_some())
            .finish_non_exhaustive()
    }
}

fn nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::MemorySink;

    fn measurer_with(durations: &[u64]) -> TimeMeasurer {
        let mut measurer = TimeMeasurer::new();
        let origin = measurer.origin();
        for &ns in durations {
            measurer.record("op", origin, origin + Duration::from_nanos(ns));
        }
        measurer
    }

    #[test]
    fn percentiles_use_ceiling_rank() {
        let measurer = measurer_with(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        let summary = measurer.summary("op");
        let Some(summary) = summary else {
            panic!("Expected a summary for recorded label");
        };
        assert_eq!(summary.count, 10);
        assert_eq!(summary.p50_ns, 5);
        assert_eq!(summary.p95_ns, 10);
        assert_eq!(summary.p99_ns, 10);
        assert!((summary.mean_ns - 5.5).abs() < 1e-9);
    }

    #[test]
    fn summary_sorts_unordered_input() {
        let measurer = measurer_with(&[9, 1, 5, 3, 7]);
        let summary = measurer.summary("op");
        assert_eq!(summary.map(|s| s.p50_ns), Some(5));
        assert_eq!(measurer.samples("op"), &[9, 1, 5, 3, 7]);
    }

    #[test]
    fn percentile_edge_cases() {
        assert_eq!(percentile_sorted(&[], 0.5), 0);
        assert_eq!(percentile_sorted(&[42], 0.0), 42);
        assert_eq!(percentile_sorted(&[42], 0.99), 42);
        assert_eq!(percentile_sorted(&[1, 2], 1.0), 2);
        assert_eq!(percentile_sorted(&[1, 2, 3, 4], 0.25), 1);
    }

    #[test]
    fn stop_without_start_is_noop() {
        let mut measurer = TimeMeasurer::new();
        assert!(measurer.stop("never-started").is_none());
        assert!(measurer.samples("never-started").is_empty());
        assert!(measurer.summary("never-started").is_none());
    }

    #[test]
    fn stop_consumes_the_start() {
        let mut measurer = TimeMeasurer::new();
        measurer.start("op");
        assert!(measurer.stop("op").is_some());
        assert!(measurer.stop("op").is_none());
        assert_eq!(measurer.samples("op").len(), 1);
    }

    #[test]
    fn last_start_wins() {
        let mut measurer = TimeMeasurer::new();
        measurer.start("op");
        std::thread::sleep(Duration::from_millis(20));
        measurer.start("op");
        let elapsed = measurer.stop("op").unwrap_or(Duration::MAX);
        assert!(elapsed < Duration::from_millis(20));
        assert_eq!(measurer.samples("op").len(), 1);
    }

    #[test]
    fn inverted_interval_records_zero() {
        let mut measurer = TimeMeasurer::new();
        let now = Instant::now();
        let elapsed = measurer.record("op", now + Duration::from_millis(1), now);
        assert_eq!(elapsed, Duration::ZERO);
        assert_eq!(measurer.samples("op"), &[0]);
    }

    #[test]
    fn completed_intervals_are_forwarded_to_sink() {
        let sink = Arc::new(MemorySink::new());
        let mut measurer = TimeMeasurer::with_sink(Arc::clone(&sink) as Arc<dyn SampleSink>);
        let origin = measurer.origin();

        measurer.record(
            "step.compute",
            origin + Duration::from_nanos(100),
            origin + Duration::from_nanos(350),
        );
        measurer.stop("unmatched");

        let samples = sink.samples();
        assert_eq!(
            samples,
            vec![Sample {
                label: String::from("step.compute"),
                offset_ns: 350,
                duration_ns: 250,
            }]
        );
    }

    #[test]
    fn summaries_are_sorted_by_label() {
        let mut measurer = TimeMeasurer::new();
        let origin = measurer.origin();
        for label in ["b", "a", "c"] {
            measurer.record(label, origin, origin + Duration::from_nanos(10));
        }
        let labels: Vec<String> = measurer.summaries().into_keys().collect();
        assert_eq!(labels, vec!["a", "b", "c"]);
    }
}
