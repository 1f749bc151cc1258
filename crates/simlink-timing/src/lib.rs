//! Latency instrumentation for simlink.
//!
//! A [`TimeMeasurer`] timestamps named intervals on the caller's thread and
//! keeps their durations in memory for percentile summaries. Each finished
//! interval is also handed to an optional [`SampleSink`]. The
//! [`CsvFileSink`] moves samples to disk on its own writer thread so
//! producers never wait on I/O.
//!
//! # Architecture
//!
//! ```text
//! start(label) / stop(label)
//!   |
//!   +-- in-memory durations --> summary(label): n, mean, p50, p95, p99
//!   |
//!   +-- SampleSink::on_sample --> mpsc queue --> writer thread --> CSV file
//! ```

pub mod error;
pub mod measurer;
pub mod sample;
pub mod sink;
pub mod worker;

// Re-export primary types for convenience.
pub use error::SinkError;
pub use measurer::{Summary, TimeMeasurer, percentile_sorted};
pub use sample::{MemorySink, Sample, SampleSink};
pub use sink::{CSV_HEADER, CsvFileSink, DEFAULT_FLUSH_EVERY, DEFAULT_SHUTDOWN_TIMEOUT};
pub use worker::Worker;
