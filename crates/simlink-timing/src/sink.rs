//! Append-only CSV sink fed by a single background writer.
//!
//! Producers call [`SampleSink::on_sample`], which only enqueues onto an
//! unbounded channel. One writer thread drains the channel into a
//! buffered file, flushing every `flush_every` records and once more on
//! shutdown.
//!
//! # Record format
//!
//! ```text
//! t_ns,id,duration_ns
//! 1843021,step.compute,51230
//! ```
//!
//! The header is written exactly once, when the sink is created.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::error::SinkError;
use crate::sample::{Sample, SampleSink};
use crate::worker::Worker;

/// Header line of every record file.
pub const CSV_HEADER: &str = "t_ns,id,duration_ns";

/// Records written between flushes unless configured otherwise.
pub const DEFAULT_FLUSH_EVERY: usize = 200;

/// How long [`CsvFileSink::shutdown`] waits for the writer by default.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Messages consumed by the writer thread.
enum SinkMessage {
    /// A sample to append.
    Record(Sample),
    /// Everything before this marker must be written; then exit.
    Close,
}

/// Durable sample sink writing CSV records from a background thread.
#[derive(Debug)]
pub struct CsvFileSink {
    path: PathBuf,
    tx: Sender<SinkMessage>,
    worker: Mutex<Worker>,
    closed: AtomicBool,
    dropped: AtomicU64,
    shutdown_timeout: Duration,
}

impl std::fmt::Debug for SinkMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Record(sample) => f.debug_tuple("Record").field(sample).finish(),
            Self::Close => f.write_str("Close"),
        }
    }
}

impl CsvFileSink {
    /// Create (truncating) the record file, write the header, and start
    /// the writer thread.
    ///
    /// A `flush_every` of zero is treated as one.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Io`] if the file cannot be created or the
    /// header cannot be written, and [`SinkError::Spawn`] if the writer
    /// thread cannot be started.
    pub fn create(path: impl AsRef<Path>, flush_every: usize) -> Result<Self, SinkError> {
        Self::with_shutdown_timeout(path, flush_every, DEFAULT_SHUTDOWN_TIMEOUT)
    }

    /// Like [`CsvFileSink::create`] with an explicit shutdown wait.
    ///
    /// # Errors
    ///
    /// Same as [`CsvFileSink::create`].
    pub fn with_shutdown_timeout(
        path: impl AsRef<Path>,
        flush_every: usize,
        shutdown_timeout: Duration,
    ) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        let mut out = BufWriter::new(File::create(&path)?);
        writeln!(out, "{CSV_HEADER}")?;
        out.flush()?;

        let flush_every = flush_every.max(1);
        let (tx, rx) = mpsc::channel();
        let writer_path = path.clone();
        let worker = Worker::spawn("simlink-sink", move || {
            match write_loop(out, &rx, flush_every) {
                Ok(records) => {
                    debug!(path = %writer_path.display(), records, "sample writer finished");
                }
                Err(e) => {
                    error!(path = %writer_path.display(), error = %e, "sample writer failed");
                }
            }
        })
        .map_err(|e| SinkError::Spawn(e.to_string()))?;

        info!(path = %path.display(), flush_every, "sample sink started");

        Ok(Self {
            path,
            tx,
            worker: Mutex::new(worker),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            shutdown_timeout,
        })
    }

    /// Path of the record file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of samples refused because the sink was closed or its
    /// writer had stopped.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop accepting samples, let the writer persist everything already
    /// queued, and wait for it within the configured window.
    ///
    /// Safe to call more than once; only the first call waits. Returns
    /// `false` if the writer did not finish in time.
    pub fn shutdown(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return true;
        }
        // The writer is gone already if this fails; nothing left to drain.
        let _ = self.tx.send(SinkMessage::Close);

        let Ok(mut worker) = self.worker.lock() else {
            return false;
        };
        let joined = worker.join_timeout(self.shutdown_timeout);
        if joined {
            info!(path = %self.path.display(), dropped = self.dropped(), "sample sink closed");
        } else {
            warn!(path = %self.path.display(), "sample sink writer still running after shutdown window");
        }
        joined
    }
}

impl SampleSink for CsvFileSink {
    fn on_sample(&self, sample: Sample) {
        if self.closed.load(Ordering::Acquire) || self.tx.send(SinkMessage::Record(sample)).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl Drop for CsvFileSink {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Drain the queue into `out` until a close marker or disconnect.
///
/// Returns the number of records written.
fn write_loop<W: Write>(
    mut out: W,
    rx: &Receiver<SinkMessage>,
    flush_every: usize,
) -> Result<u64, SinkError> {
    let mut written: u64 = 0;
    let mut since_flush: usize = 0;

    while let Ok(message) = rx.recv() {
        let SinkMessage::Record(sample) = message else {
            break;
        };
        write_record(&mut out, &sample)?;
        written = written.saturating_add(1);
        since_flush = since_flush.saturating_add(1);
        if since_flush >= flush_every {
            out.flush()?;
            since_flush = 0;
        }
    }

    // Samples that raced the close marker are still persisted.
    while let Ok(SinkMessage::Record(sample)) = rx.try_recv() {
        write_record(&mut out, &sample)?;
        written = written.saturating_add(1);
    }

    out.flush()?;
    Ok(written)
}

fn write_record<W: Write>(out: &mut W, sample: &Sample) -> std::io::Result<()> {
    writeln!(
        out,
        "{},{},{}",
        sample.offset_ns,
        csv_field(&sample.label),
        sample.duration_ns
    )
}

/// Quote a field if it contains a delimiter, quote, or line break.
fn csv_field(value: &str) -> std::borrow::Cow<'_, str> {
    if value.contains([',', '"', '\n', '\r']) {
        std::borrow::Cow::Owned(format!("\"{}\"", value.replace('"', "\"\"")))
    } else {
        std::borrow::Cow::Borrowed(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(label: &str, offset_ns: u64, duration_ns: u64) -> Sample {
        Sample {
            label: label.to_owned(),
            offset_ns,
            duration_ns,
        }
    }

    #[test]
    fn write_loop_stops_at_close_and_flushes() {
        let (tx, rx) = mpsc::channel();
        let _ = tx.send(SinkMessage::Record(sample("a", 1, 2)));
        let _ = tx.send(SinkMessage::Record(sample("b", 3, 4)));
        let _ = tx.send(SinkMessage::Close);

        let mut out = Vec::new();
        let written = write_loop(&mut out, &rx, 100).unwrap_or(0);
        assert_eq!(written, 2);
        assert_eq!(String::from_utf8_lossy(&out), "1,a,2\n3,b,4\n");
    }

    #[test]
    fn write_loop_ends_when_all_senders_drop() {
        let (tx, rx) = mpsc::channel();
        let _ = tx.send(SinkMessage::Record(sample("a", 1, 2)));
        drop(tx);

        let mut out = Vec::new();
        assert_eq!(write_loop(&mut out, &rx, 1).unwrap_or(0), 1);
    }

    #[test]
    fn labels_with_delimiters_are_quoted() {
        assert_eq!(csv_field("step.compute"), "step.compute");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }
}
