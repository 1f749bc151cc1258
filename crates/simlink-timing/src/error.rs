//! Error types for the sample sinks.

/// Errors that can occur while opening or running a durable sink.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// Creating, writing, or flushing the record file failed.
    #[error("sink I/O error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// The writer thread could not be started.
    #[error("failed to spawn sink writer thread: {0}")]
    Spawn(String),
}
