//! Error types for the `simlink-client` crate.
//!
//! Errors returned from calls (connect, send) and errors delivered to the
//! registered error handler during [`poll`](crate::SimClient::poll) share
//! this one type.

use std::io;

/// Errors that can occur while talking to a simlink server.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Socket setup or a write failed.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Configuration is invalid.
    #[error("config error: {0}")]
    Config(String),

    /// A command could not be serialized.
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),

    /// The server answered with an `{"error": ...}` line.
    #[error("server error: {0}")]
    Server(String),

    /// A line that is neither a state update nor an error.
    #[error("unknown message from server: {0}")]
    UnknownMessage(String),

    /// A line that is not valid JSON.
    #[error("invalid JSON from server: {source}. Line: {line}")]
    InvalidJson {
        /// The offending line.
        line: String,
        /// The underlying parse error.
        source: serde_json::Error,
    },

    /// A state update whose `values` could not be decoded.
    #[error("failed to parse state values: {source}. Line: {line}")]
    MalformedState {
        /// The offending line.
        line: String,
        /// The underlying decode error.
        source: serde_json::Error,
    },

    /// The receive thread lost the connection.
    #[error("disconnected: {0}")]
    Disconnected(String),

    /// A send was attempted after shutdown.
    #[error("not connected")]
    NotConnected,
}
