//! Protocol decoding errors.

/// Errors raised while decoding a request line.
///
/// [`ProtocolError::is_fatal`] separates errors that make the stream
/// itself untrustworthy from errors scoped to a single request.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The line is not valid JSON.
    #[error("malformed JSON: {0}")]
    MalformedJson(#[from] serde_json::Error),

    /// The line is valid JSON but not an object.
    #[error("expected a JSON object, got {0}")]
    NotAnObject(&'static str),

    /// The envelope has no string `op` field.
    #[error("missing or non-string `op` field")]
    MissingOp,

    /// The `op` field names an operation outside the protocol.
    #[error("operation {0} not supported")]
    UnknownOp(String),

    /// The `data` payload does not match the schema of its operation.
    #[error("invalid data for `{op}`: {source}")]
    InvalidData {
        /// Wire name of the operation whose payload failed to decode.
        op: &'static str,
        /// The underlying decode error.
        source: serde_json::Error,
    },
}

impl ProtocolError {
    /// Whether the error invalidates the whole connection rather than a
    /// single request.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::MalformedJson(_) | Self::NotAnObject(_))
    }
}
