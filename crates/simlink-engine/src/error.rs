//! Error types for the `simlink-engine` crate.

use simlink_types::NodeId;

/// Errors that can occur while creating or driving an engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A node id outside `0..node_count` was supplied.
    #[error("node {node} out of range (node count {node_count})")]
    NodeOutOfRange {
        /// The offending node id.
        node: NodeId,
        /// Number of nodes in the engine.
        node_count: usize,
    },

    /// Creation parameters were rejected.
    #[error("invalid engine parameters: {reason}")]
    InvalidParameters {
        /// Explanation of what is wrong with the parameters.
        reason: String,
    },
}
