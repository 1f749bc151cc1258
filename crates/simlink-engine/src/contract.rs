//! The collaborator contract the dispatch core calls against.
//!
//! An engine value is the session's handle: creating it is
//! [`EngineFactory::create`], destroying it is dropping it. All methods
//! may be called repeatedly for as long as the value lives.

use std::collections::BTreeSet;

use simlink_types::{NodeId, NodeState, Position};

use crate::error::EngineError;

/// A stateful gradient simulation over a graph of nodes.
///
/// Values are finite numbers or [`simlink_types::UNREACHABLE`].
pub trait GradientEngine: Send {
    /// Number of nodes in the graph.
    fn node_count(&self) -> usize;

    /// Mark or unmark a node as a gradient source.
    fn set_source(&mut self, node: NodeId, is_source: bool) -> Result<(), EngineError>;

    /// Unmark every source.
    fn clear_sources(&mut self);

    /// Advance the simulation by `rounds` rounds.
    fn step(&mut self, rounds: u32);

    /// Current value of one node.
    fn value(&self, node: NodeId) -> Result<f64, EngineError>;

    /// Ids of the nodes currently linked to `node`.
    fn neighborhood(&self, node: NodeId) -> Result<BTreeSet<NodeId>, EngineError>;

    /// Move a node.
    fn update_position(&mut self, node: NodeId, position: Position) -> Result<(), EngineError>;

    /// Current value of every node, in node id order.
    fn values(&self) -> Vec<f64>;
}

/// Creates engines for new sessions.
pub trait EngineFactory: Send + Sync {
    /// Create an engine with `node_count` nodes linked within `max_distance`.
    fn create(
        &self,
        node_count: u32,
        max_distance: f64,
    ) -> Result<Box<dyn GradientEngine>, EngineError>;
}

/// Value and neighborhood of every node, in node id order.
pub fn node_states(engine: &dyn GradientEngine) -> Vec<NodeState> {
    engine
        .values()
        .into_iter()
        .zip(0u32..)
        .map(|(value, id)| NodeState {
            value,
            neighbors: engine
                .neighborhood(NodeId(id))
                .map(|set| set.into_iter().collect())
                .unwrap_or_default(),
        })
        .collect()
}
