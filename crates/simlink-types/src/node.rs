//! Per-node data carried by the protocol.

use serde::{Deserialize, Serialize};

use crate::ids::NodeId;

/// Value reported for a node that no source can reach.
///
/// JSON has no encoding for infinity, so unreachable nodes carry the
/// largest 32-bit signed integer as a float instead.
pub const UNREACHABLE: f64 = 2_147_483_647.0;

/// Whether a gradient value denotes a node reachable from some source.
pub fn is_reachable(value: f64) -> bool {
    value.is_finite() && value < UNREACHABLE
}

/// A point in 3D space.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    /// X coordinate.
    pub x: f64,
    /// Y coordinate.
    pub y: f64,
    /// Z coordinate.
    pub z: f64,
}

impl Position {
    /// Create a position from its coordinates.
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Euclidean distance to another position.
    pub fn distance(&self, other: &Self) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        dz.mul_add(dz, dx.mul_add(dx, dy * dy)).sqrt()
    }
}

/// Gradient value and current neighborhood of a single node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    /// Gradient value, or [`UNREACHABLE`].
    pub value: f64,
    /// Ids of the nodes currently linked to this one, ascending.
    #[serde(default)]
    pub neighbors: Vec<NodeId>,
}

impl NodeState {
    /// Whether this node's value is reachable from a source.
    pub fn is_reachable(&self) -> bool {
        is_reachable(self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_is_not_reachable() {
        assert!(!is_reachable(UNREACHABLE));
        assert!(!is_reachable(f64::INFINITY));
        assert!(!is_reachable(f64::NAN));
        assert!(is_reachable(0.0));
        assert!(is_reachable(12.5));
    }

    #[test]
    fn distance_is_euclidean() {
        let a = Position::new(0.0, 0.0, 0.0);
        let b = Position::new(3.0, 4.0, 0.0);
        assert!((a.distance(&b) - 5.0).abs() < 1e-12);
    }

    #[test]
    fn node_state_neighbors_default_to_empty() {
        let state: NodeState = serde_json::from_str(r#"{"value":1.5}"#)
            .unwrap_or(NodeState { value: -1.0, neighbors: vec![NodeId(9)] });
        assert!(state.neighbors.is_empty());
        assert!((state.value - 1.5).abs() < f64::EPSILON);
    }
}
