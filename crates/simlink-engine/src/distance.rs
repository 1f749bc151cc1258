//! Distance-bounded gradient engine.
//!
//! # Model
//!
//! - Node `i` starts at `(i, 0, 0)`, one unit from its predecessor.
//! - Two distinct nodes are linked while their Euclidean distance is at
//!   most `max_distance`. Links are kept up to date on every move.
//! - Each round is synchronous: every node reads its neighbors' values
//!   from the previous round. A source takes 0; any other node takes the
//!   minimum of `neighbor value + link length` over reachable neighbors,
//!   or stays unreachable.

use std::collections::BTreeSet;

use simlink_types::{NodeId, Position, UNREACHABLE};
use tracing::debug;

use crate::contract::{EngineFactory, GradientEngine};
use crate::error::EngineError;

/// Largest graph the default factory will build.
pub const DEFAULT_MAX_NODES: u32 = 10_000;

/// Reference [`GradientEngine`] linking nodes by distance.
#[derive(Debug, Clone)]
pub struct DistanceGradient {
    max_distance: f64,
    positions: Vec<Position>,
    sources: BTreeSet<NodeId>,
    links: Vec<BTreeSet<NodeId>>,
    /// `None` means unreachable.
    values: Vec<Option<f64>>,
    rounds: u64,
}

impl DistanceGradient {
    /// Build an engine with `node_count` nodes on the x axis.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidParameters`] if `max_distance` is
    /// negative or not finite.
    pub fn new(node_count: u32, max_distance: f64) -> Result<Self, EngineError> {
        if !max_distance.is_finite() || max_distance < 0.0 {
            return Err(EngineError::InvalidParameters {
                reason: format!("max distance must be finite and non-negative, got {max_distance}"),
            });
        }

        let positions: Vec<Position> = (0..node_count)
            .map(|i| Position::new(f64::from(i), 0.0, 0.0))
            .collect();
        let count = positions.len();

        let mut engine = Self {
            max_distance,
            positions,
            sources: BTreeSet::new(),
            links: vec![BTreeSet::new(); count],
            values: vec![None; count],
            rounds: 0,
        };
        engine.rebuild_links();
        Ok(engine)
    }

    /// Number of rounds run since creation.
    pub const fn rounds(&self) -> u64 {
        self.rounds
    }

    /// Current position of a node.
    pub fn position(&self, node: NodeId) -> Result<Position, EngineError> {
        self.check(node)?;
        Ok(self.positions.get(node.index()).copied().unwrap_or_default())
    }

    /// Whether a node is currently a source.
    pub fn is_source(&self, node: NodeId) -> bool {
        self.sources.contains(&node)
    }

    fn check(&self, node: NodeId) -> Result<(), EngineError> {
        if node.index() < self.positions.len() {
            Ok(())
        } else {
            Err(EngineError::NodeOutOfRange {
                node,
                node_count: self.positions.len(),
            })
        }
    }

    fn linked(&self, a: usize, b: usize) -> bool {
        match (self.positions.get(a), self.positions.get(b)) {
            (Some(pa), Some(pb)) => a != b && pa.distance(pb) <= self.max_distance,
            _ => false,
        }
    }

    fn rebuild_links(&mut self) {
        let count = self.positions.len();
        let mut links = vec![BTreeSet::new(); count];
        for (a, row) in links.iter_mut().enumerate() {
            row.extend(
                (0..count)
                    .filter(|&b| self.linked(a, b))
                    .filter_map(|b| u32::try_from(b).ok().map(NodeId)),
            );
        }
        self.links = links;
    }

    /// Recompute only the links touching `node` after it moved.
    fn relink(&mut self, node: NodeId) {
        let a = node.index();
        let count = self.positions.len();
        for b in 0..count {
            let Ok(other) = u32::try_from(b).map(NodeId) else {
                continue;
            };
            let linked = self.linked(a, b);
            if let Some(row) = self.links.get_mut(a) {
                if linked {
                    row.insert(other);
                } else {
                    row.remove(&other);
                }
            }
            if let Some(row) = self.links.get_mut(b) {
                if linked {
                    row.insert(node);
                } else {
                    row.remove(&node);
                }
            }
        }
    }

    fn round(&mut self) {
        let next: Vec<Option<f64>> = (0..self.positions.len())
            .map(|i| {
                let Ok(id) = u32::try_from(i).map(NodeId) else {
                    return None;
                };
                if self.sources.contains(&id) {
                    return Some(0.0);
                }
                let here = self.positions.get(i)?;
                self.links
                    .get(i)?
                    .iter()
                    .filter_map(|n| {
                        let value = (*self.values.get(n.index())?)?;
                        let there = self.positions.get(n.index())?;
                        Some(value + here.distance(there))
                    })
                    .min_by(f64::total_cmp)
            })
            .collect();
        self.values = next;
        self.rounds = self.rounds.saturating_add(1);
    }
}

impl GradientEngine for DistanceGradient {
    fn node_count(&self) -> usize {
        self.positions.len()
    }

    fn set_source(&mut self, node: NodeId, is_source: bool) -> Result<(), EngineError> {
        self.check(node)?;
        if is_source {
            self.sources.insert(node);
        } else {
            self.sources.remove(&node);
        }
        Ok(())
    }

    fn clear_sources(&mut self) {
        self.sources.clear();
    }

    fn step(&mut self, rounds: u32) {
        for _ in 0..rounds {
            self.round();
        }
    }

    fn value(&self, node: NodeId) -> Result<f64, EngineError> {
        self.check(node)?;
        Ok(self
            .values
            .get(node.index())
            .copied()
            .flatten()
            .unwrap_or(UNREACHABLE))
    }

    fn neighborhood(&self, node: NodeId) -> Result<BTreeSet<NodeId>, EngineError> {
        self.check(node)?;
        Ok(self.links.get(node.index()).cloned().unwrap_or_default())
    }

    fn update_position(&mut self, node: NodeId, position: Position) -> Result<(), EngineError> {
        self.check(node)?;
        if let Some(slot) = self.positions.get_mut(node.index()) {
            *slot = position;
        }
        self.relink(node);
        Ok(())
    }

    fn values(&self) -> Vec<f64> {
        self.values.iter().map(|v| v.unwrap_or(UNREACHABLE)).collect()
    }
}

/// Factory producing [`DistanceGradient`] engines.
#[derive(Debug, Clone, Copy)]
pub struct DistanceGradientFactory {
    max_nodes: u32,
}

impl DistanceGradientFactory {
    /// Create a factory refusing graphs larger than `max_nodes`.
    pub const fn new(max_nodes: u32) -> Self {
        Self { max_nodes }
    }

    /// Largest node count this factory accepts.
    pub const fn max_nodes(&self) -> u32 {
        self.max_nodes
    }
}

impl Default for DistanceGradientFactory {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_NODES)
    }
}

impl EngineFactory for DistanceGradientFactory {
    fn create(
        &self,
        node_count: u32,
        max_distance: f64,
    ) -> Result<Box<dyn GradientEngine>, EngineError> {
        if node_count > self.max_nodes {
            return Err(EngineError::InvalidParameters {
                reason: format!("node count {node_count} exceeds limit {}", self.max_nodes),
            });
        }
        let engine = DistanceGradient::new(node_count, max_distance)?;
        debug!(node_count, max_distance, "distance gradient engine created");
        Ok(Box::new(engine))
    }
}
