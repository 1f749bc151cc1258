//! Simulation engine contract for simlink sessions.
//!
//! The server treats the engine as an opaque stateful object: it creates
//! one per session through an [`EngineFactory`], drives it through the
//! [`GradientEngine`] trait, and drops it when the session ends. Nothing
//! in the dispatch path depends on how values are computed.
//!
//! [`DistanceGradient`] is the bundled implementation: nodes are linked
//! when they lie within a maximum distance of each other, and each round
//! every node takes the shortest known distance to a source.

pub mod contract;
pub mod distance;
pub mod error;

// Re-export primary types for convenience.
pub use contract::{EngineFactory, GradientEngine, node_states};
pub use distance::{DEFAULT_MAX_NODES, DistanceGradient, DistanceGradientFactory};
pub use error::EngineError;
