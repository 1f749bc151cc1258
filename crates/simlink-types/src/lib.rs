//! Shared wire protocol types for simlink.
//!
//! The server and client exchange newline-delimited JSON objects over a
//! single TCP stream. Requests are wrapped in an `{"op", "data"}`
//! envelope; responses are bare objects whose shape identifies them.
//!
//! # Modules
//!
//! - [`ids`] -- Newtype identifiers for nodes and step requests
//! - [`node`] -- Node positions, per-node state, and the unreachable sentinel
//! - [`command`] -- Request envelope, the closed operation set, and payloads
//! - [`response`] -- Response payloads written back by the server
//! - [`error`] -- Protocol decoding errors

pub mod command;
pub mod error;
pub mod ids;
pub mod node;
pub mod response;

// Re-export all public types at crate root for convenience.
pub use command::{Command, CreateSimulation, Envelope, NeighborQuery, NewPosition, Op, SetSource, Step};
pub use error::ProtocolError;
pub use ids::{NodeId, RequestId};
pub use node::{NodeState, Position, UNREACHABLE, is_reachable};
pub use response::{ErrorReply, Neighborhood, Response, StateSnapshot};
