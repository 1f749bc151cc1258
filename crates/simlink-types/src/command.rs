//! Request envelope and command payloads.
//!
//! Every request line is a JSON object `{"op": <string>, "data": <object>}`.
//! Decoding happens in two stages so that a bad payload never costs the
//! connection:
//!
//! 1. [`Envelope::parse`] turns the line into an [`Op`] plus the raw
//!    `data` value. Only a line that is not a JSON object fails here.
//! 2. [`Envelope::into_command`] matches the op against the closed set and
//!    decodes `data` into that op's statically known schema.
//!
//! # Operations
//!
//! | op | payload | response |
//! |----|---------|----------|
//! | `create` | [`CreateSimulation`] | none |
//! | `setSource` | [`SetSource`] | none |
//! | `step` | [`Step`] | [`StateSnapshot`](crate::StateSnapshot) |
//! | `newPosition` | [`NewPosition`] | none |
//! | `neighbor` | [`NeighborQuery`] | [`Neighborhood`](crate::Neighborhood) |

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtocolError;
use crate::ids::{NodeId, RequestId};
use crate::node::Position;

// ---------------------------------------------------------------------------
// Operation names
// ---------------------------------------------------------------------------

/// The operation named by a request envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Op {
    /// Create (or replace) the session's simulation.
    Create,
    /// Mark a node as a gradient source.
    SetSource,
    /// Advance the simulation and report its state.
    Step,
    /// Move a node.
    NewPosition,
    /// Legacy query for one node's neighborhood.
    Neighbor,
    /// An op string outside the protocol.
    Unknown(String),
    /// The envelope carried no string `op` field.
    Missing,
}

impl Op {
    /// Map a wire name to an operation.
    ///
    /// `createSim` is accepted as the historical spelling of `create`.
    pub fn from_name(name: &str) -> Self {
        match name {
            "create" | "createSim" => Self::Create,
            "setSource" => Self::SetSource,
            "step" => Self::Step,
            "newPosition" => Self::NewPosition,
            "neighbor" => Self::Neighbor,
            other => Self::Unknown(other.to_owned()),
        }
    }

    /// Canonical wire name of the operation.
    pub fn name(&self) -> &str {
        match self {
            Self::Create => "create",
            Self::SetSource => "setSource",
            Self::Step => "step",
            Self::NewPosition => "newPosition",
            Self::Neighbor => "neighbor",
            Self::Unknown(name) => name,
            Self::Missing => "",
        }
    }

    /// Whether a successful request of this kind produces a response line.
    pub const fn expects_response(&self) -> bool {
        matches!(self, Self::Step | Self::Neighbor)
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Payload of `create`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSimulation {
    /// Number of nodes in the simulated graph.
    pub node_count: u32,
    /// Maximum distance at which two nodes are linked.
    pub max_distance: f64,
}

/// Payload of `setSource`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetSource {
    /// Node to mark as a source.
    pub node_id: NodeId,
}

/// Payload of `step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Number of rounds to run before reporting.
    #[serde(default = "default_step_count")]
    pub step_count: u32,
    /// Correlation id echoed in the response.
    pub rid: RequestId,
}

const fn default_step_count() -> u32 {
    1
}

/// Payload of `newPosition`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPosition {
    /// Node being moved.
    pub node_id: NodeId,
    /// New X coordinate.
    pub x: f64,
    /// New Y coordinate.
    pub y: f64,
    /// New Z coordinate.
    pub z: f64,
}

impl NewPosition {
    /// Build the payload from a node id and a position.
    pub const fn new(node_id: NodeId, position: Position) -> Self {
        Self {
            node_id,
            x: position.x,
            y: position.y,
            z: position.z,
        }
    }

    /// The new position as a [`Position`].
    pub const fn position(&self) -> Position {
        Position::new(self.x, self.y, self.z)
    }
}

/// Payload of the legacy `neighbor` query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NeighborQuery {
    /// Node whose neighborhood is requested.
    pub node_id: NodeId,
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// A fully decoded request.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `create`
    Create(CreateSimulation),
    /// `setSource`
    SetSource(SetSource),
    /// `step`
    Step(Step),
    /// `newPosition`
    NewPosition(NewPosition),
    /// `neighbor`
    Neighbor(NeighborQuery),
}

/// Outbound form of the envelope, borrowing its payload.
#[derive(Serialize)]
struct OutboundEnvelope<'a, T: Serialize> {
    op: &'a str,
    data: &'a T,
}

impl Command {
    /// The operation this command performs.
    pub fn op(&self) -> Op {
        match self {
            Self::Create(_) => Op::Create,
            Self::SetSource(_) => Op::SetSource,
            Self::Step(_) => Op::Step,
            Self::NewPosition(_) => Op::NewPosition,
            Self::Neighbor(_) => Op::Neighbor,
        }
    }

    /// Serialize the command as one envelope line, without the trailing
    /// newline.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let op = self.op();
        let name = op.name();
        match self {
            Self::Create(data) => serde_json::to_string(&OutboundEnvelope { op: name, data }),
            Self::SetSource(data) => serde_json::to_string(&OutboundEnvelope { op: name, data }),
            Self::Step(data) => serde_json::to_string(&OutboundEnvelope { op: name, data }),
            Self::NewPosition(data) => {
                serde_json::to_string(&OutboundEnvelope { op: name, data })
            }
            Self::Neighbor(data) => serde_json::to_string(&OutboundEnvelope { op: name, data }),
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// A request line split into its operation and undecoded payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// The operation named by the `op` field.
    pub op: Op,
    /// The raw `data` payload; an empty object when absent or null.
    pub data: Value,
}

impl Envelope {
    /// Parse one request line.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MalformedJson`] or
    /// [`ProtocolError::NotAnObject`]; both are fatal for the connection.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(line)?;
        let Value::Object(mut object) = value else {
            return Err(ProtocolError::NotAnObject(json_kind(&value)));
        };

        let op = match object.get("op") {
            Some(Value::String(name)) => Op::from_name(name),
            _ => Op::Missing,
        };
        let data = match object.remove("data") {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(data) => data,
        };

        Ok(Self { op, data })
    }

    /// Decode the payload according to the operation.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MissingOp`], [`ProtocolError::UnknownOp`],
    /// or [`ProtocolError::InvalidData`]; none of them is fatal.
    pub fn into_command(self) -> Result<Command, ProtocolError> {
        let Self { op, data } = self;
        match op {
            Op::Create => decode(data, "create").map(Command::Create),
            Op::SetSource => decode(data, "setSource").map(Command::SetSource),
            Op::Step => decode(data, "step").map(Command::Step),
            Op::NewPosition => decode(data, "newPosition").map(Command::NewPosition),
            Op::Neighbor => decode(data, "neighbor").map(Command::Neighbor),
            Op::Unknown(name) => Err(ProtocolError::UnknownOp(name)),
            Op::Missing => Err(ProtocolError::MissingOp),
        }
    }
}

fn decode<T: DeserializeOwned>(data: Value, op: &'static str) -> Result<T, ProtocolError> {
    serde_json::from_value(data).map_err(|source| ProtocolError::InvalidData { op, source })
}

const fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
