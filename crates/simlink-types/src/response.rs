//! Response payloads written by the server.
//!
//! Responses carry no envelope. Clients tell them apart by shape: a
//! `values` array is a state snapshot, an `error` field is an error.

use serde::{Deserialize, Serialize};

use crate::ids::{NodeId, RequestId};
use crate::node::NodeState;

/// Reply to `step`: the full per-node state after the requested rounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// The `rid` of the step request this answers.
    pub rid: RequestId,
    /// One entry per node, in node id order.
    pub values: Vec<NodeState>,
}

/// Reply to the legacy `neighbor` query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Neighborhood {
    /// Ids of the queried node's neighbors, ascending.
    pub neighbors: Vec<NodeId>,
}

/// Reply to any request that failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    /// Human-readable failure description.
    pub error: String,
}

/// Any line the server can write.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Response {
    /// Reply to `step`.
    State(StateSnapshot),
    /// Reply to `neighbor`.
    Neighbors(Neighborhood),
    /// Failure of a request.
    Error(ErrorReply),
}

impl Response {
    /// Build an error response from anything displayable.
    pub fn error(message: impl std::fmt::Display) -> Self {
        Self::Error(ErrorReply {
            error: message.to_string(),
        })
    }

    /// Serialize as one line, without the trailing newline.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_snapshot_wire_shape() {
        let response = Response::State(StateSnapshot {
            rid: RequestId(7),
            values: vec![
                NodeState {
                    value: 0.0,
                    neighbors: vec![NodeId(1)],
                },
                NodeState {
                    value: 1.0,
                    neighbors: vec![NodeId(0)],
                },
            ],
        });
        let line = response.to_line().unwrap_or_default();
        assert_eq!(
            line,
            r#"{"rid":7,"values":[{"value":0.0,"neighbors":[1]},{"value":1.0,"neighbors":[0]}]}"#
        );
    }

    #[test]
    fn error_wire_shape() {
        let line = Response::error("operation teleport not supported")
            .to_line()
            .unwrap_or_default();
        assert_eq!(line, r#"{"error":"operation teleport not supported"}"#);
    }

    #[test]
    fn neighborhood_wire_shape() {
        let line = Response::Neighbors(Neighborhood {
            neighbors: vec![NodeId(2), NodeId(5)],
        })
        .to_line()
        .unwrap_or_default();
        assert_eq!(line, r#"{"neighbors":[2,5]}"#);
    }
}
