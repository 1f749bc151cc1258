//! Request handling for one connection.
//!
//! A [`Dispatcher`] turns each request line into an [`Outcome`]: a response
//! line to write, nothing at all, or a final error line after which the
//! connection is closed. It owns the connection's session and latency
//! measurer and is driven by exactly one task, so engine calls need no
//! locking.
//!
//! # Failure policy
//!
//! | failure | response line | connection |
//! |---------|---------------|------------|
//! | line is not a JSON object | error | closed |
//! | missing or unknown `op` | error | kept |
//! | bad `data` for `step` / `neighbor` | error | kept |
//! | `stepCount` above the configured maximum | error | kept |
//! | bad `data` for a fire-and-forget op | none (logged) | kept |
//! | any op but `create` before a session exists | none | kept |
//! | engine rejects a fire-and-forget op | none (logged) | kept |
//! | engine rejects `neighbor` | error | kept |

use std::sync::Arc;
use std::time::Instant;

use simlink_engine::{EngineFactory, node_states};
use simlink_timing::{SampleSink, Summary, TimeMeasurer};
use simlink_types::{
    Command, CreateSimulation, Envelope, NeighborQuery, Neighborhood, NewPosition, Op, Response,
    SetSource, StateSnapshot, Step,
};
use tracing::{debug, info, warn};

use crate::session::{ConnectionId, SessionRegistry, SessionSlot};

/// Label of the server-side sample covering one `step` engine call.
pub const STEP_COMPUTE: &str = "step.compute";

/// Default upper bound on `stepCount` for one `step` request.
pub const DEFAULT_MAX_STEP_COUNT: u32 = 10_000;

/// What the connection task should do after one request line.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Write this line and keep reading.
    Reply(Response),
    /// Write nothing and keep reading.
    Silent,
    /// Write this line, then close the connection.
    Close(Response),
}

/// Counters reported when a connection ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Non-empty lines received.
    pub lines: u64,
    /// Lines that decoded into a command.
    pub commands: u64,
    /// Lines or commands that failed.
    pub errors: u64,
    /// Response lines produced.
    pub responses: u64,
}

/// Per-connection request handler.
pub struct Dispatcher {
    id: ConnectionId,
    registry: Arc<SessionRegistry>,
    factory: Arc<dyn EngineFactory>,
    session: Option<SessionSlot>,
    measurer: TimeMeasurer,
    stats: ConnectionStats,
    max_step_count: u32,
}

impl Dispatcher {
    /// Create a handler for a freshly accepted connection.
    ///
    /// Samples are forwarded to `sink` when one is given.
    pub fn new(
        id: ConnectionId,
        registry: Arc<SessionRegistry>,
        factory: Arc<dyn EngineFactory>,
        sink: Option<Arc<dyn SampleSink>>,
    ) -> Self {
        Self {
            id,
            registry,
            factory,
            session: None,
            measurer: TimeMeasurer::with_origin(Instant::now(), sink),
            stats: ConnectionStats::default(),
            max_step_count: DEFAULT_MAX_STEP_COUNT,
        }
    }

    /// Reject `step` requests asking for more than `max` rounds.
    #[must_use]
    pub const fn with_max_step_count(mut self, max: u32) -> Self {
        self.max_step_count = max;
        self
    }

    /// The connection this dispatcher serves.
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Whether a `create` has been applied on this connection.
    pub const fn has_session(&self) -> bool {
        self.session.is_some()
    }

    /// Counters so far.
    pub const fn stats(&self) -> ConnectionStats {
        self.stats
    }

    /// Latency summary of the `step` engine calls so far.
    pub fn step_summary(&self) -> Option<Summary> {
        self.measurer.summary(STEP_COMPUTE)
    }

    /// Handle one request line.
    pub fn handle_line(&mut self, line: &str) -> Outcome {
        let line = line.trim();
        if line.is_empty() {
            return Outcome::Silent;
        }
        self.stats.lines = self.stats.lines.saturating_add(1);

        let envelope = match Envelope::parse(line) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(connection = %self.id, error = %e, "Unparseable request, closing connection");
                return self.close(Response::error(e));
            }
        };

        let op = envelope.op.clone();
        let command = match envelope.into_command() {
            Ok(command) => command,
            Err(e) => {
                self.stats.errors = self.stats.errors.saturating_add(1);
                warn!(connection = %self.id, op = op.name(), error = %e, "Rejected request");
                return match op {
                    Op::Create | Op::SetSource | Op::NewPosition => Outcome::Silent,
                    Op::Step | Op::Neighbor | Op::Unknown(_) | Op::Missing => {
                        self.reply(Response::error(e))
                    }
                };
            }
        };

        self.stats.commands = self.stats.commands.saturating_add(1);
        self.execute(command)
    }

    /// Build the final error line for a transport-level rejection such as
    /// an oversized or non-UTF-8 line.
    pub fn reject(&mut self, reason: impl std::fmt::Display) -> Outcome {
        warn!(connection = %self.id, %reason, "Rejected line, closing connection");
        self.close(Response::error(reason))
    }

    /// Log the connection's statistics. The session ends when the
    /// dispatcher is dropped.
    pub fn finish(&self, reason: &str) {
        let stats = self.stats;
        let step_compute = self.step_summary().map(|summary| summary.to_string());
        info!(
            connection = %self.id,
            reason,
            lines = stats.lines,
            commands = stats.commands,
            errors = stats.errors,
            responses = stats.responses,
            step_compute = step_compute.as_deref(),
            "Connection closed"
        );
    }

    fn reply(&mut self, response: Response) -> Outcome {
        self.stats.responses = self.stats.responses.saturating_add(1);
        Outcome::Reply(response)
    }

    fn close(&mut self, response: Response) -> Outcome {
        self.stats.errors = self.stats.errors.saturating_add(1);
        self.stats.responses = self.stats.responses.saturating_add(1);
        Outcome::Close(response)
    }

    fn execute(&mut self, command: Command) -> Outcome {
        match command {
            Command::Create(create) => self.create(create),
            Command::SetSource(set) => self.set_source(set),
            Command::Step(step) => self.step(step),
            Command::NewPosition(moved) => self.new_position(moved),
            Command::Neighbor(query) => self.neighbor(query),
        }
    }

    fn create(&mut self, create: CreateSimulation) -> Outcome {
        let engine = match self.factory.create(create.node_count, create.max_distance) {
            Ok(engine) => engine,
            Err(e) => {
                self.stats.errors = self.stats.errors.saturating_add(1);
                warn!(connection = %self.id, error = %e, "Simulation creation failed");
                return Outcome::Silent;
            }
        };

        if let Some(slot) = self.session.as_mut() {
            slot.replace(engine);
        } else {
            self.session = Some(SessionSlot::open(
                self.id,
                Arc::clone(&self.registry),
                engine,
            ));
        }
        info!(
            connection = %self.id,
            node_count = create.node_count,
            max_distance = create.max_distance,
            "Simulation created"
        );
        Outcome::Silent
    }

    fn set_source(&mut self, set: SetSource) -> Outcome {
        let Some(slot) = self.session.as_mut() else {
            return self.no_session(&Op::SetSource);
        };
        if let Err(e) = slot.engine_mut().set_source(set.node_id, true) {
            self.stats.errors = self.stats.errors.saturating_add(1);
            warn!(connection = %self.id, error = %e, "setSource failed");
        }
        Outcome::Silent
    }

    fn step(&mut self, step: Step) -> Outcome {
        if self.session.is_none() {
            return self.no_session(&Op::Step);
        }
        if step.step_count > self.max_step_count {
            self.stats.errors = self.stats.errors.saturating_add(1);
            warn!(
                connection = %self.id,
                rid = %step.rid,
                step_count = step.step_count,
                max = self.max_step_count,
                "Rejected oversized step"
            );
            return self.reply(Response::error(format!(
                "stepCount {} exceeds the limit of {}",
                step.step_count, self.max_step_count
            )));
        }
        let Some(slot) = self.session.as_mut() else {
            return Outcome::Silent;
        };

        let started = Instant::now();
        let engine = slot.engine_mut();
        engine.step(step.step_count);
        let values = node_states(engine);
        let elapsed = self.measurer.record(STEP_COMPUTE, started, Instant::now());

        debug!(
            connection = %self.id,
            rid = %step.rid,
            rounds = step.step_count,
            elapsed_us = elapsed.as_micros(),
            "Step computed"
        );
        self.reply(Response::State(StateSnapshot {
            rid: step.rid,
            values,
        }))
    }

    fn new_position(&mut self, moved: NewPosition) -> Outcome {
        let Some(slot) = self.session.as_mut() else {
            return self.no_session(&Op::NewPosition);
        };
        if let Err(e) = slot
            .engine_mut()
            .update_position(moved.node_id, moved.position())
        {
            self.stats.errors = self.stats.errors.saturating_add(1);
            warn!(connection = %self.id, error = %e, "newPosition failed");
        }
        Outcome::Silent
    }

    fn neighbor(&mut self, query: NeighborQuery) -> Outcome {
        let Some(slot) = self.session.as_ref() else {
            return self.no_session(&Op::Neighbor);
        };
        let neighborhood = slot.engine().neighborhood(query.node_id);
        match neighborhood {
            Ok(set) => self.reply(Response::Neighbors(Neighborhood {
                neighbors: set.into_iter().collect(),
            })),
            Err(e) => {
                self.stats.errors = self.stats.errors.saturating_add(1);
                self.reply(Response::error(e))
            }
        }
    }

    fn no_session(&self, op: &Op) -> Outcome {
        debug!(connection = %self.id, op = op.name(), "No session yet, ignoring");
        Outcome::Silent
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("id", &self.id)
            .field("session", &self.session)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    use simlink_engine::DistanceGradientFactory;
    use simlink_timing::MemorySink;
    use simlink_types::{NodeId, RequestId};

    fn dispatcher_with(sink: Option<Arc<dyn SampleSink>>) -> (Dispatcher, Arc<SessionRegistry>) {
        let registry = Arc::new(SessionRegistry::new());
        let id = ConnectionId(SocketAddr::from(([127, 0, 0, 1], 4000)));
        let dispatcher = Dispatcher::new(
            id,
            Arc::clone(&registry),
            Arc::new(DistanceGradientFactory::default()),
            sink,
        );
        (dispatcher, registry)
    }

    fn dispatcher() -> Dispatcher {
        dispatcher_with(None).0
    }

    fn snapshot(outcome: Outcome) -> StateSnapshot {
        match outcome {
            Outcome::Reply(Response::State(snapshot)) => snapshot,
            other => panic!("Expected a state reply, got {other:?}"),
        }
    }

    fn error_text(outcome: &Outcome) -> Option<&str> {
        match outcome {
            Outcome::Reply(Response::Error(e)) | Outcome::Close(Response::Error(e)) => {
                Some(e.error.as_str())
            }
            _ => None,
        }
    }

    #[test]
    fn create_source_step_scenario() {
        let mut d = dispatcher();
        let create = r#"{"op":"create","data":{"nodeCount":3,"maxDistance":3.0}}"#;
        assert_eq!(d.handle_line(create), Outcome::Silent);
        assert_eq!(
            d.handle_line(r#"{"op":"setSource","data":{"nodeId":0}}"#),
            Outcome::Silent
        );

        let state = snapshot(d.handle_line(r#"{"op":"step","data":{"stepCount":1,"rid":7}}"#));
        assert_eq!(state.rid, RequestId(7));
        assert_eq!(state.values.len(), 3);
        assert!(state.values.first().is_some_and(|n| n.is_reachable()));
        assert_eq!(d.stats().responses, 1);
    }

    #[test]
    fn blank_lines_are_ignored() {
        let mut d = dispatcher();
        assert_eq!(d.handle_line("   "), Outcome::Silent);
        assert_eq!(d.stats().lines, 0);
    }

    #[test]
    fn ops_without_session_are_silent() {
        let mut d = dispatcher();
        assert_eq!(d.handle_line(r#"{"op":"step","data":{"rid":1}}"#), Outcome::Silent);
        assert_eq!(
            d.handle_line(r#"{"op":"neighbor","data":{"nodeId":0}}"#),
            Outcome::Silent
        );
        assert_eq!(
            d.handle_line(r#"{"op":"newPosition","data":{"nodeId":0,"x":1,"y":0,"z":0}}"#),
            Outcome::Silent
        );
        assert!(!d.has_session());
    }

    #[test]
    fn unknown_op_gets_error_and_continues() {
        let mut d = dispatcher();
        let outcome = d.handle_line(r#"{"op":"teleport","data":{}}"#);
        assert!(matches!(outcome, Outcome::Reply(Response::Error(_))));
        assert!(error_text(&outcome).is_some_and(|e| e.contains("teleport")));

        let missing = d.handle_line(r#"{"data":{}}"#);
        assert!(matches!(missing, Outcome::Reply(Response::Error(_))));
    }

    #[test]
    fn malformed_json_closes() {
        let mut d = dispatcher();
        assert!(matches!(d.handle_line("{not json"), Outcome::Close(_)));
        assert!(matches!(d.handle_line("[1,2]"), Outcome::Close(_)));
        assert_eq!(d.stats().errors, 2);
    }

    #[test]
    fn bad_payload_policy_depends_on_op() {
        let mut d = dispatcher();
        d.handle_line(r#"{"op":"create","data":{"nodeCount":2,"maxDistance":1.0}}"#);

        // Fire-and-forget ops never answer.
        assert_eq!(
            d.handle_line(r#"{"op":"setSource","data":{"nodeId":"zero"}}"#),
            Outcome::Silent
        );
        // Ops with a response answer with an error.
        let outcome = d.handle_line(r#"{"op":"step","data":{"stepCount":1}}"#);
        assert!(error_text(&outcome).is_some_and(|e| e.contains("step")));
        assert_eq!(d.stats().errors, 2);
    }

    #[test]
    fn missing_data_is_an_empty_object() {
        let mut d = dispatcher();
        d.handle_line(r#"{"op":"create","data":{"nodeCount":2,"maxDistance":1.0}}"#);
        let outcome = d.handle_line(r#"{"op":"step"}"#);
        assert!(error_text(&outcome).is_some_and(|e| e.contains("rid")));
    }

    #[test]
    fn out_of_range_nodes() {
        let mut d = dispatcher();
        d.handle_line(r#"{"op":"create","data":{"nodeCount":2,"maxDistance":1.0}}"#);
        assert_eq!(
            d.handle_line(r#"{"op":"setSource","data":{"nodeId":5}}"#),
            Outcome::Silent
        );
        let outcome = d.handle_line(r#"{"op":"neighbor","data":{"nodeId":5}}"#);
        assert!(error_text(&outcome).is_some_and(|e| e.contains("out of range")));
    }

    #[test]
    fn neighbor_query_lists_links() {
        let mut d = dispatcher();
        d.handle_line(r#"{"op":"create","data":{"nodeCount":3,"maxDistance":1.0}}"#);
        let outcome = d.handle_line(r#"{"op":"neighbor","data":{"nodeId":1}}"#);
        assert_eq!(
            outcome,
            Outcome::Reply(Response::Neighbors(Neighborhood {
                neighbors: vec![NodeId(0), NodeId(2)],
            }))
        );
    }

    #[test]
    fn repeated_create_replaces_engine() {
        let (mut d, registry) = dispatcher_with(None);
        d.handle_line(r#"{"op":"createSim","data":{"nodeCount":2,"maxDistance":1.0}}"#);
        d.handle_line(r#"{"op":"create","data":{"nodeCount":5,"maxDistance":1.0}}"#);

        let info = registry.describe(d.id());
        assert_eq!(info.map(|i| i.generation), Some(2));
        let state = snapshot(d.handle_line(r#"{"op":"step","data":{"rid":1}}"#));
        assert_eq!(state.values.len(), 5);

        drop(d);
        assert!(registry.is_empty());
    }

    #[test]
    fn step_count_above_limit_gets_error() {
        let mut d = dispatcher().with_max_step_count(50);
        d.handle_line(r#"{"op":"create","data":{"nodeCount":2,"maxDistance":1.0}}"#);

        let outcome = d.handle_line(r#"{"op":"step","data":{"stepCount":51,"rid":1}}"#);
        assert!(error_text(&outcome).is_some_and(|e| e.contains("exceeds the limit of 50")));

        let state = snapshot(d.handle_line(r#"{"op":"step","data":{"stepCount":50,"rid":2}}"#));
        assert_eq!(state.rid, RequestId(2));
        assert_eq!(d.stats().errors, 1);
    }

    #[test]
    fn step_records_compute_samples() {
        let sink = Arc::new(MemorySink::new());
        let (mut d, _registry) = dispatcher_with(Some(Arc::clone(&sink) as Arc<dyn SampleSink>));
        d.handle_line(r#"{"op":"create","data":{"nodeCount":4,"maxDistance":1.0}}"#);
        for rid in 1..=3 {
            let line = format!(r#"{{"op":"step","data":{{"rid":{rid}}}}}"#);
            snapshot(d.handle_line(&line));
        }
        assert_eq!(sink.samples_for(STEP_COMPUTE).len(), 3);
        assert_eq!(d.step_summary().map(|s| s.count), Some(3));
    }
}
