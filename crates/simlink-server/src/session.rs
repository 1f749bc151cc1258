//! Session registry and per-connection engine ownership.
//!
//! A session is created by the first `create` on a connection and lives
//! exactly as long as that connection. The engine itself is owned by the
//! connection task through a [`SessionSlot`]; the shared
//! [`SessionRegistry`] only records which connections currently have a
//! session, so its lock is never held across an engine call or socket I/O.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use simlink_engine::GradientEngine;
use tracing::debug;

/// Identity of one client connection: the peer socket address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub SocketAddr);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bookkeeping recorded for a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    /// Node count of the current engine.
    pub node_count: usize,
    /// Number of `create` requests applied so far (1 for a fresh session).
    pub generation: u64,
    /// When the session was first created.
    pub created_at: Instant,
}

/// Which connections currently own a session.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<ConnectionId, SessionInfo>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.lock().map_or(0, |sessions| sessions.len())
    }

    /// Whether no session is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `id` currently has a session.
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.sessions
            .lock()
            .is_ok_and(|sessions| sessions.contains_key(&id))
    }

    /// Bookkeeping for the session of `id`, if any.
    pub fn describe(&self, id: ConnectionId) -> Option<SessionInfo> {
        let Ok(sessions) = self.sessions.lock() else {
            return None;
        };
        sessions.get(&id).copied()
    }

    /// Record a session for `id`, replacing any previous record.
    fn record(&self, id: ConnectionId, node_count: usize) -> SessionInfo {
        let now = Instant::now();
        let Ok(mut sessions) = self.sessions.lock() else {
            return SessionInfo {
                node_count,
                generation: 1,
                created_at: now,
            };
        };
        let (generation, created_at) = sessions
            .get(&id)
            .map_or((1, now), |previous| {
                (previous.generation.saturating_add(1), previous.created_at)
            });
        let info = SessionInfo {
            node_count,
            generation,
            created_at,
        };
        sessions.insert(id, info);
        info
    }

    fn remove(&self, id: ConnectionId) -> Option<SessionInfo> {
        let Ok(mut sessions) = self.sessions.lock() else {
            return None;
        };
        sessions.remove(&id)
    }
}

/// The session owned by one connection task.
///
/// Dropping the slot destroys the engine and removes the registry entry.
pub struct SessionSlot {
    id: ConnectionId,
    registry: Arc<SessionRegistry>,
    engine: Box<dyn GradientEngine>,
}

impl SessionSlot {
    /// Register a new session for `id` around `engine`.
    pub fn open(
        id: ConnectionId,
        registry: Arc<SessionRegistry>,
        engine: Box<dyn GradientEngine>,
    ) -> Self {
        let info = registry.record(id, engine.node_count());
        debug!(connection = %id, node_count = info.node_count, "session opened");
        Self {
            id,
            registry,
            engine,
        }
    }

    /// Replace the engine, dropping the previous one.
    pub fn replace(&mut self, engine: Box<dyn GradientEngine>) -> SessionInfo {
        let info = self.registry.record(self.id, engine.node_count());
        self.engine = engine;
        debug!(
            connection = %self.id,
            node_count = info.node_count,
            generation = info.generation,
            "session engine replaced"
        );
        info
    }

    /// The connection owning this session.
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Shared access to the engine.
    pub fn engine(&self) -> &dyn GradientEngine {
        self.engine.as_ref()
    }

    /// Exclusive access to the engine.
    pub fn engine_mut(&mut self) -> &mut dyn GradientEngine {
        self.engine.as_mut()
    }
}

impl fmt::Debug for SessionSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSlot")
            .field("id", &self.id)
            .field("node_count", &self.engine.node_count())
            .finish_non_exhaustive()
    }
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        if self.registry.remove(self.id).is_some() {
            debug!(connection = %self.id, "session closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simlink_engine::{DistanceGradientFactory, EngineFactory};

    fn conn(port: u16) -> ConnectionId {
        ConnectionId(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    fn engine(node_count: u32) -> Box<dyn GradientEngine> {
        match DistanceGradientFactory::default().create(node_count, 1.0) {
            Ok(engine) => engine,
            Err(e) => panic!("Expected engine creation to succeed, got {e}"),
        }
    }

    #[test]
    fn open_registers_and_drop_deregisters() {
        let registry = Arc::new(SessionRegistry::new());
        let slot = SessionSlot::open(conn(1000), Arc::clone(&registry), engine(3));

        assert!(registry.contains(conn(1000)));
        assert_eq!(registry.describe(conn(1000)).map(|i| i.node_count), Some(3));
        assert_eq!(slot.engine().node_count(), 3);

        drop(slot);
        assert!(registry.is_empty());
    }

    #[test]
    fn replace_keeps_one_entry_and_bumps_generation() {
        let registry = Arc::new(SessionRegistry::new());
        let mut slot = SessionSlot::open(conn(1001), Arc::clone(&registry), engine(3));

        let info = slot.replace(engine(5));
        assert_eq!(info.generation, 2);
        assert_eq!(info.node_count, 5);
        assert_eq!(registry.len(), 1);
        assert_eq!(slot.engine_mut().node_count(), 5);
    }

    #[test]
    fn sessions_are_keyed_by_peer_address() {
        let registry = Arc::new(SessionRegistry::new());
        let a = SessionSlot::open(conn(2000), Arc::clone(&registry), engine(2));
        let b = SessionSlot::open(conn(2001), Arc::clone(&registry), engine(4));

        assert_eq!(registry.len(), 2);
        drop(a);
        assert!(!registry.contains(conn(2000)));
        assert!(registry.contains(conn(2001)));
        assert_eq!(b.id(), conn(2001));
    }
}
