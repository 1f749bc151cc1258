//! Configuration for the client and the probe binary.
//!
//! Both are loaded from environment variables with defaults, in the same
//! way the server's overrides are read.

use std::path::PathBuf;
use std::time::Duration;

use simlink_types::NodeId;

use crate::correlator::DEFAULT_MAX_PENDING;
use crate::error::ClientError;

/// Default bound on joining the receive thread at shutdown.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_millis(200);

/// Default number of inbox entries handled per `poll`.
pub const DEFAULT_MAX_MESSAGES: usize = 256;

/// Connection settings for [`SimClient`](crate::SimClient).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Server host name or address.
    pub host: String,
    /// Server TCP port.
    pub port: u16,
    /// How long shutdown waits for the receive thread.
    pub join_timeout: Duration,
    /// Cap on in-flight `step` requests tracked for correlation.
    pub max_pending: usize,
}

impl ClientConfig {
    /// Settings for `host:port` with default limits.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Load from the process environment.
    ///
    /// Optional variables:
    /// - `SIMLINK_HOST` -- server host (default `127.0.0.1`)
    /// - `SIMLINK_PORT` -- server port (default `9090`)
    /// - `SIMLINK_JOIN_TIMEOUT_MS` -- receive thread join bound (default 200)
    /// - `SIMLINK_MAX_PENDING` -- correlation table cap (default 1024)
    pub fn from_env() -> Result<Self, ClientError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ClientError> {
        let defaults = Self::default();
        let join_timeout_ms: u64 = parse_or(&lookup, "SIMLINK_JOIN_TIMEOUT_MS", 200)?;
        Ok(Self {
            host: lookup("SIMLINK_HOST").unwrap_or(defaults.host),
            port: parse_or(&lookup, "SIMLINK_PORT", defaults.port)?,
            join_timeout: Duration::from_millis(join_timeout_ms),
            max_pending: parse_or(&lookup, "SIMLINK_MAX_PENDING", defaults.max_pending)?,
        })
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 9090,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            max_pending: DEFAULT_MAX_PENDING,
        }
    }
}

/// Settings for the `simlink-probe` load driver.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeConfig {
    /// Connection settings.
    pub client: ClientConfig,
    /// Nodes in the simulated graph.
    pub node_count: u32,
    /// Link distance.
    pub max_distance: f64,
    /// Source nodes.
    pub sources: Vec<NodeId>,
    /// Frames to run.
    pub rounds: u32,
    /// Pause between frames.
    pub frame: Duration,
    /// Distance between neighboring nodes in the layout.
    pub spacing: f64,
    /// CSV file receiving client-side samples, if any.
    pub timings_path: Option<PathBuf>,
    /// Inbox entries handled per frame.
    pub max_messages: usize,
}

impl ProbeConfig {
    /// Load from the process environment.
    ///
    /// Optional variables, on top of those read by
    /// [`ClientConfig::from_env`]:
    /// - `PROBE_NODE_COUNT` -- nodes (default 10)
    /// - `PROBE_MAX_DISTANCE` -- link distance (default 3.0)
    /// - `PROBE_SOURCES` -- comma-separated source ids (default `0`)
    /// - `PROBE_ROUNDS` -- frames to run (default 10)
    /// - `PROBE_FRAME_MS` -- pause between frames (default 20)
    /// - `PROBE_SPACING` -- layout spacing (default 3.0)
    /// - `PROBE_TIMINGS_PATH` -- CSV output for client samples (default none)
    /// - `PROBE_MAX_MESSAGES` -- inbox entries per frame (default 256)
    pub fn from_env() -> Result<Self, ClientError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ClientError> {
        let client = ClientConfig::from_lookup(&lookup)?;
        let sources = lookup("PROBE_SOURCES")
            .map_or_else(|| Ok(vec![NodeId(0)]), |raw| parse_sources(&raw))?;
        let frame_ms: u64 = parse_or(&lookup, "PROBE_FRAME_MS", 20)?;

        Ok(Self {
            client,
            node_count: parse_or(&lookup, "PROBE_NODE_COUNT", 10)?,
            max_distance: parse_or(&lookup, "PROBE_MAX_DISTANCE", 3.0)?,
            sources,
            rounds: parse_or(&lookup, "PROBE_ROUNDS", 10)?,
            frame: Duration::from_millis(frame_ms),
            spacing: parse_or(&lookup, "PROBE_SPACING", 3.0)?,
            timings_path: lookup("PROBE_TIMINGS_PATH")
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from),
            max_messages: parse_or(&lookup, "PROBE_MAX_MESSAGES", DEFAULT_MAX_MESSAGES)?,
        })
    }
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ClientError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    lookup(key).map_or(Ok(default), |raw| {
        raw.trim()
            .parse()
            .map_err(|e| ClientError::Config(format!("invalid {key}: {e}")))
    })
}

fn parse_sources(raw: &str) -> Result<Vec<NodeId>, ClientError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u32>()
                .map(NodeId)
                .map_err(|e| ClientError::Config(format!("invalid PROBE_SOURCES entry {s:?}: {e}")))
        })
        .collect()
}
