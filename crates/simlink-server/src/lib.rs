//! Simulation control server for simlink.
//!
//! Accepts TCP connections and runs one task per connection. Every
//! connection reads newline-delimited JSON requests, lazily owns one
//! simulation session, and writes at most one response line per request,
//! in request order.
//!
//! # Modules
//!
//! - [`config`] -- YAML configuration with environment and CLI overrides
//! - [`session`] -- Per-connection session bookkeeping and engine ownership
//! - [`dispatch`] -- Line decoding and engine invocation for one connection
//! - [`server`] -- Listener, connection tasks, and graceful shutdown
//! - [`error`] -- Server error type

pub mod config;
pub mod dispatch;
pub mod error;
pub mod server;
pub mod session;

pub use config::{ConfigError, ServerConfig};
pub use dispatch::{ConnectionStats, Dispatcher, Outcome, STEP_COMPUTE};
pub use error::ServerError;
pub use server::Server;
pub use session::{ConnectionId, SessionInfo, SessionRegistry, SessionSlot};
