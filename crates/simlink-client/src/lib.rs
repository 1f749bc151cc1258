//! Synchronous client for the simlink control protocol.
//!
//! [`SimClient`] owns one TCP connection. Sends are plain blocking writes
//! on the caller's thread; a background thread moves every received line
//! into an inbox, and [`SimClient::poll`] drains that inbox on the
//! caller's schedule (typically once per frame), decoding each line and
//! invoking the registered handlers.
//!
//! Every `step` carries a fresh request id. When its state update comes
//! back the client records three latency samples:
//!
//! - `step.socket.send` -- writing the request line
//! - `step.socket.parse` -- decoding the response line
//! - `step.socket.wait` -- from send to end of decode
//!
//! # Modules
//!
//! - [`transport`] -- Socket, receive thread, inbox, and handlers
//! - [`correlator`] -- Request id assignment and pending table
//! - [`config`] -- Environment-based client and probe settings
//! - [`error`] -- Client error type

pub mod config;
pub mod correlator;
pub mod error;
pub mod transport;

pub use config::{ClientConfig, DEFAULT_JOIN_TIMEOUT, DEFAULT_MAX_MESSAGES, ProbeConfig};
pub use correlator::{DEFAULT_MAX_PENDING, PendingRequests};
pub use error::ClientError;
pub use transport::{
    CommandSender, Inbound, STEP_SOCKET_PARSE, STEP_SOCKET_SEND, STEP_SOCKET_WAIT, SimClient,
    StateUpdate,
};
