//! Socket ownership, the receive thread, and inbox polling.
//!
//! # Threads
//!
//! ```text
//! caller thread                         simlink-rx thread
//!   create / set_source / step            read_line (blocking)
//!     -> Mutex<TcpStream> write             -> Inbound::Line -> inbox
//!   poll(max)                             end of stream / error
//!     <- inbox (non-blocking)               -> Inbound::Disconnected -> inbox
//!     -> state / error handlers
//! ```
//!
//! The receive thread never parses or dispatches: all decoding and handler
//! calls happen inside [`SimClient::poll`] on the caller's thread.

use std::io::{BufRead, BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::Value;
use simlink_timing::{SampleSink, Summary, TimeMeasurer, Worker};
use simlink_types::{
    Command, CreateSimulation, NewPosition, NodeId, NodeState, Position, RequestId, SetSource,
    Step,
};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::correlator::PendingRequests;
use crate::error::ClientError;

/// Time spent writing one `step` line.
pub const STEP_SOCKET_SEND: &str = "step.socket.send";
/// Time spent decoding one state update.
pub const STEP_SOCKET_PARSE: &str = "step.socket.parse";
/// Time from sending a `step` to finishing the decode of its answer.
pub const STEP_SOCKET_WAIT: &str = "step.socket.wait";

const RX_THREAD_NAME: &str = "simlink-rx";

/// One entry of the inbox between the receive thread and `poll`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A raw line from the server, without its terminator.
    Line(String),
    /// The connection ended while the client was still running.
    Disconnected(String),
}

/// A decoded state update.
#[derive(Debug, Clone, PartialEq)]
pub struct StateUpdate {
    /// The `rid` echoed by the server, when present.
    pub rid: Option<RequestId>,
    /// Value and neighborhood of every node, in node id order.
    pub nodes: Vec<NodeState>,
}

/// Wire form of a state update; `rid` is optional for older servers.
#[derive(Deserialize)]
struct StateLine {
    #[serde(default)]
    rid: Option<RequestId>,
    values: Vec<NodeState>,
}

type StateHandler = Box<dyn FnMut(StateUpdate) + Send>;
type ErrorHandler = Box<dyn FnMut(ClientError) + Send>;

/// State shared by every sender and the receive thread.
struct Outbound {
    running: AtomicBool,
    writer: Mutex<Option<TcpStream>>,
    pending: Mutex<PendingRequests>,
    measurer: Mutex<TimeMeasurer>,
}

impl Outbound {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Lock the write half, failing once the client is shut down.
    fn writer(&self) -> Result<MutexGuard<'_, Option<TcpStream>>, ClientError> {
        if !self.is_running() {
            return Err(ClientError::NotConnected);
        }
        let Ok(writer) = self.writer.lock() else {
            return Err(ClientError::NotConnected);
        };
        Ok(writer)
    }

    fn write_line(&self, command: &Command) -> Result<(), ClientError> {
        let mut writer = self.writer()?;
        let stream = writer.as_mut().ok_or(ClientError::NotConnected)?;
        write_command(stream, command)
    }

    /// Issue a request id and write the `step` carrying it.
    ///
    /// The id is issued under the writer lock, so ids reach the wire in
    /// issue order even when several threads step at once.
    fn write_step(&self, step_count: u32) -> Result<RequestId, ClientError> {
        let mut writer = self.writer()?;
        let stream = writer.as_mut().ok_or(ClientError::NotConnected)?;

        let sent_at = Instant::now();
        let rid = self.pending().issue(sent_at);
        if let Err(e) = write_command(stream, &Command::Step(Step { step_count, rid })) {
            self.pending().cancel(rid);
            return Err(e);
        }
        drop(writer);

        self.measurer()
            .record(STEP_SOCKET_SEND, sent_at, Instant::now());
        Ok(rid)
    }

    fn pending(&self) -> MutexGuard<'_, PendingRequests> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn measurer(&self) -> MutexGuard<'_, TimeMeasurer> {
        self.measurer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stop accepting sends. Returns whether the client was running.
    fn close(&self) -> bool {
        let was_running = self.running.swap(false, Ordering::AcqRel);
        if let Ok(mut writer) = self.writer.lock() {
            writer.take();
        }
        was_running
    }
}

/// Cloneable handle for sending commands from any thread.
#[derive(Clone)]
pub struct CommandSender {
    shared: Arc<Outbound>,
}

impl CommandSender {
    /// Create (or replace) the session's simulation.
    pub fn create(&self, node_count: u32, max_distance: f64) -> Result<(), ClientError> {
        self.send(&Command::Create(CreateSimulation {
            node_count,
            max_distance,
        }))
    }

    /// Mark `node` as a gradient source.
    pub fn set_source(&self, node: NodeId) -> Result<(), ClientError> {
        self.send(&Command::SetSource(SetSource { node_id: node }))
    }

    /// Move `node` to `position`.
    pub fn new_position(&self, node: NodeId, position: Position) -> Result<(), ClientError> {
        self.send(&Command::NewPosition(NewPosition::new(node, position)))
    }

    /// Ask for `step_count` rounds and a state update.
    ///
    /// Returns the request id the update will carry.
    pub fn step(&self, step_count: u32) -> Result<RequestId, ClientError> {
        self.shared.write_step(step_count)
    }

    /// Send an arbitrary command.
    pub fn send(&self, command: &Command) -> Result<(), ClientError> {
        self.shared.write_line(command)
    }

    /// Whether sends are still accepted.
    pub fn is_connected(&self) -> bool {
        self.shared.is_running()
    }
}

impl std::fmt::Debug for CommandSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandSender")
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

/// A connection to a simlink server.
pub struct SimClient {
    sender: CommandSender,
    inbox: Receiver<Inbound>,
    rx_worker: Option<Worker>,
    socket: TcpStream,
    peer: SocketAddr,
    join_timeout: Duration,
    on_state: Option<StateHandler>,
    on_error: Option<ErrorHandler>,
}

impl SimClient {
    /// Connect and start the receive thread.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Io`] if the connection or the thread cannot
    /// be set up.
    pub fn connect(config: &ClientConfig) -> Result<Self, ClientError> {
        Self::connect_with_measurer(config, TimeMeasurer::new())
    }

    /// Connect and forward every client-side sample to `sink`.
    pub fn connect_with_sink(
        config: &ClientConfig,
        sink: Arc<dyn SampleSink>,
    ) -> Result<Self, ClientError> {
        Self::connect_with_measurer(config, TimeMeasurer::with_sink(sink))
    }

    fn connect_with_measurer(
        config: &ClientConfig,
        measurer: TimeMeasurer,
    ) -> Result<Self, ClientError> {
        let socket = TcpStream::connect((config.host.as_str(), config.port))?;
        if let Err(e) = socket.set_nodelay(true) {
            debug!(error = %e, "Could not disable Nagle");
        }
        let peer = socket.peer_addr()?;
        let reader = socket.try_clone()?;
        let writer = socket.try_clone()?;

        let shared = Arc::new(Outbound {
            running: AtomicBool::new(true),
            writer: Mutex::new(Some(writer)),
            pending: Mutex::new(PendingRequests::new(config.max_pending)),
            measurer: Mutex::new(measurer),
        });

        let (tx, inbox) = mpsc::channel();
        let rx_shared = Arc::clone(&shared);
        let rx_worker = Worker::spawn(RX_THREAD_NAME, move || {
            receive_loop(reader, &tx, &rx_shared);
        })?;

        info!(%peer, "Connected to simlink server");
        Ok(Self {
            sender: CommandSender { shared },
            inbox,
            rx_worker: Some(rx_worker),
            socket,
            peer,
            join_timeout: config.join_timeout,
            on_state: None,
            on_error: None,
        })
    }

    /// Register the handler receiving state updates.
    pub fn on_state(&mut self, handler: impl FnMut(StateUpdate) + Send + 'static) {
        self.on_state = Some(Box::new(handler));
    }

    /// Register the handler receiving protocol and connection errors.
    ///
    /// Without one, errors are logged.
    pub fn on_error(&mut self, handler: impl FnMut(ClientError) + Send + 'static) {
        self.on_error = Some(Box::new(handler));
    }

    /// A handle for sending from other threads.
    pub fn sender(&self) -> CommandSender {
        self.sender.clone()
    }

    /// Address of the server.
    pub const fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Whether sends are still accepted.
    pub fn is_connected(&self) -> bool {
        self.sender.is_connected()
    }

    /// See [`CommandSender::create`].
    pub fn create(&self, node_count: u32, max_distance: f64) -> Result<(), ClientError> {
        self.sender.create(node_count, max_distance)
    }

    /// See [`CommandSender::set_source`].
    pub fn set_source(&self, node: NodeId) -> Result<(), ClientError> {
        self.sender.set_source(node)
    }

    /// See [`CommandSender::new_position`].
    pub fn new_position(&self, node: NodeId, position: Position) -> Result<(), ClientError> {
        self.sender.new_position(node, position)
    }

    /// See [`CommandSender::step`].
    pub fn step(&self, step_count: u32) -> Result<RequestId, ClientError> {
        self.sender.step(step_count)
    }

    /// Handle up to `max_messages` inbox entries without blocking.
    ///
    /// Returns the number of entries taken from the inbox.
    pub fn poll(&mut self, max_messages: usize) -> usize {
        let mut drained = 0usize;
        while drained < max_messages {
            let Ok(inbound) = self.inbox.try_recv() else {
                break;
            };
            drained = drained.saturating_add(1);
            match inbound {
                Inbound::Line(line) => self.handle_line(&line),
                Inbound::Disconnected(reason) => self.emit_error(ClientError::Disconnected(reason)),
            }
        }
        drained
    }

    /// Number of `step` requests awaiting an answer.
    pub fn pending_len(&self) -> usize {
        self.sender.shared.pending().len()
    }

    /// Number of `step` requests retired without an answer.
    pub fn abandoned(&self) -> u64 {
        self.sender.shared.pending().abandoned()
    }

    /// Summary of the client-side samples recorded under `label`.
    pub fn summary(&self, label: &str) -> Option<Summary> {
        self.sender.shared.measurer().summary(label)
    }

    /// Summaries of every label recorded so far, sorted by label.
    pub fn summaries(&self) -> std::collections::BTreeMap<String, Summary> {
        self.sender.shared.measurer().summaries()
    }

    /// Stop sending, close the socket, and join the receive thread within
    /// the configured bound. Safe to call more than once.
    pub fn shutdown(&mut self) {
        let was_running = self.sender.shared.close();
        if let Err(e) = self.socket.shutdown(Shutdown::Both) {
            debug!(error = %e, "Socket already closed");
        }
        let timeout = self.join_timeout;
        let joined = self
            .rx_worker
            .take()
            .is_none_or(|mut worker| worker.join_timeout(timeout));
        if !joined {
            warn!(peer = %self.peer, "Receive thread still running after shutdown");
        }
        if was_running {
            info!(peer = %self.peer, "Disconnected from simlink server");
        }
    }

    fn handle_line(&mut self, line: &str) {
        let started = Instant::now();
        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(source) => {
                self.emit_error(ClientError::InvalidJson {
                    line: line.to_owned(),
                    source,
                });
                return;
            }
        };

        if value.get("values").is_some_and(Value::is_array) {
            match serde_json::from_value::<StateLine>(value) {
                Ok(state) => self.deliver_state(state, started),
                Err(source) => self.emit_error(ClientError::MalformedState {
                    line: line.to_owned(),
                    source,
                }),
            }
            return;
        }

        let error = match value.get("error") {
            Some(Value::String(message)) => ClientError::Server(message.clone()),
            Some(other) => ClientError::Server(other.to_string()),
            None => ClientError::UnknownMessage(line.to_owned()),
        };
        self.emit_error(error);
    }

    fn deliver_state(&mut self, state: StateLine, started: Instant) {
        let parsed = Instant::now();
        {
            let shared = &self.sender.shared;
            let sent_at = state.rid.and_then(|rid| shared.pending().complete(rid));
            let mut measurer = shared.measurer();
            measurer.record(STEP_SOCKET_PARSE, started, parsed);
            if let Some(sent_at) = sent_at {
                measurer.record(STEP_SOCKET_WAIT, sent_at, parsed);
            }
        }

        let update = StateUpdate {
            rid: state.rid,
            nodes: state.values,
        };
        if let Some(handler) = self.on_state.as_mut() {
            handler(update);
        }
    }

    fn emit_error(&mut self, error: ClientError) {
        if let Some(handler) = self.on_error.as_mut() {
            handler(error);
            return;
        }
        warn!(peer = %self.peer, error = %error, "Unhandled client error");
    }
}

impl std::fmt::Debug for SimClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimClient")
            .field("peer", &self.peer)
            .field("connected", &self.is_connected())
            .field("pending", &self.pending_len())
            .finish_non_exhaustive()
    }
}

impl Drop for SimClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn write_command(stream: &mut TcpStream, command: &Command) -> Result<(), ClientError> {
    let mut line = command.to_line()?;
    line.push('\n');
    stream.write_all(line.as_bytes())?;
    stream.flush()?;
    Ok(())
}

/// Body of the receive thread: move lines into the inbox until the
/// stream ends.
fn receive_loop(stream: TcpStream, inbox: &Sender<Inbound>, shared: &Outbound) {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();

    let reason = loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => break "server closed the connection".to_owned(),
            Ok(_) => {
                let trimmed = line.trim_end_matches(['\n', '\r']);
                if trimmed.is_empty() {
                    continue;
                }
                if inbox.send(Inbound::Line(trimmed.to_owned())).is_err() {
                    // The client is gone; nobody is left to notify.
                    return;
                }
            }
            Err(e) => break e.to_string(),
        }
    };

    if shared.is_running() {
        debug!(%reason, "Receive loop ended");
        let _ = inbox.send(Inbound::Disconnected(reason));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    /// A connected client plus the server side of its socket.
    fn pair() -> (SimClient, TcpStream) {
        let Ok(listener) = TcpListener::bind("127.0.0.1:0") else {
            panic!("Expected to bind a local listener");
        };
        let port = listener.local_addr().map(|a| a.port()).unwrap_or(0);
        let client = match SimClient::connect(&ClientConfig::new("127.0.0.1", port)) {
            Ok(client) => client,
            Err(e) => panic!("Expected connect to succeed, got {e}"),
        };
        let server = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(e) => panic!("Expected accept to succeed, got {e}"),
        };
        (client, server)
    }

    #[test]
    fn sends_are_one_envelope_per_line() {
        let (client, server) = pair();
        assert!(client.create(3, 3.0).is_ok());
        assert!(client.set_source(NodeId(0)).is_ok());
        assert_eq!(client.step(1).ok(), Some(RequestId(1)));
        assert_eq!(client.step(2).ok(), Some(RequestId(2)));

        let mut reader = BufReader::new(server);
        let mut lines = Vec::new();
        for _ in 0..4 {
            let mut line = String::new();
            if reader.read_line(&mut line).is_err() {
                break;
            }
            lines.push(line);
        }
        assert_eq!(lines.len(), 4);
        assert!(lines.iter().all(|l| l.ends_with('\n')));
        assert!(lines.first().is_some_and(|l| l.contains(r#""op":"create""#)));
        assert!(lines.get(3).is_some_and(|l| l.contains(r#""rid":2"#)));
        assert_eq!(client.pending_len(), 2);
    }

    #[test]
    fn sends_after_shutdown_fail() {
        let (mut client, _server) = pair();
        client.shutdown();
        client.shutdown();
        assert!(matches!(client.step(1), Err(ClientError::NotConnected)));
        assert!(matches!(client.create(1, 1.0), Err(ClientError::NotConnected)));
        assert_eq!(client.pending_len(), 0);
    }

    #[test]
    fn sender_clones_share_ids() {
        let (client, _server) = pair();
        let other = client.sender();
        let handle = std::thread::spawn(move || other.step(1).ok());
        let from_thread = handle.join().ok().flatten();
        let from_client = client.step(1).ok();
        assert_eq!(from_thread, Some(RequestId(1)));
        assert_eq!(from_client, Some(RequestId(2)));
    }
}
