//! Listener lifecycle and per-connection tasks.
//!
//! [`Server::bind`] opens the listening socket; [`Server::serve_until`]
//! accepts connections until the shutdown future completes. Each accepted
//! connection runs in its own task with its own [`Dispatcher`], so a slow
//! or misbehaving client only ever stalls itself.
//!
//! Engine calls are synchronous and can be long (`create` links every pair
//! of nodes, `step` runs up to `max_step_count` rounds). On a multi-thread
//! runtime each request is handled inside [`tokio::task::block_in_place`],
//! so the worker's other tasks, the accept loop, and the timer driver move
//! to another thread for the duration.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use simlink_engine::EngineFactory;
use simlink_timing::SampleSink;
use simlink_types::Response;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::dispatch::{Dispatcher, Outcome};
use crate::error::ServerError;
use crate::session::{ConnectionId, SessionRegistry};

/// A bound simlink server.
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    shared: Shared,
    shutdown_grace: Duration,
}

/// State handed to every connection task.
#[derive(Clone)]
struct Shared {
    registry: Arc<SessionRegistry>,
    factory: Arc<dyn EngineFactory>,
    sink: Option<Arc<dyn SampleSink>>,
    max_line_bytes: usize,
    max_step_count: u32,
}

impl Server {
    /// Bind the listening socket described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be resolved or
    /// bound.
    pub async fn bind(
        config: &ServerConfig,
        factory: Arc<dyn EngineFactory>,
    ) -> Result<Self, ServerError> {
        let host = config.listen.host.as_str();
        let port = config.listen.port;
        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|e| ServerError::Bind(format!("bind failed on {host}:{port}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::Bind(format!("no local address: {e}")))?;

        Ok(Self {
            listener,
            local_addr,
            shared: Shared {
                registry: Arc::new(SessionRegistry::new()),
                factory,
                sink: None,
                max_line_bytes: config.protocol.max_line_bytes,
                max_step_count: config.protocol.max_step_count,
            },
            shutdown_grace: config.shutdown_grace(),
        })
    }

    /// Forward every connection's samples to `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn SampleSink>) -> Self {
        self.shared.sink = Some(sink);
        self
    }

    /// The address actually bound, with the real port when `0` was asked.
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The registry of live sessions.
    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.shared.registry)
    }

    /// Serve until the process is terminated.
    ///
    /// # Errors
    ///
    /// See [`Server::serve_until`].
    pub async fn serve(self) -> Result<(), ServerError> {
        self.serve_until(std::future::pending()).await
    }

    /// Accept connections until `shutdown` completes, then wait up to the
    /// configured grace period for open connections and abort the rest.
    ///
    /// Failed accepts are logged and skipped.
    pub async fn serve_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let Self {
            listener,
            local_addr,
            shared,
            shutdown_grace,
        } = self;
        info!(addr = %local_addr, "Simlink server listening");

        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        connections.spawn(run_connection(stream, peer, shared.clone()));
                    }
                    Err(e) => warn!(error = %e, "Accept failed"),
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "Connection task failed");
                    }
                }
            }
        }

        drop(listener);
        info!(open = connections.len(), "Shutting down, draining connections");

        let drain = async { while connections.join_next().await.is_some() {} };
        if tokio::time::timeout(shutdown_grace, drain).await.is_err() {
            warn!(
                open = connections.len(),
                grace_ms = shutdown_grace.as_millis(),
                "Grace period elapsed, aborting connections"
            );
            connections.shutdown().await;
        }

        info!("Simlink server stopped");
        Ok(())
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr)
            .field("sessions", &self.shared.registry.len())
            .field("max_line_bytes", &self.shared.max_line_bytes)
            .field("max_step_count", &self.shared.max_step_count)
            .field("shutdown_grace", &self.shutdown_grace)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Connection task
// ---------------------------------------------------------------------------

/// Result of reading one request line.
#[derive(Debug, PartialEq, Eq)]
enum LineRead {
    /// A line (without its terminator) is in the buffer.
    Line,
    /// The peer closed the stream.
    Eof,
    /// The line exceeded the limit; the stream can no longer be framed.
    TooLong,
}

async fn run_connection(stream: TcpStream, peer: SocketAddr, shared: Shared) {
    let id = ConnectionId(peer);
    if let Err(e) = stream.set_nodelay(true) {
        debug!(connection = %id, error = %e, "Could not disable Nagle");
    }
    info!(connection = %id, "Client connected");

    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut dispatcher = Dispatcher::new(id, shared.registry, shared.factory, shared.sink)
        .with_max_step_count(shared.max_step_count);
    let mut buf = Vec::new();

    let reason = loop {
        buf.clear();
        let outcome = match read_line(&mut reader, &mut buf, shared.max_line_bytes).await {
            Ok(LineRead::Line) => match std::str::from_utf8(&buf) {
                Ok(line) => off_worker(|| dispatcher.handle_line(line)),
                Err(e) => dispatcher.reject(format!("request is not valid UTF-8: {e}")),
            },
            Ok(LineRead::Eof) => break "end of stream",
            Ok(LineRead::TooLong) => dispatcher.reject(format!(
                "request line exceeds {} bytes",
                shared.max_line_bytes
            )),
            Err(e) => {
                warn!(connection = %id, error = %e, "Read failed");
                break "read error";
            }
        };

        match outcome {
            Outcome::Silent => {}
            Outcome::Reply(response) => {
                if let Err(e) = write_response(&mut write_half, &response).await {
                    warn!(connection = %id, error = %e, "Write failed");
                    break "write error";
                }
            }
            Outcome::Close(response) => {
                if let Err(e) = write_response(&mut write_half, &response).await {
                    debug!(connection = %id, error = %e, "Final error line not delivered");
                }
                if let Err(e) = write_half.shutdown().await {
                    debug!(connection = %id, error = %e, "Shutdown after final error line failed");
                }
                break "protocol error";
            }
        }
    };

    dispatcher.finish(reason);
}

/// Run one request's synchronous work without pinning a runtime worker.
///
/// A current-thread runtime has no other worker to hand tasks to, so
/// there the work runs inline.
fn off_worker<T>(work: impl FnOnce() -> T) -> T {
    let flavor = Handle::try_current().map(|handle| handle.runtime_flavor());
    if matches!(flavor, Ok(RuntimeFlavor::MultiThread)) {
        tokio::task::block_in_place(work)
    } else {
        work()
    }
}

/// Read one line of at most `max` bytes into `buf`.
///
/// The `\n` or `\r\n` terminator is stripped and does not count towards
/// `max`. A final line without terminator is returned as a line.
async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>, max: usize) -> io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    let limit = u64::try_from(max).unwrap_or(u64::MAX).saturating_add(2);
    let read = (&mut *reader).take(limit).read_until(b'\n', buf).await?;
    if read == 0 {
        return Ok(LineRead::Eof);
    }

    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    if buf.len() > max {
        Ok(LineRead::TooLong)
    } else {
        Ok(LineRead::Line)
    }
}

async fn write_response<W>(writer: &mut W, response: &Response) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = response.to_line().map_err(io::Error::other)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn lines_of(input: &[u8], max: usize) -> Vec<(LineRead, Vec<u8>)> {
        let mut reader = BufReader::new(input);
        let mut out = Vec::new();
        loop {
            let mut buf = Vec::new();
            match read_line(&mut reader, &mut buf, max).await {
                Ok(LineRead::Eof) => break,
                Ok(LineRead::TooLong) => {
                    out.push((LineRead::TooLong, buf));
                    break;
                }
                Ok(read) => out.push((read, buf)),
                Err(e) => panic!("Expected in-memory read to succeed, got {e}"),
            }
        }
        out
    }

    #[tokio::test]
    async fn splits_lines_and_strips_terminators() {
        let lines = lines_of(b"one\r\ntwo\nthree", 16).await;
        let texts: Vec<&[u8]> = lines.iter().map(|(_, b)| b.as_slice()).collect();
        assert_eq!(texts, vec![&b"one"[..], &b"two"[..], &b"three"[..]]);
        assert!(lines.iter().all(|(r, _)| *r == LineRead::Line));
    }

    #[tokio::test]
    async fn line_at_limit_is_accepted() {
        let lines = lines_of(b"abcd\nabcde\n", 4).await;
        assert_eq!(lines.len(), 2);
        assert!(matches!(lines.first(), Some((LineRead::Line, b)) if b == b"abcd"));
        assert!(matches!(lines.get(1), Some((LineRead::TooLong, _))));
    }

    #[tokio::test]
    async fn limit_excludes_either_terminator() {
        let lines = lines_of(b"abcd\r\nabcd\nabcd", 4).await;
        let texts: Vec<&[u8]> = lines.iter().map(|(_, b)| b.as_slice()).collect();
        assert_eq!(texts, vec![&b"abcd"[..], &b"abcd"[..], &b"abcd"[..]]);
        assert!(lines.iter().all(|(r, _)| *r == LineRead::Line));

        let unterminated = lines_of(b"abcdef", 4).await;
        assert!(matches!(unterminated.first(), Some((LineRead::TooLong, _))));
        let crlf_over = lines_of(b"abcde\r\n", 4).await;
        assert!(matches!(crlf_over.first(), Some((LineRead::TooLong, _))));
    }

    #[test]
    fn off_worker_runs_inline_without_a_runtime() {
        assert_eq!(off_worker(|| 7), 7);
    }

    #[tokio::test]
    async fn off_worker_runs_inline_on_current_thread() {
        assert_eq!(off_worker(|| "inline"), "inline");
    }

    #[tokio::test]
    async fn response_lines_are_newline_terminated() {
        let mut out: Vec<u8> = Vec::new();
        let result = write_response(&mut out, &Response::error("boom")).await;
        assert!(result.is_ok());
        assert_eq!(out, b"{\"error\":\"boom\"}\n".to_vec());
    }
}
