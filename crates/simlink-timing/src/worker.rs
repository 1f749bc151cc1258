//! Named background thread with a bounded join.
//!
//! `std::thread::JoinHandle::join` waits forever. Background loops here
//! must be released within a fixed window on shutdown, so the worker
//! signals completion over a channel and the join waits on that channel
//! with a timeout first.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

/// A background thread that can be joined with a deadline.
#[derive(Debug)]
pub struct Worker {
    name: String,
    handle: Option<JoinHandle<()>>,
    done: mpsc::Receiver<()>,
}

impl Worker {
    /// Spawn `body` on a new thread called `name`.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the thread cannot be created.
    pub fn spawn<F>(name: &str, body: F) -> std::io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let (done_tx, done_rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                body();
                // The receiver may already be gone if the owner gave up.
                let _ = done_tx.send(());
            })?;

        Ok(Self {
            name: name.to_owned(),
            handle: Some(handle),
            done: done_rx,
        })
    }

    /// Thread name given at spawn time.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the thread body has returned (or the thread was already joined).
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Wait up to `timeout` for the thread to finish, then join it.
    ///
    /// Returns `true` when the thread has been joined, now or by an
    /// earlier call. On timeout the thread is detached and `false` is
    /// returned; later calls return `true` without waiting.
    pub fn join_timeout(&mut self, timeout: Duration) -> bool {
        let Some(handle) = self.handle.take() else {
            return true;
        };

        match self.done.recv_timeout(timeout) {
            // A disconnect without a message means the body panicked.
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if handle.join().is_err() {
                    warn!(thread = %self.name, "background thread panicked");
                } else {
                    debug!(thread = %self.name, "background thread joined");
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    thread = %self.name,
                    timeout_ms = timeout.as_millis(),
                    "background thread did not finish in time, detaching"
                );
                false
            }
        }
    }
}
