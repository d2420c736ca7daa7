//! In-memory control transport for testing collectors without a daemon.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::collector::transport::{ControlTransport, TransportError};

#[derive(Debug, Clone)]
enum Reply {
    Response(String),
    Failure(String),
}

impl Reply {
    fn into_result(self) -> Result<String, TransportError> {
        match self {
            Reply::Response(body) => Ok(body),
            Reply::Failure(message) => Err(TransportError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                message,
            ))),
        }
    }
}

/// Scripted transport.
///
/// Queued replies are handed out first, in order; once the queue is empty
/// every command gets the fallback reply.
#[derive(Debug)]
pub struct MockTransport {
    queue: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    commands: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl MockTransport {
    fn with_fallback(fallback: Reply) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            fallback,
            commands: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Answers every command with `body`.
    pub fn responding(body: impl Into<String>) -> Self {
        Self::with_fallback(Reply::Response(body.into()))
    }

    /// Fails every command with a connection error.
    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_fallback(Reply::Failure(message.into()))
    }

    /// Queues a one-off successful reply.
    pub fn push_response(&self, body: impl Into<String>) -> &Self {
        lock(&self.queue).push_back(Reply::Response(body.into()));
        self
    }

    /// Queues a one-off failure.
    pub fn push_failure(&self, message: impl Into<String>) -> &Self {
        lock(&self.queue).push_back(Reply::Failure(message.into()));
        self
    }

    /// Number of commands sent so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Commands sent so far, oldest first.
    pub fn commands(&self) -> Vec<String> {
        lock(&self.commands).clone()
    }
}

impl ControlTransport for MockTransport {
    fn command(&self, command: &str) -> Result<String, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.commands).push(command.to_string());
        let reply = lock(&self.queue)
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        reply.into_result()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
