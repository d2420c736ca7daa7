//! Abstraction over the daemon control channel.
//!
//! The `ControlTransport` trait lets the collector run against the real
//! control socket or against an in-memory mock in tests.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Failure to obtain a response for one command. Recoverable per scrape.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid control address '{0}'")]
    InvalidAddress(String),
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to read {what} {path}: {source}")]
    Credentials {
        what: &'static str,
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("TLS setup failed: {0}")]
    Tls(#[from] native_tls::Error),
    #[error("TLS handshake with {endpoint} failed: {message}")]
    Handshake { endpoint: String, message: String },
    #[error("control channel timed out after {0:?}")]
    Timeout(Duration),
    #[error("control channel I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("empty response to '{0}'")]
    EmptyResponse(String),
    #[error("daemon rejected '{command}': {message}")]
    Rejected { command: String, message: String },
}

/// Sends one control command and returns the complete response text.
///
/// Implementations must bound the call in time; a hung daemon must surface
/// as an error rather than block the caller forever.
pub trait ControlTransport: Send + Sync {
    fn command(&self, command: &str) -> Result<String, TransportError>;
}

impl<T: ControlTransport + ?Sized> ControlTransport for Arc<T> {
    fn command(&self, command: &str) -> Result<String, TransportError> {
        (**self).command(command)
    }
}

impl<T: ControlTransport + ?Sized> ControlTransport for Box<T> {
    fn command(&self, command: &str) -> Result<String, TransportError> {
        (**self).command(command)
    }
}
