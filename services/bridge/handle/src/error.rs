//! Socket error types shared by every bridge layer.

use thiserror::Error;

/// Socket errors
///
/// Validation errors are returned synchronously and never touch the handle.
/// Transport, handshake and protocol errors are delivered through the owning
/// socket's event channel and always precede its close event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SocketError {
    /// Bad argument (port, offset, length, state precondition)
    #[error("validation failed: {0}")]
    Validation(String),

    /// Operation issued against a closed or destroyed socket
    #[error("socket is closed")]
    Closed,

    /// Socket has no live handle
    #[error("not running")]
    NotRunning,

    /// Error reported by the underlying primitive
    #[error("transport error: {0}")]
    Transport(String),

    /// TLS handshake failed
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Peer or caller broke the stream protocol (write after FIN, etc.)
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Operation the bridge does not implement
    #[error("not supported: {0}")]
    Unsupported(&'static str),
}

impl SocketError {
    /// Shorthand for a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        SocketError::Validation(msg.into())
    }

    /// Whether this error came from a synchronous argument check.
    pub fn is_validation(&self) -> bool {
        matches!(self, SocketError::Validation(_))
    }
}

/// Result alias used across the bridge crates
pub type Result<T, E = SocketError> = std::result::Result<T, E>;
