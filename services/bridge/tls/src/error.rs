//! TLS setup error types.

use bridge_handle::SocketError;
use thiserror::Error;

/// Errors creating TLS contexts, sessions or sockets
#[derive(Error, Debug)]
pub enum TlsError {
    /// Invalid configuration (certificates, keys, server name)
    #[error("tls config error: {0}")]
    Config(String),

    /// Engine refused to create a session
    #[error("tls engine error: {0}")]
    Engine(String),

    /// Underlying socket error
    #[error(transparent)]
    Socket(#[from] SocketError),
}
