//! Error types for the session layer

use thiserror::Error;

use crate::transport::TransportError;

/// Errors surfaced by `SessionManager` commands
///
/// I/O failures of the units never appear here; they become state
/// transitions and listener notifications instead. The write path is the one
/// exception, and it carries the failure as text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Session is faulted; recreate the manager")]
    Faulted,

    #[error("Acceptor unavailable: {0}")]
    AcceptorUnavailable(String),

    #[error("Peer identifier must not be empty")]
    InvalidPeer,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Failed to spawn unit thread: {0}")]
    Spawn(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}
