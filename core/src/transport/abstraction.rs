//! Transport abstraction layer for Linkwire
//!
//! Defines the collaborator contract the session manager needs from a
//! platform: an acceptor for inbound streams, a dialable target per peer and
//! the duplex stream itself. Every blocking call (`accept`, `connect`, `read`)
//! must be interruptible by closing the resource from another thread; that is
//! the only cancellation mechanism the session layer uses.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::io;
use std::sync::Arc;
use thiserror::Error;

use crate::peer::PeerId;

/// Opaque duplex byte stream
///
/// All methods take `&self` so that `close` can be called from the session
/// manager while a reader thread is blocked in `read`.
pub trait Stream: Send + Sync {
    /// Blocking read of up to `buf.len()` bytes. `Ok(0)` means end of stream.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Blocking write of the whole buffer
    fn write_all(&self, buf: &[u8]) -> io::Result<()>;

    /// Close both directions; unblocks a pending `read`
    fn close(&self) -> io::Result<()>;

    /// Identity of the remote end
    fn remote_peer(&self) -> PeerId;
}

/// Long-lived listening endpoint
pub trait Acceptor: Send + Sync {
    /// Block until the next inbound stream arrives, or fail once closed
    fn accept(&self) -> io::Result<Arc<dyn Stream>>;

    /// Close the acceptor; a blocked `accept` must return an error
    fn close(&self) -> io::Result<()>;
}

/// Outbound connection target for a single peer
pub trait Target: Send + Sync {
    /// Blocking connect attempt
    fn connect(&self) -> io::Result<Arc<dyn Stream>>;

    /// Abort an in-flight (or future) connect attempt
    fn close(&self) -> io::Result<()>;
}

/// Platform transport: discovery, listening and dialing
pub trait Transport: Send + Sync {
    /// Whether the underlying radio/stack exists at all
    fn is_available(&self) -> bool;

    /// Peers the platform currently considers reachable (bonded/known)
    fn discoverable_peers(&self) -> Result<BTreeSet<PeerId>, TransportError>;

    /// Open a listening acceptor advertised under `service_name`
    fn bind(&self, service_name: &str) -> Result<Arc<dyn Acceptor>, TransportError>;

    /// Resolve a peer identifier into a connectable target
    fn target(&self, peer: &PeerId) -> Result<Arc<dyn Target>, TransportError>;

    /// Stop any in-progress device discovery before a connect attempt
    fn cancel_discovery(&self) {}

    /// Short human-readable transport name for logs
    fn name(&self) -> &str;
}

/// Errors raised by transport implementations
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum TransportError {
    #[error("Transport not available")]
    Unavailable,

    #[error("Bind failed: {0}")]
    BindFailed(String),

    #[error("Peer not resolvable: {0}")]
    Unresolvable(String),

    #[error("Transport I/O error: {0}")]
    Io(String),
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// Which kind of unit raised an I/O condition; used in log fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Endpoint {
    Acceptor,
    Target,
    Stream,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Acceptor => write!(f, "acceptor"),
            Endpoint::Target => write!(f, "target"),
            Endpoint::Stream => write!(f, "stream"),
        }
    }
}

/// Close a transport resource, logging instead of propagating failures
pub(crate) fn close_quietly(endpoint: Endpoint, result: io::Result<()>) {
    if let Err(err) = result {
        tracing::debug!(%endpoint, error = %err, "close() failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        let error = TransportError::Unresolvable("nowhere".to_string());
        assert!(error.to_string().contains("not resolvable"));
        assert_eq!(TransportError::Unavailable.to_string(), "Transport not available");
    }

    #[test]
    fn test_transport_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let err: TransportError = io_err.into();
        assert!(matches!(err, TransportError::Io(ref msg) if msg.contains("refused")));
    }

    #[test]
    fn test_transport_error_clone() {
        let err1 = TransportError::BindFailed("in use".to_string());
        let err2 = err1.clone();
        assert_eq!(err1, err2);
    }

    #[test]
    fn test_endpoint_display() {
        assert_eq!(Endpoint::Acceptor.to_string(), "acceptor");
        assert_eq!(Endpoint::Target.to_string(), "target");
        assert_eq!(Endpoint::Stream.to_string(), "stream");
    }
}
