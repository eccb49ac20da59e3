//! Peer identity
//!
//! A peer identifier is an opaque string the transport knows how to turn into
//! a connectable target (a socket address for TCP, a registered name for the
//! in-memory transport). The only validation applied here is non-emptiness.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use crate::session::SessionError;

/// Opaque, non-empty identifier of a remote endpoint
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId(String);

impl PeerId {
    /// Create a peer identifier, rejecting empty (or all-whitespace) input
    pub fn new(id: impl Into<String>) -> Result<Self, SessionError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(SessionError::InvalidPeer);
        }
        Ok(Self(id))
    }

    /// Build an identifier from a compile-time constant known to be non-empty
    pub(crate) fn from_static(id: &'static str) -> Self {
        debug_assert!(!id.trim().is_empty());
        Self(id.to_string())
    }

    /// Borrow the raw identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PeerId {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for PeerId {
    type Error = SessionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PeerId> for String {
    fn from(peer: PeerId) -> Self {
        peer.0
    }
}

impl From<SocketAddr> for PeerId {
    fn from(addr: SocketAddr) -> Self {
        Self(addr.to_string())
    }
}

impl AsRef<str> for PeerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_rejects_empty() {
        assert!(matches!(PeerId::new(""), Err(SessionError::InvalidPeer)));
        assert!(matches!(PeerId::new("   "), Err(SessionError::InvalidPeer)));
    }

    #[test]
    fn test_peer_id_display_and_parse() {
        let peer: PeerId = "00:11:22:33:44:55".parse().expect("valid peer");
        assert_eq!(peer.to_string(), "00:11:22:33:44:55");
        assert_eq!(peer.as_str(), "00:11:22:33:44:55");
    }

    #[test]
    fn test_peer_id_serde_validates() {
        let peer = PeerId::new("peerX").expect("valid peer");
        let json = serde_json::to_string(&peer).expect("serialize");
        assert_eq!(json, "\"peerX\"");

        let back: PeerId = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, peer);

        let empty: Result<PeerId, _> = serde_json::from_str("\"\"");
        assert!(empty.is_err());
    }
}
