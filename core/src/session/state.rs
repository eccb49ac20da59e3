//! Session state machine values

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::peer::PeerId;

/// Current state of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// Nothing running; initial state and the result of `stop()`
    Idle,
    /// Acceptor running, waiting for an inbound stream
    Listening,
    /// Outbound connect in flight (the acceptor keeps running)
    Connecting,
    /// A duplex worker owns the active stream
    Connected,
    /// The platform transport is unusable; permanent for this manager
    Faulted,
}

impl SessionState {
    /// Whether `write` reaches the stream in this state
    pub fn is_connected(&self) -> bool {
        *self == SessionState::Connected
    }

    /// Whether an accepted inbound stream is promoted in this state
    pub fn accepts_inbound(&self) -> bool {
        matches!(self, SessionState::Listening | SessionState::Connecting)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Listening => write!(f, "Listening"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Faulted => write!(f, "Faulted"),
        }
    }
}

/// Point-in-time view of the manager, taken under its lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub listener_active: bool,
    pub dialer_active: bool,
    pub worker_active: bool,
    /// Peer behind the active worker, if any
    pub peer: Option<PeerId>,
    /// Generation of the most recently created unit
    pub generation: u64,
}

impl SessionSnapshot {
    /// Number of live unit handles
    pub fn live_units(&self) -> usize {
        [self.listener_active, self.dialer_active, self.worker_active]
            .iter()
            .filter(|active| **active)
            .count()
    }

    /// Check the handle/state coupling the manager maintains:
    /// a worker exists exactly while connected, a dialer exactly while
    /// connecting, and a listener exactly while inbound streams are accepted.
    pub fn is_consistent(&self) -> bool {
        self.worker_active == (self.state == SessionState::Connected)
            && self.dialer_active == (self.state == SessionState::Connecting)
            && self.listener_active == self.state.accepts_inbound()
            && self.peer.is_some() == self.worker_active
    }
}
