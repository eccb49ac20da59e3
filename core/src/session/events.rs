//! Session notifications
//!
//! Consumers register a [`SessionListener`]. Internally every notification is
//! first captured as a [`SessionEvent`] while the manager's lock is held and
//! delivered afterwards, in the order the transitions happened.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

use crate::peer::PeerId;
use crate::session::state::SessionState;

/// Callback interface for session events
///
/// Callbacks run on whichever unit thread (or caller thread) triggered them.
/// They may call back into the `SessionManager`.
#[cfg_attr(test, mockall::automock)]
pub trait SessionListener: Send + Sync {
    /// The session state changed from `old` to `new`
    fn on_state_changed(&self, old: SessionState, new: SessionState);
    /// A stream to `peer` was promoted to the active connection
    fn on_connected(&self, peer: &PeerId);
    /// An outbound dial failed; the session is listening again
    fn on_connection_failed(&self);
    /// The active stream failed; the session is listening again
    fn on_connection_lost(&self);
    /// Bytes arrived on the active stream
    fn on_read(&self, data: &[u8]);
    /// Bytes were written to the active stream
    fn on_write(&self, data: &[u8]);
}

/// Owned form of a listener notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEvent {
    StateChanged { old: SessionState, new: SessionState },
    Connected { peer: PeerId },
    ConnectionFailed,
    ConnectionLost,
    Read(Vec<u8>),
    Write(Vec<u8>),
}

impl SessionEvent {
    /// Invoke the matching listener callback
    pub fn deliver_to(&self, listener: &dyn SessionListener) {
        match self {
            SessionEvent::StateChanged { old, new } => listener.on_state_changed(*old, *new),
            SessionEvent::Connected { peer } => listener.on_connected(peer),
            SessionEvent::ConnectionFailed => listener.on_connection_failed(),
            SessionEvent::ConnectionLost => listener.on_connection_lost(),
            SessionEvent::Read(data) => listener.on_read(data),
            SessionEvent::Write(data) => listener.on_write(data),
        }
    }
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEvent::StateChanged { old, new } => {
                write!(f, "StateChanged {{ old: {}, new: {} }}", old, new)
            }
            SessionEvent::Connected { peer } => write!(f, "Connected {{ peer: {} }}", peer),
            SessionEvent::ConnectionFailed => write!(f, "ConnectionFailed"),
            SessionEvent::ConnectionLost => write!(f, "ConnectionLost"),
            SessionEvent::Read(data) => write!(f, "Read {{ len: {} }}", data.len()),
            SessionEvent::Write(data) => write!(f, "Write {{ len: {} }}", data.len()),
        }
    }
}

/// Listener that forwards every notification into a tokio channel
///
/// Lets async consumers `recv().await` session events; sending never blocks
/// the unit threads.
pub struct EventChannel {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventChannel {
    /// Create the listener and the receiving half
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: SessionEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("event receiver dropped");
        }
    }
}

impl SessionListener for EventChannel {
    fn on_state_changed(&self, old: SessionState, new: SessionState) {
        self.forward(SessionEvent::StateChanged { old, new });
    }

    fn on_connected(&self, peer: &PeerId) {
        self.forward(SessionEvent::Connected { peer: peer.clone() });
    }

    fn on_connection_failed(&self) {
        self.forward(SessionEvent::ConnectionFailed);
    }

    fn on_connection_lost(&self) {
        self.forward(SessionEvent::ConnectionLost);
    }

    fn on_read(&self, data: &[u8]) {
        self.forward(SessionEvent::Read(data.to_vec()));
    }

    fn on_write(&self, data: &[u8]) {
        self.forward(SessionEvent::Write(data.to_vec()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_channel_round_trips_every_kind() {
        let (channel, mut rx) = EventChannel::new();
        let peer = PeerId::new("peerX").expect("valid peer");
        let events = vec![
            SessionEvent::StateChanged {
                old: SessionState::Idle,
                new: SessionState::Listening,
            },
            SessionEvent::Connected { peer },
            SessionEvent::ConnectionFailed,
            SessionEvent::ConnectionLost,
            SessionEvent::Read(vec![1, 2, 3]),
            SessionEvent::Write(vec![0x72]),
        ];

        for event in &events {
            event.deliver_to(&channel);
        }

        for expected in events {
            assert_eq!(rx.try_recv().expect("event forwarded"), expected);
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_event_channel_survives_dropped_receiver() {
        let (channel, rx) = EventChannel::new();
        drop(rx);
        channel.on_connection_lost();
    }

    #[test]
    fn test_event_display() {
        let event = SessionEvent::StateChanged {
            old: SessionState::Connected,
            new: SessionState::Listening,
        };
        assert_eq!(
            event.to_string(),
            "StateChanged { old: Connected, new: Listening }"
        );
        assert_eq!(SessionEvent::Read(vec![0; 5]).to_string(), "Read { len: 5 }");
    }

    #[test]
    fn test_deliver_to_mock() {
        let mut listener = MockSessionListener::new();
        listener
            .expect_on_write()
            .withf(|data: &[u8]| data == &[0x72u8][..])
            .times(1)
            .return_const(());

        SessionEvent::Write(vec![0x72]).deliver_to(&listener);
    }
}
