//! Shared helpers for the session integration tests

#![allow(dead_code)]

use linkwire_core::transport::{MemoryStream, MemoryTransport};
use linkwire_core::{
    PeerId, SessionConfig, SessionEvent, SessionListener, SessionManager, SessionState,
};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Generous upper bound for anything that crosses a thread boundary
pub const WAIT: Duration = Duration::from_secs(5);

/// Window used to assert that something does *not* happen
pub const QUIET: Duration = Duration::from_millis(150);

pub fn peer(name: &str) -> PeerId {
    PeerId::new(name).expect("valid peer id")
}

/// Listener that records every notification in delivery order
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<SessionEvent>>,
    changed: Condvar,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, event: SessionEvent) {
        self.events.lock().push(event);
        self.changed.notify_all();
    }

    pub fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// Block until `pred` holds for the recorded events or `timeout` passes
    pub fn wait_until<F>(&self, timeout: Duration, pred: F) -> bool
    where
        F: Fn(&[SessionEvent]) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut events = self.events.lock();
        loop {
            if pred(&events) {
                return true;
            }
            if self.changed.wait_until(&mut events, deadline).timed_out() {
                return pred(&events);
            }
        }
    }

    /// Wait until at least `n` events equal to `event` were recorded
    pub fn wait_for(&self, event: &SessionEvent, n: usize) -> bool {
        self.wait_until(WAIT, |events| {
            events.iter().filter(|e| *e == event).count() >= n
        })
    }

    pub fn count(&self, event: &SessionEvent) -> usize {
        self.events.lock().iter().filter(|e| *e == event).count()
    }

    pub fn count_connected(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, SessionEvent::Connected { .. }))
            .count()
    }

    /// Every byte delivered through `on_read`, concatenated
    pub fn read_bytes(&self) -> Vec<u8> {
        concat_reads(&self.events.lock())
    }

    /// Wait until the concatenated reads equal `expected`
    pub fn wait_for_reads(&self, expected: &[u8]) -> bool {
        self.wait_until(WAIT, |events| concat_reads(events) == expected)
    }

    /// The sequence of `new` states from state-change events
    pub fn states(&self) -> Vec<SessionState> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                SessionEvent::StateChanged { new, .. } => Some(*new),
                _ => None,
            })
            .collect()
    }
}

impl SessionListener for Recorder {
    fn on_state_changed(&self, old: SessionState, new: SessionState) {
        self.push(SessionEvent::StateChanged { old, new });
    }

    fn on_connected(&self, peer: &PeerId) {
        self.push(SessionEvent::Connected { peer: peer.clone() });
    }

    fn on_connection_failed(&self) {
        self.push(SessionEvent::ConnectionFailed);
    }

    fn on_connection_lost(&self) {
        self.push(SessionEvent::ConnectionLost);
    }

    fn on_read(&self, data: &[u8]) {
        self.push(SessionEvent::Read(data.to_vec()));
    }

    fn on_write(&self, data: &[u8]) {
        self.push(SessionEvent::Write(data.to_vec()));
    }
}

pub fn concat_reads(events: &[SessionEvent]) -> Vec<u8> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Read(data) => Some(data.as_slice()),
            _ => None,
        })
        .flatten()
        .copied()
        .collect()
}

pub fn state_changed(old: SessionState, new: SessionState) -> SessionEvent {
    SessionEvent::StateChanged { old, new }
}

/// Manager over an in-memory transport with a recording listener
pub struct Harness {
    pub transport: MemoryTransport,
    pub recorder: Arc<Recorder>,
    pub manager: SessionManager,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(SessionConfig::default())
    }

    pub fn with_config(config: SessionConfig) -> Self {
        Self::with_transport(MemoryTransport::new(), config)
    }

    pub fn with_transport(transport: MemoryTransport, config: SessionConfig) -> Self {
        let recorder = Recorder::new();
        let manager = SessionManager::new(Arc::new(transport.clone()), recorder.clone(), config)
            .expect("session manager");
        Self {
            transport,
            recorder,
            manager,
        }
    }

    /// Wait until the manager reports `state`
    pub fn wait_for_state(&self, state: SessionState) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if self.manager.state() == state {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        self.manager.state() == state
    }

    /// Wait until the transport has bound `n` acceptors in total
    pub fn wait_for_binds(&self, n: usize) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if self.transport.bind_count() >= n {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        self.transport.bind_count() >= n
    }

    /// Listen and have `remote` connect in; returns the remote end
    pub fn accept_from(&self, remote: &PeerId) -> MemoryStream {
        if self.manager.state() != SessionState::Listening {
            self.manager.listen().expect("listen");
        }
        let stream = self.transport.connect_inbound(remote).expect("inbound connect");
        assert!(
            self.recorder
                .wait_for(&SessionEvent::Connected { peer: remote.clone() }, 1),
            "inbound stream was not promoted"
        );
        stream
    }
}

/// Opt-in log output: `RUST_LOG=linkwire_core=debug cargo test`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
