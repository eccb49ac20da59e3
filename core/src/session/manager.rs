//! Session Manager — the single point of serialization
//!
//! All state transitions and all unit creation/cancellation happen while the
//! `shared` mutex is held. Listener notifications are queued under that lock
//! and delivered after it is released, through a re-entrant dispatch lock so
//! that delivery order matches transition order and callbacks may call back
//! into the manager. `write` only takes the lock long enough to grab the
//! current worker; the blocking write itself runs unlocked.

use parking_lot::{Mutex, ReentrantMutex};
use std::collections::{BTreeSet, VecDeque};
use std::io;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

use crate::peer::PeerId;
use crate::session::config::SessionConfig;
use crate::session::dialer::{self, DialerHandle};
use crate::session::error::SessionError;
use crate::session::events::{SessionEvent, SessionListener};
use crate::session::listener::{self, AcceptOutcome, ListenerHandle};
use crate::session::state::{SessionSnapshot, SessionState};
use crate::session::worker::{self, DuplexWorker};
use crate::transport::abstraction::{
    close_quietly, Endpoint, Stream, Target, Transport, TransportError,
};

/// Everything guarded by the session lock
struct Shared {
    state: SessionState,
    last_generation: u64,
    listener: Option<ListenerHandle>,
    dialer: Option<DialerHandle>,
    worker: Option<Arc<DuplexWorker>>,
    pending: VecDeque<SessionEvent>,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: SessionState::Idle,
            last_generation: 0,
            listener: None,
            dialer: None,
            worker: None,
            pending: VecDeque::new(),
        }
    }

    fn next_generation(&mut self) -> u64 {
        self.last_generation += 1;
        self.last_generation
    }

    fn set_state(&mut self, new: SessionState) {
        let old = self.state;
        if old == new {
            return;
        }
        info!(%old, %new, "session state changed");
        self.state = new;
        self.pending.push_back(SessionEvent::StateChanged { old, new });
    }

    fn cancel_listener(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.cancel();
        }
    }

    fn cancel_dialer(&mut self) {
        if let Some(dialer) = self.dialer.take() {
            dialer.cancel();
        }
    }

    fn cancel_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.cancel();
        }
    }

    fn cancel_all(&mut self) {
        self.cancel_dialer();
        self.cancel_worker();
        self.cancel_listener();
    }

    fn is_current_listener(&self, generation: u64) -> bool {
        self.listener.as_ref().map(|l| l.generation) == Some(generation)
    }

    fn is_current_dialer(&self, generation: u64) -> bool {
        self.dialer.as_ref().map(|d| d.generation) == Some(generation)
    }

    fn is_current_worker(&self, generation: u64) -> bool {
        self.worker.as_ref().map(|w| w.generation()) == Some(generation)
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            listener_active: self.listener.is_some(),
            dialer_active: self.dialer.is_some(),
            worker_active: self.worker.is_some(),
            peer: self.worker.as_ref().map(|w| w.peer().clone()),
            generation: self.last_generation,
        }
    }
}

/// State and collaborators shared between the manager and its unit threads
pub(crate) struct SessionCore {
    transport: Arc<dyn Transport>,
    delegate: Arc<dyn SessionListener>,
    config: SessionConfig,
    shared: Mutex<Shared>,
    dispatch: ReentrantMutex<()>,
}

impl SessionCore {
    pub(crate) fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    /// Deliver queued notifications in order. Must be called without the
    /// session lock held.
    fn dispatch(&self) {
        let _delivering = self.dispatch.lock();
        loop {
            let next = self.shared.lock().pending.pop_front();
            match next {
                Some(event) => {
                    trace!(%event, "delivering session event");
                    event.deliver_to(self.delegate.as_ref());
                }
                None => break,
            }
        }
    }

    // ------------------------------------------------------------------
    // Transition actions (session lock held)
    // ------------------------------------------------------------------

    fn ensure_listener(self: &Arc<Self>, shared: &mut Shared) -> Result<(), SessionError> {
        if shared.listener.is_some() {
            return Ok(());
        }
        let acceptor = self
            .transport
            .bind(&self.config.service_name)
            .map_err(|err| SessionError::AcceptorUnavailable(err.to_string()))?;
        let generation = shared.next_generation();
        let handle = listener::spawn(Arc::clone(self), generation, acceptor)?;
        debug!(generation, "listener unit created");
        shared.listener = Some(handle);
        Ok(())
    }

    fn fault(&self, shared: &mut Shared, err: &SessionError) {
        error!(error = %err, "session faulted");
        shared.cancel_all();
        shared.set_state(SessionState::Faulted);
    }

    /// The `-> Listening` edge: drop dialer and worker, make sure an acceptor
    /// is running. Failing to open the acceptor faults the session.
    fn enter_listening(self: &Arc<Self>, shared: &mut Shared) -> Result<(), SessionError> {
        shared.cancel_dialer();
        shared.cancel_worker();
        if let Err(err) = self.ensure_listener(shared) {
            self.fault(shared, &err);
            return Err(err);
        }
        shared.set_state(SessionState::Listening);
        Ok(())
    }

    /// Install `stream` as the one active connection
    fn promote(self: &Arc<Self>, shared: &mut Shared, stream: Arc<dyn Stream>, peer: PeerId) {
        shared.cancel_all();

        let generation = shared.next_generation();
        match worker::spawn(Arc::clone(self), generation, peer.clone(), stream) {
            Ok(worker) => {
                info!(%peer, generation, "connected");
                shared.worker = Some(worker);
                shared.pending.push_back(SessionEvent::Connected { peer });
                shared.set_state(SessionState::Connected);
            }
            Err(err) => {
                warn!(%peer, error = %err, "could not start worker; resuming listening");
                let _ = self.enter_listening(shared);
            }
        }
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    fn listen(self: &Arc<Self>) -> Result<(), SessionError> {
        let result = {
            let mut shared = self.shared.lock();
            if shared.state == SessionState::Faulted {
                Err(SessionError::Faulted)
            } else {
                info!("listen");
                self.enter_listening(&mut shared)
            }
        };
        self.dispatch();
        result
    }

    fn dial(self: &Arc<Self>, peer: &PeerId) -> Result<(), SessionError> {
        if self.shared.lock().state == SessionState::Faulted {
            return Err(SessionError::Faulted);
        }

        // Resolution may block (DNS); keep it outside the lock.
        let target = match self.transport.target(peer) {
            Ok(target) => target,
            Err(err) => {
                warn!(%peer, error = %err, "cannot resolve peer; dial ignored");
                return Ok(());
            }
        };

        let result = {
            let mut shared = self.shared.lock();
            self.start_dial(&mut shared, peer, target)
        };
        self.dispatch();
        result
    }

    fn start_dial(
        self: &Arc<Self>,
        shared: &mut Shared,
        peer: &PeerId,
        target: Arc<dyn Target>,
    ) -> Result<(), SessionError> {
        if shared.state == SessionState::Faulted {
            close_quietly(Endpoint::Target, target.close());
            return Err(SessionError::Faulted);
        }

        info!(%peer, "connect");
        shared.cancel_dialer();
        shared.cancel_worker();

        if let Err(err) = self.ensure_listener(shared) {
            close_quietly(Endpoint::Target, target.close());
            self.fault(shared, &err);
            return Err(err);
        }

        let generation = shared.next_generation();
        match dialer::spawn(Arc::clone(self), generation, peer.clone(), target) {
            Ok(handle) => {
                debug!(generation, %peer, "dialer unit created");
                shared.dialer = Some(handle);
                shared.set_state(SessionState::Connecting);
                Ok(())
            }
            Err(err) => {
                warn!(%peer, error = %err, "could not start dialer");
                let _ = self.enter_listening(shared);
                Err(err)
            }
        }
    }

    fn stop(&self) {
        {
            let mut shared = self.shared.lock();
            if shared.state == SessionState::Faulted {
                return;
            }
            info!("stop");
            shared.cancel_all();
            shared.set_state(SessionState::Idle);
        }
        self.dispatch();
    }

    fn write(self: &Arc<Self>, data: &[u8]) -> Result<(), SessionError> {
        let worker = {
            let shared = self.shared.lock();
            match (&shared.worker, shared.state.is_connected()) {
                (Some(worker), true) => Arc::clone(worker),
                _ => {
                    trace!(len = data.len(), "not connected; write dropped");
                    return Ok(());
                }
            }
        };

        match worker.write(data) {
            Ok(()) => {
                {
                    let mut shared = self.shared.lock();
                    if !shared.is_current_worker(worker.generation()) {
                        trace!(generation = worker.generation(), "write on a replaced worker");
                        return Ok(());
                    }
                    shared.pending.push_back(SessionEvent::Write(data.to_vec()));
                }
                self.dispatch();
                Ok(())
            }
            Err(err) => {
                warn!(peer = %worker.peer(), error = %err, "Exception during write");
                if self.config.end_session_on_write_failure {
                    self.connection_lost(worker.generation());
                }
                Err(SessionError::WriteFailed(err.to_string()))
            }
        }
    }

    // ------------------------------------------------------------------
    // Unit callbacks
    // ------------------------------------------------------------------

    pub(crate) fn inbound_accepted(
        self: &Arc<Self>,
        generation: u64,
        stream: Arc<dyn Stream>,
    ) -> AcceptOutcome {
        let outcome = {
            let mut shared = self.shared.lock();
            if !shared.is_current_listener(generation) {
                debug!(generation, "superseded listener; closing inbound stream");
                close_quietly(Endpoint::Stream, stream.close());
                AcceptOutcome::Stale
            } else if shared.state.accepts_inbound() {
                let peer = stream.remote_peer();
                info!(%peer, "inbound connection accepted");
                self.promote(&mut shared, stream, peer);
                AcceptOutcome::Promoted
            } else {
                debug!(state = %shared.state, "not accepting; closing unwanted stream");
                close_quietly(Endpoint::Stream, stream.close());
                AcceptOutcome::Rejected
            }
        };
        self.dispatch();
        outcome
    }

    /// A listener's loop ended on an error. A current listener is replaced
    /// with a fresh acceptor; if that cannot be bound the session faults.
    pub(crate) fn acceptor_failed(self: &Arc<Self>, generation: u64, err: &io::Error) {
        {
            let mut shared = self.shared.lock();
            if !shared.is_current_listener(generation) {
                debug!(generation, "listener cancelled");
                return;
            }
            warn!(generation, error = %err, "accept() failed; restarting listener");
            shared.cancel_listener();
            if shared.state.accepts_inbound() {
                if let Err(err) = self.ensure_listener(&mut shared) {
                    self.fault(&mut shared, &err);
                }
            }
        }
        self.dispatch();
    }

    pub(crate) fn dial_succeeded(
        self: &Arc<Self>,
        generation: u64,
        peer: PeerId,
        stream: Arc<dyn Stream>,
    ) {
        {
            let mut shared = self.shared.lock();
            if !shared.is_current_dialer(generation) {
                debug!(generation, %peer, "discarding stream from superseded dialer");
                close_quietly(Endpoint::Stream, stream.close());
                return;
            }
            // The target must not be closed here: for some transports that
            // would tear down the stream it just produced.
            shared.dialer = None;
            self.promote(&mut shared, stream, peer);
        }
        self.dispatch();
    }

    pub(crate) fn dial_failed(self: &Arc<Self>, generation: u64, err: &io::Error) {
        {
            let mut shared = self.shared.lock();
            if !shared.is_current_dialer(generation) {
                debug!(generation, error = %err, "cancelled dialer finished");
                return;
            }
            let peer = shared.dialer.take().map(|d| d.peer);
            warn!(generation, peer = ?peer, error = %err, "connection failed");
            let _ = self.enter_listening(&mut shared);
            shared.pending.push_back(SessionEvent::ConnectionFailed);
        }
        self.dispatch();
    }

    pub(crate) fn deliver_read(&self, generation: u64, data: &[u8]) -> bool {
        {
            let mut shared = self.shared.lock();
            if !shared.is_current_worker(generation) {
                return false;
            }
            shared.pending.push_back(SessionEvent::Read(data.to_vec()));
        }
        self.dispatch();
        true
    }

    pub(crate) fn connection_lost(self: &Arc<Self>, generation: u64) {
        {
            let mut shared = self.shared.lock();
            if !shared.is_current_worker(generation) {
                debug!(generation, "cancelled worker finished");
                return;
            }
            if let Some(worker) = shared.worker.take() {
                info!(peer = %worker.peer(), generation, "connection lost");
                worker.cancel();
            }
            let _ = self.enter_listening(&mut shared);
            shared.pending.push_back(SessionEvent::ConnectionLost);
        }
        self.dispatch();
    }
}

/// Manages one duplex session over a platform transport
///
/// ```rust
/// use linkwire_core::transport::{DialMode, MemoryTransport};
/// use linkwire_core::{EventChannel, PeerId, SessionConfig, SessionManager, SessionState};
/// use std::sync::Arc;
///
/// let transport = MemoryTransport::new();
/// let peer = PeerId::new("peerY").unwrap();
/// transport.add_peer(peer.clone(), DialMode::Refuse);
///
/// let (events, _rx) = EventChannel::new();
/// let manager = SessionManager::new(
///     Arc::new(transport.clone()),
///     Arc::new(events),
///     SessionConfig::default(),
/// )
/// .unwrap();
///
/// manager.listen().unwrap();
/// assert_eq!(manager.state(), SessionState::Listening);
/// manager.stop();
/// assert_eq!(manager.state(), SessionState::Idle);
/// ```
pub struct SessionManager {
    core: Arc<SessionCore>,
}

impl SessionManager {
    /// Create a manager. The session starts `Idle`, or `Faulted` when the
    /// transport reports itself unavailable.
    pub fn new(
        transport: Arc<dyn Transport>,
        delegate: Arc<dyn SessionListener>,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        config.validate()?;

        let available = transport.is_available();
        let core = Arc::new(SessionCore {
            transport,
            delegate,
            config,
            shared: Mutex::new(Shared::new()),
            dispatch: ReentrantMutex::new(()),
        });

        if !available {
            let mut shared = core.shared.lock();
            core.fault(&mut shared, &SessionError::from(TransportError::Unavailable));
        }
        core.dispatch();

        info!(transport = core.transport.name(), available, "session manager created");
        Ok(Self { core })
    }

    /// Alias of [`listen`](Self::listen)
    pub fn start(&self) -> Result<(), SessionError> {
        self.listen()
    }

    /// Cancel any dialer and worker, make sure the acceptor runs, and enter
    /// `Listening`. Idempotent.
    pub fn listen(&self) -> Result<(), SessionError> {
        self.core.listen()
    }

    /// Replace any in-flight dial and any active connection with a new
    /// outbound attempt to `peer`. Unresolvable peers are ignored.
    pub fn dial(&self, peer: &PeerId) -> Result<(), SessionError> {
        self.core.dial(peer)
    }

    /// Cancel every unit and return to `Idle`
    pub fn stop(&self) {
        self.core.stop()
    }

    /// Write to the active stream. A no-op unless `Connected`.
    pub fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        self.core.write(data)
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.core.shared.lock().state
    }

    /// Peer behind the active connection
    pub fn peer(&self) -> Option<PeerId> {
        self.core
            .shared
            .lock()
            .worker
            .as_ref()
            .map(|w| w.peer().clone())
    }

    /// State plus live unit handles, read atomically
    pub fn snapshot(&self) -> SessionSnapshot {
        self.core.shared.lock().snapshot()
    }

    /// Peers the platform reports as reachable
    pub fn discoverable_peers(&self) -> Result<BTreeSet<PeerId>, SessionError> {
        if self.state() == SessionState::Faulted {
            return Err(SessionError::Faulted);
        }
        Ok(self.core.transport.discoverable_peers()?)
    }

    /// Active configuration
    pub fn config(&self) -> &SessionConfig {
        &self.core.config
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.core.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::events::MockSessionListener;
    use crate::transport::memory::{DialMode, MemoryTransport};
    use mockall::predicate::eq;

    fn manager_with(transport: &MemoryTransport, listener: MockSessionListener) -> SessionManager {
        SessionManager::new(
            Arc::new(transport.clone()),
            Arc::new(listener),
            SessionConfig::default(),
        )
        .expect("manager")
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let result = SessionManager::new(
            Arc::new(MemoryTransport::new()),
            Arc::new(MockSessionListener::new()),
            SessionConfig::default().with_read_buffer_size(0),
        );
        assert!(matches!(result, Err(SessionError::InvalidConfig(_))));
    }

    #[test]
    fn test_write_while_idle_is_silent_noop() {
        // No expectations: any callback would panic on this thread.
        let manager = manager_with(&MemoryTransport::new(), MockSessionListener::new());

        assert_eq!(manager.write(&[0x72]), Ok(()));
        assert_eq!(manager.state(), SessionState::Idle);
        assert_eq!(manager.snapshot().live_units(), 0);
    }

    #[test]
    fn test_stop_when_idle_emits_nothing() {
        let manager = manager_with(&MemoryTransport::new(), MockSessionListener::new());
        manager.stop();
        manager.stop();
        assert_eq!(manager.state(), SessionState::Idle);
    }

    #[test]
    fn test_unresolvable_dial_is_noop() {
        let transport = MemoryTransport::new();
        let manager = manager_with(&transport, MockSessionListener::new());

        let unknown = PeerId::new("nobody").expect("peer");
        assert_eq!(manager.dial(&unknown), Ok(()));
        assert_eq!(manager.state(), SessionState::Idle);
        assert_eq!(transport.bind_count(), 0);
    }

    #[test]
    fn test_listen_is_idempotent() {
        let transport = MemoryTransport::new();
        let mut listener = MockSessionListener::new();
        listener
            .expect_on_state_changed()
            .with(eq(SessionState::Idle), eq(SessionState::Listening))
            .times(1)
            .return_const(());
        listener
            .expect_on_state_changed()
            .with(eq(SessionState::Listening), eq(SessionState::Idle))
            .times(1)
            .return_const(());

        let manager = manager_with(&transport, listener);
        manager.listen().expect("listen");
        manager.start().expect("listen again");

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.state, SessionState::Listening);
        assert!(snapshot.listener_active);
        assert!(snapshot.is_consistent());
        assert_eq!(transport.bind_count(), 1);
    }

    #[test]
    fn test_unavailable_transport_faults() {
        let transport = MemoryTransport::unavailable();
        let mut listener = MockSessionListener::new();
        listener
            .expect_on_state_changed()
            .with(eq(SessionState::Idle), eq(SessionState::Faulted))
            .times(1)
            .return_const(());

        let manager = manager_with(&transport, listener);
        assert_eq!(manager.state(), SessionState::Faulted);
        assert_eq!(manager.listen(), Err(SessionError::Faulted));
        assert_eq!(
            manager.dial(&PeerId::new("peer").expect("peer")),
            Err(SessionError::Faulted)
        );
        assert_eq!(manager.discoverable_peers(), Err(SessionError::Faulted));

        manager.stop();
        assert_eq!(manager.state(), SessionState::Faulted);
    }

    #[test]
    fn test_bind_failure_faults() {
        let transport = MemoryTransport::new();
        transport.set_fail_bind(true);
        let mut listener = MockSessionListener::new();
        listener
            .expect_on_state_changed()
            .with(eq(SessionState::Idle), eq(SessionState::Faulted))
            .times(1)
            .return_const(());

        let manager = manager_with(&transport, listener);
        let result = manager.listen();
        assert!(matches!(result, Err(SessionError::AcceptorUnavailable(_))));
        assert_eq!(manager.state(), SessionState::Faulted);
        assert_eq!(manager.snapshot().live_units(), 0);
    }

    #[test]
    fn test_discoverable_peers_delegates_to_transport() {
        let transport = MemoryTransport::new();
        let peer = PeerId::new("00:11:22:33:44:55").expect("peer");
        transport.add_peer(peer.clone(), DialMode::Accept);

        let manager = manager_with(&transport, MockSessionListener::new());
        let peers = manager.discoverable_peers().expect("peers");
        assert_eq!(peers.into_iter().collect::<Vec<_>>(), vec![peer]);
    }
}
