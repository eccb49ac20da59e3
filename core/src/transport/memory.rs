//! In-process transport
//!
//! Streams are pairs of byte pipes. The transport records every dial and
//! bind, and lets a driver (tests, the CLI demo) script how each peer answers
//! a dial: accept immediately, refuse, or hold the attempt until
//! `complete_dial` is called. Held dials may ignore cancellation, which makes
//! it possible to deliver a connect success after the dialer was superseded.

use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::peer::PeerId;
use crate::transport::abstraction::{Acceptor, Stream, Target, Transport, TransportError};

/// Identity the remote end of a memory stream reports for our side
pub const LOCAL_PEER: &str = "memory-local";

/// How a registered peer answers an outbound dial
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialMode {
    /// Connect succeeds at once
    Accept,
    /// Connect fails with `ConnectionRefused`
    Refuse,
    /// Connect blocks until `complete_dial`; with `honor_cancel` a `close()`
    /// on the target aborts the wait
    Manual { honor_cancel: bool },
}

#[derive(Default)]
struct PipeState {
    data: VecDeque<u8>,
    closed: bool,
    reject_writes: bool,
    stall_writes: bool,
    stalled_writers: usize,
}

#[derive(Default)]
struct Pipe {
    state: Mutex<PipeState>,
    ready: Condvar,
}

impl Pipe {
    fn push(&self, buf: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "stream closed"));
        }
        if state.reject_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "writes rejected"));
        }
        state.data.extend(buf.iter().copied());
        self.ready.notify_all();

        // Data is already delivered; only the writer's return is held back.
        if state.stall_writes {
            state.stalled_writers += 1;
            while state.stall_writes {
                self.ready.wait(&mut state);
            }
            state.stalled_writers -= 1;
        }
        Ok(())
    }

    fn set_stall(&self, stall: bool) {
        self.state.lock().stall_writes = stall;
        self.ready.notify_all();
    }

    fn pull(&self, buf: &mut [u8], deadline: Option<Instant>) -> io::Result<usize> {
        let mut state = self.state.lock();
        loop {
            if !state.data.is_empty() {
                let n = buf.len().min(state.data.len());
                for (slot, byte) in buf.iter_mut().zip(state.data.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
            if state.closed {
                return Ok(0);
            }
            match deadline {
                None => self.ready.wait(&mut state),
                Some(deadline) => {
                    if self.ready.wait_until(&mut state, deadline).timed_out()
                        && state.data.is_empty()
                        && !state.closed
                    {
                        return Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"));
                    }
                }
            }
        }
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.ready.notify_all();
    }
}

/// One end of an in-memory duplex stream
pub struct MemoryStream {
    peer: PeerId,
    incoming: Arc<Pipe>,
    outgoing: Arc<Pipe>,
}

impl MemoryStream {
    /// Create a connected pair. The first end reports `first_sees` as its
    /// remote peer, the second end reports `second_sees`.
    pub fn pair(first_sees: PeerId, second_sees: PeerId) -> (MemoryStream, MemoryStream) {
        let a_to_b = Arc::new(Pipe::default());
        let b_to_a = Arc::new(Pipe::default());
        let first = MemoryStream {
            peer: first_sees,
            incoming: Arc::clone(&b_to_a),
            outgoing: Arc::clone(&a_to_b),
        };
        let second = MemoryStream {
            peer: second_sees,
            incoming: a_to_b,
            outgoing: b_to_a,
        };
        (first, second)
    }

    /// Read with an upper bound on the wait
    pub fn read_timeout(&self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        self.incoming.pull(buf, Some(Instant::now() + timeout))
    }

    /// Read whatever arrives within `timeout` (up to 64 KiB)
    pub fn recv(&self, timeout: Duration) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; 64 * 1024];
        let n = self.read_timeout(&mut buf, timeout)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Make the other end's writes towards us fail while reads keep working
    pub fn reject_writes_from_peer(&self) {
        self.incoming.state.lock().reject_writes = true;
    }

    /// Accept the other end's writes but hold each writer until
    /// `release_writes_from_peer`
    pub fn stall_writes_from_peer(&self) {
        self.incoming.set_stall(true);
    }

    /// Let stalled writers return
    pub fn release_writes_from_peer(&self) {
        self.incoming.set_stall(false);
    }

    /// Number of the other end's writers currently held
    pub fn stalled_writes(&self) -> usize {
        self.incoming.state.lock().stalled_writers
    }

    /// Whether either direction has been closed
    pub fn is_closed(&self) -> bool {
        self.incoming.state.lock().closed || self.outgoing.state.lock().closed
    }
}

impl Stream for MemoryStream {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.incoming.pull(buf, None)
    }

    fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        self.outgoing.push(buf)
    }

    fn close(&self) -> io::Result<()> {
        self.incoming.close();
        self.outgoing.close();
        Ok(())
    }

    fn remote_peer(&self) -> PeerId {
        self.peer.clone()
    }
}

#[derive(Default)]
struct AcceptQueue {
    pending: VecDeque<Arc<dyn Stream>>,
    closed: bool,
    fail_next: bool,
}

#[derive(Default)]
struct MemoryAcceptor {
    queue: Mutex<AcceptQueue>,
    ready: Condvar,
}

impl MemoryAcceptor {
    fn is_closed(&self) -> bool {
        self.queue.lock().closed
    }

    fn enqueue(&self, stream: Arc<dyn Stream>) -> io::Result<()> {
        let mut queue = self.queue.lock();
        if queue.closed {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "acceptor closed"));
        }
        queue.pending.push_back(stream);
        self.ready.notify_all();
        Ok(())
    }

    fn fail_once(&self) {
        self.queue.lock().fail_next = true;
        self.ready.notify_all();
    }
}

impl Acceptor for MemoryAcceptor {
    fn accept(&self) -> io::Result<Arc<dyn Stream>> {
        let mut queue = self.queue.lock();
        loop {
            if queue.closed {
                return Err(io::Error::new(io::ErrorKind::ConnectionAborted, "acceptor closed"));
            }
            if queue.fail_next {
                queue.fail_next = false;
                return Err(io::Error::new(io::ErrorKind::Other, "simulated accept failure"));
            }
            if let Some(stream) = queue.pending.pop_front() {
                return Ok(stream);
            }
            self.ready.wait(&mut queue);
        }
    }

    fn close(&self) -> io::Result<()> {
        let mut queue = self.queue.lock();
        queue.closed = true;
        for stream in queue.pending.drain(..) {
            let _ = stream.close();
        }
        self.ready.notify_all();
        Ok(())
    }
}

struct HubState {
    available: bool,
    fail_bind: bool,
    acceptor: Option<Arc<MemoryAcceptor>>,
    peers: BTreeMap<PeerId, DialMode>,
    verdicts: BTreeMap<PeerId, VecDeque<bool>>,
    held_dials: BTreeMap<PeerId, usize>,
    remotes: VecDeque<(PeerId, MemoryStream)>,
    binds: usize,
    discovery_cancellations: usize,
}

struct Hub {
    state: Mutex<HubState>,
    changed: Condvar,
}

impl Hub {
    fn open_link(&self, state: &mut HubState, peer: &PeerId) -> Arc<dyn Stream> {
        let (local, remote) = MemoryStream::pair(peer.clone(), local_peer());
        state.remotes.push_back((peer.clone(), remote));
        self.changed.notify_all();
        Arc::new(local)
    }
}

fn local_peer() -> PeerId {
    PeerId::from_static(LOCAL_PEER)
}

/// In-process transport with scripted peers
#[derive(Clone)]
pub struct MemoryTransport {
    hub: Arc<Hub>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    /// Create an available transport with no peers
    pub fn new() -> Self {
        Self {
            hub: Arc::new(Hub {
                state: Mutex::new(HubState {
                    available: true,
                    fail_bind: false,
                    acceptor: None,
                    peers: BTreeMap::new(),
                    verdicts: BTreeMap::new(),
                    held_dials: BTreeMap::new(),
                    remotes: VecDeque::new(),
                    binds: 0,
                    discovery_cancellations: 0,
                }),
                changed: Condvar::new(),
            }),
        }
    }

    /// Create a transport whose platform stack is missing
    pub fn unavailable() -> Self {
        let transport = Self::new();
        transport.hub.state.lock().available = false;
        transport
    }

    /// Make subsequent `bind` calls fail
    pub fn set_fail_bind(&self, fail: bool) {
        self.hub.state.lock().fail_bind = fail;
    }

    /// Register (or re-script) a reachable peer
    pub fn add_peer(&self, peer: PeerId, mode: DialMode) {
        self.hub.state.lock().peers.insert(peer, mode);
    }

    /// Simulate `peer` connecting to our acceptor. Returns the peer's end.
    pub fn connect_inbound(&self, peer: &PeerId) -> io::Result<MemoryStream> {
        let state = self.hub.state.lock();
        let acceptor = state
            .acceptor
            .as_ref()
            .filter(|acceptor| !acceptor.is_closed())
            .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "not listening"))?;

        let (local, remote) = MemoryStream::pair(peer.clone(), local_peer());
        acceptor.enqueue(Arc::new(local))?;
        Ok(remote)
    }

    /// Make the open acceptor's next (or pending) `accept` fail once.
    /// Returns `false` when nothing is listening.
    pub fn fail_next_accept(&self) -> bool {
        let state = self.hub.state.lock();
        match state.acceptor.as_ref().filter(|acceptor| !acceptor.is_closed()) {
            Some(acceptor) => {
                acceptor.fail_once();
                true
            }
            None => false,
        }
    }

    /// Resolve one held dial to `peer`
    pub fn complete_dial(&self, peer: &PeerId, accept: bool) {
        let mut state = self.hub.state.lock();
        state.verdicts.entry(peer.clone()).or_default().push_back(accept);
        self.hub.changed.notify_all();
    }

    /// Wait until a dial to `peer` is blocked in `connect`
    pub fn wait_for_held_dial(&self, peer: &PeerId, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.hub.state.lock();
        loop {
            if state.held_dials.get(peer).copied().unwrap_or(0) > 0 {
                return true;
            }
            if self.hub.changed.wait_until(&mut state, deadline).timed_out() {
                return state.held_dials.get(peer).copied().unwrap_or(0) > 0;
            }
        }
    }

    /// Take the remote end of the next successful dial to `peer`
    pub fn take_remote(&self, peer: &PeerId, timeout: Duration) -> Option<MemoryStream> {
        let deadline = Instant::now() + timeout;
        let mut state = self.hub.state.lock();
        loop {
            if let Some(pos) = state.remotes.iter().position(|(p, _)| p == peer) {
                return state.remotes.remove(pos).map(|(_, stream)| stream);
            }
            if self.hub.changed.wait_until(&mut state, deadline).timed_out() {
                return None;
            }
        }
    }

    /// Whether an acceptor is bound and still open
    pub fn is_listening(&self) -> bool {
        self.hub
            .state
            .lock()
            .acceptor
            .as_ref()
            .map(|acceptor| !acceptor.is_closed())
            .unwrap_or(false)
    }

    /// Number of successful `bind` calls
    pub fn bind_count(&self) -> usize {
        self.hub.state.lock().binds
    }

    /// Number of `cancel_discovery` calls
    pub fn discovery_cancellations(&self) -> usize {
        self.hub.state.lock().discovery_cancellations
    }
}

impl Transport for MemoryTransport {
    fn is_available(&self) -> bool {
        self.hub.state.lock().available
    }

    fn discoverable_peers(&self) -> Result<BTreeSet<PeerId>, TransportError> {
        let state = self.hub.state.lock();
        if !state.available {
            return Err(TransportError::Unavailable);
        }
        Ok(state.peers.keys().cloned().collect())
    }

    fn bind(&self, _service_name: &str) -> Result<Arc<dyn Acceptor>, TransportError> {
        let mut state = self.hub.state.lock();
        if !state.available {
            return Err(TransportError::Unavailable);
        }
        if state.fail_bind {
            return Err(TransportError::BindFailed("simulated bind failure".to_string()));
        }
        let acceptor = Arc::new(MemoryAcceptor::default());
        state.acceptor = Some(Arc::clone(&acceptor));
        state.binds += 1;
        Ok(acceptor)
    }

    fn target(&self, peer: &PeerId) -> Result<Arc<dyn Target>, TransportError> {
        let state = self.hub.state.lock();
        if !state.available {
            return Err(TransportError::Unavailable);
        }
        let mode = *state
            .peers
            .get(peer)
            .ok_or_else(|| TransportError::Unresolvable(peer.to_string()))?;

        Ok(Arc::new(MemoryTarget {
            hub: Arc::clone(&self.hub),
            peer: peer.clone(),
            mode,
            closed: AtomicBool::new(false),
        }))
    }

    fn cancel_discovery(&self) {
        self.hub.state.lock().discovery_cancellations += 1;
    }

    fn name(&self) -> &str {
        "memory"
    }
}

struct MemoryTarget {
    hub: Arc<Hub>,
    peer: PeerId,
    mode: DialMode,
    closed: AtomicBool,
}

impl MemoryTarget {
    fn wait_for_verdict(&self, honor_cancel: bool) -> io::Result<Arc<dyn Stream>> {
        let mut state = self.hub.state.lock();
        *state.held_dials.entry(self.peer.clone()).or_default() += 1;
        self.hub.changed.notify_all();

        let verdict = loop {
            if honor_cancel && self.closed.load(Ordering::Acquire) {
                break None;
            }
            if let Some(verdict) = state
                .verdicts
                .get_mut(&self.peer)
                .and_then(|queue| queue.pop_front())
            {
                break Some(verdict);
            }
            self.hub.changed.wait(&mut state);
        };

        if let Some(held) = state.held_dials.get_mut(&self.peer) {
            *held = held.saturating_sub(1);
        }

        match verdict {
            Some(true) => Ok(self.hub.open_link(&mut state, &self.peer)),
            Some(false) => Err(io::Error::new(io::ErrorKind::ConnectionRefused, "dial refused")),
            None => Err(io::Error::new(io::ErrorKind::Interrupted, "connect cancelled")),
        }
    }
}

impl Target for MemoryTarget {
    fn connect(&self) -> io::Result<Arc<dyn Stream>> {
        let stubborn = self.mode == DialMode::Manual { honor_cancel: false };
        if !stubborn && self.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "connect cancelled"));
        }

        match self.mode {
            DialMode::Accept => {
                let mut state = self.hub.state.lock();
                Ok(self.hub.open_link(&mut state, &self.peer))
            }
            DialMode::Refuse => {
                Err(io::Error::new(io::ErrorKind::ConnectionRefused, "dial refused"))
            }
            DialMode::Manual { honor_cancel } => self.wait_for_verdict(honor_cancel),
        }
    }

    fn close(&self) -> io::Result<()> {
        self.closed.store(true, Ordering::Release);
        let _state = self.hub.state.lock();
        self.hub.changed.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const WAIT: Duration = Duration::from_secs(2);

    fn peer(name: &str) -> PeerId {
        PeerId::new(name).expect("valid peer")
    }

    #[test]
    fn test_pair_exchanges_bytes_both_ways() {
        let (a, b) = MemoryStream::pair(peer("b"), peer("a"));
        a.write_all(b"hello").expect("write");
        assert_eq!(b.recv(WAIT).expect("recv"), b"hello");

        b.write_all(&[0x72]).expect("write");
        assert_eq!(a.recv(WAIT).expect("recv"), vec![0x72]);
        assert_eq!(a.remote_peer(), peer("b"));
        assert_eq!(b.remote_peer(), peer("a"));
    }

    #[test]
    fn test_close_gives_eof_and_broken_pipe() {
        let (a, b) = MemoryStream::pair(peer("b"), peer("a"));
        a.close().expect("close");

        let mut buf = [0u8; 8];
        assert_eq!(b.read(&mut buf).expect("eof"), 0);
        assert_eq!(
            b.write_all(b"x").expect_err("write after close").kind(),
            io::ErrorKind::BrokenPipe
        );
        assert!(a.is_closed());
        assert!(b.is_closed());
    }

    #[test]
    fn test_close_unblocks_reader() {
        let (a, _b) = MemoryStream::pair(peer("b"), peer("a"));
        let a = Arc::new(a);
        let reader = Arc::clone(&a);
        let handle = thread::spawn(move || {
            let mut buf = [0u8; 8];
            reader.read(&mut buf)
        });
        a.close().expect("close");
        assert_eq!(handle.join().expect("reader").expect("eof"), 0);
    }

    #[test]
    fn test_read_timeout() {
        let (a, _b) = MemoryStream::pair(peer("b"), peer("a"));
        let err = a
            .recv(Duration::from_millis(20))
            .expect_err("nothing to read");
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_reject_writes_keeps_reads_working() {
        let (a, b) = MemoryStream::pair(peer("b"), peer("a"));
        b.reject_writes_from_peer();
        assert!(a.write_all(b"x").is_err());

        b.write_all(b"still here").expect("reverse direction works");
        assert_eq!(a.recv(WAIT).expect("recv"), b"still here");
    }

    #[test]
    fn test_stalled_write_delivers_before_returning() {
        let (a, b) = MemoryStream::pair(peer("b"), peer("a"));
        let a = Arc::new(a);
        b.stall_writes_from_peer();

        let writer = Arc::clone(&a);
        let handle = thread::spawn(move || writer.write_all(b"held"));
        assert_eq!(b.recv(WAIT).expect("recv"), b"held");
        while b.stalled_writes() == 0 {
            thread::sleep(Duration::from_millis(1));
        }

        a.close().expect("close");
        b.release_writes_from_peer();
        handle.join().expect("writer").expect("stalled write succeeds");
        assert_eq!(b.stalled_writes(), 0);
    }

    #[test]
    fn test_inbound_requires_listening_acceptor() {
        let transport = MemoryTransport::new();
        assert!(transport.connect_inbound(&peer("x")).is_err());

        let acceptor = transport.bind("svc").expect("bind");
        assert!(transport.is_listening());
        let remote = transport.connect_inbound(&peer("x")).expect("inbound");

        let local = acceptor.accept().expect("accept");
        assert_eq!(local.remote_peer(), peer("x"));
        local.write_all(b"hi").expect("write");
        assert_eq!(remote.recv(WAIT).expect("recv"), b"hi");

        acceptor.close().expect("close");
        assert!(!transport.is_listening());
        assert!(acceptor.accept().is_err());
    }

    #[test]
    fn test_accept_failure_is_one_shot() {
        let transport = MemoryTransport::new();
        assert!(!transport.fail_next_accept());

        let acceptor = transport.bind("svc").expect("bind");
        assert!(transport.fail_next_accept());
        assert!(acceptor.accept().is_err());
        assert!(transport.is_listening());

        let _remote = transport.connect_inbound(&peer("x")).expect("inbound");
        assert_eq!(acceptor.accept().expect("accept").remote_peer(), peer("x"));
    }

    #[test]
    fn test_dial_modes() {
        let transport = MemoryTransport::new();
        transport.add_peer(peer("ok"), DialMode::Accept);
        transport.add_peer(peer("no"), DialMode::Refuse);

        let stream = transport
            .target(&peer("ok"))
            .expect("resolve")
            .connect()
            .expect("connect");
        assert_eq!(stream.remote_peer(), peer("ok"));
        assert!(transport.take_remote(&peer("ok"), WAIT).is_some());

        let err = transport
            .target(&peer("no"))
            .expect("resolve")
            .connect()
            .err()
            .expect("refused");
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);

        assert!(matches!(
            transport.target(&peer("unknown")),
            Err(TransportError::Unresolvable(_))
        ));
    }

    #[test]
    fn test_manual_dial_honors_cancel() {
        let transport = MemoryTransport::new();
        transport.add_peer(peer("slow"), DialMode::Manual { honor_cancel: true });

        let target = transport.target(&peer("slow")).expect("resolve");
        let dialing = Arc::clone(&target);
        let handle = thread::spawn(move || dialing.connect().map(|_| ()));

        assert!(transport.wait_for_held_dial(&peer("slow"), WAIT));
        target.close().expect("close");
        let err = handle.join().expect("dial thread").expect_err("cancelled");
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
    }

    #[test]
    fn test_stubborn_dial_completes_after_cancel() {
        let transport = MemoryTransport::new();
        transport.add_peer(peer("late"), DialMode::Manual { honor_cancel: false });

        let target = transport.target(&peer("late")).expect("resolve");
        let dialing = Arc::clone(&target);
        let handle = thread::spawn(move || dialing.connect().map(|s| s.remote_peer()));

        assert!(transport.wait_for_held_dial(&peer("late"), WAIT));
        target.close().expect("close");
        transport.complete_dial(&peer("late"), true);

        let connected = handle.join().expect("dial thread").expect("late success");
        assert_eq!(connected, peer("late"));
    }

    #[test]
    fn test_unavailable_transport() {
        let transport = MemoryTransport::unavailable();
        assert!(!transport.is_available());
        assert_eq!(transport.discoverable_peers(), Err(TransportError::Unavailable));
        assert!(transport.bind("svc").is_err());
    }

    #[test]
    fn test_bind_failure_and_counters() {
        let transport = MemoryTransport::new();
        transport.bind("svc").expect("bind");
        transport.set_fail_bind(true);
        assert!(matches!(
            transport.bind("svc"),
            Err(TransportError::BindFailed(_))
        ));
        assert_eq!(transport.bind_count(), 1);

        transport.cancel_discovery();
        assert_eq!(transport.discovery_cancellations(), 1);
    }
}
