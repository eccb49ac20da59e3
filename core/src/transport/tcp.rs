//! TCP implementation of the transport contract
//!
//! Desktop stand-in for the platform socket layer. Peers are `host:port`
//! strings; the known-peer list plays the role of the platform's bonded
//! device list.
//!
//! Blocking socket calls cannot be interrupted from another thread, so both
//! accept and connect run non-blocking and poll. Closing an acceptor drops
//! its socket; closing a target abandons the connect at the next poll.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::BTreeSet;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::peer::PeerId;
use crate::transport::abstraction::{Acceptor, Stream, Target, Transport, TransportError};

/// Default listening port
pub const DEFAULT_PORT: u16 = 7878;

const LISTEN_BACKLOG: i32 = 16;

/// Poll intervals for the non-blocking accept and connect loops
const ACCEPT_POLL: Duration = Duration::from_millis(25);
const CONNECT_POLL: Duration = Duration::from_millis(10);

/// The previous owner of a fixed port may release it a moment late
const REBIND_ATTEMPTS: u32 = 20;
const REBIND_DELAY: Duration = Duration::from_millis(25);

/// TCP transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpTransportConfig {
    /// Address the acceptor binds to
    pub listen_addr: SocketAddr,
    /// Connect timeout in seconds (0 = wait until the OS gives up)
    pub connect_timeout_secs: u64,
    /// Disable Nagle on every stream
    pub nodelay: bool,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            connect_timeout_secs: 10,
            nodelay: true,
        }
    }
}

impl TcpTransportConfig {
    /// Create a configuration listening on `listen_addr`
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Self::default()
        }
    }

    /// Set the connect timeout in seconds
    pub fn with_connect_timeout(mut self, secs: u64) -> Self {
        self.connect_timeout_secs = secs;
        self
    }

    fn connect_timeout(&self) -> Option<Duration> {
        (self.connect_timeout_secs > 0).then(|| Duration::from_secs(self.connect_timeout_secs))
    }
}

/// TCP transport
pub struct TcpTransport {
    config: TcpTransportConfig,
    known_peers: RwLock<BTreeSet<PeerId>>,
    bound_addr: RwLock<Option<SocketAddr>>,
}

impl TcpTransport {
    /// Create a new TCP transport
    pub fn new(config: TcpTransportConfig) -> Self {
        Self {
            config,
            known_peers: RwLock::new(BTreeSet::new()),
            bound_addr: RwLock::new(None),
        }
    }

    /// Seed the known-peer list
    pub fn with_known_peers(self, peers: impl IntoIterator<Item = PeerId>) -> Self {
        self.known_peers.write().extend(peers);
        self
    }

    /// Remember a peer so it shows up in `discoverable_peers`
    pub fn add_known_peer(&self, peer: PeerId) {
        self.known_peers.write().insert(peer);
    }

    /// Address of the most recently bound acceptor
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound_addr.read()
    }
}

impl Transport for TcpTransport {
    fn is_available(&self) -> bool {
        true
    }

    fn discoverable_peers(&self) -> Result<BTreeSet<PeerId>, TransportError> {
        Ok(self.known_peers.read().clone())
    }

    fn bind(&self, service_name: &str) -> Result<Arc<dyn Acceptor>, TransportError> {
        let addr = self.config.listen_addr;
        let listener = bind_with_retry(addr)
            .map_err(|e| TransportError::BindFailed(format!("{}: {}", addr, e)))?;
        let local = listener.local_addr()?;
        *self.bound_addr.write() = Some(local);

        info!(service = service_name, addr = %local, "TCP acceptor bound");
        Ok(Arc::new(TcpAcceptor {
            listener: Mutex::new(Some(listener)),
            nodelay: self.config.nodelay,
        }))
    }

    fn target(&self, peer: &PeerId) -> Result<Arc<dyn Target>, TransportError> {
        let addr = peer
            .as_str()
            .to_socket_addrs()
            .map_err(|e| TransportError::Unresolvable(format!("{}: {}", peer, e)))?
            .next()
            .ok_or_else(|| TransportError::Unresolvable(peer.to_string()))?;

        Ok(Arc::new(TcpTarget {
            peer: peer.clone(),
            addr,
            timeout: self.config.connect_timeout(),
            nodelay: self.config.nodelay,
            cancelled: AtomicBool::new(false),
        }))
    }

    fn name(&self) -> &str {
        "tcp"
    }
}

fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    #[cfg(unix)]
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket.into())
}

fn bind_with_retry(addr: SocketAddr) -> io::Result<TcpListener> {
    let mut attempt = 1;
    loop {
        match bind_listener(addr) {
            Err(e) if e.kind() == io::ErrorKind::AddrInUse && attempt < REBIND_ATTEMPTS => {
                debug!(%addr, attempt, "address in use; retrying bind");
                attempt += 1;
                thread::sleep(REBIND_DELAY);
            }
            other => return other,
        }
    }
}

/// Connected TCP stream
pub struct TcpLink {
    stream: TcpStream,
    peer: PeerId,
}

impl TcpLink {
    fn new(stream: TcpStream, peer: PeerId, nodelay: bool) -> io::Result<Self> {
        stream.set_nodelay(nodelay)?;
        Ok(Self { stream, peer })
    }
}

impl Stream for TcpLink {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.stream).read(buf)
    }

    fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        (&self.stream).write_all(buf)?;
        (&self.stream).flush()
    }

    fn close(&self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }

    fn remote_peer(&self) -> PeerId {
        self.peer.clone()
    }
}

struct TcpAcceptor {
    /// `None` once closed
    listener: Mutex<Option<TcpListener>>,
    nodelay: bool,
}

impl TcpAcceptor {
    fn closed_error() -> io::Error {
        io::Error::new(io::ErrorKind::ConnectionAborted, "acceptor closed")
    }

    /// One non-blocking accept. `Ok(None)` means nothing usable arrived.
    fn poll_accept(&self) -> io::Result<Option<TcpLink>> {
        let guard = self.listener.lock();
        let listener = guard.as_ref().ok_or_else(Self::closed_error)?;

        match listener.accept() {
            Ok((stream, remote)) => {
                let link = stream
                    .set_nonblocking(false)
                    .and_then(|()| TcpLink::new(stream, PeerId::from(remote), self.nodelay));
                match link {
                    Ok(link) => {
                        debug!(%remote, "TCP connection accepted");
                        Ok(Some(link))
                    }
                    Err(e) => {
                        debug!(%remote, error = %e, "dropping accepted connection");
                        Ok(None)
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) if affects_one_connection(&e) => {
                debug!(error = %e, "transient accept error");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// Accept errors caused by a single peer rather than the listening socket
fn affects_one_connection(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}

impl Acceptor for TcpAcceptor {
    fn accept(&self) -> io::Result<Arc<dyn Stream>> {
        loop {
            if let Some(link) = self.poll_accept()? {
                return Ok(Arc::new(link));
            }
            thread::sleep(ACCEPT_POLL);
        }
    }

    fn close(&self) -> io::Result<()> {
        drop(self.listener.lock().take());
        Ok(())
    }
}

/// Outbound connect. Runs non-blocking so `close` can abandon it; a
/// cancelled target refuses to start and drops a socket still connecting.
struct TcpTarget {
    peer: PeerId,
    addr: SocketAddr,
    timeout: Option<Duration>,
    nodelay: bool,
    cancelled: AtomicBool,
}

impl TcpTarget {
    fn cancelled_error() -> io::Error {
        io::Error::new(io::ErrorKind::Interrupted, "connect cancelled")
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn await_connected(&self, socket: &Socket) -> io::Result<()> {
        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);
        loop {
            if self.is_cancelled() {
                return Err(Self::cancelled_error());
            }
            if let Some(err) = socket.take_error()? {
                return Err(err);
            }
            match socket.peer_addr() {
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotConnected => {}
                Err(e) => return Err(e),
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"));
            }
            thread::sleep(CONNECT_POLL);
        }
    }
}

#[cfg(unix)]
fn connect_in_progress(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EINPROGRESS) || err.kind() == io::ErrorKind::WouldBlock
}

#[cfg(not(unix))]
fn connect_in_progress(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

impl Target for TcpTarget {
    fn connect(&self) -> io::Result<Arc<dyn Stream>> {
        if self.is_cancelled() {
            return Err(Self::cancelled_error());
        }

        let socket = Socket::new(Domain::for_address(self.addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        match socket.connect(&self.addr.into()) {
            Ok(()) => {}
            Err(e) if connect_in_progress(&e) => self.await_connected(&socket)?,
            Err(e) => return Err(e),
        }
        socket.set_nonblocking(false)?;

        let stream: TcpStream = socket.into();
        if self.is_cancelled() {
            let _ = stream.shutdown(Shutdown::Both);
            return Err(Self::cancelled_error());
        }

        Ok(Arc::new(TcpLink::new(stream, self.peer.clone(), self.nodelay)?))
    }

    fn close(&self) -> io::Result<()> {
        self.cancelled.store(true, Ordering::Release);
        Ok(())
    }
}
