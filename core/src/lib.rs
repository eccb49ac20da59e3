// Linkwire Core — single-peer duplex session manager
//
// Converges "be discoverable and accept" and "dial out" into one managed
// duplex stream. At most one connection is active at a time; every state
// transition is serialized through the session manager.

pub mod peer;
pub mod session;
pub mod transport;

pub use peer::PeerId;
pub use session::{
    EventChannel, SessionConfig, SessionError, SessionEvent, SessionListener, SessionManager,
    SessionSnapshot, SessionState,
};
pub use transport::{Acceptor, Stream, Target, Transport, TransportError};

/// Crate version, as reported by the CLI
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
