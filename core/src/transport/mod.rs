// Transport module — collaborator contract plus TCP and in-memory platforms

pub mod abstraction;
pub mod memory;
pub mod tcp;

pub use abstraction::{Acceptor, Endpoint, Stream, Target, Transport, TransportError};
pub use memory::{DialMode, MemoryStream, MemoryTransport};
pub use tcp::{TcpTransport, TcpTransportConfig};
