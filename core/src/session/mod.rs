//! Session layer
//!
//! The [`SessionManager`] owns a single authoritative [`SessionState`] and up
//! to one instance each of three units, every one running on its own thread:
//!
//! - **listener** — blocks in `Acceptor::accept`, hands inbound streams over
//! - **dialer** — blocks in `Target::connect` for one outbound attempt
//! - **worker** — owns the active stream and runs the read loop
//!
//! Units are cancelled by closing the resource they block on. Each unit is
//! tagged with a generation number when it is created; callbacks from a unit
//! whose generation is no longer installed are discarded under the lock.

pub mod config;
pub mod error;
pub mod events;
pub mod state;

mod dialer;
mod listener;
mod manager;
mod worker;

pub use config::SessionConfig;
pub use error::SessionError;
pub use events::{EventChannel, SessionEvent, SessionListener};
pub use manager::SessionManager;
pub use state::{SessionSnapshot, SessionState};
