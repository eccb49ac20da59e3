//! Dialer unit
//!
//! One outbound connect attempt on its own thread. Success and failure are
//! both reported to the core tagged with the dialer's generation, so a dialer
//! cancelled mid-connect can never promote a stream or fire a spurious
//! connection-failed notification.

use std::sync::Arc;
use std::thread;
use tracing::debug;

use crate::peer::PeerId;
use crate::session::error::SessionError;
use crate::session::manager::SessionCore;
use crate::transport::abstraction::{close_quietly, Endpoint, Target};

/// Manager-side handle of an in-flight dial
pub(crate) struct DialerHandle {
    pub(crate) generation: u64,
    pub(crate) peer: PeerId,
    target: Arc<dyn Target>,
}

impl DialerHandle {
    /// Abort the connect attempt by closing the target
    pub(crate) fn cancel(&self) {
        debug!(generation = self.generation, peer = %self.peer, "cancelling dialer");
        close_quietly(Endpoint::Target, self.target.close());
    }
}

pub(crate) fn spawn(
    core: Arc<SessionCore>,
    generation: u64,
    peer: PeerId,
    target: Arc<dyn Target>,
) -> Result<DialerHandle, SessionError> {
    let name = core.config().thread_name("connect");
    let dialing = Arc::clone(&target);
    let dial_peer = peer.clone();

    let spawned = thread::Builder::new()
        .name(name)
        .spawn(move || run(core, generation, dial_peer, dialing));

    if let Err(err) = spawned {
        close_quietly(Endpoint::Target, target.close());
        return Err(SessionError::Spawn(err.to_string()));
    }

    Ok(DialerHandle {
        generation,
        peer,
        target,
    })
}

fn run(core: Arc<SessionCore>, generation: u64, peer: PeerId, target: Arc<dyn Target>) {
    debug!(generation, %peer, "BEGIN dialer");
    core.transport().cancel_discovery();

    match target.connect() {
        Ok(stream) => core.dial_succeeded(generation, peer, stream),
        Err(err) => {
            close_quietly(Endpoint::Target, target.close());
            core.dial_failed(generation, &err);
        }
    }
    debug!(generation, "END dialer");
}
