//! Listener unit
//!
//! Owns one acceptor and loops on `accept`. Each inbound stream is offered to
//! the session core, which promotes it, rejects it, or reports that this
//! listener has been superseded. Closing the acceptor is the only way to stop
//! the loop; the unit never restarts itself. An accept error is reported to the
//! core, which decides whether to bind a replacement.

use std::sync::Arc;
use std::thread;
use tracing::debug;

use crate::session::error::SessionError;
use crate::session::manager::SessionCore;
use crate::transport::abstraction::{close_quietly, Acceptor, Endpoint};

/// What the core did with an accepted stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AcceptOutcome {
    /// Installed as the active connection; this listener is now cancelled
    Promoted,
    /// Closed because the session is idle or already connected
    Rejected,
    /// Closed because a newer unit replaced this listener
    Stale,
}

/// Manager-side handle of a running listener
pub(crate) struct ListenerHandle {
    pub(crate) generation: u64,
    acceptor: Arc<dyn Acceptor>,
}

impl ListenerHandle {
    /// Close the acceptor; the thread exits on its next `accept` error
    pub(crate) fn cancel(&self) {
        debug!(generation = self.generation, "cancelling listener");
        close_quietly(Endpoint::Acceptor, self.acceptor.close());
    }
}

/// Start the accept loop on its own thread
pub(crate) fn spawn(
    core: Arc<SessionCore>,
    generation: u64,
    acceptor: Arc<dyn Acceptor>,
) -> Result<ListenerHandle, SessionError> {
    let name = core.config().thread_name("accept");
    let looped = Arc::clone(&acceptor);

    let spawned = thread::Builder::new()
        .name(name)
        .spawn(move || run(core, generation, looped));

    if let Err(err) = spawned {
        close_quietly(Endpoint::Acceptor, acceptor.close());
        return Err(SessionError::Spawn(err.to_string()));
    }

    Ok(ListenerHandle {
        generation,
        acceptor,
    })
}

fn run(core: Arc<SessionCore>, generation: u64, acceptor: Arc<dyn Acceptor>) {
    debug!(generation, "BEGIN listener");
    loop {
        match acceptor.accept() {
            Ok(stream) => match core.inbound_accepted(generation, stream) {
                AcceptOutcome::Rejected => continue,
                AcceptOutcome::Promoted | AcceptOutcome::Stale => break,
            },
            Err(err) => {
                core.acceptor_failed(generation, &err);
                break;
            }
        }
    }
    debug!(generation, "END listener");
}
