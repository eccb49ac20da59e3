//! Duplex worker
//!
//! Owns the active stream. A dedicated thread reads up to
//! `read_buffer_size` bytes at a time and hands each chunk to the core; the
//! first read error or end-of-stream ends the loop and reports the loss.
//! Writes run on the caller's thread.

use std::io;
use std::sync::Arc;
use std::thread;
use tracing::debug;

use crate::peer::PeerId;
use crate::session::error::SessionError;
use crate::session::manager::SessionCore;
use crate::transport::abstraction::{close_quietly, Endpoint, Stream};

pub(crate) struct DuplexWorker {
    generation: u64,
    peer: PeerId,
    stream: Arc<dyn Stream>,
}

impl DuplexWorker {
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// Blocking write of the full buffer
    pub(crate) fn write(&self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(data)
    }

    /// Close the stream; the read loop exits on the resulting error
    pub(crate) fn cancel(&self) {
        debug!(generation = self.generation, peer = %self.peer, "cancelling worker");
        close_quietly(Endpoint::Stream, self.stream.close());
    }
}

pub(crate) fn spawn(
    core: Arc<SessionCore>,
    generation: u64,
    peer: PeerId,
    stream: Arc<dyn Stream>,
) -> Result<Arc<DuplexWorker>, SessionError> {
    let worker = Arc::new(DuplexWorker {
        generation,
        peer,
        stream,
    });
    let name = core.config().thread_name("read");
    let buffer_size = core.config().read_buffer_size;
    let reader = Arc::clone(&worker);

    thread::Builder::new()
        .name(name)
        .spawn(move || run(core, reader, buffer_size))
        .map_err(|err| {
            worker.cancel();
            SessionError::Spawn(err.to_string())
        })?;

    Ok(worker)
}

fn run(core: Arc<SessionCore>, worker: Arc<DuplexWorker>, buffer_size: usize) {
    let generation = worker.generation;
    debug!(generation, peer = %worker.peer, "BEGIN worker");
    let mut buffer = vec![0u8; buffer_size];

    loop {
        match worker.stream.read(&mut buffer) {
            Ok(0) => {
                debug!(generation, "end of stream");
                break;
            }
            Ok(n) => {
                if !core.deliver_read(generation, &buffer[..n]) {
                    debug!(generation, "worker superseded; dropping read");
                    return;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                debug!(generation, error = %err, "read failed");
                break;
            }
        }
    }

    core.connection_lost(generation);
    debug!(generation, "END worker");
}
