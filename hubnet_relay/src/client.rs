// Peer worker loop.
//
// `RelayEngine::connect_to_authority` opens the socket on the caller's
// thread (so connect failures are reported synchronously), then hands it to
// this worker. The worker:
//
// - waits for the handshake: the first byte the authority sends is our
//   participant id. Until it arrives nothing is written, so anything the
//   application queued early goes out after the handshake, in order.
// - reads whatever is available, decodes complete frames and routes them
//   into the loopback participant's queues (origin 0 -> authority inbox,
//   anything else -> general inbox).
// - drains the loopback outbox onto the socket, keeping partial writes
//   queued.
//
// If the authority goes away (read reports closure, write error, malformed
// stream) the session role becomes `Closed` and the worker exits. Frames
// already routed remain pullable.

use std::sync::Arc;
use std::thread;

use hubnet_protocol::{FrameBuffer, ParticipantId};
use tracing::{debug, info, trace, warn};

use crate::cancel::CancelToken;
use crate::config::RelayConfig;
use crate::session::SharedSession;
use crate::transport::{Received, Transport};

/// Everything the peer thread needs, moved onto it at spawn.
pub(crate) struct PeerWorker<T: Transport> {
    pub(crate) transport: Arc<T>,
    pub(crate) stream: T::Connection,
    pub(crate) session: SharedSession,
    pub(crate) cancel: CancelToken,
    pub(crate) config: RelayConfig,
}

/// What one receive pass saw.
struct Inbound {
    progressed: bool,
    closed: bool,
}

impl<T: Transport> PeerWorker<T> {
    /// Run until cancelled or disconnected.
    pub(crate) fn run(mut self) {
        let mut reader = FrameBuffer::new();
        let mut pending_write: Vec<u8> = Vec::new();
        let mut handshaken = false;
        let mut chunk = vec![0u8; self.config.chunk_size()];
        let idle = self.config.idle_interval();
        debug!("peer worker started");

        while !self.cancel.is_cancelled() {
            let inbound = self.receive(&mut reader, &mut chunk, &mut handshaken);
            let mut progressed = inbound.progressed;
            let mut lost = inbound.closed;

            {
                let mut session = self.session.lock();
                loop {
                    match reader.pop_frame() {
                        Ok(Some(frame)) => {
                            if let Err(e) = session.route_from_authority(&frame) {
                                warn!(error = %e, "dropping frame from authority");
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "malformed stream from authority");
                            lost = true;
                            break;
                        }
                    }
                }
                if handshaken {
                    pending_write.extend_from_slice(&session.take_loopback_outbox());
                }
            }

            if !lost && !pending_write.is_empty() {
                match self.transport.send(&mut self.stream, &pending_write) {
                    Ok(0) => {}
                    Ok(n) => {
                        trace!(bytes = n, "sent");
                        pending_write.drain(..n);
                        progressed = true;
                    }
                    Err(e) => {
                        warn!(error = %e, "write to authority failed");
                        lost = true;
                    }
                }
            }

            if lost {
                self.session.lock().close();
                info!("disconnected from authority");
                break;
            }
            if !progressed {
                thread::sleep(idle);
            }
        }

        self.transport.close(self.stream);
        debug!("peer worker stopped");
    }

    fn receive(&mut self, reader: &mut FrameBuffer, chunk: &mut [u8], handshaken: &mut bool) -> Inbound {
        let mut inbound = Inbound {
            progressed: false,
            closed: false,
        };
        while self.transport.is_readable(&self.stream) {
            match self.transport.receive(&mut self.stream, chunk) {
                Received::Data(n) => {
                    inbound.progressed = true;
                    let mut data = &chunk[..n];
                    if !*handshaken {
                        if let Some((&id, rest)) = data.split_first() {
                            let id = ParticipantId(id);
                            self.session.lock().complete_handshake(id);
                            info!(id = %id, "joined authority");
                            *handshaken = true;
                            data = rest;
                        }
                    }
                    trace!(bytes = data.len(), "received");
                    reader.extend(data);
                }
                Received::Pending => break,
                Received::Closed => {
                    inbound.closed = true;
                    break;
                }
            }
        }
        inbound
    }
}
