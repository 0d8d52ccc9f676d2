// Authority worker loop.
//
// Architecture: one background thread owns the listening socket and every
// accepted connection; the application thread never touches a socket. Each
// pass of the loop does three things:
//
// 1. Accept: drain pending connections. Each gets the next participant id,
//    a `Connection` (receive reassembly buffer + pending-write buffer) and,
//    as the first byte on the wire, its id.
// 2. Receive: for every readable connection, read what is available, then
//    decode every complete frame and route it under the session lock. A
//    trailing partial frame stays in the reassembly buffer for next time.
// 3. Send: move each remote's queued outbox into its connection's
//    pending-write buffer (under the lock), then write as much as each socket
//    accepts (outside the lock). Partial writes keep the remainder queued, so
//    per-peer ordering is preserved.
//
// A connection is dropped when its read reports closure, a write fails, or
// it sends a length byte below 2 (the stream can't be resynchronised). The
// participant is removed from the routing table, which queues a `Left`
// event for the authority.
//
// When a pass moves no bytes the thread sleeps for `idle_interval` instead
// of spinning. Shutdown: the loop checks its `CancelToken` every pass and
// closes every socket on the way out.

use std::sync::Arc;
use std::thread;

use hubnet_protocol::{FrameBuffer, FrameError, ParticipantId};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::cancel::CancelToken;
use crate::config::RelayConfig;
use crate::session::SharedSession;
use crate::transport::{Received, Transport};

/// Reads taken from one connection per pass before moving on, so a chatty
/// peer can't starve the others.
const MAX_READS_PER_PASS: usize = 16;

/// Per-connection buffers. Lives exactly as long as the socket.
struct Connection<C> {
    id: ParticipantId,
    stream: C,
    reader: FrameBuffer,
    pending_write: Vec<u8>,
}

/// Why a connection was dropped.
#[derive(Error, Debug)]
enum Disconnect {
    #[error("closed by peer")]
    Closed,
    #[error("malformed stream: {0}")]
    Malformed(#[from] FrameError),
    #[error("write failed: {0}")]
    WriteFailed(std::io::Error),
}

/// Everything the authority thread needs, moved onto it at spawn.
pub(crate) struct AuthorityWorker<T: Transport> {
    pub(crate) transport: Arc<T>,
    pub(crate) listener: T::Listener,
    pub(crate) session: SharedSession,
    pub(crate) cancel: CancelToken,
    pub(crate) config: RelayConfig,
}

impl<T: Transport> AuthorityWorker<T> {
    /// Run until cancelled.
    pub(crate) fn run(self) {
        let mut connections: Vec<Connection<T::Connection>> = Vec::new();
        let mut chunk = vec![0u8; self.config.chunk_size()];
        let idle = self.config.idle_interval();
        debug!("authority worker started");

        while !self.cancel.is_cancelled() {
            let mut dropped = Vec::new();
            let mut progressed = self.accept_new(&mut connections);
            progressed |= self.receive_all(&mut connections, &mut chunk, &mut dropped);
            progressed |= self.send_all(&mut connections, &mut dropped);
            if !dropped.is_empty() {
                self.drop_connections(&mut connections, dropped);
                progressed = true;
            }
            if !progressed {
                thread::sleep(idle);
            }
        }

        for conn in connections {
            self.transport.close(conn.stream);
        }
        debug!("authority worker stopped");
    }

    fn accept_new(&self, connections: &mut Vec<Connection<T::Connection>>) -> bool {
        let mut accepted = false;
        loop {
            let stream = match self.transport.accept(&self.listener) {
                Ok(Some(stream)) => stream,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            };
            accepted = true;
            let registered = self.session.lock().register_remote();
            match registered {
                Ok(id) => {
                    info!(peer = %id, "peer connected");
                    connections.push(Connection {
                        id,
                        stream,
                        reader: FrameBuffer::new(),
                        // Handshake: the assigned id is the first byte the peer sees.
                        pending_write: vec![id.0],
                    });
                }
                Err(e) => {
                    warn!(error = %e, "refusing connection");
                    self.transport.close(stream);
                }
            }
        }
        accepted
    }

    fn receive_all(
        &self,
        connections: &mut [Connection<T::Connection>],
        chunk: &mut [u8],
        dropped: &mut Vec<(ParticipantId, Disconnect)>,
    ) -> bool {
        let mut progressed = false;
        for conn in connections.iter_mut() {
            match self.receive_from(conn, chunk) {
                Ok(got) => progressed |= got,
                Err(reason) => dropped.push((conn.id, reason)),
            }
        }
        progressed
    }

    /// Read from one connection and route every complete frame.
    fn receive_from(&self, conn: &mut Connection<T::Connection>, chunk: &mut [u8]) -> Result<bool, Disconnect> {
        let mut received = false;
        let mut closed = false;
        for _ in 0..MAX_READS_PER_PASS {
            if !self.transport.is_readable(&conn.stream) {
                break;
            }
            match self.transport.receive(&mut conn.stream, chunk) {
                Received::Data(n) => {
                    trace!(peer = %conn.id, bytes = n, "received");
                    conn.reader.extend(&chunk[..n]);
                    received = true;
                }
                Received::Pending => break,
                Received::Closed => {
                    closed = true;
                    break;
                }
            }
        }

        // Route what arrived before a close too; those frames were sent.
        if received {
            let mut session = self.session.lock();
            while let Some(frame) = conn.reader.pop_frame()? {
                if let Err(e) = session.route_from_remote(conn.id, &frame) {
                    warn!(peer = %conn.id, error = %e, "dropping frame");
                }
            }
        }
        if closed {
            return Err(Disconnect::Closed);
        }
        Ok(received)
    }

    fn send_all(
        &self,
        connections: &mut [Connection<T::Connection>],
        dropped: &mut Vec<(ParticipantId, Disconnect)>,
    ) -> bool {
        {
            let mut session = self.session.lock();
            for conn in connections.iter_mut() {
                let queued = session.take_remote_outbox(conn.id);
                conn.pending_write.extend_from_slice(&queued);
            }
        }

        let mut progressed = false;
        for conn in connections.iter_mut() {
            if conn.pending_write.is_empty() {
                continue;
            }
            match self.transport.send(&mut conn.stream, &conn.pending_write) {
                Ok(0) => {}
                Ok(n) => {
                    trace!(peer = %conn.id, bytes = n, "sent");
                    conn.pending_write.drain(..n);
                    progressed = true;
                }
                Err(e) => dropped.push((conn.id, Disconnect::WriteFailed(e))),
            }
        }
        progressed
    }

    fn drop_connections(
        &self,
        connections: &mut Vec<Connection<T::Connection>>,
        dropped: Vec<(ParticipantId, Disconnect)>,
    ) {
        for (id, reason) in dropped {
            let Some(index) = connections.iter().position(|c| c.id == id) else {
                continue;
            };
            let conn = connections.swap_remove(index);
            self.transport.close(conn.stream);
            self.session.lock().remove_remote(id);
            info!(peer = %id, %reason, "peer disconnected");
        }
    }
}
