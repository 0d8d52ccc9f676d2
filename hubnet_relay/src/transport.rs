// Stream transport seam.
//
// The engine never touches sockets directly; it goes through `Transport`,
// which models just enough of a stream API for the worker loops: resolve,
// listen/accept, connect, a readiness check, non-blocking receive/send and
// close. `TcpTransport` is the real implementation over `std::net`, with
// every socket in non-blocking mode so one worker thread can service all of
// them.
//
// `receive` distinguishes "nothing yet" from "peer closed". A zero-byte read
// always means the connection is gone; the engine drops the participant
// instead of spinning on a dead socket.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};

use tracing::debug;

use crate::error::RelayError;

/// Outcome of a non-blocking read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Received {
    /// This many bytes were written into the caller's buffer.
    Data(usize),
    /// Nothing available right now.
    Pending,
    /// The connection is closed (EOF or a hard error).
    Closed,
}

/// Stream transport used by the relay worker threads.
pub trait Transport: Send + Sync + 'static {
    type Listener: Send + 'static;
    type Connection: Send + 'static;

    /// Resolve `host:port`. `None` means "every local interface".
    fn resolve(&self, host: Option<&str>, port: u16) -> Result<SocketAddr, RelayError>;

    fn listen(&self, addr: SocketAddr) -> Result<Self::Listener, RelayError>;

    /// Address the listener actually bound (differs from the request for port 0).
    fn local_addr(&self, listener: &Self::Listener) -> io::Result<SocketAddr>;

    /// Accept one pending connection, if any. Never blocks.
    fn accept(&self, listener: &Self::Listener) -> io::Result<Option<Self::Connection>>;

    fn connect(&self, addr: SocketAddr) -> Result<Self::Connection, RelayError>;

    /// True if a `receive` would return data or report closure.
    fn is_readable(&self, conn: &Self::Connection) -> bool;

    fn receive(&self, conn: &mut Self::Connection, buf: &mut [u8]) -> Received;

    /// Write as much of `bytes` as the socket takes right now. `Ok(0)` means
    /// it would block.
    fn send(&self, conn: &mut Self::Connection, bytes: &[u8]) -> io::Result<usize>;

    fn close(&self, conn: Self::Connection);
}

/// `Transport` over non-blocking `std::net` TCP sockets.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpTransport;

impl Transport for TcpTransport {
    type Listener = TcpListener;
    type Connection = TcpStream;

    fn resolve(&self, host: Option<&str>, port: u16) -> Result<SocketAddr, RelayError> {
        let Some(host) = host else {
            return Ok(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)));
        };
        let resolve_err = |source| RelayError::Resolve {
            host: host.to_string(),
            port,
            source,
        };
        let mut addrs = (host, port).to_socket_addrs().map_err(resolve_err)?;
        addrs
            .next()
            .ok_or_else(|| resolve_err(io::Error::new(ErrorKind::NotFound, "no addresses found")))
    }

    fn listen(&self, addr: SocketAddr) -> Result<TcpListener, RelayError> {
        let listen_err = |source| RelayError::Listen { addr, source };
        let listener = TcpListener::bind(addr).map_err(listen_err)?;
        listener.set_nonblocking(true).map_err(listen_err)?;
        Ok(listener)
    }

    fn local_addr(&self, listener: &TcpListener) -> io::Result<SocketAddr> {
        listener.local_addr()
    }

    fn accept(&self, listener: &TcpListener) -> io::Result<Option<TcpStream>> {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!(%peer, "accepted tcp connection");
                configure_stream(&stream)?;
                Ok(Some(stream))
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn connect(&self, addr: SocketAddr) -> Result<TcpStream, RelayError> {
        let connect_err = |source| RelayError::Connect { addr, source };
        let stream = TcpStream::connect(addr).map_err(connect_err)?;
        configure_stream(&stream).map_err(connect_err)?;
        Ok(stream)
    }

    fn is_readable(&self, conn: &TcpStream) -> bool {
        let mut probe = [0u8; 1];
        match conn.peek(&mut probe) {
            Ok(_) => true,
            Err(e) => !matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted),
        }
    }

    fn receive(&self, conn: &mut TcpStream, buf: &mut [u8]) -> Received {
        match conn.read(buf) {
            Ok(0) => Received::Closed,
            Ok(n) => Received::Data(n),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                Received::Pending
            }
            Err(e) => {
                debug!(error = %e, "tcp read failed");
                Received::Closed
            }
        }
    }

    fn send(&self, conn: &mut TcpStream, bytes: &[u8]) -> io::Result<usize> {
        match conn.write(bytes) {
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn close(&self, conn: TcpStream) {
        // Already-closed sockets report NotConnected here; nothing to do.
        let _ = conn.shutdown(Shutdown::Both);
    }
}

fn configure_stream(stream: &TcpStream) -> io::Result<()> {
    stream.set_nonblocking(true)?;
    stream.set_nodelay(true)
}
