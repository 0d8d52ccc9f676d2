// Relay engine: lifecycle and ownership.
//
// `RelayEngine` owns the shared session, the transport, the cancel token and
// the single worker thread. It starts out `Uninitialized` and becomes one of:
//
// - a listening authority (`create_authority`): binds, then runs
//   `server::AuthorityWorker` on a background thread;
// - a loopback-only authority (`create_loopback_authority`): no transport
//   and no thread, all routing happens in the caller's send/pull calls;
// - a peer (`connect_to_authority`): connects, then runs
//   `client::PeerWorker`.
//
// Creation failures (resolve, bind, connect) are returned before any state
// changes, so the engine stays `Uninitialized` and can be retried. There is
// no way back to `Uninitialized` once a role is taken.
//
// Dropping the engine (or calling `shutdown`) cancels the worker, joins it
// and marks the session `Closed`. The worker closes its sockets on the way
// out.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::client::PeerWorker;
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::participant::{Authority, Loopback};
use crate::server::AuthorityWorker;
use crate::session::{Role, Session, SharedSession};
use crate::transport::{TcpTransport, Transport};

/// Owner of all relay state and the background worker.
pub struct RelayEngine<T: Transport = TcpTransport> {
    transport: Arc<T>,
    config: RelayConfig,
    session: SharedSession,
    cancel: CancelToken,
    worker: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl RelayEngine<TcpTransport> {
    /// An idle engine over TCP with the default config.
    pub fn new() -> Self {
        Self::with_config(RelayConfig::default())
    }

    pub fn with_config(config: RelayConfig) -> Self {
        Self::with_transport(TcpTransport, config)
    }
}

impl Default for RelayEngine<TcpTransport> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Transport> RelayEngine<T> {
    pub fn with_transport(transport: T, config: RelayConfig) -> Self {
        let session = Session::with_inbox_limit(config.inbox_limit);
        Self {
            transport: Arc::new(transport),
            config,
            session: Arc::new(Mutex::new(session)),
            cancel: CancelToken::new(),
            worker: None,
            local_addr: None,
        }
    }

    pub fn role(&self) -> Role {
        self.session.lock().role()
    }

    /// Address the authority is listening on. Only set for
    /// `AuthorityListening`.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// The local endpoint, once a role has been taken.
    pub fn loopback(&self) -> Option<Loopback> {
        self.session.lock().loopback_id()?;
        Some(Loopback::new(self.session.clone()))
    }

    /// Listen on `port` (0 picks a free one) and start routing.
    pub fn create_authority(&mut self, port: u16) -> Result<Authority, RelayError> {
        self.ensure_uninitialized()?;
        let addr = self.transport.resolve(self.config.bind_host.as_deref(), port)?;
        let listener = self.transport.listen(addr)?;
        let bound = self.transport.local_addr(&listener)?;

        self.session.lock().init_authority(Role::AuthorityListening)?;
        self.local_addr = Some(bound);

        let worker = AuthorityWorker {
            transport: self.transport.clone(),
            listener,
            session: self.session.clone(),
            cancel: self.cancel.clone(),
            config: self.config.clone(),
        };
        self.spawn_worker("hubnet-authority", move || worker.run())?;
        info!(addr = %bound, "authority listening");
        Ok(Authority::new(self.session.clone()))
    }

    /// Authority with no transport: the loopback participant is the only
    /// participant, and every send/pull happens in memory.
    pub fn create_loopback_authority(&mut self) -> Result<Authority, RelayError> {
        self.session.lock().init_authority(Role::LoopbackAuthority)?;
        info!("loopback authority created");
        Ok(Authority::new(self.session.clone()))
    }

    /// Connect to the authority at `host:port` and start the peer worker.
    /// The returned loopback's id is 0 until the authority assigns one.
    pub fn connect_to_authority(&mut self, port: u16, host: &str) -> Result<Loopback, RelayError> {
        self.ensure_uninitialized()?;
        let addr = self.transport.resolve(Some(host), port)?;
        let stream = self.transport.connect(addr)?;

        self.session.lock().init_peer()?;

        let worker = PeerWorker {
            transport: self.transport.clone(),
            stream,
            session: self.session.clone(),
            cancel: self.cancel.clone(),
            config: self.config.clone(),
        };
        self.spawn_worker("hubnet-peer", move || worker.run())?;
        info!(%addr, "connected to authority");
        Ok(Loopback::new(self.session.clone()))
    }

    /// Stop the worker and close the engine. Idempotent.
    pub fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("relay worker panicked");
            }
        }
        let mut session = self.session.lock();
        if session.role() != Role::Uninitialized {
            session.close();
        }
    }

    fn ensure_uninitialized(&self) -> Result<(), RelayError> {
        if self.role() != Role::Uninitialized {
            return Err(RelayError::AlreadyInitialized);
        }
        Ok(())
    }

    fn spawn_worker<F>(&mut self, name: &str, body: F) -> Result<(), RelayError>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new().name(name.to_string()).spawn(body)?;
        self.worker = Some(handle);
        Ok(())
    }
}

impl<T: Transport> Drop for RelayEngine<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use hubnet_protocol::{AUTHORITY_LOOPBACK_ID, ParticipantId};

    use super::*;
    use crate::participant::Sender;
    use crate::session::ParticipantKind;

    fn local_config() -> RelayConfig {
        RelayConfig {
            bind_host: Some("127.0.0.1".into()),
            ..RelayConfig::default()
        }
    }

    /// Authority -> loopback: broadcasts land in the loopback's authority
    /// inbox, never in its general inbox.
    fn receive_data_from_authority(authority: &Authority, loopback: &Loopback) {
        authority.send_broadcast(b"abc").unwrap();
        assert_eq!(loopback.try_pull_from_authority().unwrap().as_bytes(), b"abc");
        assert!(loopback.try_pull_message().is_none());
        assert!(loopback.try_pull_from_authority().is_none());

        authority.send_broadcast(b"de").unwrap();
        assert_eq!(loopback.try_pull_from_authority().unwrap().as_bytes(), b"de");
        assert!(loopback.try_pull_message().is_none());
        assert!(loopback.try_pull_from_authority().is_none());
    }

    /// Loopback -> authority: each send is pulled separately, in order, with
    /// the loopback as sender.
    fn send_data_to_authority(authority: &Authority, loopback: &Loopback) {
        loopback.send_to_authority(b"abc").unwrap();
        let (sender, packet) = authority.try_pull_message().unwrap();
        assert_eq!(sender.id(), loopback.id());
        assert_eq!(packet.as_bytes(), &[0x61, 0x62, 0x63]);
        assert!(authority.try_pull_message().is_none());

        loopback.send_to_authority(b"de").unwrap();
        let (sender, packet) = authority.try_pull_message().unwrap();
        assert_eq!(sender.id(), loopback.id());
        assert_eq!(packet.as_bytes(), b"de");
        assert!(authority.try_pull_message().is_none());
    }

    #[test]
    fn new_engine_has_no_loopback() {
        let engine = RelayEngine::new();
        assert_eq!(engine.role(), Role::Uninitialized);
        assert!(engine.loopback().is_none());
        assert!(engine.local_addr().is_none());
    }

    #[test]
    fn loopback_authority_send_to_authority() {
        let mut engine = RelayEngine::new();
        let authority = engine.create_loopback_authority().unwrap();
        let loopback = engine.loopback().unwrap();
        assert_eq!(loopback.id(), AUTHORITY_LOOPBACK_ID);
        send_data_to_authority(&authority, &loopback);
    }

    #[test]
    fn loopback_authority_receive_from_authority() {
        let mut engine = RelayEngine::new();
        let authority = engine.create_loopback_authority().unwrap();
        let loopback = engine.loopback().unwrap();
        receive_data_from_authority(&authority, &loopback);
    }

    #[test]
    fn listening_authority_without_peers() {
        let mut engine = RelayEngine::with_config(local_config());
        let authority = engine.create_authority(0).unwrap();
        assert_eq!(engine.role(), Role::AuthorityListening);
        assert_ne!(engine.local_addr().unwrap().port(), 0);

        let loopback = engine.loopback().unwrap();
        send_data_to_authority(&authority, &loopback);
        receive_data_from_authority(&authority, &loopback);
    }

    #[test]
    fn second_create_fails() {
        let mut engine = RelayEngine::new();
        engine.create_loopback_authority().unwrap();
        assert!(matches!(
            engine.create_loopback_authority(),
            Err(RelayError::AlreadyInitialized)
        ));
        assert!(matches!(engine.create_authority(0), Err(RelayError::AlreadyInitialized)));
        assert!(matches!(
            engine.connect_to_authority(1, "127.0.0.1"),
            Err(RelayError::AlreadyInitialized)
        ));
    }

    #[test]
    fn failed_listen_leaves_engine_uninitialized() {
        let mut first = RelayEngine::with_config(local_config());
        first.create_authority(0).unwrap();
        let port = first.local_addr().unwrap().port();

        let mut second = RelayEngine::with_config(local_config());
        assert!(matches!(second.create_authority(port), Err(RelayError::Listen { .. })));
        assert_eq!(second.role(), Role::Uninitialized);
        assert!(second.loopback().is_none());
        second.create_loopback_authority().unwrap();
    }

    #[test]
    fn failed_connect_leaves_engine_uninitialized() {
        // Grab a free port, then close it so nothing is listening there.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut engine = RelayEngine::new();
        assert!(matches!(
            engine.connect_to_authority(port, "127.0.0.1"),
            Err(RelayError::Connect { .. })
        ));
        assert_eq!(engine.role(), Role::Uninitialized);
    }

    #[test]
    fn oversized_payload_rejected() {
        let mut engine = RelayEngine::new();
        let authority = engine.create_loopback_authority().unwrap();
        let loopback = engine.loopback().unwrap();
        let big = vec![1u8; 254];
        assert!(matches!(loopback.send_to_authority(&big), Err(RelayError::Frame(_))));
        assert!(matches!(authority.send_broadcast(&big), Err(RelayError::Frame(_))));
        assert!(authority.try_pull_message().is_none());
        loopback.send_to_authority(&big[..253]).unwrap();
        assert_eq!(authority.try_pull_message().unwrap().1.len(), 253);
    }

    #[test]
    fn authority_resolves_loopback_sender() {
        let mut engine = RelayEngine::new();
        let authority = engine.create_loopback_authority().unwrap();
        engine.loopback().unwrap().send_to_authority(b"ping").unwrap();

        let (sender, _) = authority.try_pull_message().unwrap();
        let participant = match sender {
            Sender::Known(p) => p,
            Sender::Unknown(id) => panic!("sender {id} should resolve"),
        };
        assert_eq!(participant.kind(), ParticipantKind::Loopback);

        authority.send_to(&participant, b"pong").unwrap();
        assert_eq!(engine.loopback().unwrap().try_pull_from_authority().unwrap().as_bytes(), b"pong");
        assert_eq!(authority.participants().len(), 1);
        assert!(authority.participant(ParticipantId(2)).is_none());
    }

    #[test]
    fn shutdown_joins_worker_and_closes() {
        let mut engine = RelayEngine::with_config(local_config());
        let authority = engine.create_authority(0).unwrap();
        let start = Instant::now();
        engine.shutdown();
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(engine.role(), Role::Closed);

        // An authority keeps routing in memory after its worker stops.
        engine.loopback().unwrap().send_to_authority(b"still here").unwrap();
        assert!(authority.try_pull_message().is_some());
        engine.shutdown();
    }

    #[test]
    fn peer_sends_fail_after_shutdown() {
        let mut hub = RelayEngine::with_config(local_config());
        hub.create_authority(0).unwrap();
        let addr = hub.local_addr().unwrap();

        let mut peer = RelayEngine::new();
        let loopback = peer.connect_to_authority(addr.port(), "127.0.0.1").unwrap();
        loopback.send_to_authority(b"queued").unwrap();
        peer.shutdown();

        assert_eq!(peer.role(), Role::Closed);
        assert!(matches!(loopback.send_to_authority(b"lost"), Err(RelayError::Closed)));
        assert!(matches!(loopback.send_broadcast(b"lost"), Err(RelayError::Closed)));
        // Oversized payloads still report the size problem first.
        assert!(matches!(loopback.send_broadcast(&[0u8; 254]), Err(RelayError::Frame(_))));
    }
}
