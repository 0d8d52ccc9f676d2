// Test harness for end-to-end relay tests.
//
// Wraps real `RelayEngine` instances (an authority listening on localhost and
// peers connected to it) with blocking poll helpers, so tests can be written
// as straight-line send/expect sequences. The only test-specific code here
// is the polling: every send and pull goes through the same engine API an
// application would use.

use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use hubnet_protocol::{AUTHORITY_ID, Packet, ParticipantId};
use hubnet_relay::{Authority, Loopback, RelayConfig, RelayEngine, RelayEvent, Role, Sender};

/// Default timeout for blocking poll operations.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Sleep duration between poll attempts.
pub const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// How long `expect_silence` waits before concluding nothing is coming.
pub const QUIET_PERIOD: Duration = Duration::from_millis(100);

/// Call `f` until it yields something. Panics after `POLL_TIMEOUT`.
pub fn poll_until<R>(what: &str, mut f: impl FnMut() -> Option<R>) -> R {
    let start = Instant::now();
    loop {
        if let Some(r) = f() {
            return r;
        }
        assert!(start.elapsed() < POLL_TIMEOUT, "timed out waiting for {what}");
        thread::sleep(POLL_INTERVAL);
    }
}

/// Assert that `f` yields nothing for `QUIET_PERIOD`.
pub fn expect_silence<R: std::fmt::Debug>(what: &str, mut f: impl FnMut() -> Option<R>) {
    let start = Instant::now();
    while start.elapsed() < QUIET_PERIOD {
        if let Some(r) = f() {
            panic!("{what}: unexpected {r:?}");
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn localhost_config() -> RelayConfig {
    RelayConfig {
        bind_host: Some("127.0.0.1".into()),
        ..RelayConfig::default()
    }
}

/// A listening authority on an OS-assigned localhost port.
pub struct TestAuthority {
    pub engine: RelayEngine,
    pub authority: Authority,
    pub addr: SocketAddr,
}

impl TestAuthority {
    pub fn start() -> Self {
        Self::start_with(localhost_config())
    }

    /// Start with `config`, forcing a localhost bind.
    pub fn start_with(config: RelayConfig) -> Self {
        let config = RelayConfig {
            bind_host: Some("127.0.0.1".into()),
            ..config
        };
        let mut engine = RelayEngine::with_config(config);
        let authority = engine.create_authority(0).expect("create_authority failed");
        let addr = engine.local_addr().expect("listening authority has an address");
        Self {
            engine,
            authority,
            addr,
        }
    }

    /// The authority-side loopback participant.
    pub fn loopback(&self) -> Loopback {
        self.engine.loopback().expect("authority has a loopback")
    }

    /// Block until the next frame addressed to the authority.
    pub fn pull(&self) -> (Sender, Packet) {
        poll_until("authority frame", || self.authority.try_pull_message())
    }

    /// Block until the next join/leave event.
    pub fn next_event(&self) -> RelayEvent {
        poll_until("relay event", || self.authority.try_pull_event())
    }
}

/// A peer engine connected to a `TestAuthority`.
pub struct TestPeer {
    pub engine: RelayEngine,
    pub loopback: Loopback,
}

impl TestPeer {
    /// Connect and wait for the id handshake.
    pub fn connect(addr: SocketAddr) -> Self {
        let mut engine = RelayEngine::new();
        let loopback = engine
            .connect_to_authority(addr.port(), &addr.ip().to_string())
            .expect("connect_to_authority failed");
        poll_until("handshake", || {
            (engine.role() == Role::PeerConnected).then_some(())
        });
        Self { engine, loopback }
    }

    pub fn id(&self) -> ParticipantId {
        let id = self.loopback.id();
        assert_ne!(id, AUTHORITY_ID, "handshake not complete");
        id
    }

    pub fn send_broadcast(&self, payload: &[u8]) {
        self.loopback.send_broadcast(payload).expect("send_broadcast failed");
    }

    pub fn send_to_authority(&self, payload: &[u8]) {
        self.loopback
            .send_to_authority(payload)
            .expect("send_to_authority failed");
    }

    /// Block until the next broadcast from another participant.
    pub fn pull(&self) -> Packet {
        poll_until("peer broadcast", || self.loopback.try_pull_message())
    }

    /// Like `pull`, also returning the broadcaster's id.
    pub fn pull_with_sender(&self) -> (ParticipantId, Packet) {
        poll_until("peer broadcast", || self.loopback.try_pull_with_sender())
    }

    /// Block until the next frame from the authority.
    pub fn pull_from_authority(&self) -> Packet {
        poll_until("authority reply", || self.loopback.try_pull_from_authority())
    }

    /// Drop the connection.
    pub fn disconnect(mut self) {
        self.engine.shutdown();
    }
}
