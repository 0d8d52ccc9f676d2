// Application-facing handles.
//
// The engine owns all state (see `session.rs`); these handles are cheap,
// cloneable views that take the engine-wide lock for exactly one routing or
// pull step and release it before returning.
//
// - `Loopback`:    this process's own endpoint. Exists on both authority and
//                  peer sides and behaves identically with or without a
//                  socket behind it.
// - `Participant`: a participant as seen by the authority (the loopback, or
//                  a remote peer's proxy), with the common pull contract.
// - `Authority`:   the routing hub, id 0.
//
// Handles stay valid after the engine shuts down; queued frames can still be
// pulled, nothing new arrives.

use hubnet_protocol::{AUTHORITY_ID, Packet, ParticipantId};

use crate::error::RelayError;
use crate::session::{ParticipantKind, RelayEvent, SharedSession};

/// The local process's endpoint.
#[derive(Clone)]
pub struct Loopback {
    session: SharedSession,
}

impl Loopback {
    pub(crate) fn new(session: SharedSession) -> Self {
        Self { session }
    }

    /// Our participant id. On the peer side this reads 0 until the
    /// authority's handshake has arrived.
    pub fn id(&self) -> ParticipantId {
        self.session.lock().loopback_id().unwrap_or(AUTHORITY_ID)
    }

    /// Next broadcast from another participant, if any.
    pub fn try_pull_message(&self) -> Option<Packet> {
        self.session.lock().pull_loopback().map(|f| f.payload)
    }

    /// Like `try_pull_message`, but also returns the broadcaster's id.
    pub fn try_pull_with_sender(&self) -> Option<(ParticipantId, Packet)> {
        self.session.lock().pull_loopback().map(|f| (f.sender, f.payload))
    }

    /// Next frame the authority addressed to us, if any.
    pub fn try_pull_from_authority(&self) -> Option<Packet> {
        self.session.lock().pull_loopback_from_authority()
    }

    /// Send to every other participant.
    pub fn send_broadcast(&self, payload: &[u8]) -> Result<(), RelayError> {
        self.session.lock().loopback_broadcast(payload)
    }

    /// Send to the authority.
    pub fn send_to_authority(&self, payload: &[u8]) -> Result<(), RelayError> {
        self.session.lock().loopback_to_authority(payload)
    }
}

/// A participant known to the authority.
#[derive(Clone)]
pub struct Participant {
    session: SharedSession,
    id: ParticipantId,
    kind: ParticipantKind,
}

impl Participant {
    pub fn id(&self) -> ParticipantId {
        self.id
    }

    pub fn kind(&self) -> ParticipantKind {
        self.kind
    }

    /// False once a remote peer has disconnected.
    pub fn is_connected(&self) -> bool {
        self.session.lock().resolve(self.id).is_some()
    }

    /// Next frame delivered to this participant. For the loopback these are
    /// broadcasts from peers; for a remote, everything relayed to that peer.
    pub fn try_pull_message(&self) -> Option<Packet> {
        let mut session = self.session.lock();
        match self.kind {
            ParticipantKind::Loopback => session.pull_loopback().map(|f| f.payload),
            ParticipantKind::Remote => session.pull_remote(self.id),
        }
    }
}

impl std::fmt::Debug for Participant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Participant")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Origin of a frame pulled by the authority.
#[derive(Debug, Clone)]
pub enum Sender {
    Known(Participant),
    /// The sender disconnected before the frame was pulled.
    Unknown(ParticipantId),
}

impl Sender {
    pub fn id(&self) -> ParticipantId {
        match self {
            Sender::Known(p) => p.id(),
            Sender::Unknown(id) => *id,
        }
    }

    pub fn participant(&self) -> Option<&Participant> {
        match self {
            Sender::Known(p) => Some(p),
            Sender::Unknown(_) => None,
        }
    }
}

/// The routing hub.
#[derive(Clone)]
pub struct Authority {
    session: SharedSession,
}

impl Authority {
    pub(crate) fn new(session: SharedSession) -> Self {
        Self { session }
    }

    pub fn id(&self) -> ParticipantId {
        AUTHORITY_ID
    }

    /// Next frame addressed to the authority, with its sender resolved
    /// against the live participants.
    pub fn try_pull_message(&self) -> Option<(Sender, Packet)> {
        let mut session = self.session.lock();
        let (id, packet) = session.pull_authority()?;
        let sender = match session.resolve(id) {
            Some(kind) => Sender::Known(Participant {
                session: self.session.clone(),
                id,
                kind,
            }),
            None => Sender::Unknown(id),
        };
        Some((sender, packet))
    }

    /// Send to every participant, the loopback included.
    pub fn send_broadcast(&self, payload: &[u8]) -> Result<(), RelayError> {
        self.session.lock().authority_broadcast(payload)
    }

    /// Send to one participant.
    pub fn send_to(&self, participant: &Participant, payload: &[u8]) -> Result<(), RelayError> {
        self.session.lock().authority_send_to(participant.id, payload)
    }

    /// Next join/leave notification.
    pub fn try_pull_event(&self) -> Option<RelayEvent> {
        self.session.lock().pull_event()
    }

    /// Handle for a live participant.
    pub fn participant(&self, id: ParticipantId) -> Option<Participant> {
        let kind = self.session.lock().resolve(id)?;
        Some(Participant {
            session: self.session.clone(),
            id,
            kind,
        })
    }

    /// Every live participant, loopback first.
    pub fn participants(&self) -> Vec<Participant> {
        let session = self.session.lock();
        session
            .participant_ids()
            .into_iter()
            .filter_map(|id| {
                session.resolve(id).map(|kind| Participant {
                    session: self.session.clone(),
                    id,
                    kind,
                })
            })
            .collect()
    }

    /// Unread bytes held for the loopback and the remote mirrors. Bounded
    /// by `RelayConfig::inbox_limit` per inbox.
    pub fn retained_bytes(&self) -> usize {
        self.session.lock().retained_bytes()
    }

    /// Number of connected remote peers.
    pub fn peer_count(&self) -> usize {
        self.session.lock().remote_count()
    }
}
