// Routing state for one relay engine.
//
// `Session` holds every buffer the application thread and the worker thread
// share: the authority inbox, the loopback participant's queues, the table of
// remote participants, and the join/leave event queue. It has no internal
// locking. The engine wraps it in a single `parking_lot::Mutex` and every
// caller (handles on the application side, `server.rs` / `client.rs` on the
// worker side) takes that lock around a whole routing step, so appending a
// frame to one queue and removing one from another is atomic as seen from
// any pull.
//
// Routing on the authority side:
// - loopback -> authority:   authority inbox, tagged with the loopback id.
// - loopback broadcast:      every remote.
// - remote N -> authority:   authority inbox, tagged N.
// - remote N broadcast:      loopback general inbox + every remote except N.
// - authority broadcast:     loopback authority inbox + every remote.
// - authority -> one target: that target only.
//
// "Every remote" means the frame is appended both to the remote's inbox
// (so the authority side can see what each peer was sent) and to its outbox,
// which the worker drains onto that peer's socket.
//
// Nothing obliges the application to drain a remote's mirror inbox or the
// loopback's general inbox, so both are `BoundedInbox`es: past the
// configured byte limit the oldest frames are discarded.
//
// On the peer side there is only the loopback participant. Its sends are
// queued in its outbox tagged with the wire destination; frames from the
// authority land in the authority inbox (origin 0) or the general inbox
// (origin another peer).
//
// No socket I/O ever happens here, so a loopback-only authority exercises
// exactly the same code as a networked one.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use hubnet_protocol::{
    AUTHORITY_ID, AUTHORITY_LOOPBACK_ID, BROADCAST_TAG, Frame, FrameBuffer, MAX_FRAME_LEN, Packet,
    ParticipantId, check_payload_len,
};
use parking_lot::Mutex;
use tracing::warn;

use crate::config::DEFAULT_INBOX_LIMIT;
use crate::error::RelayError;

/// The session behind the engine-wide lock.
pub(crate) type SharedSession = Arc<Mutex<Session>>;

/// Lifecycle state of a relay engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Uninitialized,
    /// Authority with a listening socket and a worker thread.
    AuthorityListening,
    /// Authority with no transport at all.
    LoopbackAuthority,
    /// Connected to an authority, waiting for the id handshake.
    PeerConnecting,
    PeerConnected,
    /// Engine shut down, or the peer's connection dropped.
    Closed,
}

impl Role {
    pub fn is_authority(self) -> bool {
        matches!(self, Role::AuthorityListening | Role::LoopbackAuthority)
    }

    pub fn is_peer(self) -> bool {
        matches!(self, Role::PeerConnecting | Role::PeerConnected)
    }
}

/// Which kind of participant an id names.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParticipantKind {
    /// This process's own endpoint.
    Loopback,
    /// Authority-side proxy for a connected peer.
    Remote,
}

/// Membership changes observed by the authority.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayEvent {
    Joined(ParticipantId),
    Left(ParticipantId),
}

/// Frame queue that drops its oldest frames once it holds more than
/// `limit` bytes. The newest frame is always kept.
struct BoundedInbox {
    frames: FrameBuffer,
    limit: usize,
    overflowing: bool,
}

impl BoundedInbox {
    fn new(limit: usize) -> Self {
        Self {
            frames: FrameBuffer::new(),
            limit: limit.max(MAX_FRAME_LEN),
            overflowing: false,
        }
    }

    fn push(&mut self, owner: ParticipantId, sender: ParticipantId, payload: &[u8]) -> Result<(), RelayError> {
        self.frames.push_frame(sender, payload)?;
        let mut dropped = 0usize;
        while self.frames.len() > self.limit && pop_trusted(&mut self.frames).is_some() {
            dropped += 1;
        }
        // One warning per overflow episode.
        if dropped > 0 && !self.overflowing {
            warn!(participant = %owner, limit = self.limit, "inbox full, dropping oldest frames");
        }
        self.overflowing = dropped > 0;
        Ok(())
    }

    fn pop(&mut self) -> Option<Frame> {
        pop_trusted(&mut self.frames)
    }

    /// Unread bytes.
    fn len(&self) -> usize {
        self.frames.len()
    }
}

struct LoopbackState {
    id: ParticipantId,
    /// Broadcasts from other participants.
    inbox: BoundedInbox,
    /// Frames the authority sent to this participant.
    authority_inbox: FrameBuffer,
    /// Peer side only: frames waiting for the socket.
    outbox: FrameBuffer,
}

impl LoopbackState {
    fn new(id: ParticipantId, inbox_limit: usize) -> Self {
        Self {
            id,
            inbox: BoundedInbox::new(inbox_limit),
            authority_inbox: FrameBuffer::new(),
            outbox: FrameBuffer::new(),
        }
    }
}

struct RemoteState {
    /// Mirror of what was relayed to this peer.
    inbox: BoundedInbox,
    outbox: FrameBuffer,
}

impl RemoteState {
    fn new(inbox_limit: usize) -> Self {
        Self {
            inbox: BoundedInbox::new(inbox_limit),
            outbox: FrameBuffer::new(),
        }
    }

    fn deliver(&mut self, id: ParticipantId, sender: ParticipantId, payload: &[u8]) -> Result<(), RelayError> {
        self.outbox.push_frame(sender, payload)?;
        self.inbox.push(id, sender, payload)
    }
}

/// All queues and the routing table of one engine.
pub struct Session {
    role: Role,
    authority_inbox: Option<FrameBuffer>,
    loopback: Option<LoopbackState>,
    remotes: BTreeMap<ParticipantId, RemoteState>,
    next_remote_id: Option<ParticipantId>,
    events: VecDeque<RelayEvent>,
    inbox_limit: usize,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self::with_inbox_limit(DEFAULT_INBOX_LIMIT)
    }

    /// `inbox_limit` caps, in bytes, each remote mirror inbox and the
    /// loopback's general inbox.
    pub fn with_inbox_limit(inbox_limit: usize) -> Self {
        Self {
            role: Role::Uninitialized,
            authority_inbox: None,
            loopback: None,
            remotes: BTreeMap::new(),
            next_remote_id: None,
            events: VecDeque::new(),
            inbox_limit,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Become an authority (`AuthorityListening` or `LoopbackAuthority`).
    /// Creates the authority inbox and the loopback participant (id 1).
    pub fn init_authority(&mut self, role: Role) -> Result<(), RelayError> {
        if self.role != Role::Uninitialized {
            return Err(RelayError::AlreadyInitialized);
        }
        debug_assert!(role.is_authority());
        self.role = role;
        self.authority_inbox = Some(FrameBuffer::new());
        self.loopback = Some(LoopbackState::new(AUTHORITY_LOOPBACK_ID, self.inbox_limit));
        self.next_remote_id = AUTHORITY_LOOPBACK_ID.next();
        Ok(())
    }

    /// Become a peer. The loopback id stays 0 until the handshake.
    pub fn init_peer(&mut self) -> Result<(), RelayError> {
        if self.role != Role::Uninitialized {
            return Err(RelayError::AlreadyInitialized);
        }
        self.role = Role::PeerConnecting;
        self.loopback = Some(LoopbackState::new(AUTHORITY_ID, self.inbox_limit));
        Ok(())
    }

    /// Record the id the authority assigned us.
    pub fn complete_handshake(&mut self, id: ParticipantId) {
        if let Some(loopback) = self.loopback.as_mut() {
            loopback.id = id;
        }
        if self.role == Role::PeerConnecting {
            self.role = Role::PeerConnected;
        }
    }

    pub fn close(&mut self) {
        self.role = Role::Closed;
    }

    pub fn loopback_id(&self) -> Option<ParticipantId> {
        self.loopback.as_ref().map(|l| l.id)
    }

    // --- Routing table ---

    /// Allocate the next id for a freshly accepted connection.
    pub fn register_remote(&mut self) -> Result<ParticipantId, RelayError> {
        let id = self.next_remote_id.ok_or(RelayError::IdsExhausted)?;
        self.next_remote_id = id.next();
        self.remotes.insert(id, RemoteState::new(self.inbox_limit));
        self.events.push_back(RelayEvent::Joined(id));
        Ok(id)
    }

    /// Forget a departed peer and its queues. Returns false if it was
    /// already gone.
    pub fn remove_remote(&mut self, id: ParticipantId) -> bool {
        if self.remotes.remove(&id).is_some() {
            self.events.push_back(RelayEvent::Left(id));
            true
        } else {
            false
        }
    }

    /// Resolve a live id. The authority itself is not a participant.
    pub fn resolve(&self, id: ParticipantId) -> Option<ParticipantKind> {
        if self.authority_inbox.is_some() && self.loopback_id() == Some(id) {
            Some(ParticipantKind::Loopback)
        } else if self.remotes.contains_key(&id) {
            Some(ParticipantKind::Remote)
        } else {
            None
        }
    }

    /// Every live participant id on the authority side, ascending.
    pub fn participant_ids(&self) -> Vec<ParticipantId> {
        let mut ids: Vec<ParticipantId> = Vec::with_capacity(self.remotes.len() + 1);
        if self.authority_inbox.is_some() {
            ids.extend(self.loopback_id());
        }
        ids.extend(self.remotes.keys().copied());
        ids
    }

    pub fn remote_count(&self) -> usize {
        self.remotes.len()
    }

    // --- Sends ---

    /// Loopback participant -> authority.
    pub fn loopback_to_authority(&mut self, payload: &[u8]) -> Result<(), RelayError> {
        check_payload_len(payload.len())?;
        self.ensure_peer_open()?;
        let loopback = self.loopback.as_mut().ok_or(RelayError::NotInitialized)?;
        match self.authority_inbox.as_mut() {
            Some(inbox) => inbox.push_frame(loopback.id, payload)?,
            None => loopback.outbox.push_frame(AUTHORITY_ID, payload)?,
        }
        Ok(())
    }

    /// Loopback participant -> everyone else.
    pub fn loopback_broadcast(&mut self, payload: &[u8]) -> Result<(), RelayError> {
        check_payload_len(payload.len())?;
        self.ensure_peer_open()?;
        let loopback = self.loopback.as_mut().ok_or(RelayError::NotInitialized)?;
        if self.authority_inbox.is_none() {
            loopback.outbox.push_frame(ParticipantId(BROADCAST_TAG), payload)?;
            return Ok(());
        }
        let sender = loopback.id;
        self.fan_out(sender, payload)
    }

    /// A closed peer has no socket left to drain its outbox. A closed
    /// authority still routes in memory.
    fn ensure_peer_open(&self) -> Result<(), RelayError> {
        if self.role == Role::Closed && self.authority_inbox.is_none() {
            return Err(RelayError::Closed);
        }
        Ok(())
    }

    /// Authority -> every participant.
    pub fn authority_broadcast(&mut self, payload: &[u8]) -> Result<(), RelayError> {
        check_payload_len(payload.len())?;
        if self.authority_inbox.is_none() {
            return Err(RelayError::NotInitialized);
        }
        if let Some(loopback) = self.loopback.as_mut() {
            loopback.authority_inbox.push_frame(AUTHORITY_ID, payload)?;
        }
        for (id, remote) in self.remotes.iter_mut() {
            remote.deliver(*id, AUTHORITY_ID, payload)?;
        }
        Ok(())
    }

    /// Authority -> one participant.
    pub fn authority_send_to(&mut self, target: ParticipantId, payload: &[u8]) -> Result<(), RelayError> {
        check_payload_len(payload.len())?;
        if self.authority_inbox.is_none() {
            return Err(RelayError::NotInitialized);
        }
        match self.resolve(target) {
            Some(ParticipantKind::Loopback) => {
                if let Some(loopback) = self.loopback.as_mut() {
                    loopback.authority_inbox.push_frame(AUTHORITY_ID, payload)?;
                }
            }
            Some(ParticipantKind::Remote) => {
                if let Some(remote) = self.remotes.get_mut(&target) {
                    remote.deliver(target, AUTHORITY_ID, payload)?;
                }
            }
            None => return Err(RelayError::UnknownParticipant(target)),
        }
        Ok(())
    }

    /// Route a frame read from remote `sender`'s connection. Byte 1 of the
    /// frame is the destination: the authority, or anything else for a
    /// broadcast.
    pub fn route_from_remote(&mut self, sender: ParticipantId, frame: &Frame) -> Result<(), RelayError> {
        let payload = frame.payload.as_bytes();
        if frame.sender.is_authority() {
            let inbox = self.authority_inbox.as_mut().ok_or(RelayError::NotInitialized)?;
            inbox.push_frame(sender, payload)?;
            Ok(())
        } else {
            self.fan_out(sender, payload)
        }
    }

    /// Route a frame the authority sent down to this peer.
    pub fn route_from_authority(&mut self, frame: &Frame) -> Result<(), RelayError> {
        let loopback = self.loopback.as_mut().ok_or(RelayError::NotInitialized)?;
        let payload = frame.payload.as_bytes();
        if frame.sender.is_authority() {
            loopback.authority_inbox.push_frame(frame.sender, payload)?;
        } else {
            loopback.inbox.push(loopback.id, frame.sender, payload)?;
        }
        Ok(())
    }

    /// Deliver a broadcast from `sender` to every participant but `sender`.
    fn fan_out(&mut self, sender: ParticipantId, payload: &[u8]) -> Result<(), RelayError> {
        if let Some(loopback) = self.loopback.as_mut().filter(|l| l.id != sender) {
            loopback.inbox.push(loopback.id, sender, payload)?;
        }
        for (id, remote) in self.remotes.iter_mut() {
            if *id != sender {
                remote.deliver(*id, sender, payload)?;
            }
        }
        Ok(())
    }

    // --- Pulls ---

    pub fn pull_authority(&mut self) -> Option<(ParticipantId, Packet)> {
        let frame = pop_trusted(self.authority_inbox.as_mut()?)?;
        Some((frame.sender, frame.payload))
    }

    /// Next broadcast for the loopback, with its origin.
    pub fn pull_loopback(&mut self) -> Option<Frame> {
        self.loopback.as_mut()?.inbox.pop()
    }

    pub fn pull_loopback_from_authority(&mut self) -> Option<Packet> {
        pop_trusted(&mut self.loopback.as_mut()?.authority_inbox).map(|f| f.payload)
    }

    pub fn pull_remote(&mut self, id: ParticipantId) -> Option<Packet> {
        self.remotes.get_mut(&id)?.inbox.pop().map(|f| f.payload)
    }

    /// Unread bytes in the loopback's general inbox and in every remote
    /// mirror.
    pub fn retained_bytes(&self) -> usize {
        let loopback = self.loopback.as_ref().map_or(0, |l| l.inbox.len());
        loopback + self.remotes.values().map(|r| r.inbox.len()).sum::<usize>()
    }

    pub fn pull_event(&mut self) -> Option<RelayEvent> {
        self.events.pop_front()
    }

    // --- Worker-side draining ---

    /// Whole frames queued for remote `id`'s socket.
    pub fn take_remote_outbox(&mut self, id: ParticipantId) -> Vec<u8> {
        self.remotes
            .get_mut(&id)
            .map(|r| r.outbox.take_complete())
            .unwrap_or_default()
    }

    /// Whole frames the peer-side loopback queued for the authority.
    pub fn take_loopback_outbox(&mut self) -> Vec<u8> {
        self.loopback
            .as_mut()
            .map(|l| l.outbox.take_complete())
            .unwrap_or_default()
    }
}

/// Pop from a queue that only ever receives frames via `push_frame`, so its
/// length bytes are always valid.
fn pop_trusted(buf: &mut FrameBuffer) -> Option<Frame> {
    buf.pop_frame().ok().flatten()
}
