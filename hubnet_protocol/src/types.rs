// Participant identifiers for the relay protocol.
//
// Ids are a single byte because they travel in byte 1 of every frame. The
// authority owns id 0; the authority-side loopback participant is 1; remote
// peers are numbered from 2 upward in connection order and never reused
// while an engine is alive. 255 is not an id at all: peers use it on the
// wire to mark a frame as a broadcast (see `framing.rs`).

use std::fmt;

use serde::{Deserialize, Serialize};

/// Relay-assigned participant id (one byte on the wire).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParticipantId(pub u8);

/// The routing hub. Frames a peer tags with this id are addressed to the
/// authority; frames the authority sends carry it as their origin.
pub const AUTHORITY_ID: ParticipantId = ParticipantId(0);

/// Id of the loopback participant on the authority side.
pub const AUTHORITY_LOOPBACK_ID: ParticipantId = ParticipantId(1);

/// Peer-side destination tag meaning "everyone except me". The authority
/// rewrites it to the peer's true id before forwarding.
pub const BROADCAST_TAG: u8 = u8::MAX;

/// Highest id the authority will hand out.
pub const MAX_PARTICIPANT_ID: ParticipantId = ParticipantId(BROADCAST_TAG - 1);

impl ParticipantId {
    pub fn is_authority(self) -> bool {
        self == AUTHORITY_ID
    }

    /// The id after this one, or `None` once the id space is used up.
    pub fn next(self) -> Option<ParticipantId> {
        if self >= MAX_PARTICIPANT_ID {
            None
        } else {
            Some(ParticipantId(self.0 + 1))
        }
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u8> for ParticipantId {
    fn from(raw: u8) -> Self {
        ParticipantId(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_stops_before_broadcast_tag() {
        assert_eq!(ParticipantId(2).next(), Some(ParticipantId(3)));
        assert_eq!(ParticipantId(253).next(), Some(MAX_PARTICIPANT_ID));
        assert_eq!(MAX_PARTICIPANT_ID.next(), None);
    }

    #[test]
    fn display_uses_hash_prefix() {
        assert_eq!(ParticipantId(7).to_string(), "#7");
    }

    #[test]
    fn serializes_as_plain_number() {
        let json = serde_json::to_string(&ParticipantId(42)).unwrap();
        assert_eq!(json, "42");
    }
}
