// hubnet_protocol — wire framing for the hubnet star relay.
//
// This crate defines the pieces of the protocol that both ends of a
// connection share: participant ids, the opaque `Packet` payload, and the
// one-byte length-prefixed frame codec. It has no networking and no threads;
// the relay engine (`hubnet_relay`) builds on it.
//
// Module overview:
// - `types.rs`:    `ParticipantId` and the reserved ids/tags.
// - `packet.rs`:   `Packet`, an owned copy of one frame's payload.
// - `framing.rs`:  `encode` / `decode_next` and `FrameBuffer`, the cursor-based
//                  reassembly buffer used for every queue in the relay.
// - `error.rs`:    `FrameError`.

pub mod error;
pub mod framing;
pub mod packet;
pub mod types;

pub use error::FrameError;
pub use framing::{
    Frame, FrameBuffer, HEADER_LEN, MAX_FRAME_LEN, MAX_PAYLOAD_LEN, check_payload_len, decode_next,
    encode, encode_into,
};
pub use packet::Packet;
pub use types::{AUTHORITY_ID, AUTHORITY_LOOPBACK_ID, BROADCAST_TAG, MAX_PARTICIPANT_ID, ParticipantId};
