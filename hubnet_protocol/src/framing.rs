// One-byte length-prefixed framing.
//
// Wire layout of a frame:
//
//   byte 0        total frame length, 2..=255, counting bytes 0 and 1
//   byte 1        sender id (or, peer -> authority, a destination tag)
//   bytes 2..len  payload
//
// The length field is a single byte, so a payload is capped at
// `MAX_PAYLOAD_LEN` (253) bytes. `encode` rejects anything larger instead of
// truncating it.
//
// `FrameBuffer` is the reassembly buffer used everywhere the relay queues
// frame bytes: participant inboxes, outboxes and per-connection receive
// buffers. Bytes are appended at the back; frames are decoded from a read
// cursor at the front and returned as owned copies, so callers never hold
// references into the buffer while it is being spliced. A trailing partial
// frame simply stays put until the rest of it arrives.

use crate::error::FrameError;
use crate::packet::Packet;
use crate::types::ParticipantId;

/// Length byte + sender byte.
pub const HEADER_LEN: usize = 2;

/// Largest frame the length byte can describe.
pub const MAX_FRAME_LEN: usize = u8::MAX as usize;

/// Largest payload that fits in one frame.
pub const MAX_PAYLOAD_LEN: usize = MAX_FRAME_LEN - HEADER_LEN;

/// Consumed bytes are only shifted out once this many have piled up in front
/// of the cursor (or the buffer drains completely).
const COMPACT_THRESHOLD: usize = 4096;

/// One decoded frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub sender: ParticipantId,
    pub payload: Packet,
}

/// Fail early if `len` payload bytes can't be framed.
pub fn check_payload_len(len: usize) -> Result<(), FrameError> {
    if len > MAX_PAYLOAD_LEN {
        return Err(FrameError::PayloadTooLarge { len });
    }
    Ok(())
}

/// Encode a frame: `[payload.len() + 2, sender, payload...]`.
pub fn encode(sender: ParticipantId, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut out = Vec::with_capacity(payload.len() + HEADER_LEN);
    encode_into(&mut out, sender, payload)?;
    Ok(out)
}

/// Append an encoded frame to `out`. `out` is untouched on error.
pub fn encode_into(out: &mut Vec<u8>, sender: ParticipantId, payload: &[u8]) -> Result<(), FrameError> {
    check_payload_len(payload.len())?;
    let len = u8::try_from(payload.len() + HEADER_LEN)
        .map_err(|_| FrameError::PayloadTooLarge { len: payload.len() })?;
    out.push(len);
    out.push(sender.0);
    out.extend_from_slice(payload);
    Ok(())
}

/// Decode the frame at the front of `buf`.
///
/// Returns `Ok(None)` if fewer than two bytes are buffered or the frame is
/// not complete yet. On success, also returns how many bytes to drop from the
/// front. Never looks past the frame's own length.
pub fn decode_next(buf: &[u8]) -> Result<Option<(Frame, usize)>, FrameError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let len = buf[0];
    let frame_len = usize::from(len);
    if frame_len < HEADER_LEN {
        return Err(FrameError::InvalidLength(len));
    }
    if buf.len() < frame_len {
        return Ok(None);
    }
    let frame = Frame {
        sender: ParticipantId(buf[1]),
        payload: Packet::from_bytes(&buf[HEADER_LEN..frame_len]),
    };
    Ok(Some((frame, frame_len)))
}

/// Append-only byte queue holding zero or more complete frames followed by at
/// most one partial frame.
#[derive(Clone, Debug, Default)]
pub struct FrameBuffer {
    bytes: Vec<u8>,
    cursor: usize,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of unconsumed bytes.
    pub fn len(&self) -> usize {
        self.bytes.len() - self.cursor
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unconsumed bytes, front first.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[self.cursor..]
    }

    /// Append raw stream bytes (may end mid-frame).
    pub fn extend(&mut self, data: &[u8]) {
        self.bytes.extend_from_slice(data);
    }

    /// Encode and append one whole frame.
    pub fn push_frame(&mut self, sender: ParticipantId, payload: &[u8]) -> Result<(), FrameError> {
        encode_into(&mut self.bytes, sender, payload)
    }

    /// Decode and remove the frame at the front. On `Ok(None)` the buffer is
    /// unchanged.
    pub fn pop_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        match decode_next(self.as_slice())? {
            Some((frame, used)) => {
                self.cursor += used;
                self.compact();
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }

    /// Remove and return the raw bytes of every complete frame at the front,
    /// leaving a trailing partial frame (or a bad length byte) queued.
    pub fn take_complete(&mut self) -> Vec<u8> {
        let pending = self.as_slice();
        let mut end = 0;
        while pending.len() - end >= HEADER_LEN {
            let frame_len = usize::from(pending[end]);
            if frame_len < HEADER_LEN || pending.len() - end < frame_len {
                break;
            }
            end += frame_len;
        }
        let taken = pending[..end].to_vec();
        self.cursor += end;
        self.compact();
        taken
    }

    fn compact(&mut self) {
        if self.cursor == self.bytes.len() {
            self.bytes.clear();
            self.cursor = 0;
        } else if self.cursor >= COMPACT_THRESHOLD {
            self.bytes.drain(..self.cursor);
            self.cursor = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn encode_layout() {
        let bytes = encode(ParticipantId(3), b"abc").unwrap();
        assert_eq!(bytes, vec![5, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn encode_empty_payload() {
        let bytes = encode(ParticipantId(1), b"").unwrap();
        assert_eq!(bytes, vec![2, 1]);
        let (frame, used) = decode_next(&bytes).unwrap().unwrap();
        assert_eq!(used, 2);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn encode_max_payload() {
        let payload = vec![7u8; MAX_PAYLOAD_LEN];
        let bytes = encode(ParticipantId(2), &payload).unwrap();
        assert_eq!(bytes.len(), MAX_FRAME_LEN);
        assert_eq!(bytes[0], 255);
    }

    #[test]
    fn rejects_oversized_payload() {
        let payload = vec![0u8; MAX_PAYLOAD_LEN + 1];
        let err = encode(ParticipantId(2), &payload).unwrap_err();
        assert_eq!(err, FrameError::PayloadTooLarge { len: 254 });

        let mut out = vec![9];
        assert!(encode_into(&mut out, ParticipantId(2), &payload).is_err());
        assert_eq!(out, vec![9], "failed encode must not leave partial bytes");
    }

    #[test]
    fn decode_needs_header() {
        assert_eq!(decode_next(&[]).unwrap(), None);
        assert_eq!(decode_next(&[5]).unwrap(), None);
    }

    #[test]
    fn decode_waits_for_whole_frame() {
        assert_eq!(decode_next(&[5, 1, b'a', b'b']).unwrap(), None);
    }

    #[test]
    fn decode_ignores_bytes_after_frame() {
        let (frame, used) = decode_next(&[3, 4, b'x', 9, 9, 9]).unwrap().unwrap();
        assert_eq!(used, 3);
        assert_eq!(frame.sender, ParticipantId(4));
        assert_eq!(frame.payload.as_bytes(), b"x");
    }

    #[test]
    fn decode_rejects_short_length() {
        assert_eq!(decode_next(&[1, 0]).unwrap_err(), FrameError::InvalidLength(1));
        assert_eq!(decode_next(&[0, 0, 0]).unwrap_err(), FrameError::InvalidLength(0));
    }

    #[test]
    fn buffer_pops_in_order() {
        let mut buf = FrameBuffer::new();
        buf.push_frame(ParticipantId(2), b"abc").unwrap();
        buf.push_frame(ParticipantId(2), b"de").unwrap();

        let first = buf.pop_frame().unwrap().unwrap();
        assert_eq!(first.payload.as_bytes(), b"abc");
        let second = buf.pop_frame().unwrap().unwrap();
        assert_eq!(second.payload.as_bytes(), b"de");
        assert_eq!(buf.pop_frame().unwrap(), None);
        assert!(buf.is_empty());
    }

    #[test]
    fn buffer_partial_frame_left_untouched() {
        let mut buf = FrameBuffer::new();
        buf.extend(&[4, 1, b'h']);
        assert_eq!(buf.pop_frame().unwrap(), None);
        assert_eq!(buf.as_slice(), &[4, 1, b'h']);

        buf.extend(&[b'i']);
        let frame = buf.pop_frame().unwrap().unwrap();
        assert_eq!(frame.payload.as_bytes(), b"hi");
        assert!(buf.is_empty());
    }

    #[test]
    fn take_complete_leaves_partial_tail() {
        let mut buf = FrameBuffer::new();
        buf.push_frame(ParticipantId(1), b"one").unwrap();
        buf.push_frame(ParticipantId(1), b"two").unwrap();
        buf.extend(&[6, 1, b't']);

        let taken = buf.take_complete();
        assert_eq!(taken.len(), 10);
        assert_eq!(buf.as_slice(), &[6, 1, b't']);
        assert!(buf.take_complete().is_empty());
    }

    #[test]
    fn compaction_keeps_contents() {
        let mut buf = FrameBuffer::new();
        let payload = [1u8; 100];
        for _ in 0..100 {
            buf.push_frame(ParticipantId(5), &payload).unwrap();
        }
        for _ in 0..99 {
            buf.pop_frame().unwrap().unwrap();
        }
        assert_eq!(buf.len(), 102);
        let last = buf.pop_frame().unwrap().unwrap();
        assert_eq!(last.payload.as_bytes(), &payload);
    }

    proptest! {
        #[test]
        fn roundtrip(sender in any::<u8>(), payload in proptest::collection::vec(any::<u8>(), 0..=MAX_PAYLOAD_LEN)) {
            let bytes = encode(ParticipantId(sender), &payload).unwrap();
            let (frame, used) = decode_next(&bytes).unwrap().unwrap();
            prop_assert_eq!(used, bytes.len());
            prop_assert_eq!(frame.sender, ParticipantId(sender));
            prop_assert_eq!(frame.payload.as_bytes(), payload.as_slice());
        }

        #[test]
        fn split_delivery_yields_one_frame(
            payload in proptest::collection::vec(any::<u8>(), 0..=MAX_PAYLOAD_LEN),
            cuts in proptest::collection::vec(any::<prop::sample::Index>(), 0..4),
        ) {
            let bytes = encode(ParticipantId(9), &payload).unwrap();
            let mut points: Vec<usize> = cuts.iter().map(|c| c.index(bytes.len())).collect();
            points.push(bytes.len());
            points.sort_unstable();

            let mut buf = FrameBuffer::new();
            let mut start = 0;
            for end in points {
                prop_assert_eq!(buf.pop_frame().unwrap(), None);
                buf.extend(&bytes[start..end]);
                start = end;
            }
            let frame = buf.pop_frame().unwrap().unwrap();
            prop_assert_eq!(frame.payload.as_bytes(), payload.as_slice());
            prop_assert!(buf.is_empty());
        }
    }
}
