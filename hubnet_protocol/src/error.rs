// Codec errors.
//
// Raised by `encode` for payloads that don't fit a one-byte length, and by
// `decode_next` for a length byte no frame can have.

use thiserror::Error;

use crate::framing::{HEADER_LEN, MAX_PAYLOAD_LEN};

/// Errors produced while encoding or decoding frames.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The payload does not fit behind a one-byte length field.
    #[error("payload too large: {len} bytes (max {max})", max = MAX_PAYLOAD_LEN)]
    PayloadTooLarge { len: usize },

    /// A length byte smaller than the header itself. The stream can't be
    /// resynchronised after this.
    #[error("invalid frame length {0} (minimum {min})", min = HEADER_LEN)]
    InvalidLength(u8),
}
