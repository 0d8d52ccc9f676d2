// Relay engine errors.
//
// Creation failures carry the address and the underlying io error. The rest
// come from handle calls made in the wrong state or with bad arguments.

use std::io;
use std::net::SocketAddr;

use hubnet_protocol::{FrameError, ParticipantId};
use thiserror::Error;

/// Errors surfaced by the relay engine and its handles.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("failed to resolve {host}:{port}: {source}")]
    Resolve {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("relay engine is already initialized")]
    AlreadyInitialized,

    #[error("relay engine has no authority or peer connection")]
    NotInitialized,

    #[error("connection to the authority is closed")]
    Closed,

    #[error("unknown participant {0}")]
    UnknownParticipant(ParticipantId),

    #[error("no participant ids left to assign")]
    IdsExhausted,

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("invalid relay config: {0}")]
    Config(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}
