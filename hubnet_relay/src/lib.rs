// hubnet_relay — star-topology message relay.
//
// One authority (the routing hub, id 0) and any number of peers exchange
// small framed messages over TCP. The same API also runs with no transport
// at all ("loopback authority"), so application code and tests exercise the
// identical send/pull paths whether or not a socket exists.
//
// Module overview:
// - `engine.rs`:       `RelayEngine`: lifecycle (create authority, loopback
//                      authority, connect as peer), worker ownership,
//                      shutdown.
// - `session.rs`:      `Session`: every shared queue and the routing table,
//                      guarded by one engine-wide lock. All routing
//                      decisions live here.
// - `participant.rs`:  application handles: `Loopback`, `Participant`,
//                      `Authority`.
// - `server.rs`:       authority worker thread: accept, receive, route, send.
// - `client.rs`:       peer worker thread: handshake, receive, route, send.
// - `transport.rs`:    `Transport` trait and the `TcpTransport`
//                      implementation.
// - `config.rs`, `error.rs`, `cancel.rs`: ambient pieces.
//
// Dependencies: `hubnet_protocol` for ids, packets and framing.
//
// The relay can run as a standalone binary (`main.rs`) or be embedded via
// the library API (`RelayEngine`).

pub mod cancel;
mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod participant;
mod server;
pub mod session;
pub mod transport;

pub use cancel::CancelToken;
pub use config::RelayConfig;
pub use engine::RelayEngine;
pub use error::RelayError;
pub use participant::{Authority, Loopback, Participant, Sender};
pub use session::{ParticipantKind, RelayEvent, Role};
pub use transport::{Received, TcpTransport, Transport};
