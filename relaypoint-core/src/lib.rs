//! Transport substrate for the relaypoint node: peer identity, structured
//! addresses, message-framed transports (TCP, WebSocket), protocol-ID
//! negotiation, an authenticated encrypted channel and stream multiplexing.
//!
//! The layering mirrors how a connection is established: a transport
//! session is accepted or dialed ([`transport`]), a security protocol is
//! agreed on by ID and the channel handshake runs ([`negotiate`],
//! [`secure`]), a multiplexer is agreed on and started ([`mux`]), and
//! every logical stream then negotiates its application protocol.

pub mod addr;
pub mod error;
pub mod identity;
pub mod mux;
pub mod negotiate;
pub mod secure;
pub mod transport;

pub use error::{Error, Result};
