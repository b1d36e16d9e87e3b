//! Wire-level protocol IDs and control messages. Every control message is
//! a msgpack-encoded serde struct exchanged over one logical stream; relay
//! outcomes travel as explicit status codes so clients can distinguish
//! "try later" from "not allowed" from "target unreachable".

use relaypoint_core::addr::Multiaddr;
use relaypoint_core::identity::PeerId;
use relaypoint_core::negotiate::MsgChannel;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Relay reservation and circuit requests, spoken to the relay.
pub const PROTOCOL_HOP: &str = "/relaypoint/relay/1.0.0/hop";
/// Circuit delivery, spoken by the relay to the reserved peer.
pub const PROTOCOL_STOP: &str = "/relaypoint/relay/1.0.0/stop";
/// Reachability probing (dial-back requests).
pub const PROTOCOL_PROBE: &str = "/relaypoint/probe/1.0.0";
/// Hole-punch coordination over an existing relayed stream.
pub const PROTOCOL_PUNCH: &str = "/relaypoint/punch/1.0.0";

#[derive(Serialize, Deserialize, Eq, PartialEq, Copy, Clone, Debug)]
#[repr(u8)]
pub enum RelayStatus {
    Ok,
    Denied,
    CapacityExceeded,
    NoReservation,
    Error,
    Unknown = 255,
}

impl From<u8> for RelayStatus {
    fn from(value: u8) -> Self {
        match value {
            0 => RelayStatus::Ok,
            1 => RelayStatus::Denied,
            2 => RelayStatus::CapacityExceeded,
            3 => RelayStatus::NoReservation,
            4 => RelayStatus::Error,
            _ => RelayStatus::Unknown,
        }
    }
}

impl From<RelayStatus> for u8 {
    fn from(value: RelayStatus) -> Self {
        value as u8
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub enum HopRequest {
    Reserve,
    Connect { target: PeerId },
}

/// Byte and duration bounds applied to one relayed circuit.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, Eq, PartialEq)]
pub struct CircuitLimit {
    pub max_bytes: u64,
    pub max_secs: u64,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct HopResponse {
    pub status: RelayStatus,
    /// On a successful reservation: addresses the client may advertise.
    pub addrs: Vec<Multiaddr>,
    pub ttl_secs: u64,
    pub limit: Option<CircuitLimit>,
}

impl HopResponse {
    pub(crate) fn status(status: RelayStatus) -> HopResponse {
        HopResponse {
            status,
            addrs: Vec::new(),
            ttl_secs: 0,
            limit: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct StopRequest {
    pub src: PeerId,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct StopResponse {
    pub status: RelayStatus,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ProbeRequest {
    /// Candidate address the prober wants dialed back.
    pub addr: Multiaddr,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ProbeResponse {
    pub reachable: bool,
}

#[derive(Serialize, Deserialize, Debug)]
pub enum PunchMessage {
    /// Candidate direct addresses of the sender.
    Candidates { addrs: Vec<Multiaddr>, nonce: u64 },
    /// "Dial now": the initiator sends this after measuring the round
    /// trip, then waits half of it before dialing itself.
    Sync,
}

pub(crate) async fn send_msg<C, T>(channel: &mut C, msg: &T) -> Result<()>
where
    C: MsgChannel + ?Sized,
    T: Serialize,
{
    let encoded = rmp_serde::to_vec(msg).map_err(Error::codec)?;
    channel.send_msg(&encoded).await?;
    Ok(())
}

pub(crate) async fn recv_msg<C, T>(channel: &mut C) -> Result<T>
where
    C: MsgChannel + ?Sized,
    T: DeserializeOwned,
{
    let raw = channel.recv_msg().await?;
    rmp_serde::from_slice(&raw).map_err(Error::codec)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_code_round_trip() {
        for status in [
            RelayStatus::Ok,
            RelayStatus::Denied,
            RelayStatus::CapacityExceeded,
            RelayStatus::NoReservation,
            RelayStatus::Error,
        ] {
            assert_eq!(RelayStatus::from(u8::from(status)), status);
        }
        assert_eq!(RelayStatus::from(9), RelayStatus::Unknown);
    }

    #[test]
    fn hop_messages_encode() {
        let target = relaypoint_core::identity::Keypair::generate().peer_id();
        let encoded = rmp_serde::to_vec(&HopRequest::Connect { target }).unwrap();
        match rmp_serde::from_slice(&encoded).unwrap() {
            HopRequest::Connect { target: got } => assert_eq!(got, target),
            other => panic!("unexpected {other:?}"),
        }

        let resp = HopResponse {
            status: RelayStatus::Ok,
            addrs: vec!["/ip4/127.0.0.1/tcp/8080/ws".parse().unwrap()],
            ttl_secs: 600,
            limit: Some(CircuitLimit {
                max_bytes: 1 << 20,
                max_secs: 120,
            }),
        };
        let decoded: HopResponse = rmp_serde::from_slice(&rmp_serde::to_vec(&resp).unwrap()).unwrap();
        assert_eq!(decoded.status, RelayStatus::Ok);
        assert_eq!(decoded.addrs, resp.addrs);
        assert_eq!(decoded.limit, resp.limit);
    }
}
