//! Client side of the relay protocol: requesting a reservation, dialing a
//! reserved peer through a relay, and accepting delivered circuits (STOP).

use async_trait::async_trait;
use relaypoint_core::addr::{Multiaddr, Protocol};
use relaypoint_core::identity::PeerId;
use relaypoint_core::mux::Stream;
use relaypoint_core::negotiate;
use tokio::time::Duration;

use crate::error::{Error, Result};
use crate::host::{HostHandle, StreamHandler};
use crate::protocol::{
    recv_msg, send_msg, CircuitLimit, HopRequest, HopResponse, RelayStatus, StopRequest,
    StopResponse, PROTOCOL_HOP,
};

/// What a successful reservation grants the client.
#[derive(Clone, Debug)]
pub struct ReservationInfo {
    /// Relay addresses the client may advertise to peers that cannot
    /// reach it directly.
    pub addrs: Vec<Multiaddr>,
    pub ttl: Duration,
    pub limit: Option<CircuitLimit>,
}

/// Requests (or refreshes) a reservation with a connected relay.
pub(crate) async fn reserve(host: &HostHandle, relay: PeerId) -> Result<ReservationInfo> {
    let mut stream = host.open_stream(&relay, PROTOCOL_HOP).await?;
    send_msg(&mut stream, &HopRequest::Reserve).await?;
    let response: HopResponse = recv_msg(&mut stream).await?;
    match response.status {
        RelayStatus::Ok => Ok(ReservationInfo {
            addrs: response.addrs,
            ttl: Duration::from_secs(response.ttl_secs),
            limit: response.limit,
        }),
        status => Err(Error::Refused(status)),
    }
}

/// Opens a circuit to `target` through `relay` and negotiates `protocol`
/// end to end over it. The returned stream reaches the target peer, not
/// the relay.
pub(crate) async fn connect(
    host: &HostHandle,
    relay: PeerId,
    target: PeerId,
    protocol: &str,
) -> Result<Stream> {
    let mut stream = host.open_stream(&relay, PROTOCOL_HOP).await?;
    send_msg(&mut stream, &HopRequest::Connect { target }).await?;
    let response: HopResponse = recv_msg(&mut stream).await?;
    if response.status != RelayStatus::Ok {
        return Err(Error::Refused(response.status));
    }
    negotiate::propose(&mut stream, &[protocol.to_string()]).await?;
    Ok(stream)
}

/// Accepts circuits the relay delivers to this (reserved) peer and hands
/// them to the host's regular protocol dispatch, so relayed streams reach
/// the same handlers as direct ones.
pub(crate) struct StopHandler {
    pub(crate) host: HostHandle,
}

#[async_trait]
impl StreamHandler for StopHandler {
    async fn handle(&self, relay: PeerId, remote_addr: Multiaddr, mut stream: Stream) {
        let request: StopRequest = match recv_msg(&mut stream).await {
            Ok(request) => request,
            Err(e) => {
                log::debug!("stop request via {relay}: {e:?}");
                return;
            }
        };
        if send_msg(
            &mut stream,
            &StopResponse {
                status: RelayStatus::Ok,
            },
        )
        .await
        .is_err()
        {
            return;
        }
        log::debug!("incoming circuit from {} via relay {relay}", request.src);
        let circuit_addr = remote_addr.with(Protocol::P2pCircuit);
        self.host
            .dispatch_incoming(request.src, circuit_addr, stream)
            .await;
    }
}
