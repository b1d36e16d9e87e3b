//! Hole-punch orchestration. Both sides of an active relayed circuit
//! exchange candidate direct addresses over the circuit itself, agree on
//! a dial moment from the measured round trip, and dial each other
//! simultaneously. The first direct connection to complete wins; the
//! losing racer is simply discarded. Failure leaves the relayed path in
//! place and is never surfaced as a connection error.

use async_trait::async_trait;
use rand::Rng;
use relaypoint_core::addr::{Multiaddr, Protocol};
use relaypoint_core::identity::PeerId;
use relaypoint_core::mux::Stream;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::{timeout, Duration, Instant};

use crate::config::PunchConfig;
use crate::error::{Error, Result};
use crate::host::{Connection, HostHandle, StreamHandler};
use crate::protocol::{recv_msg, send_msg, PunchMessage, PROTOCOL_PUNCH};
use crate::relay;

/// Initiator side: opens a punch stream through the relay and runs up to
/// `max_attempts` coordinated dial rounds.
pub(crate) async fn upgrade(
    host: &HostHandle,
    relay_peer: PeerId,
    target: PeerId,
    config: &PunchConfig,
) -> Result<Arc<Connection>> {
    if let Some(conn) = host.connection(&target) {
        return Ok(conn);
    }
    for attempt in 1..=config.max_attempts {
        match attempt_once(host, relay_peer, target, config).await {
            Ok(conn) => {
                log::info!(
                    "hole punch with {target} succeeded via {}",
                    conn.remote_addr()
                );
                return Ok(conn);
            }
            Err(e) => log::debug!("hole punch attempt {attempt} with {target}: {e:?}"),
        }
    }
    log::debug!("hole punch with {target} failed, relayed path remains");
    Err(Error::PunchFailed)
}

async fn attempt_once(
    host: &HostHandle,
    relay_peer: PeerId,
    target: PeerId,
    config: &PunchConfig,
) -> Result<Arc<Connection>> {
    let mut stream = relay::client::connect(host, relay_peer, target, PROTOCOL_PUNCH).await?;
    let nonce: u64 = rand::thread_rng().gen();
    let started = Instant::now();
    send_msg(
        &mut stream,
        &PunchMessage::Candidates {
            addrs: host.addrs(),
            nonce,
        },
    )
    .await?;
    let reply: PunchMessage = recv_msg(&mut stream).await?;
    let PunchMessage::Candidates {
        addrs,
        nonce: reply_nonce,
    } = reply
    else {
        return Err(Error::Codec("expected candidates".to_string()));
    };
    if reply_nonce != nonce {
        return Err(Error::Codec("candidate nonce mismatch".to_string()));
    }
    let rtt = started.elapsed().min(config.max_rtt);
    send_msg(&mut stream, &PunchMessage::Sync).await?;
    // The responder dials the moment Sync lands, one half round trip from
    // now; waiting the other half lines the two dials up.
    tokio::time::sleep(rtt / 2).await;
    attempt_dial(host, target, addrs, config.dial_timeout).await
}

/// Dials every candidate concurrently; the first success wins and the
/// rest are aborted. An inbound connection racing in from the other side
/// is registered by the host as usual, never treated as an error.
async fn attempt_dial(
    host: &HostHandle,
    peer: PeerId,
    addrs: Vec<Multiaddr>,
    dial_timeout: Duration,
) -> Result<Arc<Connection>> {
    let mut set = JoinSet::new();
    for addr in addrs {
        let host = host.clone();
        let addr = addr.with(Protocol::P2p(peer));
        set.spawn(async move {
            timeout(dial_timeout, host.dial(&addr))
                .await
                .map_err(|_| Error::Timeout)?
        });
    }
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(conn)) => return Ok(conn),
            Ok(Err(e)) => log::debug!("punch dial: {e:?}"),
            Err(e) => log::debug!("punch dial task: {e:?}"),
        }
    }
    Err(Error::PunchFailed)
}

/// Responder side, reached over the relayed circuit: answers with our own
/// candidates and dials as soon as the initiator's Sync arrives.
pub(crate) struct PunchHandler {
    host: HostHandle,
    config: PunchConfig,
}

impl PunchHandler {
    pub(crate) fn new(host: HostHandle, config: PunchConfig) -> PunchHandler {
        PunchHandler { host, config }
    }
}

#[async_trait]
impl StreamHandler for PunchHandler {
    async fn handle(&self, peer: PeerId, _remote_addr: Multiaddr, mut stream: Stream) {
        let request: PunchMessage = match recv_msg(&mut stream).await {
            Ok(request) => request,
            Err(e) => {
                log::debug!("punch request from {peer}: {e:?}");
                return;
            }
        };
        let PunchMessage::Candidates { addrs, nonce } = request else {
            log::debug!("punch request from {peer}: expected candidates");
            return;
        };
        if send_msg(
            &mut stream,
            &PunchMessage::Candidates {
                addrs: self.host.addrs(),
                nonce,
            },
        )
        .await
        .is_err()
        {
            return;
        }
        match recv_msg::<_, PunchMessage>(&mut stream).await {
            Ok(PunchMessage::Sync) => {}
            other => {
                log::debug!("punch sync from {peer}: {other:?}");
                return;
            }
        }
        match attempt_dial(&self.host, peer, addrs, self.config.dial_timeout).await {
            Ok(conn) => log::info!(
                "hole punch with {peer} succeeded via {}",
                conn.remote_addr()
            ),
            Err(_) => log::debug!("hole punch with {peer} failed, relayed path remains"),
        }
    }
}
