//! The circuit relay broker. A client peer reserves a slot over HOP; a
//! third peer then asks the relay to connect it to the reserved peer, the
//! relay opens a STOP stream to the target and, once the target accepts,
//! splices the two streams into a byte-forwarding circuit bounded by the
//! configured byte and duration limits.
//!
//! State per client peer id: no reservation -> reserved -> expired or
//! cancelled. Every outcome travels as an explicit [`RelayStatus`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_shutdown::ShutdownManager;
use async_trait::async_trait;
use relaypoint_core::addr::{Multiaddr, Protocol};
use relaypoint_core::identity::PeerId;
use relaypoint_core::mux::Stream;
use tokio::time::{timeout, Duration, Instant};

use crate::acl::Acl;
use crate::config::RelayConfig;
use crate::error::Result;
use crate::host::{HostHandle, StreamHandler};
use crate::protocol::{
    recv_msg, send_msg, CircuitLimit, HopRequest, HopResponse, RelayStatus, StopRequest,
    StopResponse, PROTOCOL_HOP, PROTOCOL_STOP,
};

pub mod client;
mod reservations;

use reservations::ReservationTable;

pub(crate) struct RelayService {
    host: HostHandle,
    acl: Arc<dyn Acl>,
    config: RelayConfig,
    reservations: ReservationTable,
}

impl RelayService {
    /// Installs the HOP handler on the host. Registration failure is
    /// propagated: a relay that cannot speak its own protocol must not
    /// start.
    pub(crate) fn install(
        host: HostHandle,
        acl: Arc<dyn Acl>,
        config: RelayConfig,
    ) -> Result<Arc<RelayService>> {
        let service = Arc::new(RelayService {
            reservations: ReservationTable::new(config.max_reservations),
            host,
            acl,
            config,
        });
        service
            .host
            .register_handler(PROTOCOL_HOP, Arc::new(HopHandler(service.clone())))?;
        Ok(service)
    }

    pub(crate) fn reservation_count(&self) -> usize {
        self.reservations.len()
    }

    /// Explicit cancellation: drops the peer's reservation and releases
    /// its capacity slot.
    pub(crate) fn cancel(&self, peer: &PeerId) -> bool {
        let cancelled = self.reservations.cancel(peer);
        if cancelled {
            log::debug!("reservation for {peer} cancelled");
        }
        cancelled
    }

    pub(crate) fn clear(&self) {
        self.reservations.clear();
    }

    async fn handle_hop(&self, peer: PeerId, addr: Multiaddr, mut stream: Stream) {
        let request: HopRequest = match recv_msg(&mut stream).await {
            Ok(request) => request,
            Err(e) => {
                log::debug!("hop request from {peer}: {e:?}");
                return;
            }
        };
        match request {
            HopRequest::Reserve => self.handle_reserve(peer, addr, stream).await,
            HopRequest::Connect { target } => {
                self.handle_connect(peer, addr, target, stream).await
            }
        }
    }

    async fn handle_reserve(&self, peer: PeerId, addr: Multiaddr, mut stream: Stream) {
        let response = if !self.acl.allow_reserve(&peer, &addr) {
            log::debug!("reservation from {peer} denied");
            HopResponse::status(RelayStatus::Denied)
        } else if !self
            .reservations
            .reserve(peer, self.config.reservation_ttl)
        {
            log::debug!("reservation from {peer} refused, at capacity");
            HopResponse::status(RelayStatus::CapacityExceeded)
        } else {
            log::debug!(
                "reserved slot for {peer}, ttl {:?}",
                self.config.reservation_ttl
            );
            HopResponse {
                status: RelayStatus::Ok,
                addrs: self.relay_addrs(peer),
                ttl_secs: self.config.reservation_ttl.as_secs(),
                limit: Some(self.config.limit),
            }
        };
        _ = send_msg(&mut stream, &response).await;
    }

    /// Addresses the reserved client may hand out:
    /// `<relay>/p2p/<relay-id>/p2p-circuit/p2p/<client-id>`.
    fn relay_addrs(&self, client: PeerId) -> Vec<Multiaddr> {
        let relay_id = self.host.peer_id();
        self.host
            .addrs()
            .into_iter()
            .map(|addr| {
                addr.with(Protocol::P2p(relay_id))
                    .with(Protocol::P2pCircuit)
                    .with(Protocol::P2p(client))
            })
            .collect()
    }

    async fn handle_connect(
        &self,
        initiator: PeerId,
        addr: Multiaddr,
        target: PeerId,
        mut hop: Stream,
    ) {
        let Some(circuits) = self.reservations.active(&target) else {
            _ = send_msg(&mut hop, &HopResponse::status(RelayStatus::NoReservation)).await;
            return;
        };
        if !self.acl.allow_connect(&initiator, &addr, &target) {
            log::debug!("circuit {initiator} -> {target} denied");
            _ = send_msg(&mut hop, &HopResponse::status(RelayStatus::Denied)).await;
            return;
        }
        let Some(_guard) = CircuitGuard::acquire(circuits, self.config.max_circuits_per_peer)
        else {
            log::debug!("circuit {initiator} -> {target} refused, at circuit limit");
            _ = send_msg(&mut hop, &HopResponse::status(RelayStatus::CapacityExceeded)).await;
            return;
        };

        let mut stop = match self.host.open_stream(&target, PROTOCOL_STOP).await {
            Ok(stop) => stop,
            Err(e) => {
                log::debug!("circuit {initiator} -> {target}: {e:?}");
                _ = send_msg(&mut hop, &HopResponse::status(RelayStatus::Error)).await;
                return;
            }
        };
        if send_msg(&mut stop, &StopRequest { src: initiator }).await.is_err() {
            _ = send_msg(&mut hop, &HopResponse::status(RelayStatus::Error)).await;
            return;
        }
        let accepted = match timeout(self.config.stop_timeout, recv_msg::<_, StopResponse>(&mut stop)).await {
            Ok(Ok(response)) => response.status == RelayStatus::Ok,
            _ => false,
        };
        if !accepted {
            log::debug!("circuit {initiator} -> {target}: target did not accept");
            _ = send_msg(&mut hop, &HopResponse::status(RelayStatus::Error)).await;
            return;
        }
        let response = HopResponse {
            status: RelayStatus::Ok,
            addrs: Vec::new(),
            ttl_secs: 0,
            limit: Some(self.config.limit),
        };
        if send_msg(&mut hop, &response).await.is_err() {
            return;
        }

        log::debug!("circuit {initiator} -> {target} open");
        let (bytes, reason) = bridge(
            hop,
            stop,
            self.config.limit,
            self.host.shutdown_manager().clone(),
            self.host.config().shutdown_grace,
        )
        .await;
        log::debug!("circuit {initiator} -> {target} closed, {bytes} bytes ({reason})");
    }
}

pub(crate) async fn expire_loop(service: Arc<RelayService>) {
    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let removed = service.reservations.sweep();
        if removed > 0 {
            log::debug!("expired {removed} reservations");
        }
    }
}

struct HopHandler(Arc<RelayService>);

#[async_trait]
impl StreamHandler for HopHandler {
    async fn handle(&self, peer: PeerId, remote_addr: Multiaddr, stream: Stream) {
        self.0.handle_hop(peer, remote_addr, stream).await;
    }
}

/// Bounds concurrent circuits per reservation; the slot is released when
/// the guard drops with the circuit.
struct CircuitGuard {
    circuits: Arc<AtomicUsize>,
}

impl CircuitGuard {
    fn acquire(circuits: Arc<AtomicUsize>, max: usize) -> Option<CircuitGuard> {
        circuits
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| {
                (c < max).then_some(c + 1)
            })
            .ok()?;
        Some(CircuitGuard { circuits })
    }
}

impl Drop for CircuitGuard {
    fn drop(&mut self) {
        self.circuits.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Splices two streams into one relayed circuit and forwards bytes both
/// ways until either side closes, a limit trips, or shutdown drains it.
/// During shutdown the circuit keeps forwarding for at most `grace`.
async fn bridge(
    mut a: Stream,
    mut b: Stream,
    limit: CircuitLimit,
    shutdown: ShutdownManager<()>,
    grace: Duration,
) -> (u64, &'static str) {
    let _delay = shutdown.delay_shutdown_token().ok();
    let mut deadline = Instant::now() + Duration::from_secs(limit.max_secs);
    let mut draining = shutdown.is_shutdown_triggered();
    if draining {
        deadline = deadline.min(Instant::now() + grace);
    }
    let mut transferred = 0u64;
    let reason = loop {
        tokio::select! {
            chunk = a.read() => match chunk {
                Some(chunk) => {
                    transferred += chunk.len() as u64;
                    if transferred > limit.max_bytes {
                        break "byte limit";
                    }
                    if b.write(&chunk).await.is_err() {
                        break "target gone";
                    }
                }
                None => {
                    _ = b.shutdown().await;
                    break "initiator closed";
                }
            },
            chunk = b.read() => match chunk {
                Some(chunk) => {
                    transferred += chunk.len() as u64;
                    if transferred > limit.max_bytes {
                        break "byte limit";
                    }
                    if a.write(&chunk).await.is_err() {
                        break "initiator gone";
                    }
                }
                None => {
                    _ = a.shutdown().await;
                    break "target closed";
                }
            },
            _ = tokio::time::sleep_until(deadline) => {
                break if draining { "shutdown" } else { "duration limit" };
            }
            _ = shutdown.wait_shutdown_triggered(), if !draining => {
                draining = true;
                deadline = deadline.min(Instant::now() + grace);
            }
        }
    };
    (transferred, reason)
}
