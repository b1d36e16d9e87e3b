//! relaypoint: an admission-controlled circuit relay node with NAT
//! traversal coordination.
//!
//! A [`Node`] listens on its configured multiaddresses, brokers relayed
//! circuits between peers that cannot reach each other directly (with a
//! pluggable [`acl::Acl`] admission policy and watermark-based connection
//! pruning), probes its own reachability through cooperating peers, and
//! upgrades relayed sessions to direct connections by coordinated hole
//! punching. Connectivity changes are published on a subscriber event bus.

pub mod acl;
pub mod config;
pub mod connmgr;
pub mod error;
pub mod events;
mod holepunch;
pub mod host;
pub mod protocol;
pub mod reachability;
pub mod relay;

use std::sync::Arc;

use relaypoint_core::identity;

pub use relaypoint_core::addr::{Multiaddr, Protocol};
pub use relaypoint_core::identity::{Keypair, PeerId};
pub use relaypoint_core::mux::Stream;

pub use crate::acl::{Acl, AllowAll};
pub use crate::config::{NodeConfig, ProbeConfig, PunchConfig, RelayConfig};
pub use crate::connmgr::ConnectionLimits;
pub use crate::error::{Error, Result};
pub use crate::events::{ConnectivityEvent, Subscription};
pub use crate::host::{Connection, StreamHandler};
pub use crate::reachability::Reachability;
pub use crate::relay::client::ReservationInfo;

use crate::host::{Host, HostHandle};
use crate::reachability::{ProbeHandler, ReachabilityTracker};
use crate::relay::client::StopHandler;
use crate::relay::RelayService;

/// A running relay node. Construction binds every configured listener,
/// installs the protocol handlers and starts the maintenance loops; any
/// failure along the way is fatal and surfaces as an error.
pub struct Node {
    handle: HostHandle,
    relay_service: Option<Arc<RelayService>>,
    tracker: Arc<ReachabilityTracker>,
    _host: Host,
}

impl Node {
    pub async fn new(config: NodeConfig) -> Result<Node> {
        Node::with_acl(config, Arc::new(AllowAll)).await
    }

    pub async fn with_acl(config: NodeConfig, acl: Arc<dyn Acl>) -> Result<Node> {
        let keypair = match &config.key_file {
            Some(path) => identity::load_or_create(path)?,
            None => Keypair::generate(),
        };
        let config = Arc::new(config);
        let mut host = Host::new(keypair, config.clone());
        host.listen().await?;
        let handle = host.handle();

        let tracker = Arc::new(ReachabilityTracker::new(
            config.probe.window,
            config.force_reachability,
        ));
        handle.register_handler(
            protocol::PROTOCOL_STOP,
            Arc::new(StopHandler {
                host: handle.clone(),
            }),
        )?;
        handle.register_handler(
            protocol::PROTOCOL_PROBE,
            Arc::new(ProbeHandler::new(handle.clone(), config.probe.dial_timeout)),
        )?;
        handle.register_handler(
            protocol::PROTOCOL_PUNCH,
            Arc::new(holepunch::PunchHandler::new(
                handle.clone(),
                config.punch.clone(),
            )),
        )?;
        let relay_service = match &config.relay {
            Some(relay_config) => Some(RelayService::install(
                handle.clone(),
                acl,
                relay_config.clone(),
            )?),
            None => None,
        };

        let join_set = host::maintain::start_task(&handle, relay_service.clone(), tracker.clone());
        let shutdown = handle.shutdown_manager().clone();
        let fut = shutdown.wrap_cancel(async move {
            let mut join_set = join_set;
            while join_set.join_next().await.is_some() {}
        });
        tokio::spawn(async move {
            if fut.await.is_err() {
                log::debug!("maintain tasks shut down");
            }
        });

        Ok(Node {
            handle,
            relay_service,
            tracker,
            _host: host,
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.handle.peer_id()
    }

    /// The bound listen addresses (with real ports).
    pub fn addrs(&self) -> Vec<Multiaddr> {
        self.handle.addrs()
    }

    /// Addresses worth advertising as a relay: the listen addresses with
    /// the `/p2p` suffix, and only while the node believes it is publicly
    /// reachable.
    pub fn advertised_addrs(&self) -> Vec<Multiaddr> {
        if self.reachability() != Reachability::Public {
            return Vec::new();
        }
        let id = self.peer_id();
        self.addrs()
            .into_iter()
            .map(|addr| addr.with(Protocol::P2p(id)))
            .collect()
    }

    pub fn reachability(&self) -> Reachability {
        self.tracker.status()
    }

    pub fn current_peers(&self) -> Vec<PeerId> {
        self.handle.current_peers()
    }

    pub fn connection_count(&self) -> usize {
        self.handle.connection_count()
    }

    /// A fresh connectivity event subscription (no history replay).
    pub fn subscribe(&self) -> Subscription {
        self.handle.subscribe()
    }

    /// Registers an application protocol handler. Relayed circuit streams
    /// reach it the same way direct streams do.
    pub fn register_handler(&self, protocol: &str, handler: Arc<dyn StreamHandler>) -> Result<()> {
        self.handle.register_handler(protocol, handler)
    }

    pub async fn dial(&self, addr: &Multiaddr) -> Result<Arc<Connection>> {
        self.handle.dial(addr).await
    }

    pub async fn open_stream(&self, peer: &PeerId, protocol: &str) -> Result<Stream> {
        self.handle.open_stream(peer, protocol).await
    }

    /// Requests a relay reservation from a connected relay peer.
    pub async fn reserve(&self, relay: PeerId) -> Result<ReservationInfo> {
        relay::client::reserve(&self.handle, relay).await
    }

    /// Opens a relayed circuit to `target` through `relay` and negotiates
    /// `protocol` end to end over it.
    pub async fn connect_via(
        &self,
        relay: PeerId,
        target: PeerId,
        protocol: &str,
    ) -> Result<Stream> {
        relay::client::connect(&self.handle, relay, target, protocol).await
    }

    /// Active reservation count held by this node's relay broker (zero
    /// when the relay is disabled).
    pub fn reservation_count(&self) -> usize {
        self.relay_service
            .as_ref()
            .map(|service| service.reservation_count())
            .unwrap_or(0)
    }

    /// Cancels a peer's reservation on this relay, releasing its slot.
    pub fn cancel_reservation(&self, peer: &PeerId) -> bool {
        self.relay_service
            .as_ref()
            .map(|service| service.cancel(peer))
            .unwrap_or(false)
    }

    /// Attempts to upgrade connectivity with `target` to a direct
    /// connection by coordinated hole punching over a relayed circuit.
    /// Failure is recoverable; the relayed path keeps working.
    pub async fn hole_punch(&self, relay: PeerId, target: PeerId) -> Result<Arc<Connection>> {
        holepunch::upgrade(
            &self.handle,
            relay,
            target,
            &self.handle.config().punch,
        )
        .await
    }

    /// Stops accepting, drains relayed circuits within the configured
    /// grace, then closes every connection and drops all reservations.
    pub async fn shutdown(&self) {
        if let Some(service) = &self.relay_service {
            service.clear();
        }
        self.handle.shutdown().await;
    }
}

/// Builder-style construction mirroring [`NodeConfig`].
pub struct Builder {
    config: NodeConfig,
    acl: Option<Arc<dyn Acl>>,
}

impl Builder {
    pub fn new() -> Builder {
        Builder {
            config: NodeConfig::default(),
            acl: None,
        }
    }

    pub fn listen_addr(mut self, addr: Multiaddr) -> Builder {
        self.config.listen_addrs.push(addr);
        self
    }

    pub fn key_file(mut self, path: std::path::PathBuf) -> Builder {
        self.config.key_file.replace(path);
        self
    }

    pub fn acl<A: Acl + 'static>(mut self, acl: A) -> Builder {
        self.acl.replace(Arc::new(acl));
        self
    }

    pub fn relay(mut self, relay: RelayConfig) -> Builder {
        self.config.relay.replace(relay);
        self
    }

    pub fn no_relay(mut self) -> Builder {
        self.config.relay = None;
        self
    }

    pub fn limits(mut self, limits: ConnectionLimits) -> Builder {
        self.config.limits = limits;
        self
    }

    pub fn force_reachability(mut self, reachability: Reachability) -> Builder {
        self.config.force_reachability.replace(reachability);
        self
    }

    pub async fn build(self) -> Result<Node> {
        match self.acl {
            Some(acl) => Node::with_acl(self.config, acl).await,
            None => Node::new(self.config).await,
        }
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;

    struct Echo;

    #[async_trait]
    impl StreamHandler for Echo {
        async fn handle(&self, _peer: PeerId, _addr: Multiaddr, mut stream: Stream) {
            while let Some(chunk) = stream.read().await {
                if stream.write(&chunk).await.is_err() {
                    break;
                }
            }
            _ = stream.shutdown().await;
        }
    }

    const ECHO: &str = "/test/echo/1.0.0";

    fn base_config() -> NodeConfig {
        NodeConfig::default()
            .set_listen_addrs(vec!["/ip4/127.0.0.1/tcp/0".parse().unwrap()])
            .set_force_reachability(Reachability::Public)
            .set_shutdown_grace(Duration::from_millis(200))
    }

    async fn relay_node(relay: RelayConfig) -> Node {
        Node::new(base_config().set_relay(relay)).await.unwrap()
    }

    async fn client_node() -> Node {
        Node::new(base_config().disable_relay()).await.unwrap()
    }

    fn full_addr(node: &Node) -> Multiaddr {
        node.addrs()[0].clone().with(Protocol::P2p(node.peer_id()))
    }

    #[tokio::test]
    async fn relayed_circuit_forwards_bytes_both_ways() {
        let relay = relay_node(RelayConfig::default()).await;
        let b = client_node().await;
        b.register_handler(ECHO, Arc::new(Echo)).unwrap();
        b.dial(&full_addr(&relay)).await.unwrap();
        let info = b.reserve(relay.peer_id()).await.unwrap();
        assert!(!info.addrs.is_empty());
        assert!(info.addrs[0].is_circuit());
        assert_eq!(info.addrs[0].peer_id(), Some(b.peer_id()));

        let a = client_node().await;
        a.dial(&full_addr(&relay)).await.unwrap();
        let mut stream = a
            .connect_via(relay.peer_id(), b.peer_id(), ECHO)
            .await
            .unwrap();
        stream.write(b"through the relay").await.unwrap();
        let echoed = stream.read().await.unwrap();
        assert_eq!(echoed.as_ref(), b"through the relay");

        a.shutdown().await;
        b.shutdown().await;
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn connect_without_reservation_is_explicit() {
        let relay = relay_node(RelayConfig::default()).await;
        let a = client_node().await;
        a.dial(&full_addr(&relay)).await.unwrap();

        let stranger = Keypair::generate().peer_id();
        let rs = a.connect_via(relay.peer_id(), stranger, ECHO).await;
        assert!(matches!(
            rs,
            Err(Error::Refused(protocol::RelayStatus::NoReservation))
        ));
        a.shutdown().await;
        relay.shutdown().await;
    }

    struct DenyConnect;

    impl Acl for DenyConnect {
        fn allow_reserve(&self, _peer: &PeerId, _addr: &Multiaddr) -> bool {
            true
        }

        fn allow_connect(&self, _src: &PeerId, _addr: &Multiaddr, _dest: &PeerId) -> bool {
            false
        }
    }

    struct DenyReserve;

    impl Acl for DenyReserve {
        fn allow_reserve(&self, _peer: &PeerId, _addr: &Multiaddr) -> bool {
            false
        }

        fn allow_connect(&self, _src: &PeerId, _addr: &Multiaddr, _dest: &PeerId) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn acl_denial_is_an_explicit_status_not_a_timeout() {
        let relay = Node::with_acl(base_config(), Arc::new(DenyConnect))
            .await
            .unwrap();
        let b = client_node().await;
        b.dial(&full_addr(&relay)).await.unwrap();
        b.reserve(relay.peer_id()).await.unwrap();

        let a = client_node().await;
        a.dial(&full_addr(&relay)).await.unwrap();
        let rs = a.connect_via(relay.peer_id(), b.peer_id(), ECHO).await;
        assert!(matches!(
            rs,
            Err(Error::Refused(protocol::RelayStatus::Denied))
        ));

        a.shutdown().await;
        b.shutdown().await;
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn reserve_denied_by_acl() {
        let relay = Node::with_acl(base_config(), Arc::new(DenyReserve))
            .await
            .unwrap();
        let b = client_node().await;
        b.dial(&full_addr(&relay)).await.unwrap();
        let rs = b.reserve(relay.peer_id()).await;
        assert!(matches!(
            rs,
            Err(Error::Refused(protocol::RelayStatus::Denied))
        ));
        b.shutdown().await;
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn repeat_reservation_replaces() {
        let relay = relay_node(RelayConfig::default()).await;
        let b = client_node().await;
        b.dial(&full_addr(&relay)).await.unwrap();
        b.reserve(relay.peer_id()).await.unwrap();
        b.reserve(relay.peer_id()).await.unwrap();
        assert_eq!(relay.reservation_count(), 1);

        assert!(relay.cancel_reservation(&b.peer_id()));
        assert_eq!(relay.reservation_count(), 0);
        b.shutdown().await;
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn reservation_capacity_is_explicit() {
        let relay = relay_node(RelayConfig::default().set_max_reservations(1)).await;
        let b = client_node().await;
        let c = client_node().await;
        b.dial(&full_addr(&relay)).await.unwrap();
        c.dial(&full_addr(&relay)).await.unwrap();
        b.reserve(relay.peer_id()).await.unwrap();
        let rs = c.reserve(relay.peer_id()).await;
        assert!(matches!(
            rs,
            Err(Error::Refused(protocol::RelayStatus::CapacityExceeded))
        ));
        b.shutdown().await;
        c.shutdown().await;
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn expired_reservation_yields_no_reservation() {
        let relay =
            relay_node(RelayConfig::default().set_reservation_ttl(Duration::from_millis(300)))
                .await;
        let b = client_node().await;
        b.register_handler(ECHO, Arc::new(Echo)).unwrap();
        b.dial(&full_addr(&relay)).await.unwrap();
        b.reserve(relay.peer_id()).await.unwrap();

        let a = client_node().await;
        a.dial(&full_addr(&relay)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        let rs = a.connect_via(relay.peer_id(), b.peer_id(), ECHO).await;
        assert!(matches!(
            rs,
            Err(Error::Refused(protocol::RelayStatus::NoReservation))
        ));

        a.shutdown().await;
        b.shutdown().await;
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn circuit_byte_limit_tears_down() {
        let relay = relay_node(RelayConfig::default().set_limit(protocol::CircuitLimit {
            max_bytes: 1024,
            max_secs: 60,
        }))
        .await;
        let b = client_node().await;
        b.register_handler(ECHO, Arc::new(Echo)).unwrap();
        b.dial(&full_addr(&relay)).await.unwrap();
        b.reserve(relay.peer_id()).await.unwrap();

        let a = client_node().await;
        a.dial(&full_addr(&relay)).await.unwrap();
        let mut stream = a
            .connect_via(relay.peer_id(), b.peer_id(), ECHO)
            .await
            .unwrap();
        stream.write(&vec![0u8; 4096]).await.unwrap();
        // The relay stops forwarding once the limit trips; the stream ends
        // instead of echoing everything back.
        let mut returned = 0usize;
        while let Some(chunk) = stream.read().await {
            returned += chunk.len();
        }
        assert!(returned < 4096);

        a.shutdown().await;
        b.shutdown().await;
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn hole_punch_upgrades_to_direct_connection() {
        let relay = relay_node(RelayConfig::default()).await;
        let b = client_node().await;
        b.dial(&full_addr(&relay)).await.unwrap();
        b.reserve(relay.peer_id()).await.unwrap();

        let a = client_node().await;
        a.dial(&full_addr(&relay)).await.unwrap();
        let conn = a.hole_punch(relay.peer_id(), b.peer_id()).await.unwrap();
        assert_eq!(conn.peer(), b.peer_id());
        assert!(!conn.remote_addr().is_circuit());

        a.shutdown().await;
        b.shutdown().await;
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn connectivity_events_and_snapshot() {
        let relay = relay_node(RelayConfig::default()).await;
        let mut events = relay.subscribe();

        let a = client_node().await;
        a.dial(&full_addr(&relay)).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        let ConnectivityEvent::Connected { peer, conn, .. } = event else {
            panic!("expected Connected first");
        };
        assert_eq!(peer, a.peer_id());
        assert!(relay.current_peers().contains(&a.peer_id()));

        a.shutdown().await;
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            ConnectivityEvent::Disconnected {
                peer: a.peer_id(),
                conn
            }
        );
        assert!(!relay.current_peers().contains(&a.peer_id()));
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn probing_marks_a_loopback_node_public() {
        let config = base_config();
        let mut config = NodeConfig {
            force_reachability: None,
            ..config
        };
        config.probe = ProbeConfig::default()
            .set_interval(Duration::from_millis(200))
            .set_max_peers(1);
        let node = Node::new(config).await.unwrap();

        let helper = client_node().await;
        node.dial(&full_addr(&helper)).await.unwrap();

        let mut status = node.reachability();
        for _ in 0..50 {
            status = node.reachability();
            if status == Reachability::Public {
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        assert_eq!(status, Reachability::Public);

        node.shutdown().await;
        helper.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_accepting() {
        let relay = relay_node(RelayConfig::default()).await;
        let addr = full_addr(&relay);
        relay.shutdown().await;

        let a = client_node().await;
        let rs = tokio::time::timeout(Duration::from_secs(3), a.dial(&addr)).await;
        assert!(matches!(rs, Ok(Err(_)) | Err(_)));
        a.shutdown().await;
    }
}
