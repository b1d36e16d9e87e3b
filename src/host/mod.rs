//! The host ties the substrate together: it owns the listeners, runs the
//! per-connection negotiation pipeline (security phase, handshake, mux
//! phase), keeps the connection table, and dispatches every inbound
//! logical stream to the protocol handler registered for it.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_shutdown::ShutdownManager;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use relaypoint_core::addr::Multiaddr;
use relaypoint_core::identity::{Keypair, PeerId};
use relaypoint_core::mux::{self, MuxHandle, Stream};
use relaypoint_core::secure::{self, Role};
use relaypoint_core::transport::{self, Listener, RawConn};
use relaypoint_core::negotiate;
use tokio::task::JoinSet;
use tokio::time::{timeout, Duration, Instant};

use crate::config::NodeConfig;
use crate::connmgr::ConnView;
use crate::error::{Error, Result};
use crate::events::{ConnId, ConnectivityEvent, EventBus, Subscription};

pub(crate) mod maintain;

/// A protocol handler invoked for every inbound stream that negotiated the
/// handler's protocol ID. Relayed circuit streams are dispatched through
/// the same registry, so a handler serves both direct and relayed callers.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn handle(&self, peer: PeerId, remote_addr: Multiaddr, stream: Stream);
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// One live transport session with a remote peer, tagged with the
/// negotiated stack and tracked for pruning by the connection manager.
pub struct Connection {
    id: ConnId,
    peer: PeerId,
    remote_addr: Multiaddr,
    direction: Direction,
    opened_at: Instant,
    mux: MuxHandle,
}

impl Connection {
    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn remote_addr(&self) -> &Multiaddr {
        &self.remote_addr
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    pub fn last_activity(&self) -> Instant {
        self.mux.last_activity()
    }

    pub fn is_closed(&self) -> bool {
        self.mux.is_closed()
    }

    pub async fn close(&self) {
        self.mux.close().await;
    }

    /// Opens a logical stream and negotiates `protocol` on it.
    pub async fn open_stream(&self, protocol: &str) -> Result<Stream> {
        let mut stream = self.mux.open_stream().await?;
        negotiate::propose(&mut stream, &[protocol.to_string()]).await?;
        Ok(stream)
    }
}

pub(crate) struct HostShared {
    keypair: Keypair,
    config: Arc<NodeConfig>,
    listen_addrs: RwLock<Vec<Multiaddr>>,
    conns: DashMap<PeerId, Vec<Arc<Connection>>>,
    conn_count: AtomicUsize,
    next_conn_id: AtomicU64,
    handlers: DashMap<String, Arc<dyn StreamHandler>>,
    events: EventBus,
    shutdown: ShutdownManager<()>,
}

/// Cheap-to-clone surface of the host, handed to services and background
/// loops.
#[derive(Clone)]
pub struct HostHandle {
    shared: Arc<HostShared>,
}

/// Owner of the accept loops; dropping it stops accepting.
pub(crate) struct Host {
    handle: HostHandle,
    accept_tasks: JoinSet<()>,
}

impl Host {
    pub(crate) fn new(keypair: Keypair, config: Arc<NodeConfig>) -> Host {
        let event_queue_size = config.event_queue_size;
        let shared = Arc::new(HostShared {
            keypair,
            config,
            listen_addrs: RwLock::new(Vec::new()),
            conns: DashMap::new(),
            conn_count: AtomicUsize::new(0),
            next_conn_id: AtomicU64::new(1),
            handlers: DashMap::new(),
            events: EventBus::new(event_queue_size),
            shutdown: ShutdownManager::new(),
        });
        Host {
            handle: HostHandle { shared },
            accept_tasks: JoinSet::new(),
        }
    }

    /// Binds every configured listen address. Any single bind failure is
    /// returned (and treated as fatal by the caller): a node that cannot
    /// listen where it was told to is not usefully up.
    pub(crate) async fn listen(&mut self) -> Result<()> {
        let shared = &self.handle.shared;
        for addr in &shared.config.listen_addrs {
            let listener = Listener::bind(addr).await?;
            log::info!("listening on {}", listener.local_addr());
            shared.listen_addrs.write().push(listener.local_addr().clone());
            self.accept_tasks
                .spawn(accept_loop(shared.clone(), listener));
        }
        Ok(())
    }

    pub(crate) fn handle(&self) -> HostHandle {
        self.handle.clone()
    }
}

impl HostHandle {
    pub fn peer_id(&self) -> PeerId {
        self.shared.keypair.peer_id()
    }

    pub(crate) fn config(&self) -> &NodeConfig {
        &self.shared.config
    }

    /// The bound listen addresses (with real ports).
    pub fn addrs(&self) -> Vec<Multiaddr> {
        self.shared.listen_addrs.read().clone()
    }

    pub(crate) fn shutdown_manager(&self) -> &ShutdownManager<()> {
        &self.shared.shutdown
    }

    /// Registers `handler` for a protocol ID. Installing the same ID twice
    /// is refused; the startup path treats that as fatal.
    pub fn register_handler(&self, protocol: &str, handler: Arc<dyn StreamHandler>) -> Result<()> {
        match self.shared.handlers.entry(protocol.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(Error::HandlerExists(protocol.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(handler);
                Ok(())
            }
        }
    }

    /// Dials, secures and multiplexes a connection to `addr`. When the
    /// address pins a peer id, the handshake result is checked against it.
    pub async fn dial(&self, addr: &Multiaddr) -> Result<Arc<Connection>> {
        if self.shared.shutdown.is_shutdown_triggered() {
            return Err(Error::Shutdown);
        }
        let raw = transport::dial(addr).await?;
        let conn = setup_conn(self.shared.clone(), raw, Role::Initiator).await?;
        if let Some(expected) = addr.peer_id() {
            if conn.peer != expected {
                conn.close().await;
                return Err(Error::NotConnected(expected));
            }
        }
        Ok(conn)
    }

    pub fn connection(&self, peer: &PeerId) -> Option<Arc<Connection>> {
        self.shared
            .conns
            .get(peer)
            .and_then(|list| list.first().cloned())
    }

    pub async fn open_stream(&self, peer: &PeerId, protocol: &str) -> Result<Stream> {
        let conn = self.connection(peer).ok_or(Error::NotConnected(*peer))?;
        conn.open_stream(protocol).await
    }

    pub fn connection_count(&self) -> usize {
        self.shared.conn_count.load(Ordering::Relaxed)
    }

    pub fn current_peers(&self) -> Vec<PeerId> {
        self.shared.events.current_peers()
    }

    pub fn subscribe(&self) -> Subscription {
        self.shared.events.subscribe()
    }

    pub(crate) fn connection_views(&self) -> Vec<ConnView> {
        let mut views = Vec::with_capacity(self.connection_count());
        for entry in self.shared.conns.iter() {
            for conn in entry.value() {
                views.push(ConnView {
                    peer: conn.peer,
                    conn: conn.id,
                    opened_at: conn.opened_at,
                    last_activity: conn.last_activity(),
                });
            }
        }
        views
    }

    pub(crate) async fn close_connection(&self, peer: &PeerId, id: ConnId) {
        let conn = self
            .shared
            .conns
            .get(peer)
            .and_then(|list| list.iter().find(|c| c.id == id).cloned());
        if let Some(conn) = conn {
            conn.close().await;
        }
    }

    /// Runs the handler registry against a stream that arrived outside the
    /// normal mux path (a relayed circuit delivered over STOP).
    pub(crate) async fn dispatch_incoming(&self, peer: PeerId, remote_addr: Multiaddr, stream: Stream) {
        dispatch_stream(self.shared.clone(), peer, remote_addr, stream).await;
    }

    /// Stops accepting, lets relayed circuits drain within the shutdown
    /// grace, then closes every connection.
    pub async fn shutdown(&self) {
        let grace = self.shared.config.shutdown_grace;
        _ = self.shared.shutdown.trigger_shutdown(());
        _ = timeout(
            grace + Duration::from_secs(1),
            self.shared.shutdown.wait_shutdown_complete(),
        )
        .await;
        let conns: Vec<Arc<Connection>> = self
            .shared
            .conns
            .iter()
            .flat_map(|entry| entry.value().clone())
            .collect();
        for conn in conns {
            conn.close().await;
        }
        // Handlers hold services which hold host handles; dropping them
        // here lets the whole graph free once the last task exits.
        self.shared.handlers.clear();
    }
}

async fn accept_loop(shared: Arc<HostShared>, listener: Listener) {
    loop {
        let Ok(rs) = shared.shutdown.wrap_cancel(listener.accept()).await else {
            log::debug!("accept loop on {} shut down", listener.local_addr());
            break;
        };
        match rs {
            Ok((stream, remote_addr, ws)) => {
                let shared = shared.clone();
                tokio::spawn(async move {
                    let raw =
                        match transport::upgrade_inbound(stream, remote_addr.clone(), ws).await {
                            Ok(raw) => raw,
                            Err(e) => {
                                log::debug!("inbound upgrade {remote_addr}: {e:?}");
                                return;
                            }
                        };
                    if let Err(e) = setup_conn(shared, raw, Role::Responder).await {
                        log::debug!("inbound setup {remote_addr}: {e:?}");
                    }
                });
            }
            Err(e) => {
                log::warn!("accept on {}: {e:?}", listener.local_addr());
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Negotiation pipeline shared by dial and accept: security phase on the
/// raw connection, channel handshake, mux phase, then registration and
/// stream dispatch for the connection's lifetime.
async fn setup_conn(
    shared: Arc<HostShared>,
    mut raw: RawConn,
    role: Role,
) -> Result<Arc<Connection>> {
    let config = shared.config.clone();
    let keypair = shared.keypair.clone();
    let secured = timeout(config.handshake_timeout, async move {
        match role {
            Role::Initiator => {
                negotiate::propose(&mut raw, &config.security_protocols).await?;
            }
            Role::Responder => {
                negotiate::accept(&mut raw, &config.security_protocols).await?;
            }
        }
        let mut secured = secure::handshake(role, &keypair, raw).await?;
        match role {
            Role::Initiator => {
                negotiate::propose(&mut secured, &config.mux_protocols).await?;
            }
            Role::Responder => {
                negotiate::accept(&mut secured, &config.mux_protocols).await?;
            }
        }
        Ok::<_, relaypoint_core::Error>(secured)
    })
    .await
    .map_err(|_| Error::Timeout)??;

    let peer = secured.peer;
    let remote_addr = secured.remote_addr.clone();
    let muxer = mux::start(secured, role);
    let id = shared.next_conn_id.fetch_add(1, Ordering::Relaxed);
    let connection = Arc::new(Connection {
        id,
        peer,
        remote_addr: remote_addr.clone(),
        direction: match role {
            Role::Initiator => Direction::Outbound,
            Role::Responder => Direction::Inbound,
        },
        opened_at: Instant::now(),
        mux: muxer.handle.clone(),
    });
    shared.conns.entry(peer).or_default().push(connection.clone());
    shared.conn_count.fetch_add(1, Ordering::Relaxed);
    shared.events.publish(ConnectivityEvent::Connected {
        peer,
        conn: id,
        addr: remote_addr.clone(),
    });
    log::debug!("connected {peer} via {remote_addr}");

    let task_shared = shared.clone();
    let mut incoming = muxer.incoming;
    tokio::spawn(async move {
        while let Some(stream) = incoming.recv().await {
            let shared = task_shared.clone();
            let addr = remote_addr.clone();
            tokio::spawn(dispatch_stream(shared, peer, addr, stream));
        }
        remove_conn(&task_shared, peer, id);
    });
    Ok(connection)
}

fn remove_conn(shared: &Arc<HostShared>, peer: PeerId, id: ConnId) {
    let mut removed = false;
    shared.conns.remove_if_mut(&peer, |_, list| {
        let before = list.len();
        list.retain(|c| c.id != id);
        removed = list.len() != before;
        list.is_empty()
    });
    if removed {
        shared.conn_count.fetch_sub(1, Ordering::Relaxed);
        shared
            .events
            .publish(ConnectivityEvent::Disconnected { peer, conn: id });
        log::debug!("disconnected {peer}");
    }
}

async fn dispatch_stream(
    shared: Arc<HostShared>,
    peer: PeerId,
    remote_addr: Multiaddr,
    mut stream: Stream,
) {
    let ids: Vec<String> = shared.handlers.iter().map(|e| e.key().clone()).collect();
    let protocol = match negotiate::accept(&mut stream, &ids).await {
        Ok(protocol) => protocol,
        Err(e) => {
            log::debug!("stream from {peer}: {e:?}");
            return;
        }
    };
    let handler = shared.handlers.get(&protocol).map(|e| e.value().clone());
    if let Some(handler) = handler {
        handler.handle(peer, remote_addr, stream).await;
    }
}
