//! Connectivity event hub. Connection handlers publish here without ever
//! blocking: each subscriber owns a bounded queue drained at its own pace,
//! and a full queue costs that subscriber the event rather than stalling
//! the connection path.

use dashmap::DashMap;
use parking_lot::Mutex;
use relaypoint_core::addr::Multiaddr;
use relaypoint_core::identity::PeerId;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

pub type ConnId = u64;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConnectivityEvent {
    Connected {
        peer: PeerId,
        conn: ConnId,
        addr: Multiaddr,
    },
    Disconnected {
        peer: PeerId,
        conn: ConnId,
    },
}

pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::Sender<ConnectivityEvent>>>,
    peers: DashMap<PeerId, usize>,
    queue_size: usize,
}

/// One subscriber's view of the event sequence. Dropping it unsubscribes.
pub struct Subscription {
    rx: mpsc::Receiver<ConnectivityEvent>,
}

impl Subscription {
    /// The next event; `None` once the bus shut down.
    pub async fn recv(&mut self) -> Option<ConnectivityEvent> {
        self.rx.recv().await
    }
}

impl EventBus {
    pub fn new(queue_size: usize) -> EventBus {
        EventBus {
            subscribers: Mutex::new(Vec::new()),
            peers: DashMap::new(),
            queue_size,
        }
    }

    /// A fresh subscription; events flow from now on, history is not
    /// replayed.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.queue_size);
        self.subscribers.lock().push(tx);
        Subscription { rx }
    }

    /// Fans the event out to every subscriber. The peer snapshot is
    /// updated first, so `current_peers` is always consistent with the
    /// most recently delivered event.
    pub fn publish(&self, event: ConnectivityEvent) {
        match &event {
            ConnectivityEvent::Connected { peer, .. } => {
                *self.peers.entry(*peer).or_insert(0) += 1;
            }
            ConnectivityEvent::Disconnected { peer, .. } => {
                self.peers.remove_if_mut(peer, |_, count| {
                    *count = count.saturating_sub(1);
                    *count == 0
                });
            }
        }
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::warn!("slow event subscriber, dropping {event:?}");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    /// Peers with at least one live connection, per the delivered events.
    pub fn current_peers(&self) -> Vec<PeerId> {
        self.peers.iter().map(|e| *e.key()).collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use relaypoint_core::identity::Keypair;

    fn connected(peer: PeerId, conn: ConnId) -> ConnectivityEvent {
        ConnectivityEvent::Connected {
            peer,
            conn,
            addr: "/ip4/127.0.0.1/tcp/1".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn per_connection_order_is_preserved() {
        let bus = EventBus::new(8);
        let mut sub = bus.subscribe();
        let peer = Keypair::generate().peer_id();

        bus.publish(connected(peer, 1));
        bus.publish(ConnectivityEvent::Disconnected { peer, conn: 1 });

        assert!(matches!(
            sub.recv().await.unwrap(),
            ConnectivityEvent::Connected { conn: 1, .. }
        ));
        assert!(matches!(
            sub.recv().await.unwrap(),
            ConnectivityEvent::Disconnected { conn: 1, .. }
        ));
    }

    #[tokio::test]
    async fn snapshot_tracks_delivered_events() {
        let bus = EventBus::new(8);
        let a = Keypair::generate().peer_id();
        let b = Keypair::generate().peer_id();

        bus.publish(connected(a, 1));
        bus.publish(connected(b, 2));
        bus.publish(connected(b, 3));
        let mut peers = bus.current_peers();
        peers.sort();
        let mut expect = vec![a, b];
        expect.sort();
        assert_eq!(peers, expect);

        // One of b's two connections goes away: still present.
        bus.publish(ConnectivityEvent::Disconnected { peer: b, conn: 2 });
        assert_eq!(bus.current_peers().len(), 2);
        bus.publish(ConnectivityEvent::Disconnected { peer: b, conn: 3 });
        assert_eq!(bus.current_peers(), vec![a]);
    }

    #[tokio::test]
    async fn slow_subscriber_never_blocks_publish() {
        let bus = EventBus::new(1);
        let mut sub = bus.subscribe();
        let peer = Keypair::generate().peer_id();

        // Second publish overflows the queue and is dropped for this
        // subscriber; publish itself must not block.
        bus.publish(connected(peer, 1));
        bus.publish(connected(peer, 2));
        bus.publish(connected(peer, 3));

        assert!(matches!(
            sub.recv().await.unwrap(),
            ConnectivityEvent::Connected { conn: 1, .. }
        ));
        assert_eq!(bus.current_peers(), vec![peer]);
    }

    #[tokio::test]
    async fn dropped_subscription_is_pruned() {
        let bus = EventBus::new(4);
        let sub = bus.subscribe();
        drop(sub);
        let peer = Keypair::generate().peer_id();
        bus.publish(connected(peer, 1));
        assert!(bus.subscribers.lock().is_empty());
    }
}
