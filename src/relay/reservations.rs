use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use relaypoint_core::identity::PeerId;
use tokio::time::{Duration, Instant};

/// Per-peer reservation state. The table is sharded; every mutation takes
/// only the entry's shard, never a table-wide lock.
pub(crate) struct ReservationTable {
    entries: DashMap<PeerId, ReservationEntry>,
    count: AtomicUsize,
    max: usize,
}

struct ReservationEntry {
    expires_at: Instant,
    circuits: Arc<AtomicUsize>,
}

impl ReservationTable {
    pub(crate) fn new(max: usize) -> ReservationTable {
        ReservationTable {
            entries: DashMap::new(),
            count: AtomicUsize::new(0),
            max,
        }
    }

    /// Grants or refreshes a reservation. A repeat request from the same
    /// peer replaces the existing reservation (fresh TTL, same capacity
    /// slot) instead of stacking a second one. Returns `false` when the
    /// table is at capacity.
    pub(crate) fn reserve(&self, peer: PeerId, ttl: Duration) -> bool {
        match self.entries.entry(peer) {
            dashmap::mapref::entry::Entry::Occupied(mut e) => {
                e.get_mut().expires_at = Instant::now() + ttl;
                true
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                let admitted = self
                    .count
                    .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| {
                        (c < self.max).then_some(c + 1)
                    })
                    .is_ok();
                if !admitted {
                    return false;
                }
                v.insert(ReservationEntry {
                    expires_at: Instant::now() + ttl,
                    circuits: Arc::new(AtomicUsize::new(0)),
                });
                true
            }
        }
    }

    /// The circuit counter of a live reservation. An expired entry is
    /// removed on the spot, so expiry holds even between sweeps.
    pub(crate) fn active(&self, peer: &PeerId) -> Option<Arc<AtomicUsize>> {
        let now = Instant::now();
        {
            let entry = self.entries.get(peer)?;
            if entry.expires_at > now {
                return Some(entry.circuits.clone());
            }
        }
        self.remove_expired(peer, now);
        None
    }

    pub(crate) fn cancel(&self, peer: &PeerId) -> bool {
        let removed = self.entries.remove(peer).is_some();
        if removed {
            self.count.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Drops every expired reservation, releasing capacity. Returns how
    /// many were removed.
    pub(crate) fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<PeerId> = self
            .entries
            .iter()
            .filter(|e| e.value().expires_at <= now)
            .map(|e| *e.key())
            .collect();
        let mut removed = 0;
        for peer in expired {
            if self.remove_expired(&peer, now) {
                removed += 1;
            }
        }
        removed
    }

    pub(crate) fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub(crate) fn clear(&self) {
        self.entries.clear();
        self.count.store(0, Ordering::Relaxed);
    }

    fn remove_expired(&self, peer: &PeerId, now: Instant) -> bool {
        let removed = self
            .entries
            .remove_if(peer, |_, entry| entry.expires_at <= now)
            .is_some();
        if removed {
            self.count.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use relaypoint_core::identity::Keypair;

    #[tokio::test(start_paused = true)]
    async fn repeat_reserve_replaces_not_stacks() {
        let table = ReservationTable::new(8);
        let peer = Keypair::generate().peer_id();
        assert!(table.reserve(peer, Duration::from_secs(60)));
        assert!(table.reserve(peer, Duration::from_secs(60)));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_is_enforced_per_distinct_peer() {
        let table = ReservationTable::new(2);
        let a = Keypair::generate().peer_id();
        let b = Keypair::generate().peer_id();
        let c = Keypair::generate().peer_id();
        assert!(table.reserve(a, Duration::from_secs(60)));
        assert!(table.reserve(b, Duration::from_secs(60)));
        assert!(!table.reserve(c, Duration::from_secs(60)));
        // Refreshing an existing reservation is not a new slot.
        assert!(table.reserve(a, Duration::from_secs(60)));

        // Cancellation releases the slot.
        assert!(table.cancel(&b));
        assert!(table.reserve(c, Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expiry_releases_capacity() {
        let table = ReservationTable::new(1);
        let a = Keypair::generate().peer_id();
        let b = Keypair::generate().peer_id();
        assert!(table.reserve(a, Duration::from_secs(60)));
        assert!(table.active(&a).is_some());

        tokio::time::advance(Duration::from_secs(61)).await;
        // Expired even though no sweep ran yet.
        assert!(table.active(&a).is_none());
        assert!(table.reserve(b, Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_reports_expired_entries() {
        let table = ReservationTable::new(8);
        let a = Keypair::generate().peer_id();
        let b = Keypair::generate().peer_id();
        table.reserve(a, Duration::from_secs(30));
        table.reserve(b, Duration::from_secs(300));
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(table.sweep(), 1);
        assert_eq!(table.len(), 1);
        assert!(table.active(&b).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn replacement_refreshes_ttl() {
        let table = ReservationTable::new(8);
        let a = Keypair::generate().peer_id();
        table.reserve(a, Duration::from_secs(60));
        tokio::time::advance(Duration::from_secs(45)).await;
        table.reserve(a, Duration::from_secs(60));
        tokio::time::advance(Duration::from_secs(45)).await;
        assert!(table.active(&a).is_some());
    }
}
