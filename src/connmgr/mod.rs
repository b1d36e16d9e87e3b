//! Watermark-based connection pruning. Total connections are allowed to
//! drift up to the high watermark; crossing it trims back down to the low
//! watermark, skipping anything still inside its grace period and
//! preferring the least recently active, then oldest, connections.

use std::time::Duration;

use relaypoint_core::identity::PeerId;
use tokio::time::Instant;

use crate::events::ConnId;
use crate::host::HostHandle;

#[derive(Clone, Debug)]
pub struct ConnectionLimits {
    pub low: usize,
    pub high: usize,
    pub grace: Duration,
    pub check_interval: Duration,
}

pub(crate) const DEFAULT_LOW_WATERMARK: usize = 200;
pub(crate) const DEFAULT_HIGH_WATERMARK: usize = 400;
pub(crate) const DEFAULT_GRACE: Duration = Duration::from_secs(120);
const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(10);

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            low: DEFAULT_LOW_WATERMARK,
            high: DEFAULT_HIGH_WATERMARK,
            grace: DEFAULT_GRACE,
            check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }
}

impl ConnectionLimits {
    pub fn set_watermarks(mut self, low: usize, high: usize) -> Self {
        self.low = low;
        self.high = high;
        self
    }

    pub fn set_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn set_check_interval(mut self, check_interval: Duration) -> Self {
        self.check_interval = check_interval;
        self
    }
}

/// What the selector needs to know about one live connection.
#[derive(Clone, Debug)]
pub(crate) struct ConnView {
    pub peer: PeerId,
    pub conn: ConnId,
    pub opened_at: Instant,
    pub last_activity: Instant,
}

/// Picks the connections to close. Empty unless the count exceeds the high
/// watermark; otherwise enough grace-expired connections to bring the
/// count back to the low watermark, least recently active first, oldest
/// first among equals. Connections younger than the grace period are never
/// selected, even if the count stays above the high watermark.
pub(crate) fn select_victims(
    now: Instant,
    limits: &ConnectionLimits,
    conns: &[ConnView],
) -> Vec<(PeerId, ConnId)> {
    if conns.len() <= limits.high {
        return Vec::new();
    }
    let excess = conns.len() - limits.low;
    let mut eligible: Vec<&ConnView> = conns
        .iter()
        .filter(|view| now.saturating_duration_since(view.opened_at) >= limits.grace)
        .collect();
    eligible.sort_by_key(|view| (view.last_activity, view.opened_at));
    eligible
        .into_iter()
        .take(excess)
        .map(|view| (view.peer, view.conn))
        .collect()
}

pub(crate) async fn prune_loop(host: HostHandle, limits: ConnectionLimits) {
    loop {
        tokio::time::sleep(limits.check_interval).await;
        let views = host.connection_views();
        let victims = select_victims(Instant::now(), &limits, &views);
        if victims.is_empty() {
            continue;
        }
        log::info!(
            "connection count {} over high watermark {}, closing {}",
            views.len(),
            limits.high,
            victims.len()
        );
        for (peer, conn) in victims {
            host.close_connection(&peer, conn).await;
        }
    }
}
