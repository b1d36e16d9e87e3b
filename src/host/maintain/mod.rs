use std::sync::Arc;

use tokio::task::JoinSet;

use crate::connmgr;
use crate::host::HostHandle;
use crate::reachability::{self, ReachabilityTracker};
use crate::relay::{self, RelayService};

/// Spawns the background maintenance loops: watermark pruning, reservation
/// expiry and reachability probing. The caller parks the set under the
/// host's shutdown manager.
pub(crate) fn start_task(
    host: &HostHandle,
    relay_service: Option<Arc<RelayService>>,
    tracker: Arc<ReachabilityTracker>,
) -> JoinSet<()> {
    let mut join_set = JoinSet::new();
    join_set.spawn(connmgr::prune_loop(
        host.clone(),
        host.config().limits.clone(),
    ));
    if let Some(service) = relay_service {
        join_set.spawn(relay::expire_loop(service));
    }
    if host.config().force_reachability.is_none() {
        join_set.spawn(reachability::probe_loop(
            host.clone(),
            tracker,
            host.config().probe.clone(),
        ));
    }
    join_set
}
