//! Reachability probing. The node periodically asks a few connected peers
//! to dial back one of its listen addresses; the sliding window of
//! outcomes classifies the node as publicly reachable, private, or
//! unknown. The probe service side performs dial-backs for others,
//! verifying the dialed-back identity before reporting success.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use crossbeam_utils::atomic::AtomicCell;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use relaypoint_core::addr::Multiaddr;
use relaypoint_core::identity::PeerId;
use relaypoint_core::mux::Stream;
use tokio::time::{timeout, Duration};

use crate::config::ProbeConfig;
use crate::error::{Error, Result};
use crate::host::{HostHandle, StreamHandler};
use crate::protocol::{recv_msg, send_msg, ProbeRequest, ProbeResponse, PROTOCOL_PROBE};

const MIN_SAMPLES: usize = 3;
const PROBE_REPLY_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Reachability {
    Unknown,
    Public,
    Private,
}

/// Derives the node's [`Reachability`] from probe outcomes: consistent
/// success marks Public, consistent failure Private, anything mixed or
/// thin stays Unknown. A forced status pins the value and ignores probes.
pub struct ReachabilityTracker {
    status: AtomicCell<Reachability>,
    window: Mutex<VecDeque<bool>>,
    window_size: usize,
    forced: bool,
}

impl ReachabilityTracker {
    pub(crate) fn new(window_size: usize, forced: Option<Reachability>) -> ReachabilityTracker {
        ReachabilityTracker {
            status: AtomicCell::new(forced.unwrap_or(Reachability::Unknown)),
            window: Mutex::new(VecDeque::with_capacity(window_size)),
            window_size,
            forced: forced.is_some(),
        }
    }

    pub fn status(&self) -> Reachability {
        self.status.load()
    }

    pub(crate) fn record(&self, reachable: bool) {
        if self.forced {
            return;
        }
        let mut window = self.window.lock();
        window.push_back(reachable);
        while window.len() > self.window_size {
            window.pop_front();
        }
        let successes = window.iter().filter(|v| **v).count();
        let failures = window.len() - successes;
        let status = if successes >= MIN_SAMPLES && failures == 0 {
            Reachability::Public
        } else if failures >= MIN_SAMPLES && successes == 0 {
            Reachability::Private
        } else {
            Reachability::Unknown
        };
        if self.status.load() != status {
            log::info!("reachability status: {status:?}");
        }
        self.status.store(status);
    }
}

/// Service side: dials back the candidate address and reports the outcome.
/// Success requires the dial-back to land on the requesting peer, not
/// merely on something that accepts TCP.
pub(crate) struct ProbeHandler {
    host: HostHandle,
    dial_timeout: Duration,
}

impl ProbeHandler {
    pub(crate) fn new(host: HostHandle, dial_timeout: Duration) -> ProbeHandler {
        ProbeHandler { host, dial_timeout }
    }
}

#[async_trait]
impl StreamHandler for ProbeHandler {
    async fn handle(&self, peer: PeerId, _remote_addr: Multiaddr, mut stream: Stream) {
        let request: ProbeRequest = match recv_msg(&mut stream).await {
            Ok(request) => request,
            Err(e) => {
                log::debug!("probe request from {peer}: {e:?}");
                return;
            }
        };
        let reachable = dial_back(&self.host, peer, &request.addr, self.dial_timeout).await;
        log::debug!("dial-back of {} for {peer}: {reachable}", request.addr);
        _ = send_msg(&mut stream, &ProbeResponse { reachable }).await;
    }
}

async fn dial_back(host: &HostHandle, peer: PeerId, addr: &Multiaddr, dial_timeout: Duration) -> bool {
    if addr.socket_addr().is_none() {
        return false;
    }
    match timeout(dial_timeout, host.dial(addr)).await {
        Ok(Ok(conn)) => {
            let verified = conn.peer() == peer;
            conn.close().await;
            verified
        }
        _ => false,
    }
}

/// Prober loop: every interval, ask up to `max_peers` random connected
/// peers to dial back our first listen address and fold the answers into
/// the tracker. Probe transport failures are not evidence either way and
/// are skipped.
pub(crate) async fn probe_loop(host: HostHandle, tracker: Arc<ReachabilityTracker>, config: ProbeConfig) {
    tokio::time::sleep(Duration::from_secs(2)).await;
    loop {
        if let Some(addr) = host.addrs().into_iter().next() {
            let mut peers = host.current_peers();
            peers.shuffle(&mut rand::thread_rng());
            let mut asked = 0;
            for peer in peers {
                if asked >= config.max_peers {
                    break;
                }
                match probe_once(&host, peer, &addr).await {
                    Ok(reachable) => {
                        tracker.record(reachable);
                        asked += 1;
                    }
                    Err(e) => log::debug!("probe via {peer}: {e:?}"),
                }
            }
        }
        tokio::time::sleep(config.interval).await;
    }
}

async fn probe_once(host: &HostHandle, peer: PeerId, addr: &Multiaddr) -> Result<bool> {
    let mut stream = host.open_stream(&peer, PROTOCOL_PROBE).await?;
    send_msg(&mut stream, &ProbeRequest { addr: addr.clone() }).await?;
    let response: ProbeResponse = timeout(PROBE_REPLY_TIMEOUT, recv_msg(&mut stream))
        .await
        .map_err(|_| Error::Timeout)??;
    Ok(response.reachable)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn consistent_success_marks_public() {
        let tracker = ReachabilityTracker::new(8, None);
        assert_eq!(tracker.status(), Reachability::Unknown);
        tracker.record(true);
        tracker.record(true);
        assert_eq!(tracker.status(), Reachability::Unknown);
        tracker.record(true);
        assert_eq!(tracker.status(), Reachability::Public);
    }

    #[test]
    fn consistent_failure_marks_private() {
        let tracker = ReachabilityTracker::new(8, None);
        for _ in 0..3 {
            tracker.record(false);
        }
        assert_eq!(tracker.status(), Reachability::Private);
    }

    #[test]
    fn contradictory_data_stays_unknown() {
        let tracker = ReachabilityTracker::new(8, None);
        tracker.record(true);
        tracker.record(false);
        tracker.record(true);
        tracker.record(true);
        assert_eq!(tracker.status(), Reachability::Unknown);
    }

    #[test]
    fn old_samples_slide_out_of_the_window() {
        let tracker = ReachabilityTracker::new(4, None);
        tracker.record(false);
        for _ in 0..4 {
            tracker.record(true);
        }
        assert_eq!(tracker.status(), Reachability::Public);
    }

    #[test]
    fn forced_status_ignores_probes() {
        let tracker = ReachabilityTracker::new(4, Some(Reachability::Private));
        for _ in 0..4 {
            tracker.record(true);
        }
        assert_eq!(tracker.status(), Reachability::Private);
    }
}
