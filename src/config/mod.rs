use std::path::PathBuf;
use std::time::Duration;

use relaypoint_core::addr::Multiaddr;
use relaypoint_core::{mux, secure};

use crate::connmgr::ConnectionLimits;
use crate::protocol::CircuitLimit;
use crate::reachability::Reachability;

pub(crate) const RESERVATION_TTL: Duration = Duration::from_secs(600);
pub(crate) const CIRCUIT_MAX_BYTES: u64 = 1 << 20;
pub(crate) const CIRCUIT_MAX_SECS: u64 = 120;
const MAX_RESERVATIONS: usize = 128;
const MAX_CIRCUITS_PER_PEER: usize = 16;
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity policy of the relay broker; independent of the general
/// connection-manager watermarks.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub max_reservations: usize,
    pub reservation_ttl: Duration,
    pub max_circuits_per_peer: usize,
    pub limit: CircuitLimit,
    /// How long the relay waits for the reserved peer to accept a circuit.
    pub stop_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_reservations: MAX_RESERVATIONS,
            reservation_ttl: RESERVATION_TTL,
            max_circuits_per_peer: MAX_CIRCUITS_PER_PEER,
            limit: CircuitLimit {
                max_bytes: CIRCUIT_MAX_BYTES,
                max_secs: CIRCUIT_MAX_SECS,
            },
            stop_timeout: STOP_TIMEOUT,
        }
    }
}

impl RelayConfig {
    pub fn set_max_reservations(mut self, max_reservations: usize) -> Self {
        self.max_reservations = max_reservations;
        self
    }

    pub fn set_reservation_ttl(mut self, reservation_ttl: Duration) -> Self {
        self.reservation_ttl = reservation_ttl;
        self
    }

    pub fn set_max_circuits_per_peer(mut self, max_circuits_per_peer: usize) -> Self {
        self.max_circuits_per_peer = max_circuits_per_peer;
        self
    }

    pub fn set_limit(mut self, limit: CircuitLimit) -> Self {
        self.limit = limit;
        self
    }
}

#[derive(Clone, Debug)]
pub struct ProbeConfig {
    pub interval: Duration,
    /// Peers asked for a dial-back per round.
    pub max_peers: usize,
    /// Sliding window of probe outcomes the status is derived from.
    pub window: usize,
    pub dial_timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(90),
            max_peers: 3,
            window: 8,
            dial_timeout: Duration::from_secs(5),
        }
    }
}

impl ProbeConfig {
    pub fn set_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn set_max_peers(mut self, max_peers: usize) -> Self {
        self.max_peers = max_peers;
        self
    }

    pub fn set_dial_timeout(mut self, dial_timeout: Duration) -> Self {
        self.dial_timeout = dial_timeout;
        self
    }
}

#[derive(Clone, Debug)]
pub struct PunchConfig {
    pub max_attempts: usize,
    pub dial_timeout: Duration,
    /// Cap on the measured round trip used to schedule the synchronized
    /// dial, so a bogus peer cannot park the coordinator.
    pub max_rtt: Duration,
}

impl Default for PunchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            dial_timeout: Duration::from_secs(5),
            max_rtt: Duration::from_secs(2),
        }
    }
}

impl PunchConfig {
    pub fn set_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn set_dial_timeout(mut self, dial_timeout: Duration) -> Self {
        self.dial_timeout = dial_timeout;
        self
    }
}

pub struct NodeConfig {
    pub listen_addrs: Vec<Multiaddr>,
    /// Persisted identity location; `None` runs with an ephemeral key.
    pub key_file: Option<PathBuf>,
    pub security_protocols: Vec<String>,
    pub mux_protocols: Vec<String>,
    pub limits: ConnectionLimits,
    /// `None` disables the relay broker; the node is then client-only.
    pub relay: Option<RelayConfig>,
    pub probe: ProbeConfig,
    pub punch: PunchConfig,
    /// Pins the reachability status instead of deriving it from probes.
    pub force_reachability: Option<Reachability>,
    pub handshake_timeout: Duration,
    pub shutdown_grace: Duration,
    pub event_queue_size: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addrs: Vec::new(),
            key_file: None,
            security_protocols: vec![secure::PROTOCOL_ID.to_string()],
            mux_protocols: vec![mux::PROTOCOL_ID.to_string()],
            limits: ConnectionLimits::default(),
            relay: Some(RelayConfig::default()),
            probe: ProbeConfig::default(),
            punch: PunchConfig::default(),
            force_reachability: None,
            handshake_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(5),
            event_queue_size: 64,
        }
    }
}

impl NodeConfig {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn set_listen_addrs(mut self, listen_addrs: Vec<Multiaddr>) -> Self {
        self.listen_addrs = listen_addrs;
        self
    }

    pub fn set_key_file(mut self, key_file: PathBuf) -> Self {
        self.key_file.replace(key_file);
        self
    }

    pub fn set_limits(mut self, limits: ConnectionLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn set_relay(mut self, relay: RelayConfig) -> Self {
        self.relay.replace(relay);
        self
    }

    pub fn disable_relay(mut self) -> Self {
        self.relay = None;
        self
    }

    pub fn set_probe(mut self, probe: ProbeConfig) -> Self {
        self.probe = probe;
        self
    }

    pub fn set_punch(mut self, punch: PunchConfig) -> Self {
        self.punch = punch;
        self
    }

    pub fn set_force_reachability(mut self, reachability: Reachability) -> Self {
        self.force_reachability.replace(reachability);
        self
    }

    pub fn set_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    pub fn set_shutdown_grace(mut self, shutdown_grace: Duration) -> Self {
        self.shutdown_grace = shutdown_grace;
        self
    }
}
