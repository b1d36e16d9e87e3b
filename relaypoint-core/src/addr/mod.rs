use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use crate::error::Error;
use crate::identity::PeerId;

/// One segment of a [`Multiaddr`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Protocol {
    Ip4(Ipv4Addr),
    Ip6(Ipv6Addr),
    Tcp(u16),
    /// WebSocket framing on top of the preceding TCP segment.
    Ws,
    P2p(PeerId),
    /// Marks the remainder of the address as relayed through the preceding
    /// peer.
    P2pCircuit,
}

/// A self-describing network address: an ordered stack of protocol
/// segments, e.g. `/ip4/203.0.113.7/tcp/8080/ws/p2p/<peer-id>`.
/// Many addresses may map to one peer.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Default)]
pub struct Multiaddr {
    segments: Vec<Protocol>,
}

impl Multiaddr {
    pub fn empty() -> Multiaddr {
        Multiaddr {
            segments: Vec::new(),
        }
    }

    pub fn from_socket_addr(addr: SocketAddr, ws: bool) -> Multiaddr {
        let mut segments = Vec::with_capacity(3);
        match addr.ip() {
            IpAddr::V4(ip) => segments.push(Protocol::Ip4(ip)),
            IpAddr::V6(ip) => segments.push(Protocol::Ip6(ip)),
        }
        segments.push(Protocol::Tcp(addr.port()));
        if ws {
            segments.push(Protocol::Ws);
        }
        Multiaddr { segments }
    }

    pub fn push(&mut self, protocol: Protocol) {
        self.segments.push(protocol);
    }

    pub fn with(mut self, protocol: Protocol) -> Multiaddr {
        self.segments.push(protocol);
        self
    }

    pub fn segments(&self) -> &[Protocol] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// The dialable socket address of the leading ip/tcp segments, if any.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        let ip = match self.segments.first()? {
            Protocol::Ip4(ip) => IpAddr::V4(*ip),
            Protocol::Ip6(ip) => IpAddr::V6(*ip),
            _ => return None,
        };
        match self.segments.get(1)? {
            Protocol::Tcp(port) => Some(SocketAddr::new(ip, *port)),
            _ => None,
        }
    }

    pub fn is_ws(&self) -> bool {
        self.segments.contains(&Protocol::Ws)
    }

    pub fn is_circuit(&self) -> bool {
        self.segments.contains(&Protocol::P2pCircuit)
    }

    /// The trailing `/p2p/<id>` segment, if present.
    pub fn peer_id(&self) -> Option<PeerId> {
        self.segments.iter().rev().find_map(|p| match p {
            Protocol::P2p(id) => Some(*id),
            _ => None,
        })
    }

    /// The address with any trailing `/p2p/<id>` segment removed, suitable
    /// for handing to a transport.
    pub fn transport_part(&self) -> Multiaddr {
        let segments = self
            .segments
            .iter()
            .take_while(|p| !matches!(p, Protocol::P2p(_) | Protocol::P2pCircuit))
            .copied()
            .collect();
        Multiaddr { segments }
    }
}

impl fmt::Display for Multiaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.segments {
            match segment {
                Protocol::Ip4(ip) => write!(f, "/ip4/{ip}")?,
                Protocol::Ip6(ip) => write!(f, "/ip6/{ip}")?,
                Protocol::Tcp(port) => write!(f, "/tcp/{port}")?,
                Protocol::Ws => write!(f, "/ws")?,
                Protocol::P2p(id) => write!(f, "/p2p/{id}")?,
                Protocol::P2pCircuit => write!(f, "/p2p-circuit")?,
            }
        }
        Ok(())
    }
}

impl FromStr for Multiaddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidAddr(s.to_string());
        if !s.starts_with('/') {
            return Err(invalid());
        }
        let mut parts = s.split('/').skip(1).peekable();
        let mut segments = Vec::new();
        while let Some(name) = parts.next() {
            let segment = match name {
                "ip4" => Protocol::Ip4(
                    parts.next().and_then(|v| v.parse().ok()).ok_or_else(invalid)?,
                ),
                "ip6" => Protocol::Ip6(
                    parts.next().and_then(|v| v.parse().ok()).ok_or_else(invalid)?,
                ),
                "tcp" => Protocol::Tcp(
                    parts.next().and_then(|v| v.parse().ok()).ok_or_else(invalid)?,
                ),
                "ws" => Protocol::Ws,
                "p2p" => Protocol::P2p(
                    parts.next().and_then(|v| v.parse().ok()).ok_or_else(invalid)?,
                ),
                "p2p-circuit" => Protocol::P2pCircuit,
                _ => return Err(invalid()),
            };
            segments.push(segment);
        }
        if segments.is_empty() {
            return Err(invalid());
        }
        Ok(Multiaddr { segments })
    }
}

impl serde::Serialize for Multiaddr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Multiaddr {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text: std::borrow::Cow<'de, str> = serde::Deserialize::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}
