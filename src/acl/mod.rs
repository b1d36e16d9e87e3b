use relaypoint_core::addr::Multiaddr;
use relaypoint_core::identity::PeerId;

/// Admission policy consulted by the relay broker. Both hooks run
/// synchronously on the request path and must not block; a `false` result
/// surfaces to the requester as an explicit denial status.
///
/// Swapping in a stricter policy (allow-lists, rate limits, reputation)
/// never requires touching the broker itself.
pub trait Acl: Send + Sync {
    fn allow_reserve(&self, peer: &PeerId, addr: &Multiaddr) -> bool;
    fn allow_connect(&self, src: &PeerId, src_addr: &Multiaddr, dest: &PeerId) -> bool;
}

/// The default policy: everything is admitted, every decision is logged.
pub struct AllowAll;

impl Acl for AllowAll {
    fn allow_reserve(&self, peer: &PeerId, addr: &Multiaddr) -> bool {
        log::info!("incoming reservation: {peer} at {addr}");
        true
    }

    fn allow_connect(&self, src: &PeerId, src_addr: &Multiaddr, dest: &PeerId) -> bool {
        log::info!("connecting: {src} ({src_addr}) to {dest}");
        true
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use relaypoint_core::identity::Keypair;

    #[test]
    fn default_policy_admits_everything() {
        let a = Keypair::generate().peer_id();
        let b = Keypair::generate().peer_id();
        let addr: Multiaddr = "/ip4/127.0.0.1/tcp/1".parse().unwrap();
        assert!(AllowAll.allow_reserve(&a, &addr));
        assert!(AllowAll.allow_connect(&a, &addr, &b));
    }
}
