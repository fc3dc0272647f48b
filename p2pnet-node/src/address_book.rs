//! Address book: known transport addresses per peer, each with an expiry.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use p2pnet_core::addr::without_peer;
use p2pnet_core::{Multiaddr, PeerId};

/// TTL for addresses learned from discovery or the directory.
pub const PROVIDER_ADDR_TTL: Duration = Duration::from_secs(10 * 60);

/// Safe for concurrent writers: every operation takes the lock once and never awaits.
#[derive(Debug, Default)]
pub struct AddressBook {
    peers: Mutex<HashMap<PeerId, HashMap<Multiaddr, Instant>>>,
}

impl AddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Union `addrs` into the peer's entry. An address already present keeps the later expiry.
    pub fn add_addrs(&self, peer: PeerId, addrs: impl IntoIterator<Item = Multiaddr>, ttl: Duration) {
        let expiry = Instant::now() + ttl;
        let mut peers = self.lock();
        let entry = peers.entry(peer).or_default();
        for addr in addrs {
            let slot = entry.entry(without_peer(&addr)).or_insert(expiry);
            if *slot < expiry {
                *slot = expiry;
            }
        }
    }

    /// Unexpired addresses for `peer`, ordered.
    pub fn addrs(&self, peer: &PeerId) -> Vec<Multiaddr> {
        let now = Instant::now();
        let peers = self.lock();
        let mut out: Vec<Multiaddr> = peers
            .get(peer)
            .map(|m| {
                m.iter()
                    .filter(|(_, exp)| **exp > now)
                    .map(|(a, _)| a.clone())
                    .collect()
            })
            .unwrap_or_default();
        out.sort();
        out
    }

    /// Peers with at least one unexpired address.
    pub fn peers_with_addrs(&self) -> Vec<PeerId> {
        let now = Instant::now();
        let peers = self.lock();
        let mut out: Vec<PeerId> = peers
            .iter()
            .filter(|(_, m)| m.values().any(|exp| *exp > now))
            .map(|(id, _)| *id)
            .collect();
        out.sort();
        out
    }

    /// Drop expired addresses and peers left without any.
    pub fn prune(&self) {
        let now = Instant::now();
        let mut peers = self.lock();
        for addrs in peers.values_mut() {
            addrs.retain(|_, exp| *exp > now);
        }
        peers.retain(|_, addrs| !addrs.is_empty());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PeerId, HashMap<Multiaddr, Instant>>> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.peers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p2pnet_core::addr::with_peer;

    fn addr(s: &str) -> Multiaddr {
        s.parse().unwrap()
    }

    #[test]
    fn disjoint_additions_union() {
        let book = AddressBook::new();
        let id = PeerId::random();
        book.add_addrs(id, [addr("/ip4/10.0.0.1/tcp/1")], PROVIDER_ADDR_TTL);
        book.add_addrs(id, [addr("/ip4/10.0.0.2/tcp/1")], PROVIDER_ADDR_TTL);
        assert_eq!(
            book.addrs(&id),
            vec![addr("/ip4/10.0.0.1/tcp/1"), addr("/ip4/10.0.0.2/tcp/1")]
        );
        assert_eq!(book.peers_with_addrs(), vec![id]);
    }

    #[test]
    fn repeated_address_not_duplicated() {
        let book = AddressBook::new();
        let id = PeerId::random();
        let a = addr("/ip4/10.0.0.1/tcp/1");
        book.add_addrs(id, [a.clone(), with_peer(&a, id)], PROVIDER_ADDR_TTL);
        book.add_addrs(id, [a.clone()], PROVIDER_ADDR_TTL);
        assert_eq!(book.addrs(&id), vec![a]);
    }

    #[test]
    fn expired_addresses_hidden_and_pruned() {
        let book = AddressBook::new();
        let id = PeerId::random();
        book.add_addrs(id, [addr("/ip4/10.0.0.1/tcp/1")], Duration::ZERO);
        assert!(book.addrs(&id).is_empty());
        assert!(book.peers_with_addrs().is_empty());
        book.prune();
        assert!(book.lock().is_empty());
    }

    #[test]
    fn shorter_ttl_does_not_shorten_expiry() {
        let book = AddressBook::new();
        let id = PeerId::random();
        let a = addr("/ip4/10.0.0.1/tcp/1");
        book.add_addrs(id, [a.clone()], PROVIDER_ADDR_TTL);
        book.add_addrs(id, [a.clone()], Duration::ZERO);
        assert_eq!(book.addrs(&id), vec![a]);
    }
}
