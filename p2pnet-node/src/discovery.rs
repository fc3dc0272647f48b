//! Local-segment discovery over the swarm's mDNS behaviour.

use std::collections::BTreeMap;
use std::sync::Arc;

use p2pnet_core::{DiscoverySource, Multiaddr, PeerId, PeerRecord};
use tokio::sync::mpsc;
use tracing::info;

use crate::error::{Error, Result};
use crate::swarm::SwarmTransport;

/// Found-peer events buffered before sightings are dropped.
const EVENT_BUFFER: usize = 64;

/// Emits a `PeerRecord` (source `Local`) for every peer mDNS sees on the
/// segment. mDNS answers for every p2pnet node, whatever its rendezvous tag;
/// group membership is decided by the directory and RPC tags.
pub struct MdnsDiscovery {
    transport: Arc<SwarmTransport>,
}

impl MdnsDiscovery {
    pub fn new(transport: Arc<SwarmTransport>) -> Self {
        Self { transport }
    }

    /// Start forwarding sightings. Fails when mDNS could not be started on this host.
    pub async fn start(&self, rendezvous: &str) -> Result<mpsc::Receiver<PeerRecord>> {
        if !self.transport.local_discovery_enabled() {
            return Err(Error::Io(std::io::Error::other("mDNS is not running")));
        }
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        if !self.transport.watch_local(tx).await {
            return Err(Error::Io(std::io::Error::other("transport closed")));
        }
        info!(%rendezvous, "local discovery started");
        Ok(rx)
    }
}

/// One record per sighted peer other than `local_id`, with every address it was seen at.
pub fn local_sightings(
    local_id: PeerId,
    seen: impl IntoIterator<Item = (PeerId, Multiaddr)>,
) -> Vec<PeerRecord> {
    let mut by_peer: BTreeMap<PeerId, Vec<Multiaddr>> = BTreeMap::new();
    for (peer, addr) in seen {
        if peer != local_id {
            by_peer.entry(peer).or_default().push(addr);
        }
    }
    by_peer
        .into_iter()
        .map(|(peer, addrs)| PeerRecord::new(peer, addrs, DiscoverySource::Local))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Multiaddr {
        s.parse().unwrap()
    }

    #[test]
    fn sightings_group_addresses_per_peer() {
        let me = PeerId::random();
        let other = PeerId::random();
        let records = local_sightings(
            me,
            [
                (other, addr("/ip4/192.168.1.20/tcp/4001")),
                (other, addr("/ip4/10.0.0.3/tcp/4001")),
            ],
        );
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].peer_id(), other);
        assert_eq!(records[0].discovered_via(), DiscoverySource::Local);
        assert_eq!(records[0].addresses().len(), 2);
    }

    #[test]
    fn own_sightings_are_ignored() {
        let me = PeerId::random();
        let other = PeerId::random();
        let records = local_sightings(
            me,
            [
                (me, addr("/ip4/192.168.1.10/tcp/4001")),
                (other, addr(&format!("/ip4/192.168.1.20/tcp/4001/p2p/{other}"))),
            ],
        );
        assert_eq!(records.len(), 1);
        let stored: Vec<String> = records[0].addresses().iter().map(|a| a.to_string()).collect();
        assert_eq!(stored, vec!["/ip4/192.168.1.20/tcp/4001".to_string()]);
    }
}
