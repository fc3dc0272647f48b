//! Peer records: a discovered peer identity plus the addresses it was seen at.

use std::collections::BTreeSet;

use libp2p::{Multiaddr, PeerId};

use crate::addr::{peer_of, with_peer, without_peer};

/// Where a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscoverySource {
    Local,
    Directory,
    Static,
}

/// Immutable sighting of a peer. A fresher sighting is a new record, never an edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    peer_id: PeerId,
    addresses: BTreeSet<Multiaddr>,
    discovered_via: DiscoverySource,
}

impl PeerRecord {
    /// Addresses are stored transport-only; any `/p2p/` suffix is stripped.
    pub fn new(
        peer_id: PeerId,
        addresses: impl IntoIterator<Item = Multiaddr>,
        discovered_via: DiscoverySource,
    ) -> Self {
        Self {
            peer_id,
            addresses: addresses.into_iter().map(|a| without_peer(&a)).collect(),
            discovered_via,
        }
    }

    /// Build a record from a full peer address (the `/p2p/` segment names the peer).
    pub fn from_p2p_addr(addr: Multiaddr, source: DiscoverySource) -> Result<Self, RecordError> {
        let peer_id = peer_of(&addr).ok_or(RecordError::MissingPeerId(addr.clone()))?;
        Ok(Self::new(peer_id, [addr], source))
    }

    /// Build a record from addresses in their composed text form. Entries that do
    /// not parse or name another peer are skipped.
    pub fn from_dialable(
        peer_id: PeerId,
        addrs: &[String],
        source: DiscoverySource,
    ) -> Self {
        let addresses = addrs
            .iter()
            .filter_map(|s| s.parse::<Multiaddr>().ok())
            .filter(|a| peer_of(a) == Some(peer_id));
        Self::new(peer_id, addresses, source)
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn addresses(&self) -> &BTreeSet<Multiaddr> {
        &self.addresses
    }

    pub fn discovered_via(&self) -> DiscoverySource {
        self.discovered_via
    }

    /// Addresses composed with the peer identity, dial-able independent of source.
    pub fn dialable_addrs(&self) -> Vec<Multiaddr> {
        self.addresses
            .iter()
            .map(|a| with_peer(a, self.peer_id))
            .collect()
    }

    /// Same peer and addresses, attributed to another source.
    pub fn via(&self, source: DiscoverySource) -> Self {
        Self {
            peer_id: self.peer_id,
            addresses: self.addresses.clone(),
            discovered_via: source,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RecordError {
    #[error("address {0} has no /p2p/ peer id segment")]
    MissingPeerId(Multiaddr),
}
