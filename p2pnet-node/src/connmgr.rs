//! Connection manager: feeds discovered records into the address book and dials from it.

use std::sync::Arc;

use p2pnet_core::{PeerId, PeerRecord};
use tracing::debug;

use crate::address_book::PROVIDER_ADDR_TTL;
use crate::transport::PeerTransport;

pub struct ConnectionManager {
    transport: Arc<dyn PeerTransport>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn PeerTransport>) -> Self {
        Self { transport }
    }

    /// Merge the record's addresses into the address book. Repeats only refresh expiry.
    pub fn record_peer(&self, record: &PeerRecord) {
        let peer = record.peer_id();
        if peer == self.transport.local_peer_id() {
            debug!("ignoring record for self");
            return;
        }
        let book = self.transport.address_book();
        book.add_addrs(peer, record.addresses().iter().cloned(), PROVIDER_ADDR_TTL);
        debug!(
            %peer,
            via = ?record.discovered_via(),
            addrs = ?book.addrs(&peer),
            "peer recorded"
        );
    }

    /// Dial `peer` using whatever addresses are currently known. Never errors.
    pub async fn connect(&self, peer: PeerId) -> bool {
        if self.transport.is_connected(&peer) {
            return true;
        }
        let addrs = self.transport.address_book().addrs(&peer);
        if addrs.is_empty() {
            debug!(%peer, "no known address");
            return false;
        }
        match self.transport.connect(peer, &addrs).await {
            Ok(()) => true,
            Err(e) => {
                debug!(%peer, "connect failed: {e}");
                false
            }
        }
    }

    /// Peers with a known address and no live connection.
    pub fn unconnected_peers(&self) -> Vec<PeerId> {
        self.transport
            .address_book()
            .peers_with_addrs()
            .into_iter()
            .filter(|p| !self.transport.is_connected(p))
            .collect()
    }

    pub fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.transport
    }
}
