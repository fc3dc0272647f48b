//! The swarm's network behaviour: Kademlia directory, identify, optional mDNS and protocol-tagged streams.

use std::time::Duration;

use libp2p::identity::Keypair;
use libp2p::kad::{self, store::MemoryStore, store::MemoryStoreConfig};
use libp2p::swarm::{behaviour::toggle::Toggle, NetworkBehaviour};
use libp2p::{identify, mdns, StreamProtocol};
use p2pnet_core::{IDENTIFY_PROTOCOL_VERSION, KADEMLIA_PROTOCOL};
use tracing::warn;

/// Provider records expire this long after the last announce.
pub const PROVIDER_RECORD_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// Upper bound on one directory query (provide, find providers, record lookup).
pub const DIRECTORY_QUERY_TIMEOUT: Duration = Duration::from_secs(10);
/// Provider store bounds. Past these the store refuses new keys instead of growing.
pub const MAX_PROVIDER_KEYS: usize = 1024;
pub const MAX_PROVIDERS_PER_KEY: usize = 64;
/// Address records published next to provider records.
pub const MAX_RECORDS: usize = 4096;
pub const MAX_RECORD_BYTES: usize = 8 * 1024;

#[derive(NetworkBehaviour)]
pub struct NodeBehaviour {
    pub kademlia: kad::Behaviour<MemoryStore>,
    pub identify: identify::Behaviour,
    pub mdns: Toggle<mdns::tokio::Behaviour>,
    pub streams: libp2p_stream::Behaviour,
}

impl NodeBehaviour {
    /// mDNS failing to start leaves local discovery off; everything else is unaffected.
    pub fn new(key: &Keypair, local_discovery: bool) -> Self {
        let peer_id = key.public().to_peer_id();
        let store = MemoryStore::with_config(peer_id, store_config());
        let mut kademlia = kad::Behaviour::with_config(peer_id, store, kad_config());
        kademlia.set_mode(Some(kad::Mode::Server));

        let identify = identify::Behaviour::new(identify::Config::new(
            IDENTIFY_PROTOCOL_VERSION.to_string(),
            key.public(),
        ));

        let mdns = if local_discovery {
            match mdns::tokio::Behaviour::new(mdns::Config::default(), peer_id) {
                Ok(m) => Some(m),
                Err(e) => {
                    warn!("local discovery unavailable: {e}");
                    None
                }
            }
        } else {
            None
        };

        Self {
            kademlia,
            identify,
            mdns: Toggle::from(mdns),
            streams: libp2p_stream::Behaviour::new(),
        }
    }
}

pub fn store_config() -> MemoryStoreConfig {
    MemoryStoreConfig {
        max_records: MAX_RECORDS,
        max_value_bytes: MAX_RECORD_BYTES,
        max_providers_per_key: MAX_PROVIDERS_PER_KEY,
        max_provided_keys: MAX_PROVIDER_KEYS,
    }
}

fn kad_config() -> kad::Config {
    let mut config = kad::Config::new(StreamProtocol::new(KADEMLIA_PROTOCOL));
    config
        .set_provider_record_ttl(Some(PROVIDER_RECORD_TTL))
        .set_provider_publication_interval(Some(PROVIDER_RECORD_TTL / 2))
        .set_record_ttl(Some(PROVIDER_RECORD_TTL))
        .set_query_timeout(DIRECTORY_QUERY_TIMEOUT);
    config
}
