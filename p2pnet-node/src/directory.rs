//! Rendezvous directory: provider records published to and looked up in the Kademlia DHT.
//!
//! `DirectoryRouter` is what the rest of the node talks to. It is useless until
//! `initialize` has bound a `DirectoryClient`; the shipped client is
//! `KademliaDirectory`, which provides the rendezvous tag as a DHT key and
//! publishes the node's dialable addresses next to it.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use p2pnet_core::wire::{decode_payload, encode_payload};
use p2pnet_core::{peer_addresses_key, AddressRecord, DiscoverySource, PeerId, PeerRecord};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::swarm::SwarmTransport;
use crate::transport::PeerTransport;

const FIND_BUFFER: usize = 32;

#[async_trait]
pub trait DirectoryClient: Send + Sync {
    /// Populate the client's view of the directory. Called once by the router.
    async fn bootstrap(&self) -> Result<()>;

    /// Publish the local node as a provider of `key`.
    async fn provide(&self, key: &str) -> Result<()>;

    /// Providers of `key`. The channel closes when the lookup is exhausted.
    async fn find_providers(&self, key: &str) -> Result<mpsc::Receiver<PeerRecord>>;
}

pub struct KademliaDirectory {
    transport: Arc<SwarmTransport>,
}

impl KademliaDirectory {
    /// Fails if the transport has no address to publish.
    pub fn new(transport: Arc<SwarmTransport>) -> Result<Self> {
        if transport.listen_addrs().is_empty() {
            return Err(Error::DirectoryInit(
                "transport has no listen address to publish".into(),
            ));
        }
        Ok(Self { transport })
    }

    /// Our listen addresses in dialable form, as published for finders.
    fn address_record(&self) -> AddressRecord {
        let me = self.transport.local_peer_id();
        AddressRecord {
            addrs: PeerRecord::new(me, self.transport.listen_addrs(), DiscoverySource::Directory)
                .dialable_addrs()
                .iter()
                .map(|a| a.to_string())
                .collect(),
        }
    }
}

#[async_trait]
impl DirectoryClient for KademliaDirectory {
    async fn bootstrap(&self) -> Result<()> {
        if self.transport.is_closed() {
            return Err(Error::DirectoryBootstrap("transport is closed".into()));
        }
        let peers = self.transport.directory_bootstrap().await?;
        debug!(peers, "directory bootstrapped");
        Ok(())
    }

    async fn provide(&self, key: &str) -> Result<()> {
        let value = encode_payload(&self.address_record()).map_err(|e| Error::AdvertiseFailure {
            tag: key.to_string(),
            reason: e.to_string(),
        })?;
        let me = self.transport.local_peer_id();
        self.transport
            .start_providing(key, peer_addresses_key(&me), value)
            .await?;
        debug!(key, "provider record published");
        Ok(())
    }

    async fn find_providers(&self, key: &str) -> Result<mpsc::Receiver<PeerRecord>> {
        let mut providers = self.transport.get_providers(key).await?;
        let (tx, rx) = mpsc::channel(FIND_BUFFER);
        let transport = self.transport.clone();
        tokio::spawn(async move {
            let mut seen = HashSet::new();
            while let Some(peer) = providers.recv().await {
                if !seen.insert(peer) {
                    continue;
                }
                let record = resolve(&transport, peer).await;
                if tx.send(record).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }
}

/// Addresses for a provider: its published address record, else whatever the
/// address book has learned, else none.
async fn resolve(transport: &SwarmTransport, peer: PeerId) -> PeerRecord {
    if peer == transport.local_peer_id() {
        return PeerRecord::new(peer, transport.listen_addrs(), DiscoverySource::Directory);
    }
    if let Some(value) = transport.get_record(peer_addresses_key(&peer)).await {
        match decode_payload::<AddressRecord>(&value) {
            Ok(published) => {
                let record = PeerRecord::from_dialable(peer, &published.addrs, DiscoverySource::Directory);
                if !record.addresses().is_empty() {
                    return record;
                }
            }
            Err(e) => debug!(%peer, "unreadable address record: {e}"),
        }
    }
    PeerRecord::new(
        peer,
        transport.address_book().addrs(&peer),
        DiscoverySource::Directory,
    )
}

/// Node-facing directory handle: advertise and look up rendezvous tags.
pub struct DirectoryRouter {
    local_id: PeerId,
    client: OnceLock<Arc<dyn DirectoryClient>>,
}

impl DirectoryRouter {
    pub fn new(local_id: PeerId) -> Self {
        Self {
            local_id,
            client: OnceLock::new(),
        }
    }

    /// Bind a `KademliaDirectory` over `transport` and bootstrap it.
    pub async fn initialize(&self, transport: Arc<SwarmTransport>) -> Result<()> {
        if self.client.get().is_some() {
            debug!("directory already initialized");
            return Ok(());
        }
        let client = KademliaDirectory::new(transport)?;
        self.initialize_with(Arc::new(client)).await
    }

    pub async fn initialize_with(&self, client: Arc<dyn DirectoryClient>) -> Result<()> {
        if self.client.get().is_some() {
            debug!("directory already initialized");
            return Ok(());
        }
        client.bootstrap().await?;
        if self.client.set(client).is_err() {
            debug!("directory initialized concurrently");
        }
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.client.get().is_some()
    }

    /// Publish this node under `tag`. Not retried; the caller decides what a failure means.
    pub async fn advertise(&self, tag: &str) -> Result<()> {
        let client = self.client.get().ok_or(Error::DiscoveryUnavailable)?;
        match client.provide(tag).await {
            Ok(()) => {
                info!(tag, "advertised");
                Ok(())
            }
            Err(e) => {
                warn!(tag, "advertise failed: {e}");
                Err(match e {
                    Error::AdvertiseFailure { .. } => e,
                    other => Error::AdvertiseFailure {
                        tag: tag.to_string(),
                        reason: other.to_string(),
                    },
                })
            }
        }
    }

    /// Peers registered under `tag`, excluding ourselves. Each call is an independent lookup.
    pub async fn find_peers(&self, tag: &str) -> Result<mpsc::Receiver<PeerRecord>> {
        let client = self.client.get().ok_or(Error::DiscoveryUnavailable)?;
        let mut providers = client.find_providers(tag).await?;
        let (tx, rx) = mpsc::channel(FIND_BUFFER);
        let local_id = self.local_id;
        tokio::spawn(async move {
            while let Some(record) = providers.recv().await {
                if record.peer_id() == local_id {
                    continue;
                }
                if tx.send(record).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}
