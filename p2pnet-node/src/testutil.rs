//! In-memory `PeerTransport` for unit tests: reachability is scripted, streams are unsupported.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use p2pnet_core::{Multiaddr, PeerId};

use crate::address_book::AddressBook;
use crate::error::{Error, Result};
use crate::stream::Stream;
use crate::transport::{PeerTransport, StreamHandler};

pub(crate) struct MockTransport {
    id: PeerId,
    listen: Vec<Multiaddr>,
    book: AddressBook,
    reachable: Mutex<HashSet<PeerId>>,
    connected: Mutex<HashSet<PeerId>>,
    pub(crate) connect_calls: AtomicUsize,
    connect_delay: Duration,
    closed: AtomicBool,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    /// Every connect attempt sleeps first, so attempts within one pass overlap.
    pub(crate) fn with_delay(connect_delay: Duration) -> Self {
        Self {
            id: PeerId::random(),
            listen: vec!["/ip4/127.0.0.1/tcp/4001".parse().unwrap()],
            book: AddressBook::new(),
            reachable: Mutex::new(HashSet::new()),
            connected: Mutex::new(HashSet::new()),
            connect_calls: AtomicUsize::new(0),
            connect_delay,
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn set_reachable(&self, peer: PeerId) {
        self.reachable.lock().unwrap().insert(peer);
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    fn local_peer_id(&self) -> PeerId {
        self.id
    }

    fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.listen.clone()
    }

    fn address_book(&self) -> &AddressBook {
        &self.book
    }

    async fn connect(&self, peer: PeerId, addrs: &[Multiaddr]) -> Result<()> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        if !addrs.is_empty() && self.reachable.lock().unwrap().contains(&peer) {
            self.connected.lock().unwrap().insert(peer);
            Ok(())
        } else {
            Err(Error::ConnectionFailure {
                peer,
                reason: "unreachable".into(),
            })
        }
    }

    fn is_connected(&self, peer: &PeerId) -> bool {
        self.connected.lock().unwrap().contains(peer)
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.connected.lock().unwrap().iter().copied().collect();
        peers.sort();
        peers
    }

    async fn open_stream(&self, peer: PeerId, protocol: &str) -> Result<Stream> {
        Err(Error::StreamOpen {
            peer,
            protocol: protocol.to_string(),
            reason: "mock transport has no streams".into(),
        })
    }

    fn set_stream_handler(&self, _protocol: &str, _handler: StreamHandler) {}

    fn remove_stream_handler(&self, _protocol: &str) {}

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
