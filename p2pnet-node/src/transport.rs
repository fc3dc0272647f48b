//! Peer transport capability consumed by discovery, bootstrap, streams and RPC.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use p2pnet_core::{Multiaddr, PeerId};

use crate::address_book::AddressBook;
use crate::error::Result;
use crate::stream::Stream;

pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Invoked once per inbound stream; each invocation runs on its own task.
pub type StreamHandler = Arc<dyn Fn(Stream) -> BoxFuture + Send + Sync>;

/// Wrap an async closure as a `StreamHandler`.
pub fn handler_fn<F, Fut>(f: F) -> StreamHandler
where
    F: Fn(Stream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |stream: Stream| -> BoxFuture { Box::pin(f(stream)) })
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    fn local_peer_id(&self) -> PeerId;

    /// Addresses other peers can dial us on, without the `/p2p/` suffix.
    fn listen_addrs(&self) -> Vec<Multiaddr>;

    fn address_book(&self) -> &AddressBook;

    /// Ensure a connection to `peer` using `addrs` plus any the transport already knows. Ok if already connected.
    async fn connect(&self, peer: PeerId, addrs: &[Multiaddr]) -> Result<()>;

    fn is_connected(&self, peer: &PeerId) -> bool;

    fn connected_peers(&self) -> Vec<PeerId>;

    async fn open_stream(&self, peer: PeerId, protocol: &str) -> Result<Stream>;

    fn set_stream_handler(&self, protocol: &str, handler: StreamHandler);

    fn remove_stream_handler(&self, protocol: &str);

    fn is_closed(&self) -> bool;

    async fn close(&self);
}
