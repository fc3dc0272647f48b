//! Protocol-tagged streams and the stream manager: per-protocol handlers for inbound streams and outbound opens.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use p2pnet_core::PeerId;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

use crate::error::Result;
use crate::transport::{handler_fn, PeerTransport};

/// One yamux substream negotiated for a protocol tag.
///
/// Reads and writes go straight to the substream. `shutdown` half-closes the
/// write side; `reset` aborts both directions and later I/O fails with
/// `ConnectionReset`. Dropping the stream without shutting it down resets it.
pub struct Stream {
    inner: Option<libp2p::Stream>,
    remote: PeerId,
    protocol: String,
}

impl Stream {
    pub(crate) fn new(inner: libp2p::Stream, remote: PeerId, protocol: String) -> Self {
        Self {
            inner: Some(inner),
            remote,
            protocol,
        }
    }

    pub fn remote_peer(&self) -> PeerId {
        self.remote
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn reset(&mut self) {
        if self.inner.take().is_some() {
            debug!(peer = %self.remote, protocol = %self.protocol, "stream reset");
        }
    }

    fn live(&mut self) -> io::Result<Pin<&mut libp2p::Stream>> {
        self.inner
            .as_mut()
            .map(Pin::new)
            .ok_or_else(|| io::ErrorKind::ConnectionReset.into())
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("remote", &self.remote)
            .field("protocol", &self.protocol)
            .field("reset", &self.inner.is_none())
            .finish()
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let inner = match self.get_mut().live() {
            Ok(s) => s,
            Err(e) => return Poll::Ready(Err(e)),
        };
        let n = match futures::AsyncRead::poll_read(inner, cx, buf.initialize_unfilled()) {
            Poll::Ready(Ok(n)) => n,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        };
        buf.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().live() {
            Ok(s) => futures::AsyncWrite::poll_write(s, cx, data),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().live() {
            Ok(s) => futures::AsyncWrite::poll_flush(s, cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().live() {
            Ok(s) => futures::AsyncWrite::poll_close(s, cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

pub struct StreamManager {
    transport: Arc<dyn PeerTransport>,
}

impl StreamManager {
    pub fn new(transport: Arc<dyn PeerTransport>) -> Self {
        Self { transport }
    }

    /// Each inbound stream for `protocol` runs `handler` on its own task. Replaces any earlier handler.
    pub fn set_handler<F, Fut>(&self, protocol: &str, handler: F)
    where
        F: Fn(Stream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.transport.set_stream_handler(protocol, handler_fn(handler));
        debug!(protocol, "stream handler set");
    }

    /// Later inbound streams for `protocol` are refused. Streams already running are unaffected.
    pub fn remove_handler(&self, protocol: &str) {
        self.transport.remove_stream_handler(protocol);
        debug!(protocol, "stream handler removed");
    }

    pub async fn open_stream(&self, peer: PeerId, protocol: &str) -> Result<Stream> {
        self.transport.open_stream(peer, protocol).await
    }
}
