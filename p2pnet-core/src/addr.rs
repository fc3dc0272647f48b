//! Layered peer addresses: a transport part plus an optional terminal `/p2p/<peer-id>` segment.

use std::net::IpAddr;

use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};

/// Peer named by the terminal `/p2p/` segment, if any.
pub fn peer_of(addr: &Multiaddr) -> Option<PeerId> {
    match addr.iter().last() {
        Some(Protocol::P2p(peer)) => Some(peer),
        _ => None,
    }
}

/// Transport part only.
pub fn without_peer(addr: &Multiaddr) -> Multiaddr {
    addr.iter()
        .filter(|p| !matches!(p, Protocol::P2p(_)))
        .collect()
}

/// Transport part composed with `peer`.
pub fn with_peer(addr: &Multiaddr, peer: PeerId) -> Multiaddr {
    without_peer(addr).with(Protocol::P2p(peer))
}

/// `/ip4/<host>/tcp/<port>` or `/ip6/<host>/tcp/<port>`.
pub fn tcp_addr(host: &str, port: u16) -> Result<Multiaddr, AddrParseError> {
    let ip: IpAddr = host
        .trim()
        .parse()
        .map_err(|_| AddrParseError::Host(host.to_string()))?;
    Ok(Multiaddr::from(ip).with(Protocol::Tcp(port)))
}

/// Parse a full peer address. The terminal `/p2p/` segment is required.
pub fn parse_peer_addr(s: &str) -> Result<(PeerId, Multiaddr), AddrParseError> {
    let addr: Multiaddr = s
        .trim()
        .parse()
        .map_err(|e: libp2p::multiaddr::Error| AddrParseError::Malformed(format!("{s}: {e}")))?;
    let peer = peer_of(&addr).ok_or_else(|| AddrParseError::MissingPeerId(s.to_string()))?;
    Ok((peer, without_peer(&addr)))
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddrParseError {
    #[error("malformed address {0}")]
    Malformed(String),
    #[error("not an IP host: {0:?}")]
    Host(String),
    #[error("address {0} has no /p2p/ peer id segment")]
    MissingPeerId(String),
}
