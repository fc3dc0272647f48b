//! p2pnet wire protocol: protocol names, directory keys and values, RPC envelopes.

use libp2p::PeerId;
use serde::{Deserialize, Serialize};

/// Identify protocol version announced to every peer.
pub const IDENTIFY_PROTOCOL_VERSION: &str = "/p2pnet/1.0.0";

/// Protocol name of the Kademlia directory.
pub const KADEMLIA_PROTOCOL: &str = "/p2pnet/kad/1.0.0";

/// Default namespace of the request/response protocol tag.
pub const DEFAULT_RPC_NAMESPACE: &str = "/p2p/rpc";

/// Request/response protocol tag for a rendezvous group.
pub fn rpc_protocol(namespace: &str, rendezvous: &str) -> String {
    format!("{}/{}", namespace.trim_end_matches('/'), rendezvous)
}

/// Directory record key under which a peer publishes its addresses.
pub fn peer_addresses_key(peer: &PeerId) -> Vec<u8> {
    format!("/p2pnet/peer/{peer}").into_bytes()
}

/// Value stored under `peer_addresses_key`: dialable addresses (`.../p2p/<id>`) in text form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRecord {
    pub addrs: Vec<String>,
}

/// Request envelope of the request/response layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub service: String,
    pub method: String,
    pub args: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcResponse {
    Ok(Vec<u8>),
    /// The method ran and returned an error.
    Err(String),
    UnknownService,
    UnknownMethod,
    /// Arguments did not decode.
    BadRequest(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_protocol_joins_namespace_and_tag() {
        assert_eq!(rpc_protocol(DEFAULT_RPC_NAMESPACE, "meetme"), "/p2p/rpc/meetme");
        assert_eq!(rpc_protocol("/custom/", "g1"), "/custom/g1");
    }

    #[test]
    fn address_keys_differ_per_peer() {
        let a = PeerId::random();
        let b = PeerId::random();
        assert_ne!(peer_addresses_key(&a), peer_addresses_key(&b));
        assert!(String::from_utf8(peer_addresses_key(&a))
            .unwrap()
            .ends_with(&a.to_string()));
    }
}
