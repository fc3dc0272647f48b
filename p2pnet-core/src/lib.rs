//! p2pnet protocol core.
//! No I/O: identities, peer addresses and records, wire messages and framing, bootstrap gate.

pub mod addr;
pub mod bootstrap;
pub mod identity;
pub mod protocol;
pub mod record;
pub mod wire;

pub use addr::AddrParseError;
pub use bootstrap::{BootstrapGate, BootstrapState};
pub use identity::KeyMaterialError;
pub use libp2p::identity::Keypair;
pub use libp2p::{Multiaddr, PeerId};
pub use protocol::{
    peer_addresses_key, rpc_protocol, AddressRecord, RpcRequest, RpcResponse,
    IDENTIFY_PROTOCOL_VERSION, KADEMLIA_PROTOCOL,
};
pub use record::{DiscoverySource, PeerRecord, RecordError};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
