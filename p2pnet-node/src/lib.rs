//! p2pnet node: discovery and bootstrap coordination, streams and RPC over a libp2p swarm.

pub mod address_book;
pub mod behaviour;
pub mod bootstrap;
pub mod config;
pub mod connmgr;
pub mod directory;
pub mod discovery;
pub mod error;
mod framed;
pub mod network;
pub mod rpc;
pub mod stream;
pub mod swarm;
pub mod transport;

#[cfg(test)]
mod testutil;

pub use address_book::{AddressBook, PROVIDER_ADDR_TTL};
pub use bootstrap::BootstrapCoordinator;
pub use config::Config;
pub use connmgr::ConnectionManager;
pub use directory::{DirectoryClient, DirectoryRouter, KademliaDirectory};
pub use discovery::MdnsDiscovery;
pub use error::{CallError, Error, Result};
pub use network::Network;
pub use rpc::{Rpc, Service};
pub use stream::{Stream, StreamManager};
pub use swarm::{SwarmConfig, SwarmTransport};
pub use transport::{handler_fn, PeerTransport, StreamHandler};
