//! `Network`: one node's transport, discovery, bootstrap, streams and RPC behind one handle.

use std::sync::Arc;
use std::time::Duration;

use p2pnet_core::addr::{parse_peer_addr, tcp_addr, with_peer};
use p2pnet_core::identity;
use p2pnet_core::{rpc_protocol, BootstrapState, DiscoverySource, Multiaddr, PeerId, PeerRecord};
use tracing::{info, warn};

use crate::bootstrap::BootstrapCoordinator;
use crate::config::Config;
use crate::connmgr::ConnectionManager;
use crate::directory::DirectoryRouter;
use crate::discovery::MdnsDiscovery;
use crate::error::{Error, Result};
use crate::rpc::Rpc;
use crate::stream::StreamManager;
use crate::swarm::{SwarmConfig, SwarmTransport};
use crate::transport::PeerTransport;

pub struct Network {
    config: Config,
    peer_id: PeerId,
    transport: Arc<dyn PeerTransport>,
    router: Arc<DirectoryRouter>,
    connmgr: Arc<ConnectionManager>,
    coordinator: BootstrapCoordinator,
    streams: StreamManager,
    rpc: Rpc,
}

impl Network {
    /// Listen, initialize the directory, record bootstrap peers and start bootstrapping.
    /// Every error returned here is fatal (`Error::is_fatal`).
    pub async fn new(config: Config) -> Result<Self> {
        let keypair = match &config.identity_key {
            Some(hex) => identity::keypair_from_hex(hex)
                .map_err(|e| Error::Config(format!("identity_key: {e}")))?,
            None => identity::generate(),
        };
        let peer_id = keypair.public().to_peer_id();
        let bootstrap_peers = parse_bootstrap_peers(&config.bootstrap_peers)?;
        let listen = tcp_addr(&config.listen_host, config.listen_port)
            .map_err(|e| Error::Config(format!("listen_host: {e}")))?;
        if config.relay_enabled {
            warn!("relay_enabled is set but this transport does not relay");
        }

        let swarm = Arc::new(
            SwarmTransport::start(
                keypair,
                SwarmConfig {
                    listen,
                    dial_timeout: Duration::from_secs(config.dial_timeout_secs),
                    local_discovery: config.local_discovery,
                },
            )
            .await?,
        );
        let transport: Arc<dyn PeerTransport> = swarm.clone();
        let router = Arc::new(DirectoryRouter::new(peer_id));
        if let Err(e) = router.initialize(swarm.clone()).await {
            transport.close().await;
            return Err(e);
        }

        let connmgr = Arc::new(ConnectionManager::new(transport.clone()));
        for record in &bootstrap_peers {
            connmgr.record_peer(record);
        }
        let directory_poll =
            (config.directory_poll_secs > 0).then(|| Duration::from_secs(config.directory_poll_secs));
        let coordinator = BootstrapCoordinator::new(
            connmgr.clone(),
            router.clone(),
            config.rendezvous.clone(),
            Duration::from_secs(config.poll_interval_secs),
            directory_poll,
        );

        if config.local_discovery {
            match MdnsDiscovery::new(swarm.clone()).start(&config.rendezvous).await {
                Ok(found) => coordinator.consume_local(found),
                Err(e) => warn!("local discovery unavailable: {e}"),
            }
        }

        let streams = StreamManager::new(transport.clone());
        let rpc = Rpc::new(
            transport.clone(),
            rpc_protocol(&config.rpc_namespace, &config.rendezvous),
            Duration::from_secs(config.call_timeout_secs),
        );
        coordinator.start();

        let network = Self {
            config,
            peer_id,
            transport,
            router,
            connmgr,
            coordinator,
            streams,
            rpc,
        };
        for addr in network.addrs() {
            info!(%addr, "node listening");
        }
        Ok(network)
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Listen addresses with the `/p2p/` suffix, ready to hand to other peers.
    pub fn addrs(&self) -> Vec<Multiaddr> {
        let id = self.peer_id();
        self.transport
            .listen_addrs()
            .into_iter()
            .map(|a| with_peer(&a, id))
            .collect()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.transport
    }

    pub fn record_peer(&self, record: &PeerRecord) {
        self.connmgr.record_peer(record);
    }

    /// Record `record` and dial it now instead of waiting for the next poll.
    pub async fn connect(&self, record: &PeerRecord) -> Result<()> {
        self.connmgr.record_peer(record);
        self.transport
            .connect(record.peer_id(), &record.dialable_addrs())
            .await?;
        self.coordinator.connection_established();
        Ok(())
    }

    pub async fn wait_for_bootstrap(&self) {
        self.coordinator.wait().await;
    }

    pub fn bootstrap_state(&self) -> BootstrapState {
        self.coordinator.state()
    }

    pub fn discovery(&self) -> &DirectoryRouter {
        &self.router
    }

    pub fn stream_manager(&self) -> &StreamManager {
        &self.streams
    }

    pub fn rpc(&self) -> &Rpc {
        &self.rpc
    }

    /// Stop background tasks and close every connection.
    pub async fn close(&self) {
        self.coordinator.close();
        self.rpc.close();
        self.transport.close().await;
    }
}

fn parse_bootstrap_peers(peers: &[String]) -> Result<Vec<PeerRecord>> {
    peers
        .iter()
        .map(|s| {
            let (peer, addr) = parse_peer_addr(s)
                .map_err(|e| Error::Config(format!("bootstrap peer {s:?}: {e}")))?;
            Ok(PeerRecord::new(peer, [addr], DiscoverySource::Static))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_peers_need_peer_ids() {
        let id = PeerId::random();
        let ok = parse_bootstrap_peers(&[format!("/ip4/10.0.0.1/tcp/4001/p2p/{id}")]).unwrap();
        assert_eq!(ok[0].peer_id(), id);
        assert_eq!(ok[0].discovered_via(), DiscoverySource::Static);
        assert!(matches!(
            parse_bootstrap_peers(&["/ip4/10.0.0.1/tcp/4001".into()]),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            parse_bootstrap_peers(&["not an address".into()]),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn bad_identity_key_is_fatal() {
        let config = Config {
            identity_key: Some("zz".into()),
            local_discovery: false,
            listen_host: "127.0.0.1".into(),
            listen_port: 0,
            ..Config::default()
        };
        let err = Network::new(config).await.err().unwrap();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn bad_listen_host_is_fatal() {
        let config = Config {
            local_discovery: false,
            listen_host: "not-a-host".into(),
            listen_port: 0,
            ..Config::default()
        };
        let err = Network::new(config).await.err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }
}
