//! `SwarmTransport`: a libp2p swarm (TCP, Noise, Yamux) behind the `PeerTransport` seam.
//!
//! One task owns the `Swarm` and serves commands sent by the handle. Connection
//! state and listen addresses are mirrored into shared sets so the trait's
//! synchronous queries never wait on that task.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use libp2p::core::transport::ListenerId;
use libp2p::kad::{self, GetProvidersOk, GetRecordOk, QueryId, QueryResult, Quorum, Record, RecordKey};
use libp2p::swarm::{dial_opts::DialOpts, DialError, SwarmEvent};
use libp2p::{identify, mdns, noise, tcp, yamux, StreamProtocol, Swarm};
use libp2p_stream::IncomingStreams;
use p2pnet_core::{Keypair, Multiaddr, PeerId, PeerRecord};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::address_book::{AddressBook, PROVIDER_ADDR_TTL};
use crate::behaviour::{NodeBehaviour, NodeBehaviourEvent, DIRECTORY_QUERY_TIMEOUT};
use crate::discovery::local_sightings;
use crate::error::{Error, Result};
use crate::stream::Stream;
use crate::transport::{PeerTransport, StreamHandler};

/// Connections with no open streams are kept this long.
const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);
/// How long startup waits for the first listen address.
const LISTEN_TIMEOUT: Duration = Duration::from_secs(5);
const STREAM_OPEN_TIMEOUT: Duration = Duration::from_secs(10);
/// A provide may wait for the routing table to fill before its query runs.
const PROVIDE_TIMEOUT: Duration = Duration::from_secs(2 * DIRECTORY_QUERY_TIMEOUT.as_secs());
const COMMAND_BUFFER: usize = 256;

pub struct SwarmConfig {
    pub listen: Multiaddr,
    pub dial_timeout: Duration,
    pub local_discovery: bool,
}

#[derive(Default)]
struct Shared {
    listen: RwLock<Vec<Multiaddr>>,
    connected: RwLock<HashSet<PeerId>>,
    book: AddressBook,
}

struct Handler {
    slot: Arc<RwLock<StreamHandler>>,
    accept: JoinHandle<()>,
}

pub struct SwarmTransport {
    local_id: PeerId,
    shared: Arc<Shared>,
    commands: mpsc::Sender<Command>,
    control: libp2p_stream::Control,
    handlers: Mutex<HashMap<String, Handler>>,
    dial_timeout: Duration,
    local_discovery: bool,
    closed: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SwarmTransport {
    /// Build the swarm, start listening and spawn its event loop. Returns once
    /// the first listen address is known.
    pub async fn start(keypair: Keypair, config: SwarmConfig) -> Result<Self> {
        let local_id = keypair.public().to_peer_id();
        let want_mdns = config.local_discovery;
        let mut swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(
                tcp::Config::default(),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(|e| Error::TransportInit(e.to_string()))?
            .with_behaviour(|key| NodeBehaviour::new(key, want_mdns))
            .map_err(|e| Error::TransportInit(e.to_string()))?
            .with_swarm_config(|c| c.with_idle_connection_timeout(IDLE_CONNECTION_TIMEOUT))
            .build();

        let local_discovery = swarm.behaviour().mdns.is_enabled();
        let control = swarm.behaviour().streams.new_control();
        let listener = swarm
            .listen_on(config.listen.clone())
            .map_err(|e| Error::TransportInit(format!("listen on {}: {e}", config.listen)))?;

        let shared = Arc::new(Shared::default());
        let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (ready_tx, ready_rx) = oneshot::channel();
        let event_loop = EventLoop {
            swarm,
            commands: command_rx,
            shared: shared.clone(),
            listener,
            listen_ready: Some(ready_tx),
            pending_dials: HashMap::new(),
            pending_provide: HashMap::new(),
            pending_providers: HashMap::new(),
            pending_records: HashMap::new(),
            local_found: None,
            parked: Vec::new(),
        };
        let task = tokio::spawn(event_loop.run());

        let ready = match tokio::time::timeout(LISTEN_TIMEOUT, ready_rx).await {
            Ok(Ok(r)) => r,
            Ok(Err(_)) => Err(Error::TransportInit("swarm stopped during startup".into())),
            Err(_) => Err(Error::TransportInit(format!(
                "no listen address on {} after {LISTEN_TIMEOUT:?}",
                config.listen
            ))),
        };
        if let Err(e) = ready {
            task.abort();
            return Err(e);
        }
        info!(peer = %local_id, local_discovery, "transport started");

        Ok(Self {
            local_id,
            shared,
            commands,
            control,
            handlers: Mutex::new(HashMap::new()),
            dial_timeout: config.dial_timeout,
            local_discovery,
            closed: AtomicBool::new(false),
            task: Mutex::new(Some(task)),
        })
    }

    /// mDNS is running on this swarm.
    pub fn local_discovery_enabled(&self) -> bool {
        self.local_discovery
    }

    /// Refresh the Kademlia routing table. Returns the number of peers in it;
    /// with none there is nobody to bootstrap from and no query runs.
    pub async fn directory_bootstrap(&self) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Bootstrap { reply })
            .await
            .map_err(|_| Error::DirectoryBootstrap("transport closed".into()))?;
        rx.await
            .map_err(|_| Error::DirectoryBootstrap("transport closed".into()))
    }

    /// Announce ourselves as a provider of `tag` and publish our dialable
    /// addresses under `address_key` so finders can reach us.
    pub async fn start_providing(
        &self,
        tag: &str,
        address_key: Vec<u8>,
        address_value: Vec<u8>,
    ) -> Result<()> {
        let failure = |reason: &str| Error::AdvertiseFailure {
            tag: tag.to_string(),
            reason: reason.to_string(),
        };
        let (reply, rx) = oneshot::channel();
        self.send(Command::Provide {
            tag: tag.to_string(),
            address_key,
            address_value,
            reply,
        })
        .await
        .map_err(|_| failure("transport closed"))?;
        match tokio::time::timeout(PROVIDE_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(failure("transport closed")),
            Err(_) => Err(failure("timed out")),
        }
    }

    /// Providers of `tag` arrive on the returned channel as the query finds
    /// them. The channel closes when the query ends.
    pub async fn get_providers(&self, tag: &str) -> Result<mpsc::UnboundedReceiver<PeerId>> {
        let (found, rx) = mpsc::unbounded_channel();
        self.send(Command::FindProviders {
            tag: tag.to_string(),
            found,
        })
        .await
        .map_err(|_| Error::DiscoveryUnavailable)?;
        Ok(rx)
    }

    /// Value stored under `key` in the directory, if any peer has it.
    pub async fn get_record(&self, key: Vec<u8>) -> Option<Vec<u8>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::GetRecord { key, reply }).await.ok()?;
        rx.await.ok().flatten()
    }

    /// mDNS sightings are sent to `found` from now on. False once closed.
    pub async fn watch_local(&self, found: mpsc::Sender<PeerRecord>) -> bool {
        self.send(Command::WatchLocal { found }).await.is_ok()
    }

    /// Fails once the transport is closed.
    async fn send(&self, command: Command) -> std::result::Result<(), Closed> {
        if self.is_closed() {
            return Err(Closed);
        }
        self.commands.send(command).await.map_err(|_| Closed)
    }

    fn lock_handlers(&self) -> std::sync::MutexGuard<'_, HashMap<String, Handler>> {
        self.handlers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl PeerTransport for SwarmTransport {
    fn local_peer_id(&self) -> PeerId {
        self.local_id
    }

    fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.shared
            .listen
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn address_book(&self) -> &AddressBook {
        &self.shared.book
    }

    async fn connect(&self, peer: PeerId, addrs: &[Multiaddr]) -> Result<()> {
        let failure = |reason: &str| Error::ConnectionFailure {
            peer,
            reason: reason.to_string(),
        };
        if peer == self.local_id {
            return Err(failure("refusing to dial self"));
        }
        if self.is_connected(&peer) {
            return Ok(());
        }
        let (reply, rx) = oneshot::channel();
        self.send(Command::Dial {
            peer,
            addrs: addrs.to_vec(),
            reply,
        })
        .await
        .map_err(|_| failure("transport closed"))?;
        match tokio::time::timeout(self.dial_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(failure("transport closed")),
            Err(_) => Err(failure("dial timed out")),
        }
    }

    fn is_connected(&self, peer: &PeerId) -> bool {
        self.shared
            .connected
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(peer)
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.shared
            .connected
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .copied()
            .collect()
    }

    async fn open_stream(&self, peer: PeerId, protocol: &str) -> Result<Stream> {
        let failure = |reason: String| Error::StreamOpen {
            peer,
            protocol: protocol.to_string(),
            reason,
        };
        if self.is_closed() {
            return Err(failure("transport closed".into()));
        }
        if !self.is_connected(&peer) {
            return Err(failure("not connected".into()));
        }
        let tag = StreamProtocol::try_from_owned(protocol.to_string())
            .map_err(|e| failure(e.to_string()))?;
        let mut control = self.control.clone();
        match tokio::time::timeout(STREAM_OPEN_TIMEOUT, control.open_stream(peer, tag)).await {
            Ok(Ok(inner)) => Ok(Stream::new(inner, peer, protocol.to_string())),
            Ok(Err(e)) => Err(failure(e.to_string())),
            Err(_) => Err(failure("timed out".into())),
        }
    }

    fn set_stream_handler(&self, protocol: &str, handler: StreamHandler) {
        let mut handlers = self.lock_handlers();
        if let Some(existing) = handlers.get(protocol) {
            *existing.slot.write().unwrap_or_else(|e| e.into_inner()) = handler;
            return;
        }
        let tag = match StreamProtocol::try_from_owned(protocol.to_string()) {
            Ok(t) => t,
            Err(e) => {
                warn!(protocol, "handler not set: {e}");
                return;
            }
        };
        let incoming = match self.control.clone().accept(tag) {
            Ok(i) => i,
            Err(e) => {
                warn!(protocol, "handler not set: {e}");
                return;
            }
        };
        let slot = Arc::new(RwLock::new(handler));
        let accept = tokio::spawn(accept_loop(incoming, protocol.to_string(), slot.clone()));
        handlers.insert(protocol.to_string(), Handler { slot, accept });
    }

    fn remove_stream_handler(&self, protocol: &str) {
        if let Some(h) = self.lock_handlers().remove(protocol) {
            h.accept.abort();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for (_, h) in self.lock_handlers().drain() {
            h.accept.abort();
        }
        let _ = self.commands.send(Command::Shutdown).await;
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.shared
            .connected
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        info!(peer = %self.local_id, "transport closed");
    }
}

/// Each inbound stream runs the handler current at accept time on its own task.
async fn accept_loop(
    mut incoming: IncomingStreams,
    protocol: String,
    slot: Arc<RwLock<StreamHandler>>,
) {
    while let Some((peer, inner)) = incoming.next().await {
        let handler = slot.read().unwrap_or_else(|e| e.into_inner()).clone();
        debug!(%peer, %protocol, "inbound stream");
        tokio::spawn(handler(Stream::new(inner, peer, protocol.clone())));
    }
}

struct Closed;

enum Command {
    Dial {
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        reply: oneshot::Sender<Result<()>>,
    },
    Bootstrap {
        reply: oneshot::Sender<usize>,
    },
    Provide {
        tag: String,
        address_key: Vec<u8>,
        address_value: Vec<u8>,
        reply: oneshot::Sender<Result<()>>,
    },
    FindProviders {
        tag: String,
        found: mpsc::UnboundedSender<PeerId>,
    },
    GetRecord {
        key: Vec<u8>,
        reply: oneshot::Sender<Option<Vec<u8>>>,
    },
    WatchLocal {
        found: mpsc::Sender<PeerRecord>,
    },
    Shutdown,
}

struct EventLoop {
    swarm: Swarm<NodeBehaviour>,
    commands: mpsc::Receiver<Command>,
    shared: Arc<Shared>,
    listener: ListenerId,
    listen_ready: Option<oneshot::Sender<Result<()>>>,
    pending_dials: HashMap<PeerId, Vec<oneshot::Sender<Result<()>>>>,
    pending_provide: HashMap<QueryId, (String, oneshot::Sender<Result<()>>)>,
    pending_providers: HashMap<QueryId, mpsc::UnboundedSender<PeerId>>,
    pending_records: HashMap<QueryId, oneshot::Sender<Option<Vec<u8>>>>,
    local_found: Option<mpsc::Sender<PeerRecord>>,
    parked: Vec<Command>,
}

impl EventLoop {
    async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => self.on_swarm_event(event),
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.on_command(command),
                },
            }
        }
        debug!("swarm event loop stopped");
    }

    fn routing_table_size(&mut self) -> usize {
        self.swarm
            .behaviour_mut()
            .kademlia
            .kbuckets()
            .map(|b| b.num_entries())
            .sum()
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Dial { peer, addrs, reply } => {
                if self.swarm.is_connected(&peer) {
                    let _ = reply.send(Ok(()));
                    return;
                }
                let opts = DialOpts::peer_id(peer)
                    .addresses(addrs)
                    .extend_addresses_through_behaviour()
                    .build();
                match self.swarm.dial(opts) {
                    Ok(()) | Err(DialError::DialPeerConditionFalse(_)) => {
                        self.pending_dials.entry(peer).or_default().push(reply);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(Error::ConnectionFailure {
                            peer,
                            reason: e.to_string(),
                        }));
                    }
                }
            }
            Command::Bootstrap { reply } => {
                let peers = self.routing_table_size();
                if peers > 0 {
                    if let Err(e) = self.swarm.behaviour_mut().kademlia.bootstrap() {
                        debug!("directory bootstrap not started: {e}");
                    }
                }
                let _ = reply.send(peers);
            }
            Command::Provide {
                tag,
                address_key,
                address_value,
                reply,
            } => {
                if self.routing_table_size() == 0 {
                    if self.swarm.connected_peers().next().is_some() {
                        // Connected, but identify has not yet put anyone in the routing table.
                        debug!(%tag, "provide parked until the routing table fills");
                        self.parked.push(Command::Provide {
                            tag,
                            address_key,
                            address_value,
                            reply,
                        });
                    } else {
                        let _ = reply.send(Err(Error::AdvertiseFailure {
                            tag,
                            reason: "no directory peers".into(),
                        }));
                    }
                    return;
                }
                let kademlia = &mut self.swarm.behaviour_mut().kademlia;
                if let Err(e) = kademlia.put_record(Record::new(address_key, address_value), Quorum::One) {
                    debug!("address record not stored: {e}");
                }
                match kademlia.start_providing(RecordKey::new(&tag)) {
                    Ok(id) => {
                        self.pending_provide.insert(id, (tag, reply));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(Error::AdvertiseFailure {
                            tag,
                            reason: e.to_string(),
                        }));
                    }
                }
            }
            Command::FindProviders { tag, found } => {
                let id = self
                    .swarm
                    .behaviour_mut()
                    .kademlia
                    .get_providers(RecordKey::new(&tag));
                self.pending_providers.insert(id, found);
            }
            Command::GetRecord { key, reply } => {
                let id = self
                    .swarm
                    .behaviour_mut()
                    .kademlia
                    .get_record(RecordKey::new(&key));
                self.pending_records.insert(id, reply);
            }
            Command::WatchLocal { found } => self.local_found = Some(found),
            Command::Shutdown => {}
        }
    }

    fn on_swarm_event(&mut self, event: SwarmEvent<NodeBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr {
                listener_id,
                address,
            } => {
                info!(%address, "listening");
                let mut listen = self.shared.listen.write().unwrap_or_else(|e| e.into_inner());
                if !listen.contains(&address) {
                    listen.push(address);
                }
                drop(listen);
                if listener_id == self.listener {
                    if let Some(ready) = self.listen_ready.take() {
                        let _ = ready.send(Ok(()));
                    }
                }
            }
            SwarmEvent::ExpiredListenAddr { address, .. } => {
                self.shared
                    .listen
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .retain(|a| a != &address);
            }
            SwarmEvent::ListenerClosed {
                listener_id,
                reason,
                ..
            } => {
                if listener_id == self.listener {
                    if let Some(ready) = self.listen_ready.take() {
                        let reason = match reason {
                            Ok(()) => "listener closed".to_string(),
                            Err(e) => e.to_string(),
                        };
                        let _ = ready.send(Err(Error::TransportInit(reason)));
                    }
                }
            }
            SwarmEvent::ConnectionEstablished {
                peer_id, endpoint, ..
            } => {
                let first = self
                    .shared
                    .connected
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(peer_id);
                if endpoint.is_dialer() {
                    self.swarm
                        .behaviour_mut()
                        .kademlia
                        .add_address(&peer_id, endpoint.get_remote_address().clone());
                }
                if first {
                    debug!(peer = %peer_id, addr = %endpoint.get_remote_address(), "connected");
                }
                for reply in self.pending_dials.remove(&peer_id).unwrap_or_default() {
                    let _ = reply.send(Ok(()));
                }
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                ..
            } => {
                if num_established == 0 {
                    self.shared
                        .connected
                        .write()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(&peer_id);
                    debug!(peer = %peer_id, "disconnected");
                }
            }
            SwarmEvent::OutgoingConnectionError {
                peer_id: Some(peer),
                error,
                ..
            } => {
                if !self.swarm.is_connected(&peer) {
                    let reason = error.to_string();
                    for reply in self.pending_dials.remove(&peer).unwrap_or_default() {
                        let _ = reply.send(Err(Error::ConnectionFailure {
                            peer,
                            reason: reason.clone(),
                        }));
                    }
                }
            }
            SwarmEvent::Behaviour(NodeBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                for addr in &info.listen_addrs {
                    self.swarm
                        .behaviour_mut()
                        .kademlia
                        .add_address(&peer_id, addr.clone());
                }
                self.shared
                    .book
                    .add_addrs(peer_id, info.listen_addrs, PROVIDER_ADDR_TTL);
            }
            SwarmEvent::Behaviour(NodeBehaviourEvent::Mdns(mdns::Event::Discovered(list))) => {
                for (peer, addr) in &list {
                    self.swarm
                        .behaviour_mut()
                        .kademlia
                        .add_address(peer, addr.clone());
                }
                let local_id = *self.swarm.local_peer_id();
                if let Some(found) = &self.local_found {
                    for record in local_sightings(local_id, list) {
                        if found.try_send(record).is_err() {
                            debug!("local discovery consumer behind; sighting dropped");
                        }
                    }
                }
            }
            SwarmEvent::Behaviour(NodeBehaviourEvent::Kademlia(event)) => self.on_kademlia_event(event),
            _ => {}
        }
    }

    fn on_kademlia_event(&mut self, event: kad::Event) {
        let (id, result, step) = match event {
            kad::Event::OutboundQueryProgressed {
                id, result, step, ..
            } => (id, result, step),
            kad::Event::RoutingUpdated { peer, .. } => {
                debug!(%peer, "directory routing table updated");
                for command in std::mem::take(&mut self.parked) {
                    self.on_command(command);
                }
                return;
            }
            _ => return,
        };
        match result {
            QueryResult::StartProviding(result) => {
                if let Some((tag, reply)) = self.pending_provide.remove(&id) {
                    let _ = reply.send(result.map(|_| ()).map_err(|e| Error::AdvertiseFailure {
                        tag,
                        reason: e.to_string(),
                    }));
                }
            }
            QueryResult::GetProviders(Ok(GetProvidersOk::FoundProviders { providers, .. })) => {
                if let Some(found) = self.pending_providers.get(&id) {
                    for peer in providers {
                        let _ = found.send(peer);
                    }
                }
                if step.last {
                    self.pending_providers.remove(&id);
                }
            }
            QueryResult::GetProviders(result) => {
                if let Err(e) = result {
                    debug!("provider lookup ended: {e}");
                }
                self.pending_providers.remove(&id);
            }
            QueryResult::GetRecord(Ok(GetRecordOk::FoundRecord(found))) => {
                if let Some(reply) = self.pending_records.remove(&id) {
                    let _ = reply.send(Some(found.record.value));
                }
                if let Some(mut query) = self.swarm.behaviour_mut().kademlia.query_mut(&id) {
                    query.finish();
                }
            }
            QueryResult::GetRecord(_) => {
                if let Some(reply) = self.pending_records.remove(&id) {
                    let _ = reply.send(None);
                }
            }
            QueryResult::PutRecord(Err(e)) => debug!("address record not replicated: {e}"),
            QueryResult::Bootstrap(Err(e)) => debug!("directory bootstrap: {e}"),
            _ => {}
        }
    }
}
