//! Runtime peer session for one enabled network
//!
//! A session owns the network's swarm and runs its event loop on a spawned
//! task. Everything else talks to it through a cloneable [`SessionHandle`]
//! that sends commands and awaits oneshot replies. Dropping the swarm on
//! shutdown closes every connection of the network; nothing is persisted.

use futures::StreamExt;
use libp2p::{
    identify,
    identity::Keypair,
    multiaddr::Protocol,
    ping,
    request_response::{self, OutboundRequestId, ResponseChannel},
    swarm::{dial_opts::DialOpts, ConnectionId, SwarmEvent},
    Multiaddr, PeerId, Swarm,
};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::messages::{ChunkRequest, ChunkResponse, ResponseStatus};
use crate::metrics::Metrics;
use crate::netconfig::NetworkDefinition;
use crate::networks::NetworkError;
use crate::p2p::{create_swarm, Behaviour, BehaviourEvent, SwarmSettings};
use crate::protocol::serve_request;
use crate::store::ChunkStore;

const COMMAND_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub peer_id: String,
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    pub network_id: String,
    pub peer_id: String,
    pub connected_peers: usize,
    pub peers: Vec<String>,
    pub address_book_size: usize,
    pub listen_addresses: Vec<String>,
}

type Reply<T> = oneshot::Sender<T>;

enum SessionCommand {
    Dial {
        addr: Multiaddr,
        reply: Reply<Result<PeerId, NetworkError>>,
    },
    Status {
        reply: Reply<NetworkStatus>,
    },
    Addresses {
        reply: Reply<Vec<String>>,
    },
    Peers {
        reply: Reply<Vec<PeerInfo>>,
    },
    ConnectedPeers {
        reply: Reply<Vec<PeerId>>,
    },
    FindPeer {
        peer: PeerId,
        reply: Reply<Vec<String>>,
    },
    Request {
        peer: PeerId,
        request: ChunkRequest,
        reply: Reply<Result<ChunkResponse, NetworkError>>,
    },
    Shutdown,
}

/// Cloneable handle to a running session
#[derive(Clone)]
pub struct SessionHandle {
    network_id: String,
    commands: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub fn network_id(&self) -> &str {
        &self.network_id
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> SessionCommand,
    ) -> Result<T, NetworkError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| NetworkError::Closed(self.network_id.clone()))?;
        rx.await
            .map_err(|_| NetworkError::Closed(self.network_id.clone()))
    }

    /// Dial `addr`; resolves once the connection is established
    pub async fn dial(&self, addr: Multiaddr) -> Result<PeerId, NetworkError> {
        self.call(|reply| SessionCommand::Dial { addr, reply })
            .await?
    }

    pub async fn status(&self) -> Result<NetworkStatus, NetworkError> {
        self.call(|reply| SessionCommand::Status { reply }).await
    }

    /// Listen addresses with the `/p2p/<peer id>` suffix
    pub async fn addresses(&self) -> Result<Vec<String>, NetworkError> {
        self.call(|reply| SessionCommand::Addresses { reply }).await
    }

    pub async fn peers(&self) -> Result<Vec<PeerInfo>, NetworkError> {
        self.call(|reply| SessionCommand::Peers { reply }).await
    }

    pub async fn connected_peers(&self) -> Result<Vec<PeerId>, NetworkError> {
        self.call(|reply| SessionCommand::ConnectedPeers { reply })
            .await
    }

    /// Addresses in this network's address book for `peer`
    pub async fn find_peer(&self, peer: PeerId) -> Result<Vec<String>, NetworkError> {
        self.call(|reply| SessionCommand::FindPeer { peer, reply })
            .await
    }

    pub async fn request(
        &self,
        peer: PeerId,
        request: ChunkRequest,
    ) -> Result<ChunkResponse, NetworkError> {
        self.call(|reply| SessionCommand::Request {
            peer,
            request,
            reply,
        })
        .await?
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(SessionCommand::Shutdown).await;
    }
}

/// A started session: its handle and the event loop task
pub struct RunningSession {
    pub handle: SessionHandle,
    pub task: JoinHandle<()>,
}

fn peer_of(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().find_map(|p| match p {
        Protocol::P2p(peer) => Some(peer),
        _ => None,
    })
}

fn with_peer(addr: &Multiaddr, peer: PeerId) -> String {
    if peer_of(addr).is_some() {
        addr.to_string()
    } else {
        addr.clone().with(Protocol::P2p(peer)).to_string()
    }
}

/// Build the network's swarm, listen, dial bootstrap peers and spawn the loop
///
/// Fails without leaving anything running when the listener cannot start.
pub async fn start_session(
    definition: &NetworkDefinition,
    keypair: Keypair,
    listen: Multiaddr,
    settings: SwarmSettings,
    store: ChunkStore,
    metrics: Metrics,
) -> Result<RunningSession, NetworkError> {
    let psk = definition.psk()?;
    let bootstrap = definition.bootstrap_addrs()?;
    let network_id = definition.network_id.clone();

    let mut swarm = create_swarm(keypair, psk, settings)?;
    let local_peer_id = *swarm.local_peer_id();

    swarm
        .listen_on(listen.clone())
        .map_err(|e| NetworkError::Listen {
            addr: listen.to_string(),
            reason: e.to_string(),
        })?;

    let first = tokio::time::timeout(settings.dial_timeout, async {
        loop {
            match swarm.select_next_some().await {
                SwarmEvent::NewListenAddr { address, .. } => return Ok(address),
                SwarmEvent::ListenerError { error, .. } => return Err(error.to_string()),
                SwarmEvent::ListenerClosed { reason, .. } => {
                    return Err(match reason {
                        Ok(()) => "listener closed".to_string(),
                        Err(e) => e.to_string(),
                    })
                }
                _ => {}
            }
        }
    })
    .await
    .map_err(|_| "timed out waiting for listener".to_string())
    .and_then(|r| r)
    .map_err(|reason| NetworkError::Listen {
        addr: listen.to_string(),
        reason,
    })?;

    info!(
        "Network {} listening on {}/p2p/{}",
        network_id, first, local_peer_id
    );

    let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
    let (served_tx, served_rx) = mpsc::unbounded_channel();
    let mut session = SessionLoop {
        network_id: network_id.clone(),
        swarm,
        commands: rx,
        served_tx,
        served_rx,
        store,
        metrics,
        pending_dials: HashMap::new(),
        pending_requests: HashMap::new(),
        address_book: HashMap::new(),
        connections: HashMap::new(),
    };

    for addr in bootstrap {
        if peer_of(&addr) == Some(local_peer_id) {
            debug!("Skipping own bootstrap address {}", addr);
            continue;
        }
        if let Err(e) = session.swarm.dial(addr.clone()) {
            warn!("Network {}: bootstrap dial {} failed: {}", network_id, addr, e);
        }
    }

    let task = tokio::spawn(session.run());
    Ok(RunningSession {
        handle: SessionHandle {
            network_id,
            commands: tx,
        },
        task,
    })
}

struct SessionLoop {
    network_id: String,
    swarm: Swarm<Behaviour>,
    commands: mpsc::Receiver<SessionCommand>,
    served_tx: mpsc::UnboundedSender<(ResponseChannel<ChunkResponse>, ChunkResponse)>,
    served_rx: mpsc::UnboundedReceiver<(ResponseChannel<ChunkResponse>, ChunkResponse)>,
    store: ChunkStore,
    metrics: Metrics,
    pending_dials: HashMap<ConnectionId, Reply<Result<PeerId, NetworkError>>>,
    pending_requests: HashMap<OutboundRequestId, Reply<Result<ChunkResponse, NetworkError>>>,
    address_book: HashMap<PeerId, HashSet<Multiaddr>>,
    connections: HashMap<PeerId, HashMap<ConnectionId, Multiaddr>>,
}

impl SessionLoop {
    async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => self.handle_swarm_event(event),
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some((channel, response)) = self.served_rx.recv() => {
                    let served = response.data.len();
                    let ok = response.response_status() == ResponseStatus::Ok;
                    if self.swarm.behaviour_mut().lish.send_response(channel, response).is_err() {
                        debug!("Network {}: peer went away before response", self.network_id);
                    } else if ok && served > 0 {
                        self.metrics.chunk_served(served);
                    }
                }
            }
        }

        for (_, reply) in self.pending_dials.drain() {
            let _ = reply.send(Err(NetworkError::Closed(self.network_id.clone())));
        }
        for (_, reply) in self.pending_requests.drain() {
            let _ = reply.send(Err(NetworkError::Closed(self.network_id.clone())));
        }
        for _ in self.connections.values().flat_map(|c| c.keys()) {
            self.metrics.peer_disconnected();
        }
        info!("Network {} session stopped", self.network_id);
    }

    fn local_peer_id(&self) -> PeerId {
        *self.swarm.local_peer_id()
    }

    fn listen_addresses(&self) -> Vec<String> {
        let local = self.local_peer_id();
        self.swarm
            .listeners()
            .chain(self.swarm.external_addresses())
            .map(|a| with_peer(a, local))
            .collect()
    }

    fn remember(&mut self, peer: PeerId, addr: Multiaddr) {
        if peer == self.local_peer_id() {
            return;
        }
        if self
            .address_book
            .entry(peer)
            .or_default()
            .insert(addr.clone())
        {
            trace!("Network {}: learned {} for {}", self.network_id, addr, peer);
            self.swarm.add_peer_address(peer, addr);
        }
    }

    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Dial { addr, reply } => {
                let target = peer_of(&addr);
                if target == Some(self.local_peer_id()) {
                    let _ = reply.send(Err(NetworkError::Dial(format!(
                        "{} is this node",
                        addr
                    ))));
                    return;
                }
                if let Some(peer) = target.filter(|p| self.swarm.is_connected(p)) {
                    let _ = reply.send(Ok(peer));
                    return;
                }
                let opts = DialOpts::from(addr.clone());
                let connection_id = opts.connection_id();
                match self.swarm.dial(opts) {
                    Ok(()) => {
                        debug!("Network {}: dialing {}", self.network_id, addr);
                        self.pending_dials.insert(connection_id, reply);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(NetworkError::Dial(e.to_string())));
                    }
                }
            }
            SessionCommand::Status { reply } => {
                let peers: Vec<String> = self
                    .swarm
                    .connected_peers()
                    .map(|p| p.to_string())
                    .collect();
                let _ = reply.send(NetworkStatus {
                    network_id: self.network_id.clone(),
                    peer_id: self.local_peer_id().to_string(),
                    connected_peers: peers.len(),
                    peers,
                    address_book_size: self.address_book.len(),
                    listen_addresses: self.listen_addresses(),
                });
            }
            SessionCommand::Addresses { reply } => {
                let _ = reply.send(self.listen_addresses());
            }
            SessionCommand::Peers { reply } => {
                let mut peers: Vec<PeerInfo> = self
                    .connections
                    .iter()
                    .map(|(peer, conns)| {
                        let mut addresses: Vec<String> =
                            conns.values().map(|a| a.to_string()).collect();
                        addresses.sort();
                        addresses.dedup();
                        PeerInfo {
                            peer_id: peer.to_string(),
                            addresses,
                        }
                    })
                    .collect();
                peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
                let _ = reply.send(peers);
            }
            SessionCommand::ConnectedPeers { reply } => {
                let _ = reply.send(self.swarm.connected_peers().copied().collect());
            }
            SessionCommand::FindPeer { peer, reply } => {
                let mut addresses: Vec<String> = self
                    .address_book
                    .get(&peer)
                    .map(|set| set.iter().map(|a| with_peer(a, peer)).collect())
                    .unwrap_or_default();
                addresses.sort();
                let _ = reply.send(addresses);
            }
            SessionCommand::Request {
                peer,
                request,
                reply,
            } => {
                let request_id = self.swarm.behaviour_mut().lish.send_request(&peer, request);
                self.pending_requests.insert(request_id, reply);
            }
            SessionCommand::Shutdown => {}
        }
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<BehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("Network {} listening on {}", self.network_id, address);
            }
            SwarmEvent::ConnectionEstablished {
                peer_id,
                connection_id,
                endpoint,
                ..
            } => {
                let remote = endpoint.get_remote_address().clone();
                info!(
                    "Network {}: connected to {} at {}",
                    self.network_id, peer_id, remote
                );
                self.metrics.peer_connected();
                if endpoint.is_dialer() {
                    self.remember(peer_id, remote.clone());
                }
                self.connections
                    .entry(peer_id)
                    .or_default()
                    .insert(connection_id, remote);
                if let Some(reply) = self.pending_dials.remove(&connection_id) {
                    let _ = reply.send(Ok(peer_id));
                }
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                connection_id,
                cause,
                ..
            } => {
                debug!(
                    "Network {}: connection to {} closed: {:?}",
                    self.network_id, peer_id, cause
                );
                if let Some(conns) = self.connections.get_mut(&peer_id) {
                    if conns.remove(&connection_id).is_some() {
                        self.metrics.peer_disconnected();
                    }
                    if conns.is_empty() {
                        self.connections.remove(&peer_id);
                    }
                }
            }
            SwarmEvent::OutgoingConnectionError {
                connection_id,
                peer_id,
                error,
            } => {
                warn!(
                    "Network {}: outgoing connection to {:?} failed: {}",
                    self.network_id, peer_id, error
                );
                if let Some(reply) = self.pending_dials.remove(&connection_id) {
                    let _ = reply.send(Err(NetworkError::Dial(error.to_string())));
                }
            }
            SwarmEvent::IncomingConnectionError {
                send_back_addr,
                error,
                ..
            } => {
                debug!(
                    "Network {}: incoming connection from {} failed: {}",
                    self.network_id, send_back_addr, error
                );
            }
            SwarmEvent::ListenerError { error, .. } => {
                error!("Network {}: listener error: {}", self.network_id, error);
            }
            SwarmEvent::Behaviour(BehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                debug!(
                    "Network {}: identified {} ({} addresses)",
                    self.network_id,
                    peer_id,
                    info.listen_addrs.len()
                );
                for addr in info.listen_addrs {
                    self.remember(peer_id, addr);
                }
            }
            SwarmEvent::Behaviour(BehaviourEvent::Identify(_)) => {}
            SwarmEvent::Behaviour(BehaviourEvent::Ping(ping::Event { peer, result, .. })) => {
                trace!("Network {}: ping {} {:?}", self.network_id, peer, result);
            }
            SwarmEvent::Behaviour(BehaviourEvent::Lish(event)) => self.handle_lish_event(event),
            _ => {}
        }
    }

    fn handle_lish_event(&mut self, event: request_response::Event<ChunkRequest, ChunkResponse>) {
        match event {
            request_response::Event::Message { peer, message, .. } => match message {
                request_response::Message::Request {
                    request, channel, ..
                } => {
                    trace!(
                        "Network {}: {} asks {:?} of {}",
                        self.network_id,
                        peer,
                        request.request_kind(),
                        request.dataset_id
                    );
                    let store = self.store.clone();
                    let served_tx = self.served_tx.clone();
                    tokio::spawn(async move {
                        let response = serve_request(&store, request).await;
                        let _ = served_tx.send((channel, response));
                    });
                }
                request_response::Message::Response {
                    request_id,
                    response,
                } => {
                    if let Some(reply) = self.pending_requests.remove(&request_id) {
                        let _ = reply.send(Ok(response));
                    }
                }
            },
            request_response::Event::OutboundFailure {
                peer,
                request_id,
                error,
                ..
            } => {
                debug!(
                    "Network {}: request to {} failed: {}",
                    self.network_id, peer, error
                );
                if let Some(reply) = self.pending_requests.remove(&request_id) {
                    let _ = reply.send(Err(NetworkError::Request(error.to_string())));
                }
            }
            request_response::Event::InboundFailure { peer, error, .. } => {
                debug!(
                    "Network {}: inbound request from {} failed: {}",
                    self.network_id, peer, error
                );
            }
            request_response::Event::ResponseSent { .. } => {}
        }
    }
}
