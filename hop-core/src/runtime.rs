//! Async runtime and event loop for the node
//!
//! The swarm is owned by a single driver task. `SwarmHost` talks to it
//! over a command channel and exposes it to the supply engine as a `Host`
//! and a `TransferProtocol`. `run_node` wires storage, identity, the
//! exchange and the HTTP API together and runs until Ctrl+C.

use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use futures::StreamExt;
use libp2p::request_response::{self, OutboundRequestId, ResponseChannel};
use libp2p::swarm::SwarmEvent;
use libp2p::{Multiaddr, PeerId, Swarm};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::api::create_router;
use crate::authorizer::{AcceptAll, MaxSize, RequestKind, TransferAuthorizer, Validation, Voucher};
use crate::config::Config;
use crate::content_id::parse_cid;
use crate::datastore::{DatastoreError, RocksDatastore};
use crate::exchange::{Exchange, ExchangeError};
use crate::host::{Host, InboundSupply, TransportError};
use crate::keystore::{load_or_create_identity, FsKeystore, KeystoreError};
use crate::messages::{decode_message, encode_message, SupplyMessage};
use crate::metrics::Metrics;
use crate::p2p::{create_swarm, Behaviour, BehaviourEvent, HopRequest, HopResponse, P2PError, WireVoucher};
use crate::storage::{Blockstore, RocksBlockStore, StorageError};
use crate::supply::SupplyConfig;
use crate::transfer::{TransferError, TransferProtocol, TransferSession};

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("P2P error: {0}")]
    P2P(#[from] P2PError),

    #[error("Exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Datastore error: {0}")]
    Datastore(#[from] DatastoreError),

    #[error("Keystore error: {0}")]
    Keystore(#[from] KeystoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

type Reply = oneshot::Sender<Result<HopResponse, TransportError>>;

enum Command {
    Dial(Multiaddr),
    Request {
        peer: PeerId,
        request: HopRequest,
        reply: Reply,
    },
    Respond {
        channel: ResponseChannel<HopResponse>,
        response: HopResponse,
    },
}

struct HostState {
    local_peer: PeerId,
    commands: mpsc::UnboundedSender<Command>,
    peers: RwLock<HashSet<PeerId>>,
    inbox: Mutex<Option<mpsc::UnboundedSender<InboundSupply>>>,
    authorizer: RwLock<Option<Arc<TransferAuthorizer>>>,
    store: Arc<dyn Blockstore>,
    metrics: Metrics,
}

/// libp2p-backed `Host` and `TransferProtocol`
#[derive(Clone)]
pub struct SwarmHost {
    state: Arc<HostState>,
}

impl SwarmHost {
    /// Hand `swarm` to a driver task and return a handle to it. The driver
    /// stops when `shutdown` is cancelled.
    pub fn spawn(
        swarm: Swarm<Behaviour>,
        store: Arc<dyn Blockstore>,
        metrics: Metrics,
        shutdown: CancellationToken,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let state = Arc::new(HostState {
            local_peer: *swarm.local_peer_id(),
            commands,
            peers: RwLock::new(HashSet::new()),
            inbox: Mutex::new(None),
            authorizer: RwLock::new(None),
            store,
            metrics,
        });

        let driver = Driver {
            swarm,
            state: Arc::clone(&state),
            pending: HashMap::new(),
        };
        let handle = tokio::spawn(driver.run(command_rx, shutdown));

        (Self { state }, handle)
    }

    pub fn dial(&self, addr: Multiaddr) -> Result<(), TransportError> {
        self.state
            .commands
            .send(Command::Dial(addr))
            .map_err(|_| TransportError::Closed)
    }

    async fn request(&self, peer: PeerId, request: HopRequest) -> Result<HopResponse, TransportError> {
        let (reply, reply_rx) = oneshot::channel();
        self.state
            .commands
            .send(Command::Request {
                peer,
                request,
                reply,
            })
            .map_err(|_| TransportError::Closed)?;
        reply_rx.await.map_err(|_| TransportError::Closed)?
    }
}

#[async_trait]
impl Host for SwarmHost {
    fn local_peer_id(&self) -> PeerId {
        self.state.local_peer
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.state.peers.read().iter().copied().collect()
    }

    async fn send_supply_message(
        &self,
        peer: PeerId,
        message: SupplyMessage,
    ) -> Result<(), TransportError> {
        if !self.state.peers.read().contains(&peer) {
            return Err(TransportError::NotConnected(peer));
        }
        let bytes = encode_message(&message).map_err(|e| TransportError::Failed(e.to_string()))?;

        match self.request(peer, HopRequest::Supply(bytes)).await? {
            HopResponse::Ack => Ok(()),
            HopResponse::Rejected(reason) | HopResponse::Error(reason) => {
                Err(TransportError::Failed(reason))
            }
            other => Err(TransportError::Failed(format!("unexpected response {:?}", other))),
        }
    }

    fn register_supply_inbox(&self, inbox: mpsc::UnboundedSender<InboundSupply>) {
        *self.state.inbox.lock() = Some(inbox);
    }
}

#[async_trait]
impl TransferProtocol for SwarmHost {
    fn install_authorizer(&self, authorizer: Arc<TransferAuthorizer>) {
        *self.state.authorizer.write() = Some(authorizer);
    }

    async fn open_pull(
        &self,
        provider: PeerId,
        payload_cid: Cid,
        voucher: Voucher,
    ) -> Result<TransferSession, TransferError> {
        if !self.state.peers.read().contains(&provider) {
            return Err(TransferError::Failed(format!("not connected to {}", provider)));
        }

        let (session, mut responder) = TransferSession::new(self.state.local_peer, provider, payload_cid);
        let request = HopRequest::Pull {
            cid: payload_cid.to_bytes(),
            voucher: WireVoucher::from(&voucher),
        };
        let host = self.clone();

        tokio::spawn(async move {
            let response = tokio::select! {
                _ = responder.cancelled() => return,
                response = host.request(provider, request) => response,
            };

            match response {
                Ok(HopResponse::Block(data)) => {
                    responder.accepted().await;
                    responder.completed(Bytes::from(data)).await;
                }
                Ok(HopResponse::Rejected(reason)) => {
                    responder.rejected(reason).await;
                }
                Ok(HopResponse::NotFound) => {
                    responder.failed("provider does not hold the block").await;
                }
                Ok(HopResponse::Error(reason)) => {
                    responder.failed(reason).await;
                }
                Ok(HopResponse::Ack) => {
                    responder.failed("unexpected acknowledgement").await;
                }
                Err(e) => {
                    responder.failed(e.to_string()).await;
                }
            }
        });

        Ok(session)
    }
}

struct Driver {
    swarm: Swarm<Behaviour>,
    state: Arc<HostState>,
    pending: HashMap<OutboundRequestId, Reply>,
}

impl Driver {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
                event = self.swarm.select_next_some() => self.on_swarm_event(event),
            }
        }
        info!("Swarm driver stopped");
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Dial(addr) => {
                if let Err(e) = self.swarm.dial(addr.clone()) {
                    warn!("Failed to dial {}: {}", addr, e);
                }
            }
            Command::Request {
                peer,
                request,
                reply,
            } => {
                let id = self.swarm.behaviour_mut().hop.send_request(&peer, request);
                self.pending.insert(id, reply);
            }
            Command::Respond { channel, response } => {
                if self
                    .swarm
                    .behaviour_mut()
                    .hop
                    .send_response(channel, response)
                    .is_err()
                {
                    debug!("Response channel closed before the response was sent");
                }
            }
        }
    }

    fn on_swarm_event(&mut self, event: SwarmEvent<BehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("Listening on {}", address);
            }
            SwarmEvent::ConnectionEstablished {
                peer_id, endpoint, ..
            } => {
                info!(
                    "Connected to peer: {} at {}",
                    peer_id,
                    endpoint.get_remote_address()
                );
                if self.state.peers.write().insert(peer_id) {
                    self.state.metrics.peer_connected();
                }
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                cause,
                ..
            } => {
                debug!("Connection closed with {}: {:?}", peer_id, cause);
                if num_established == 0 && self.state.peers.write().remove(&peer_id) {
                    self.state.metrics.peer_disconnected();
                }
            }
            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                error!("Outgoing connection error to {:?}: {}", peer_id, error);
            }
            SwarmEvent::Behaviour(BehaviourEvent::Hop(event)) => self.on_hop_event(event),
            SwarmEvent::Behaviour(BehaviourEvent::Identify(event)) => {
                trace!("Identify event: {:?}", event);
            }
            SwarmEvent::Behaviour(BehaviourEvent::Ping(event)) => {
                trace!("Ping event: {:?}", event);
            }
            _ => {}
        }
    }

    fn on_hop_event(&mut self, event: request_response::Event<HopRequest, HopResponse>) {
        match event {
            request_response::Event::Message { peer, message, .. } => match message {
                request_response::Message::Request {
                    request, channel, ..
                } => self.on_request(peer, request, channel),
                request_response::Message::Response {
                    request_id,
                    response,
                } => {
                    if let Some(reply) = self.pending.remove(&request_id) {
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
                let err = match error {
                    request_response::OutboundFailure::UnsupportedProtocols => {
                        TransportError::ProtocolNotSupported(peer)
                    }
                    other => TransportError::Failed(other.to_string()),
                };
                if let Some(reply) = self.pending.remove(&request_id) {
                    let _ = reply.send(Err(err));
                }
            }
            request_response::Event::InboundFailure { peer, error, .. } => {
                debug!("Inbound Hop request from {} failed: {}", peer, error);
            }
            request_response::Event::ResponseSent { .. } => {}
        }
    }

    fn on_request(&mut self, peer: PeerId, request: HopRequest, channel: ResponseChannel<HopResponse>) {
        match request {
            HopRequest::Supply(bytes) => {
                let response = match decode_message(&bytes) {
                    Ok(message) => {
                        let inbox = self.state.inbox.lock().clone();
                        let delivered = inbox
                            .map(|inbox| inbox.send(InboundSupply { from: peer, message }).is_ok())
                            .unwrap_or(false);
                        if delivered {
                            HopResponse::Ack
                        } else {
                            HopResponse::Error("supply engine not running".to_string())
                        }
                    }
                    Err(e) => HopResponse::Error(e.to_string()),
                };
                let _ = self.swarm.behaviour_mut().hop.send_response(channel, response);
            }
            HopRequest::Pull { cid, voucher } => {
                let state = Arc::clone(&self.state);
                tokio::spawn(async move {
                    let response = serve_pull(&state, peer, &cid, voucher).await;
                    let _ = state.commands.send(Command::Respond { channel, response });
                });
            }
        }
    }
}

async fn serve_pull(state: &HostState, peer: PeerId, cid: &[u8], voucher: WireVoucher) -> HopResponse {
    let cid = match parse_cid(cid) {
        Ok(cid) => cid,
        Err(e) => return HopResponse::Error(e.to_string()),
    };
    let voucher = voucher.into_voucher(cid);

    let authorizer = state.authorizer.read().clone();
    let outcome = match authorizer {
        Some(authorizer) => authorizer.authorize(&peer, &voucher),
        None => Validation::Reject("no authorizer installed".to_string()),
    };
    if let Validation::Reject(reason) = outcome {
        return HopResponse::Rejected(reason);
    }

    match state.store.get(&cid).await {
        Ok(block) => {
            debug!(peer = %peer, cid = %cid, size = block.size(), "Serving pull");
            HopResponse::Block(block.data)
        }
        Err(StorageError::BlockNotFound(_)) => HopResponse::NotFound,
        Err(e) => HopResponse::Error(e.to_string()),
    }
}

/// Run a Hop node with the given configuration
pub async fn run_node(config: Config) -> Result<(), NodeError> {
    std::fs::create_dir_all(&config.data_dir)?;

    let keystore = Arc::new(FsKeystore::open(config.data_dir.join("keys"))?);
    let keypair = load_or_create_identity(keystore.as_ref())?;

    let store: Arc<dyn Blockstore> = Arc::new(RocksBlockStore::open(config.data_dir.join("blocks"))?);
    let datastore = Arc::new(RocksDatastore::open(config.data_dir.join("metadata"))?);
    let metrics = Metrics::new();
    let shutdown = CancellationToken::new();

    let transfer_timeout = Duration::from_secs(config.transfer_timeout_secs);
    let mut swarm = create_swarm(keypair, transfer_timeout)?;

    let listen_addr: Multiaddr = format!("/ip4/0.0.0.0/tcp/{}", config.listen_port)
        .parse()
        .map_err(|e| P2PError::Transport(format!("Invalid listen address: {}", e)))?;
    swarm
        .listen_on(listen_addr)
        .map_err(|e| P2PError::Transport(format!("Failed to listen: {}", e)))?;

    let (host, driver) = SwarmHost::spawn(swarm, Arc::clone(&store), metrics.clone(), shutdown.clone());
    info!("Node started with peer ID: {}", host.local_peer_id());

    for addr in &config.bootstrap_nodes {
        match addr.parse::<Multiaddr>() {
            Ok(addr) => {
                info!("Dialing bootstrap node {}", addr);
                if let Err(e) = host.dial(addr) {
                    warn!("Failed to queue dial: {}", e);
                }
            }
            Err(e) => warn!("Ignoring invalid bootstrap address {}: {}", addr, e),
        }
    }

    let authorizer = TransferAuthorizer::builder()
        .register(RequestKind::Add, MaxSize::new(config.max_block_size))
        .register(RequestKind::Retrieval, AcceptAll)
        .build();
    let supply_config = SupplyConfig {
        transfer_timeout,
        ..SupplyConfig::default()
    };

    let host = Arc::new(host);
    let exchange = Exchange::builder()
        .with_blockstore(store)
        .with_host(host.clone())
        .with_transfer(host)
        .with_datastore(datastore)
        .with_keystore(keystore)
        .with_authorizer(authorizer)
        .with_supply_config(supply_config)
        .with_metrics(metrics.clone())
        .build()
        .await?;
    let exchange = Arc::new(exchange);

    let api_addr = format!("0.0.0.0:{}", config.api_port);
    let listener = tokio::net::TcpListener::bind(&api_addr).await?;
    info!("HTTP API listening on {}", api_addr);

    let router = create_router(Arc::clone(&exchange), metrics);
    let api_shutdown = shutdown.clone();
    let api = tokio::spawn(async move {
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(async move { api_shutdown.cancelled().await })
            .await;
        if let Err(e) = served {
            error!("HTTP API error: {}", e);
        }
    });

    signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");

    exchange.close().await;
    shutdown.cancel();
    let _ = api.await;
    let _ = driver.await;

    info!("Node stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authorizer::RetrievalRequest;
    use crate::content_id::content_cid;
    use crate::storage::{Block, MemoryBlockStore};
    use libp2p::identity::Keypair;

    fn spawn_host(store: Arc<dyn Blockstore>) -> (SwarmHost, CancellationToken) {
        let swarm = create_swarm(Keypair::generate_ed25519(), Duration::from_secs(5)).unwrap();
        let shutdown = CancellationToken::new();
        let (host, _driver) = SwarmHost::spawn(swarm, store, Metrics::new(), shutdown.clone());
        (host, shutdown)
    }

    #[tokio::test]
    async fn test_serve_pull_outcomes() {
        let store = Arc::new(MemoryBlockStore::new());
        let block = Block::new(b"served over libp2p".to_vec()).unwrap();
        store.put(block.clone()).await.unwrap();

        let (host, shutdown) = spawn_host(store);
        let peer = PeerId::random();
        let cid_bytes = block.cid.to_bytes();

        // nothing installed yet
        assert!(matches!(
            serve_pull(&host.state, peer, &cid_bytes, WireVoucher::Retrieval).await,
            HopResponse::Rejected(_)
        ));

        host.install_authorizer(Arc::new(TransferAuthorizer::accept_all()));
        assert_eq!(
            serve_pull(&host.state, peer, &cid_bytes, WireVoucher::Retrieval).await,
            HopResponse::Block(block.data.clone())
        );

        let missing = content_cid(b"not here").unwrap().to_bytes();
        assert_eq!(
            serve_pull(&host.state, peer, &missing, WireVoucher::Retrieval).await,
            HopResponse::NotFound
        );

        assert!(matches!(
            serve_pull(&host.state, peer, b"junk", WireVoucher::Retrieval).await,
            HopResponse::Error(_)
        ));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_unconnected_peer_is_refused() {
        let (host, shutdown) = spawn_host(Arc::new(MemoryBlockStore::new()));
        let peer = PeerId::random();
        let cid = content_cid(b"x").unwrap();

        assert!(host.connected_peers().is_empty());
        assert!(matches!(
            host.send_supply_message(peer, SupplyMessage::completed(&cid)).await,
            Err(TransportError::NotConnected(_))
        ));
        assert!(host
            .open_pull(peer, cid, Voucher::Retrieval(RetrievalRequest::new(cid)))
            .await
            .is_err());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_two_swarm_hosts_exchange_supply_messages() {
        let (a, a_shutdown) = spawn_host(Arc::new(MemoryBlockStore::new()));

        let mut b_swarm = create_swarm(Keypair::generate_ed25519(), Duration::from_secs(5)).unwrap();
        b_swarm
            .listen_on("/ip4/127.0.0.1/tcp/0".parse().unwrap())
            .unwrap();
        let b_addr = loop {
            if let SwarmEvent::NewListenAddr { address, .. } = b_swarm.select_next_some().await {
                break address;
            }
        };
        let b_shutdown = CancellationToken::new();
        let (b, _driver) = SwarmHost::spawn(
            b_swarm,
            Arc::new(MemoryBlockStore::new()),
            Metrics::new(),
            b_shutdown.clone(),
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        b.register_supply_inbox(tx);
        a.dial(b_addr).unwrap();

        tokio::time::timeout(Duration::from_secs(10), async {
            while !a.connected_peers().contains(&b.local_peer_id()) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        let cid = content_cid(b"hello libp2p").unwrap();
        a.send_supply_message(b.local_peer_id(), SupplyMessage::completed(&cid))
            .await
            .unwrap();

        let inbound = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(inbound.from, a.local_peer_id());

        a_shutdown.cancel();
        b_shutdown.cancel();
    }
}
