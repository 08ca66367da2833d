//! In-memory network
//!
//! A mock network of nodes for exercising the supply protocol without
//! sockets. Each `MockNode` is a `Host`, a `TransferProtocol` and a
//! `PubSub` at once. Links between nodes are explicit, and a node can be
//! told to misbehave when serving pulls.

use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use libp2p::PeerId;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

use crate::authorizer::{TransferAuthorizer, Validation, Voucher};
use crate::host::{Host, InboundSupply, PubSub, PubSubMessage, TransportError};
use crate::messages::SupplyMessage;
use crate::storage::{Blockstore, MemoryBlockStore};
use crate::transfer::{SessionResponder, TransferError, TransferProtocol, TransferSession};

/// How a node behaves when serving a pull
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Fault {
    #[default]
    None,
    /// Serve bytes that do not hash to the requested id
    Corrupt,
    /// Accept the pull and never send anything
    Stall,
}

struct NodeState {
    peer_id: PeerId,
    store: Arc<dyn Blockstore>,
    inbox: Mutex<Option<mpsc::UnboundedSender<InboundSupply>>>,
    authorizer: RwLock<Option<Arc<TransferAuthorizer>>>,
    topics: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<PubSubMessage>>>>,
    fault: Mutex<Fault>,
}

#[derive(Default)]
struct NetInner {
    nodes: RwLock<HashMap<PeerId, Arc<NodeState>>>,
    links: RwLock<HashSet<(PeerId, PeerId)>>,
    serving: AtomicUsize,
}

/// Counts a pull for as long as the provider side is serving it
struct ServingGuard(Arc<NetInner>);

impl ServingGuard {
    fn enter(net: Arc<NetInner>) -> Self {
        net.serving.fetch_add(1, Ordering::AcqRel);
        Self(net)
    }
}

impl Drop for ServingGuard {
    fn drop(&mut self) {
        self.0.serving.fetch_sub(1, Ordering::AcqRel);
    }
}

impl NetInner {
    fn linked(&self, a: &PeerId, b: &PeerId) -> bool {
        self.links.read().contains(&link(*a, *b))
    }

    fn node(&self, peer: &PeerId) -> Option<Arc<NodeState>> {
        self.nodes.read().get(peer).cloned()
    }
}

fn link(a: PeerId, b: PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

#[derive(Clone, Default)]
pub struct MockNet {
    inner: Arc<NetInner>,
}

impl MockNet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&self, store: Arc<dyn Blockstore>) -> MockNode {
        let peer_id = PeerId::random();
        let state = Arc::new(NodeState {
            peer_id,
            store,
            inbox: Mutex::new(None),
            authorizer: RwLock::new(None),
            topics: Mutex::new(HashMap::new()),
            fault: Mutex::new(Fault::None),
        });
        self.inner.nodes.write().insert(peer_id, Arc::clone(&state));

        MockNode {
            net: Arc::clone(&self.inner),
            state,
        }
    }

    pub fn add_memory_node(&self) -> MockNode {
        self.add_node(Arc::new(MemoryBlockStore::new()))
    }

    pub fn connect(&self, a: &PeerId, b: &PeerId) {
        if a != b {
            self.inner.links.write().insert(link(*a, *b));
        }
    }

    pub fn disconnect(&self, a: &PeerId, b: &PeerId) {
        self.inner.links.write().remove(&link(*a, *b));
    }

    /// Link every pair of nodes added so far
    pub fn connect_all(&self) {
        let peers: Vec<PeerId> = self.inner.nodes.read().keys().copied().collect();
        let mut links = self.inner.links.write();
        for (i, a) in peers.iter().enumerate() {
            for b in &peers[i + 1..] {
                links.insert(link(*a, *b));
            }
        }
    }

    pub fn node_count(&self) -> usize {
        self.inner.nodes.read().len()
    }

    /// Pulls whose provider side has not finished yet
    pub fn active_pulls(&self) -> usize {
        self.inner.serving.load(Ordering::Acquire)
    }
}

#[derive(Clone)]
pub struct MockNode {
    net: Arc<NetInner>,
    state: Arc<NodeState>,
}

impl MockNode {
    pub fn peer_id(&self) -> PeerId {
        self.state.peer_id
    }

    pub fn store(&self) -> Arc<dyn Blockstore> {
        Arc::clone(&self.state.store)
    }

    pub fn set_fault(&self, fault: Fault) {
        *self.state.fault.lock() = fault;
    }
}

#[async_trait]
impl Host for MockNode {
    fn local_peer_id(&self) -> PeerId {
        self.state.peer_id
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        let me = self.state.peer_id;
        self.net
            .links
            .read()
            .iter()
            .filter_map(|(a, b)| {
                if *a == me {
                    Some(*b)
                } else if *b == me {
                    Some(*a)
                } else {
                    None
                }
            })
            .collect()
    }

    async fn send_supply_message(
        &self,
        peer: PeerId,
        message: SupplyMessage,
    ) -> Result<(), TransportError> {
        if !self.net.linked(&self.state.peer_id, &peer) {
            return Err(TransportError::NotConnected(peer));
        }
        let target = self
            .net
            .node(&peer)
            .ok_or(TransportError::NotConnected(peer))?;

        let inbox = target.inbox.lock().clone();
        let inbox = inbox.ok_or(TransportError::ProtocolNotSupported(peer))?;

        trace!(from = %self.state.peer_id, to = %peer, "Delivering supply message");
        inbox
            .send(InboundSupply {
                from: self.state.peer_id,
                message,
            })
            .map_err(|_| TransportError::Failed(format!("inbox of {} is closed", peer)))
    }

    fn register_supply_inbox(&self, inbox: mpsc::UnboundedSender<InboundSupply>) {
        *self.state.inbox.lock() = Some(inbox);
    }
}

#[async_trait]
impl TransferProtocol for MockNode {
    fn install_authorizer(&self, authorizer: Arc<TransferAuthorizer>) {
        *self.state.authorizer.write() = Some(authorizer);
    }

    async fn open_pull(
        &self,
        provider: PeerId,
        payload_cid: Cid,
        voucher: Voucher,
    ) -> Result<TransferSession, TransferError> {
        if !self.net.linked(&self.state.peer_id, &provider) {
            return Err(TransferError::Failed(format!("not connected to {}", provider)));
        }
        let target = self
            .net
            .node(&provider)
            .ok_or_else(|| TransferError::Failed(format!("unknown peer {}", provider)))?;

        let (session, responder) = TransferSession::new(self.state.peer_id, provider, payload_cid);
        let requester = self.state.peer_id;
        let guard = ServingGuard::enter(Arc::clone(&self.net));
        tokio::spawn(async move {
            serve_pull(target, requester, payload_cid, voucher, responder).await;
            drop(guard);
        });
        Ok(session)
    }
}

async fn serve_pull(
    provider: Arc<NodeState>,
    requester: PeerId,
    payload_cid: Cid,
    voucher: Voucher,
    mut responder: SessionResponder,
) {
    if voucher.payload_cid() != payload_cid {
        responder
            .rejected("voucher does not cover the requested content")
            .await;
        return;
    }

    let authorizer = provider.authorizer.read().clone();
    let outcome = match authorizer {
        Some(authorizer) => authorizer.authorize(&requester, &voucher),
        None => Validation::Reject("provider has no authorizer installed".to_string()),
    };
    if let Validation::Reject(reason) = outcome {
        responder.rejected(reason).await;
        return;
    }

    if !responder.accepted().await {
        return;
    }

    let fault = *provider.fault.lock();
    if fault == Fault::Stall {
        responder.cancelled().await;
        return;
    }

    match provider.store.get(&payload_cid).await {
        Ok(block) => {
            let mut data = block.data;
            if fault == Fault::Corrupt {
                data.push(0);
            }
            responder.completed(Bytes::from(data)).await;
        }
        Err(e) => {
            responder.failed(e.to_string()).await;
        }
    }
}

#[async_trait]
impl PubSub for MockNode {
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), TransportError> {
        let from = self.state.peer_id;
        for peer in self.connected_peers() {
            let Some(node) = self.net.node(&peer) else {
                continue;
            };
            let mut topics = node.topics.lock();
            if let Some(subscribers) = topics.get_mut(topic) {
                subscribers.retain(|tx| {
                    tx.send(PubSubMessage {
                        from,
                        data: data.clone(),
                    })
                    .is_ok()
                });
            }
        }
        Ok(())
    }

    fn subscribe(
        &self,
        topic: &str,
    ) -> Result<mpsc::UnboundedReceiver<PubSubMessage>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}
