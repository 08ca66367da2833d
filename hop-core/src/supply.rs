//! Supply protocol engine
//!
//! Announcing content sends an `AddRequest` to every reachable peer. A peer
//! that accepts the request pulls the block from the announcer, verifies
//! it, stores it and sends back a completion notice. The announcer then
//! records that peer as a provider and publishes an `Event`.
//!
//! Inbound messages arrive on a channel registered with the host and are
//! handled by a single engine task; pulls and deliveries run on their own
//! tasks and all of them stop when the engine shuts down.

use cid::Cid;
use libp2p::PeerId;
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use crate::authorizer::{AddRequest, TransferAuthorizer, Validation, Voucher};
use crate::content_id::{parse_cid_str, validate_cid, CidError};
use crate::datastore::{Datastore, DatastoreError};
use crate::events::{Event, EventBus, Subscription, DEFAULT_QUEUE_DEPTH};
use crate::host::{Host, InboundSupply, PubSub, PubSubMessage, TransportError};
use crate::messages::{decode_message, encode_message, MessageError, SupplyMessage, SupplyPayload};
use crate::metrics::Metrics;
use crate::registry::ProviderRegistry;
use crate::storage::{Block, Blockstore, StorageError};
use crate::transfer::{TransferError, TransferProtocol};

/// Pubsub topic add requests are broadcast on
pub const ADD_REQUEST_TOPIC: &str = "/hop/supply/add/1.0.0";

/// Datastore prefix for persisted provider entries
pub const PROVIDER_PREFIX: &str = "/supply/providers/";

#[derive(Debug, Clone)]
pub struct SupplyConfig {
    /// Upper bound on a single pull, accept included
    pub transfer_timeout: Duration,
    /// Extra delivery attempts per peer after the first one fails
    pub max_retries: u32,
    /// Base delay between delivery attempts, grows linearly
    pub retry_interval: Duration,
    pub event_queue_depth: usize,
    pub max_concurrent_pulls: usize,
    pub topic: String,
}

impl Default for SupplyConfig {
    fn default() -> Self {
        Self {
            transfer_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_interval: Duration::from_millis(500),
            event_queue_depth: DEFAULT_QUEUE_DEPTH,
            max_concurrent_pulls: 16,
            topic: ADD_REQUEST_TOPIC.to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupplyError {
    #[error("Request rejected: {0}")]
    RequestRejected(String),

    #[error("Transfer timed out after {0:?}")]
    TransferTimeout(Duration),

    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    #[error("Received bytes do not match {0}")]
    ContentMismatch(Cid),

    #[error("Invalid content identifier: {0}")]
    InvalidIdentifier(#[from] CidError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Datastore error: {0}")]
    Datastore(#[from] DatastoreError),

    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    #[error("Supply engine is shut down")]
    Closed,
}

impl From<TransferError> for SupplyError {
    fn from(e: TransferError) -> Self {
        match e {
            TransferError::Rejected(reason) => SupplyError::RequestRejected(reason),
            TransferError::Timeout(after) => SupplyError::TransferTimeout(after),
            TransferError::Failed(reason) => SupplyError::TransferFailed(reason),
        }
    }
}

fn provider_key(cid: &Cid, peer: &PeerId) -> String {
    format!("{}{}/{}", PROVIDER_PREFIX, cid, peer)
}

fn parse_provider_key(key: &str) -> Option<(Cid, PeerId)> {
    let rest = key.strip_prefix(PROVIDER_PREFIX)?;
    let (cid, peer) = rest.split_once('/')?;
    Some((parse_cid_str(cid).ok()?, PeerId::from_str(peer).ok()?))
}

struct Shared {
    local_peer: PeerId,
    host: Arc<dyn Host>,
    transfer: Arc<dyn TransferProtocol>,
    store: Arc<dyn Blockstore>,
    pubsub: Option<Arc<dyn PubSub>>,
    datastore: Option<Arc<dyn Datastore>>,
    authorizer: Arc<TransferAuthorizer>,
    registry: ProviderRegistry,
    events: EventBus,
    announced: Mutex<HashSet<Cid>>,
    /// Announcers waiting on a pull per content, in arrival order
    in_flight: Mutex<HashMap<Cid, Vec<(PeerId, AddRequest)>>>,
    pulls: Semaphore,
    metrics: Metrics,
    config: SupplyConfig,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

pub struct Supply {
    shared: Arc<Shared>,
}

pub struct SupplyBuilder {
    host: Arc<dyn Host>,
    transfer: Arc<dyn TransferProtocol>,
    store: Arc<dyn Blockstore>,
    pubsub: Option<Arc<dyn PubSub>>,
    datastore: Option<Arc<dyn Datastore>>,
    authorizer: Option<Arc<TransferAuthorizer>>,
    metrics: Option<Metrics>,
    config: SupplyConfig,
}

impl SupplyBuilder {
    pub fn pubsub(mut self, pubsub: Arc<dyn PubSub>) -> Self {
        self.pubsub = Some(pubsub);
        self
    }

    pub fn datastore(mut self, datastore: Arc<dyn Datastore>) -> Self {
        self.datastore = Some(datastore);
        self
    }

    pub fn authorizer(mut self, authorizer: Arc<TransferAuthorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    pub fn metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(mut self, config: SupplyConfig) -> Self {
        self.config = config;
        self
    }

    /// Wire the engine into its collaborators and start it
    pub async fn start(self) -> Result<Supply, SupplyError> {
        let authorizer = self
            .authorizer
            .unwrap_or_else(|| Arc::new(TransferAuthorizer::accept_all()));
        self.transfer.install_authorizer(Arc::clone(&authorizer));

        let registry = ProviderRegistry::new();
        if let Some(datastore) = &self.datastore {
            let records = datastore.scan_prefix(PROVIDER_PREFIX).await?;
            let entries = records.iter().filter_map(|(key, _)| {
                let entry = parse_provider_key(key);
                if entry.is_none() {
                    warn!(key = %key, "Skipping malformed provider record");
                }
                entry
            });
            let loaded = registry.load(entries);
            info!(entries = loaded, "Loaded provider registry");
        }

        let shared = Arc::new(Shared {
            local_peer: self.host.local_peer_id(),
            host: self.host,
            transfer: self.transfer,
            store: self.store,
            pubsub: self.pubsub,
            datastore: self.datastore,
            authorizer,
            registry,
            events: EventBus::new(self.config.event_queue_depth),
            announced: Mutex::new(HashSet::new()),
            in_flight: Mutex::new(HashMap::new()),
            pulls: Semaphore::new(self.config.max_concurrent_pulls.max(1)),
            metrics: self.metrics.unwrap_or_default(),
            config: self.config,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        });

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        shared.host.register_supply_inbox(inbox_tx.clone());

        if let Some(pubsub) = &shared.pubsub {
            let topic_rx = pubsub.subscribe(&shared.config.topic)?;
            shared.tasks.spawn(forward_pubsub(
                topic_rx,
                inbox_tx,
                shared.shutdown.clone(),
            ));
        }
        shared.tasks.spawn(run_engine(Arc::clone(&shared), inbox_rx));

        info!(peer = %shared.local_peer, "Supply engine started");

        Ok(Supply { shared })
    }
}

impl Supply {
    pub fn builder(
        host: Arc<dyn Host>,
        transfer: Arc<dyn TransferProtocol>,
        store: Arc<dyn Blockstore>,
    ) -> SupplyBuilder {
        SupplyBuilder {
            host,
            transfer,
            store,
            pubsub: None,
            datastore: None,
            authorizer: None,
            metrics: None,
            config: SupplyConfig::default(),
        }
    }

    /// Ask every reachable peer to replicate `payload_cid`.
    ///
    /// Returns once the requests are queued. Delivery to each peer is
    /// retried in the background and a peer that cannot be reached only
    /// produces a warning. With no reachable peers this is a no-op.
    pub async fn send_add_request(&self, payload_cid: Cid, size: u64) -> Result<(), SupplyError> {
        validate_cid(&payload_cid)?;
        let shared = &self.shared;
        if shared.shutdown.is_cancelled() {
            return Err(SupplyError::Closed);
        }

        shared.announced.lock().insert(payload_cid);
        shared.metrics.announcement();

        let peers = shared.host.connected_peers();
        if peers.is_empty() {
            debug!(cid = %payload_cid, "No reachable peers, nothing to announce to");
            return Ok(());
        }

        let request = AddRequest::new(payload_cid, size);
        let message = SupplyMessage::add_request(&request);

        if let Some(pubsub) = &shared.pubsub {
            match encode_message(&message) {
                Ok(bytes) => {
                    if let Err(e) = pubsub.publish(&shared.config.topic, bytes).await {
                        warn!(cid = %payload_cid, "Failed to publish add request: {}", e);
                    }
                }
                Err(e) => warn!(cid = %payload_cid, "Failed to encode add request: {}", e),
            }
        }

        info!(cid = %payload_cid, size, peers = peers.len(), "Announcing content");

        for peer in peers {
            let task_shared = Arc::clone(shared);
            let message = message.clone();
            shared.tasks.spawn(async move {
                let shared = task_shared;
                let outcome = tokio::select! {
                    _ = shared.shutdown.cancelled() => return,
                    outcome = shared.deliver(peer, message) => outcome,
                };
                match outcome {
                    Ok(()) => shared.metrics.add_request_sent(),
                    Err(e) => {
                        shared.metrics.add_request_send_failed();
                        warn!(peer = %peer, cid = %payload_cid, "Could not deliver add request: {}", e);
                    }
                }
            });
        }

        Ok(())
    }

    /// Peers known to hold a verified copy of `payload_cid`, as of now
    pub fn provider_peers_for_content(&self, payload_cid: &Cid) -> Result<Vec<PeerId>, SupplyError> {
        validate_cid(payload_cid)?;
        Ok(self.shared.registry.get(payload_cid))
    }

    pub fn subscribe_to_events<F>(&self, callback: F) -> Subscription
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        self.shared.events.subscribe(callback)
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.shared.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.shared.events
    }

    pub fn authorizer(&self) -> Arc<TransferAuthorizer> {
        Arc::clone(&self.shared.authorizer)
    }

    pub fn config(&self) -> &SupplyConfig {
        &self.shared.config
    }

    pub fn metrics(&self) -> &Metrics {
        &self.shared.metrics
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.shared.local_peer
    }

    pub fn is_closed(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Background tasks still running: the engine loop, pulls and
    /// deliveries
    pub fn pending_tasks(&self) -> usize {
        self.shared.tasks.len()
    }

    /// Stop the engine and wait for every pull and delivery it started
    pub async fn close(&self) {
        self.shared.shutdown.cancel();
        self.shared.tasks.close();
        self.shared.tasks.wait().await;
        debug!(peer = %self.shared.local_peer, "Supply engine stopped");
    }
}

impl Drop for Supply {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

async fn forward_pubsub(
    mut topic_rx: mpsc::UnboundedReceiver<PubSubMessage>,
    inbox: mpsc::UnboundedSender<InboundSupply>,
    shutdown: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = topic_rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        match decode_message(&msg.data) {
            Ok(message) => {
                let inbound = InboundSupply {
                    from: msg.from,
                    message,
                };
                if inbox.send(inbound).is_err() {
                    break;
                }
            }
            Err(e) => debug!(peer = %msg.from, "Dropping malformed pubsub message: {}", e),
        }
    }
}

async fn run_engine(shared: Arc<Shared>, mut inbox: mpsc::UnboundedReceiver<InboundSupply>) {
    loop {
        let inbound = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            inbound = inbox.recv() => match inbound {
                Some(inbound) => inbound,
                None => break,
            },
        };

        if inbound.from == shared.local_peer {
            continue;
        }

        match inbound.message.payload() {
            Ok(SupplyPayload::Add(request)) => shared.on_add_request(inbound.from, request),
            Ok(SupplyPayload::Completed(cid)) => shared.on_transfer_completed(inbound.from, cid).await,
            Err(e) => debug!(peer = %inbound.from, "Ignoring malformed supply message: {}", e),
        }
    }
    trace!("Supply engine loop exited");
}

impl Shared {
    fn on_add_request(self: &Arc<Self>, from: PeerId, request: AddRequest) {
        let cid = request.payload_cid();
        self.metrics.add_request_received();

        if let Err(e) = validate_cid(&cid) {
            self.metrics.add_request_rejected();
            debug!(peer = %from, "Rejecting add request: {}", e);
            return;
        }

        if let Validation::Reject(reason) = self.authorizer.authorize(&from, &Voucher::Add(request)) {
            self.metrics.add_request_rejected();
            debug!(peer = %from, cid = %cid, "Add request rejected: {}", reason);
            return;
        }
        self.metrics.add_request_accepted();

        match self.in_flight.lock().entry(cid) {
            Entry::Occupied(mut waiting) => {
                if !waiting.get().iter().any(|(peer, _)| *peer == from) {
                    waiting.get_mut().push((from, request));
                }
                trace!(peer = %from, cid = %cid, "Pull already in flight, queued announcer");
                return;
            }
            Entry::Vacant(slot) => {
                slot.insert(vec![(from, request)]);
            }
        }

        let shared = Arc::clone(self);
        self.tasks.spawn(async move {
            tokio::select! {
                _ = shared.shutdown.cancelled() => {}
                _ = shared.replicate_from_announcers(cid) => {}
            }
        });
    }

    /// Try each announcer waiting on `cid` in turn until one pull succeeds,
    /// then confirm to all of them
    async fn replicate_from_announcers(self: &Arc<Self>, cid: Cid) {
        let mut tried: HashSet<PeerId> = HashSet::new();

        loop {
            let next = {
                let mut in_flight = self.in_flight.lock();
                let next = in_flight
                    .get(&cid)
                    .and_then(|waiting| waiting.iter().find(|(peer, _)| !tried.contains(peer)).copied());
                if next.is_none() {
                    in_flight.remove(&cid);
                }
                next
            };
            let Some((from, request)) = next else {
                debug!(cid = %cid, attempts = tried.len(), "No announcer could serve the content");
                return;
            };
            tried.insert(from);

            match self.replicate(from, request).await {
                Ok(()) => break,
                Err(SupplyError::Closed) => {
                    self.in_flight.lock().remove(&cid);
                    return;
                }
                Err(e) => {
                    self.metrics.pull_failed();
                    warn!(peer = %from, cid = %cid, "Replication failed: {}", e);
                }
            }
        }

        let waiting = self.in_flight.lock().remove(&cid).unwrap_or_default();
        for (announcer, _) in waiting {
            let shared = Arc::clone(self);
            self.tasks.spawn(async move {
                let notice = SupplyMessage::completed(&cid);
                let delivered = tokio::select! {
                    _ = shared.shutdown.cancelled() => return,
                    delivered = shared.deliver(announcer, notice) => delivered,
                };
                if let Err(e) = delivered {
                    warn!(peer = %announcer, cid = %cid, "Could not send completion notice: {}", e);
                }
            });
        }
    }

    /// Pull `request` from `from`, verify it and store it
    async fn replicate(&self, from: PeerId, request: AddRequest) -> Result<(), SupplyError> {
        let cid = request.payload_cid();
        if self.store.has(&cid).await {
            debug!(cid = %cid, "Already holding content, confirming without a pull");
            return Ok(());
        }

        let _permit = self.pulls.acquire().await.map_err(|_| SupplyError::Closed)?;

        debug!(peer = %from, cid = %cid, size = request.size(), "Pulling announced content");
        let timeout = self.config.transfer_timeout;
        let pull = async {
            let session = self
                .transfer
                .open_pull(from, cid, Voucher::Add(request))
                .await?;
            session.finish(timeout).await
        };
        let data = tokio::time::timeout(timeout, pull)
            .await
            .map_err(|_| SupplyError::TransferTimeout(timeout))??;

        let block = Block::from_cid_and_data(cid, data.to_vec())
            .map_err(|_| SupplyError::ContentMismatch(cid))?;
        let size = block.size();
        self.store.put(block).await?;

        self.metrics.pull_succeeded(size);
        info!(peer = %from, cid = %cid, size, "Replicated content");
        Ok(())
    }

    async fn on_transfer_completed(&self, from: PeerId, cid: Cid) {
        if !self.announced.lock().contains(&cid) {
            debug!(peer = %from, cid = %cid, "Ignoring completion for content we never announced");
            return;
        }

        if !self.registry.add(cid, from) {
            trace!(peer = %from, cid = %cid, "Provider already registered");
            return;
        }
        self.metrics.provider_registered();

        if let Some(datastore) = &self.datastore {
            if let Err(e) = datastore.put(&provider_key(&cid, &from), &from.to_bytes()).await {
                warn!(peer = %from, cid = %cid, "Failed to persist provider record: {}", e);
            }
        }

        info!(peer = %from, cid = %cid, "Registered new provider");
        self.events.publish(Event {
            payload_cid: cid,
            provider: from,
        });
        self.metrics.event_published();
    }

    /// Send `message` to `peer`, retrying with linear backoff
    async fn deliver(&self, peer: PeerId, message: SupplyMessage) -> Result<(), TransportError> {
        let attempts = self.config.max_retries + 1;
        let mut attempt = 1;

        loop {
            match self.host.send_supply_message(peer, message.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    debug!(peer = %peer, attempt, "Supply message delivery failed: {}", e);
                    tokio::time::sleep(self.config.retry_interval * attempt).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_id::content_cid;
    use crate::datastore::MemDatastore;
    use crate::memnet::{MockNet, MockNode};
    use crate::storage::MemoryBlockStore;

    async fn start(node: &MockNode) -> Supply {
        Supply::builder(
            Arc::new(node.clone()),
            Arc::new(node.clone()),
            node.store(),
        )
        .start()
        .await
        .unwrap()
    }

    #[test]
    fn test_provider_key_round_trip() {
        let cid = content_cid(b"key").unwrap();
        let peer = PeerId::random();

        let key = provider_key(&cid, &peer);
        assert!(key.starts_with(PROVIDER_PREFIX));
        assert_eq!(parse_provider_key(&key), Some((cid, peer)));
        assert_eq!(parse_provider_key("/supply/providers/garbage"), None);
    }

    #[test]
    fn test_transfer_errors_map_to_taxonomy() {
        assert!(matches!(
            SupplyError::from(TransferError::Rejected("no".into())),
            SupplyError::RequestRejected(_)
        ));
        assert!(matches!(
            SupplyError::from(TransferError::Timeout(Duration::from_secs(1))),
            SupplyError::TransferTimeout(_)
        ));
        assert!(matches!(
            SupplyError::from(TransferError::Failed("eof".into())),
            SupplyError::TransferFailed(_)
        ));
    }

    #[tokio::test]
    async fn test_zero_peers_is_a_no_op() {
        let net = MockNet::new();
        let node = net.add_memory_node();
        let supply = start(&node).await;

        let cid = content_cid(b"lonely").unwrap();
        supply.send_add_request(cid, 6).await.unwrap();

        assert!(supply.provider_peers_for_content(&cid).unwrap().is_empty());
        assert_eq!(supply.metrics().announcements(), 1);
        supply.close().await;
    }

    #[tokio::test]
    async fn test_invalid_identifier() {
        let net = MockNet::new();
        let node = net.add_memory_node();
        let supply = start(&node).await;

        // only CIDv1 identifiers are accepted
        let v0: Cid = "QmdfTbBqBPQ7VNxZEYEj14VmRuZBkqFbiwReogJgS1zR1n".parse().unwrap();
        assert!(matches!(
            supply.provider_peers_for_content(&v0),
            Err(SupplyError::InvalidIdentifier(_))
        ));
        assert!(matches!(
            supply.send_add_request(v0, 1).await,
            Err(SupplyError::InvalidIdentifier(_))
        ));
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let net = MockNet::new();
        let node = net.add_memory_node();
        let supply = start(&node).await;
        supply.close().await;

        let cid = content_cid(b"late").unwrap();
        assert!(matches!(
            supply.send_add_request(cid, 4).await,
            Err(SupplyError::Closed)
        ));
        assert!(supply.is_closed());
    }

    #[tokio::test]
    async fn test_registry_reloads_from_datastore() {
        let datastore = Arc::new(MemDatastore::new());
        let cid = content_cid(b"persisted").unwrap();
        let peer = PeerId::random();
        datastore
            .put(&provider_key(&cid, &peer), &peer.to_bytes())
            .await
            .unwrap();
        datastore
            .put("/supply/providers/not-a-cid/x", b"")
            .await
            .unwrap();

        let net = MockNet::new();
        let node = net.add_node(Arc::new(MemoryBlockStore::new()));
        let supply = Supply::builder(Arc::new(node.clone()), Arc::new(node.clone()), node.store())
            .datastore(datastore)
            .start()
            .await
            .unwrap();

        assert_eq!(supply.provider_peers_for_content(&cid).unwrap(), vec![peer]);
        assert_eq!(supply.registry().len(), 1);
    }
}
