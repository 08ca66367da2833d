//! Exchange facade
//!
//! Composes the supply engine with the local block store. `announce` pushes
//! a stored block out to peers; `get_block` serves from the local store and
//! falls back to pulling from known providers.

use cid::Cid;
use futures::future::join_all;
use libp2p::PeerId;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::authorizer::{RetrievalRequest, TransferAuthorizer, Voucher};
use crate::content_id::{validate_cid, CidError};
use crate::datastore::{Datastore, DatastoreError, RocksDatastore};
use crate::host::{Host, PubSub};
use crate::keystore::{FsKeystore, Keystore, KeystoreError};
use crate::metrics::Metrics;
use crate::storage::{Block, Blockstore, StorageError};
use crate::supply::{Supply, SupplyConfig, SupplyError};
use crate::transfer::TransferProtocol;

#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("Block {0} is not held locally")]
    NotFoundLocally(Cid),

    #[error("Block {0} could not be found locally or from any provider")]
    NotFoundAnywhere(Cid),

    #[error("Invalid content identifier: {0}")]
    InvalidIdentifier(#[from] CidError),

    #[error("Missing required collaborator: {0}")]
    MissingCollaborator(&'static str),

    #[error("Supply error: {0}")]
    Supply(#[from] SupplyError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Datastore error: {0}")]
    Datastore(#[from] DatastoreError),

    #[error("Keystore error: {0}")]
    Keystore(#[from] KeystoreError),
}

pub struct Exchange {
    store: Arc<dyn Blockstore>,
    host: Arc<dyn Host>,
    transfer: Arc<dyn TransferProtocol>,
    keystore: Option<Arc<dyn Keystore>>,
    supply: Supply,
    metrics: Metrics,
}

#[derive(Default)]
pub struct ExchangeBuilder {
    blockstore: Option<Arc<dyn Blockstore>>,
    host: Option<Arc<dyn Host>>,
    transfer: Option<Arc<dyn TransferProtocol>>,
    pubsub: Option<Arc<dyn PubSub>>,
    datastore: Option<Arc<dyn Datastore>>,
    repo_path: Option<PathBuf>,
    keystore: Option<Arc<dyn Keystore>>,
    authorizer: Option<Arc<TransferAuthorizer>>,
    supply_config: Option<SupplyConfig>,
    metrics: Option<Metrics>,
}

impl ExchangeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_blockstore(mut self, blockstore: Arc<dyn Blockstore>) -> Self {
        self.blockstore = Some(blockstore);
        self
    }

    pub fn with_host(mut self, host: Arc<dyn Host>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn with_transfer(mut self, transfer: Arc<dyn TransferProtocol>) -> Self {
        self.transfer = Some(transfer);
        self
    }

    pub fn with_pubsub(mut self, pubsub: Arc<dyn PubSub>) -> Self {
        self.pubsub = Some(pubsub);
        self
    }

    pub fn with_datastore(mut self, datastore: Arc<dyn Datastore>) -> Self {
        self.datastore = Some(datastore);
        self
    }

    /// Directory for the metadata store and keystore when those are not
    /// given explicitly
    pub fn with_repo_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.repo_path = Some(path.into());
        self
    }

    pub fn with_keystore(mut self, keystore: Arc<dyn Keystore>) -> Self {
        self.keystore = Some(keystore);
        self
    }

    pub fn with_authorizer(mut self, authorizer: TransferAuthorizer) -> Self {
        self.authorizer = Some(Arc::new(authorizer));
        self
    }

    pub fn with_supply_config(mut self, config: SupplyConfig) -> Self {
        self.supply_config = Some(config);
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn build(self) -> Result<Exchange, ExchangeError> {
        let store = self
            .blockstore
            .ok_or(ExchangeError::MissingCollaborator("blockstore"))?;
        let host = self.host.ok_or(ExchangeError::MissingCollaborator("host"))?;
        let transfer = self
            .transfer
            .ok_or(ExchangeError::MissingCollaborator("transfer protocol"))?;

        let mut datastore = self.datastore;
        let mut keystore = self.keystore;
        if let Some(repo) = &self.repo_path {
            if datastore.is_none() {
                datastore = Some(Arc::new(RocksDatastore::open(repo.join("metadata"))?));
            }
            if keystore.is_none() {
                keystore = Some(Arc::new(FsKeystore::open(repo.join("keys"))?));
            }
        }

        let metrics = self.metrics.unwrap_or_default();
        let mut supply = Supply::builder(Arc::clone(&host), Arc::clone(&transfer), Arc::clone(&store))
            .metrics(metrics.clone())
            .config(self.supply_config.unwrap_or_default());
        if let Some(pubsub) = self.pubsub {
            supply = supply.pubsub(pubsub);
        }
        if let Some(datastore) = datastore {
            supply = supply.datastore(datastore);
        }
        if let Some(authorizer) = self.authorizer {
            supply = supply.authorizer(authorizer);
        }
        let supply = supply.start().await?;

        Ok(Exchange {
            store,
            host,
            transfer,
            keystore,
            supply,
            metrics,
        })
    }
}

impl Exchange {
    pub fn builder() -> ExchangeBuilder {
        ExchangeBuilder::new()
    }

    /// Look a block up in the local store only
    pub async fn get_local(&self, cid: &Cid) -> Result<Block, ExchangeError> {
        validate_cid(cid)?;
        match self.store.get(cid).await {
            Ok(block) => Ok(block),
            Err(StorageError::BlockNotFound(_)) => Err(ExchangeError::NotFoundLocally(*cid)),
            Err(e) => Err(e.into()),
        }
    }

    /// Offer a locally stored block to every reachable peer
    pub async fn announce(&self, cid: &Cid) -> Result<(), ExchangeError> {
        let block = self.get_local(cid).await?;

        self.supply
            .send_add_request(*cid, block.size() as u64)
            .await?;
        Ok(())
    }

    /// Fetch a block, locally if possible, otherwise from a known provider.
    /// A block fetched remotely is verified and kept in the local store.
    pub async fn get_block(&self, cid: &Cid) -> Result<Block, ExchangeError> {
        match self.get_local(cid).await {
            Ok(block) => {
                self.metrics.retrieval_local();
                return Ok(block);
            }
            Err(ExchangeError::NotFoundLocally(_)) => {}
            Err(e) => return Err(e),
        }

        let local = self.local_peer_id();
        let providers = self.supply.provider_peers_for_content(cid)?;
        debug!(cid = %cid, providers = providers.len(), "Block not held locally");

        for provider in providers.into_iter().filter(|p| *p != local) {
            match self.fetch_from(provider, cid).await {
                Ok(block) => {
                    if let Err(e) = self.store.put(block.clone()).await {
                        warn!(cid = %cid, "Failed to keep retrieved block locally: {}", e);
                    }
                    self.metrics.retrieval_remote();
                    info!(cid = %cid, provider = %provider, size = block.size(), "Retrieved block from provider");
                    return Ok(block);
                }
                Err(e) => {
                    warn!(cid = %cid, provider = %provider, "Provider could not serve block: {}", e);
                }
            }
        }

        self.metrics.retrieval_failed();
        Err(ExchangeError::NotFoundAnywhere(*cid))
    }

    async fn fetch_from(&self, provider: PeerId, cid: &Cid) -> Result<Block, SupplyError> {
        let timeout = self.supply.config().transfer_timeout;
        let voucher = Voucher::Retrieval(RetrievalRequest::new(*cid));

        // one deadline covers opening the session and receiving the bytes
        let pull = async {
            let session = self.transfer.open_pull(provider, *cid, voucher).await?;
            session.finish(timeout).await
        };
        let data = tokio::time::timeout(timeout, pull)
            .await
            .map_err(|_| SupplyError::TransferTimeout(timeout))??;

        Block::from_cid_and_data(*cid, data.to_vec()).map_err(|_| SupplyError::ContentMismatch(*cid))
    }

    /// Fetch several blocks concurrently; results are in request order
    pub async fn get_blocks(&self, cids: &[Cid]) -> Vec<Result<Block, ExchangeError>> {
        join_all(cids.iter().map(|cid| self.get_block(cid))).await
    }

    /// Store a block locally and announce it
    pub async fn has_block(&self, block: Block) -> Result<Cid, ExchangeError> {
        let cid = block.cid;
        self.store.put(block).await?;
        self.announce(&cid).await?;
        Ok(cid)
    }

    /// True while the engine runs and at least one peer is reachable
    pub fn is_online(&self) -> bool {
        !self.supply.is_closed() && !self.host.connected_peers().is_empty()
    }

    pub async fn close(&self) {
        self.supply.close().await;
    }

    pub fn supply(&self) -> &Supply {
        &self.supply
    }

    pub fn blockstore(&self) -> Arc<dyn Blockstore> {
        Arc::clone(&self.store)
    }

    pub fn keystore(&self) -> Option<Arc<dyn Keystore>> {
        self.keystore.clone()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.host.local_peer_id()
    }
}
