//! Block storage
//!
//! The exchange only needs get/put/has from its block store, so storage is
//! a trait with two backends: a RocksDB store for running nodes and an
//! in-memory store for tests and ephemeral nodes. Both verify a block
//! against its CID on `put`.

use async_trait::async_trait;
use cid::Cid;
use parking_lot::RwLock;
use rocksdb::{Options, WriteBatch, DB};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::content_id::{content_cid, verify_content, CidError};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Block not found: {0}")]
    BlockNotFound(String),

    #[error("CID verification failed: {0}")]
    VerificationFailed(#[from] CidError),

    #[error("Database error: {0}")]
    DatabaseError(#[from] rocksdb::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A block with its CID and data
#[derive(Clone, Debug, PartialEq)]
pub struct Block {
    pub cid: Cid,
    pub data: Vec<u8>,
}

impl Block {
    /// Create a new block from data, computing its CID
    pub fn new(data: Vec<u8>) -> Result<Self, CidError> {
        let cid = content_cid(&data)?;
        Ok(Self { cid, data })
    }

    /// Create a block from data and verify it matches the expected CID
    pub fn from_cid_and_data(cid: Cid, data: Vec<u8>) -> Result<Self, CidError> {
        verify_content(&data, &cid)?;
        Ok(Self { cid, data })
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Statistics about a block store
#[derive(Debug, Clone, Default)]
pub struct BlockStoreStats {
    pub block_count: usize,
    pub total_size: usize,
}

/// Content-addressed block storage consumed by the exchange
#[async_trait]
pub trait Blockstore: Send + Sync {
    /// Fetch a block; `StorageError::BlockNotFound` when absent
    async fn get(&self, cid: &Cid) -> Result<Block, StorageError>;

    /// Store a block after verifying it against its CID. Idempotent.
    async fn put(&self, block: Block) -> Result<(), StorageError>;

    async fn has(&self, cid: &Cid) -> bool;

    async fn delete(&self, cid: &Cid) -> Result<(), StorageError>;

    async fn list_cids(&self) -> Vec<Cid>;

    async fn stats(&self) -> BlockStoreStats;

    /// Drop every block
    async fn clear(&self);
}

/// Volatile block store backed by a hash map
#[derive(Default)]
pub struct MemoryBlockStore {
    blocks: RwLock<HashMap<Cid, Vec<u8>>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Blockstore for MemoryBlockStore {
    async fn get(&self, cid: &Cid) -> Result<Block, StorageError> {
        self.blocks
            .read()
            .get(cid)
            .map(|data| Block {
                cid: *cid,
                data: data.clone(),
            })
            .ok_or_else(|| StorageError::BlockNotFound(cid.to_string()))
    }

    async fn put(&self, block: Block) -> Result<(), StorageError> {
        verify_content(&block.data, &block.cid)?;
        let size = block.data.len();
        let cid = block.cid;

        if self.blocks.write().insert(block.cid, block.data).is_none() {
            debug!(cid = %cid, size, "Stored block in memory");
        }
        Ok(())
    }

    async fn has(&self, cid: &Cid) -> bool {
        self.blocks.read().contains_key(cid)
    }

    async fn delete(&self, cid: &Cid) -> Result<(), StorageError> {
        self.blocks
            .write()
            .remove(cid)
            .map(|_| ())
            .ok_or_else(|| StorageError::BlockNotFound(cid.to_string()))
    }

    async fn list_cids(&self) -> Vec<Cid> {
        self.blocks.read().keys().copied().collect()
    }

    async fn stats(&self) -> BlockStoreStats {
        let blocks = self.blocks.read();
        BlockStoreStats {
            block_count: blocks.len(),
            total_size: blocks.values().map(Vec::len).sum(),
        }
    }

    async fn clear(&self) {
        self.blocks.write().clear();
    }
}

/// RocksDB-backed persistent block storage with CID-based indexing
pub struct RocksBlockStore {
    db: Arc<DB>,
}

impl RocksBlockStore {
    /// Open (or create) a block store at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);

        // Point lookups dominate: CID -> block
        opts.optimize_for_point_lookup(256);
        opts.set_enable_pipelined_write(true);

        // Blocks are opaque and usually already compressed
        opts.set_compression_type(rocksdb::DBCompressionType::None);

        opts.increase_parallelism(num_cpus::get() as i32);
        opts.set_max_background_jobs(4);
        opts.set_write_buffer_size(64 * 1024 * 1024);
        opts.set_target_file_size_base(128 * 1024 * 1024);

        let db = DB::open(&opts, path.as_ref())?;

        info!("Opened RocksDB block store at {:?}", path.as_ref());
        Ok(Self { db: Arc::new(db) })
    }
}

fn join_error(e: tokio::task::JoinError) -> StorageError {
    StorageError::IoError(std::io::Error::other(e.to_string()))
}

#[async_trait]
impl Blockstore for RocksBlockStore {
    async fn get(&self, cid: &Cid) -> Result<Block, StorageError> {
        let cid_str = cid.to_string();
        let db = Arc::clone(&self.db);
        let key = cid_str.clone();

        let data = tokio::task::spawn_blocking(move || db.get(&key))
            .await
            .map_err(join_error)??
            .ok_or(StorageError::BlockNotFound(cid_str))?;

        Ok(Block { cid: *cid, data })
    }

    async fn put(&self, block: Block) -> Result<(), StorageError> {
        verify_content(&block.data, &block.cid)?;

        let db = Arc::clone(&self.db);
        let cid = block.cid;
        let key = cid.to_string();
        let size = block.data.len();

        let stored = tokio::task::spawn_blocking(move || {
            if db.get(&key)?.is_some() {
                return Ok::<bool, StorageError>(false);
            }
            db.put(&key, &block.data)?;
            Ok(true)
        })
        .await
        .map_err(join_error)??;

        if stored {
            debug!(cid = %cid, size, "Stored block");
        }
        Ok(())
    }

    async fn has(&self, cid: &Cid) -> bool {
        let key = cid.to_string();
        let db = Arc::clone(&self.db);

        tokio::task::spawn_blocking(move || db.get(&key).map(|opt| opt.is_some()).unwrap_or(false))
            .await
            .unwrap_or(false)
    }

    async fn delete(&self, cid: &Cid) -> Result<(), StorageError> {
        let key = cid.to_string();
        let db = Arc::clone(&self.db);

        tokio::task::spawn_blocking(move || {
            if db.get(&key)?.is_none() {
                return Err(StorageError::BlockNotFound(key));
            }
            db.delete(&key)?;
            Ok(())
        })
        .await
        .map_err(join_error)??;

        debug!(cid = %cid, "Deleted block");
        Ok(())
    }

    async fn list_cids(&self) -> Vec<Cid> {
        let db = Arc::clone(&self.db);

        tokio::task::spawn_blocking(move || {
            db.iterator(rocksdb::IteratorMode::Start)
                .flatten()
                .filter_map(|(key, _)| String::from_utf8(key.to_vec()).ok())
                .filter_map(|key| key.parse::<Cid>().ok())
                .collect()
        })
        .await
        .unwrap_or_default()
    }

    async fn stats(&self) -> BlockStoreStats {
        let db = Arc::clone(&self.db);

        tokio::task::spawn_blocking(move || {
            let mut stats = BlockStoreStats::default();
            for (_, value) in db.iterator(rocksdb::IteratorMode::Start).flatten() {
                stats.block_count += 1;
                stats.total_size += value.len();
            }
            stats
        })
        .await
        .unwrap_or_default()
    }

    async fn clear(&self) {
        let db = Arc::clone(&self.db);

        let result = tokio::task::spawn_blocking(move || {
            let mut batch = WriteBatch::default();
            for (key, _) in db.iterator(rocksdb::IteratorMode::Start).flatten() {
                batch.delete(&key);
            }
            db.write(batch)
        })
        .await;

        match result {
            Ok(Ok(())) => info!("Cleared all blocks from store"),
            Ok(Err(e)) => warn!("Failed to clear block store: {}", e),
            Err(e) => warn!("Block store clear task failed: {}", e),
        }
    }
}
