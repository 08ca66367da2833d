//! Key-value metadata store
//!
//! Holds small records that must survive restarts, such as the provider
//! registry. Keys are `/`-separated paths so related records can be loaded
//! with one prefix scan.

use async_trait::async_trait;
use parking_lot::RwLock;
use rocksdb::{Direction, IteratorMode, Options, DB};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum DatastoreError {
    #[error("Database error: {0}")]
    Database(#[from] rocksdb::Error),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Task error: {0}")]
    Task(String),
}

#[async_trait]
pub trait Datastore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, DatastoreError>;

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), DatastoreError>;

    /// Every record whose key starts with `prefix`, in key order
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, DatastoreError>;
}

/// Datastore kept entirely in memory
#[derive(Default)]
pub struct MemDatastore {
    records: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemDatastore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Datastore for MemDatastore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, DatastoreError> {
        Ok(self.records.read().get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), DatastoreError> {
        if key.is_empty() {
            return Err(DatastoreError::InvalidKey("empty key".to_string()));
        }
        self.records.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, DatastoreError> {
        Ok(self
            .records
            .read()
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}

/// RocksDB-backed metadata store
pub struct RocksDatastore {
    db: Arc<DB>,
}

impl RocksDatastore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DatastoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);

        let db = DB::open(&opts, path.as_ref())?;
        info!("Opened metadata store at {:?}", path.as_ref());

        Ok(Self { db: Arc::new(db) })
    }
}

fn task_error(e: tokio::task::JoinError) -> DatastoreError {
    DatastoreError::Task(e.to_string())
}

#[async_trait]
impl Datastore for RocksDatastore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, DatastoreError> {
        let db = Arc::clone(&self.db);
        let key = key.to_string();

        let value = tokio::task::spawn_blocking(move || db.get(key.as_bytes()))
            .await
            .map_err(task_error)??;
        Ok(value)
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), DatastoreError> {
        if key.is_empty() {
            return Err(DatastoreError::InvalidKey("empty key".to_string()));
        }

        let db = Arc::clone(&self.db);
        let key = key.to_string();
        let value = value.to_vec();

        tokio::task::spawn_blocking(move || db.put(key.as_bytes(), value))
            .await
            .map_err(task_error)??;
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, DatastoreError> {
        let db = Arc::clone(&self.db);
        let prefix = prefix.to_string();

        tokio::task::spawn_blocking(move || {
            let mut records = Vec::new();
            let iter = db.iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward));

            for item in iter {
                let (key, value) = item?;
                if !key.starts_with(prefix.as_bytes()) {
                    break;
                }
                if let Ok(key) = String::from_utf8(key.to_vec()) {
                    records.push((key, value.to_vec()));
                }
            }

            Ok::<_, DatastoreError>(records)
        })
        .await
        .map_err(task_error)?
    }
}
