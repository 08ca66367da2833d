//! Provider registry
//!
//! Records which peers hold a verified full copy of a piece of content.
//! Entries are only ever added. The map is split into shards so concurrent
//! inserts for different content rarely contend.

use cid::Cid;
use libp2p::PeerId;
use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};

const SHARD_COUNT: usize = 16;

type Shard = RwLock<HashMap<Cid, HashSet<PeerId>>>;

pub struct ProviderRegistry {
    shards: Vec<Shard>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, cid: &Cid) -> &Shard {
        let mut hasher = DefaultHasher::new();
        Hash::hash(cid, &mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    /// Record `peer` as a provider of `cid`. Returns true when the pair was
    /// not already present.
    pub fn add(&self, cid: Cid, peer: PeerId) -> bool {
        self.shard(&cid).write().entry(cid).or_default().insert(peer)
    }

    /// Bulk insert, used when reloading persisted entries
    pub fn load(&self, entries: impl IntoIterator<Item = (Cid, PeerId)>) -> usize {
        entries
            .into_iter()
            .filter(|(cid, peer)| self.add(*cid, *peer))
            .count()
    }

    /// Snapshot of the providers of `cid`. The caller owns the returned list.
    pub fn get(&self, cid: &Cid) -> Vec<PeerId> {
        self.shard(cid)
            .read()
            .get(cid)
            .map(|peers| peers.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Every content id with at least one provider
    pub fn contents(&self) -> Vec<Cid> {
        self.shards
            .iter()
            .flat_map(|shard| shard.read().keys().copied().collect::<Vec<_>>())
            .collect()
    }

    /// Total number of (content, provider) pairs
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.read().values().map(HashSet::len).sum::<usize>())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}
