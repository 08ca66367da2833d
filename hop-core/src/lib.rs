//! Hop Core
//!
//! Supply protocol, provider registry and retrieval fallback for the Hop
//! content exchange, plus the storage and networking adapters a node runs
//! on.

pub mod api;
pub mod authorizer;
pub mod config;
pub mod content_id;
pub mod datastore;
pub mod events;
pub mod exchange;
pub mod host;
pub mod keystore;
pub mod memnet;
pub mod messages;
pub mod metrics;
pub mod p2p;
pub mod registry;
pub mod runtime;
pub mod storage;
pub mod supply;
pub mod transfer;

pub use authorizer::{
    AcceptAll, AddRequest, AllowList, MaxSize, RateLimit, RequestKind, RequestValidator,
    RetrievalRequest, TransferAuthorizer, Validation, Voucher,
};
pub use config::{Config, ConfigError};
pub use content_id::{content_cid, content_hash, validate_cid, verify_content, CidError};
pub use datastore::{Datastore, DatastoreError, MemDatastore, RocksDatastore};
pub use events::{Event, EventBus, Subscription};
pub use exchange::{Exchange, ExchangeBuilder, ExchangeError};
pub use host::{Host, InboundSupply, PubSub, PubSubMessage, TransportError};
pub use keystore::{load_or_create_identity, FsKeystore, Keystore, KeystoreError, MemKeystore};
pub use memnet::{Fault, MockNet, MockNode};
pub use messages::{SupplyMessage, SupplyPayload};
pub use metrics::Metrics;
pub use p2p::{create_swarm, Behaviour, P2PError};
pub use registry::ProviderRegistry;
pub use runtime::{run_node, NodeError, SwarmHost};
pub use storage::{Block, BlockStoreStats, Blockstore, MemoryBlockStore, RocksBlockStore, StorageError};
pub use supply::{Supply, SupplyBuilder, SupplyConfig, SupplyError};
pub use transfer::{SessionEvent, SessionResponder, SessionState, TransferError, TransferProtocol, TransferSession};

// Re-export Cid for external use
pub use cid::Cid;
