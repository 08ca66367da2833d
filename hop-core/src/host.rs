//! Network seams used by the supply engine
//!
//! `Host` delivers supply messages between peers and reports which peers
//! are reachable. `PubSub` is the optional broadcast channel for add
//! requests. Both are implemented over libp2p in `runtime` and in memory
//! in `memnet`.

use async_trait::async_trait;
use libp2p::PeerId;
use tokio::sync::mpsc;

use crate::messages::SupplyMessage;

/// A supply message received from a remote peer
#[derive(Debug, Clone)]
pub struct InboundSupply {
    pub from: PeerId,
    pub message: SupplyMessage,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Peer {0} is not connected")]
    NotConnected(PeerId),

    #[error("Peer {0} does not speak the supply protocol")]
    ProtocolNotSupported(PeerId),

    #[error("Host is shutting down")]
    Closed,

    #[error("Transport failure: {0}")]
    Failed(String),
}

#[async_trait]
pub trait Host: Send + Sync {
    fn local_peer_id(&self) -> PeerId;

    /// Peers with a live connection right now
    fn connected_peers(&self) -> Vec<PeerId>;

    async fn send_supply_message(
        &self,
        peer: PeerId,
        message: SupplyMessage,
    ) -> Result<(), TransportError>;

    /// Route every inbound supply message to `inbox`. A later call replaces
    /// the earlier registration.
    fn register_supply_inbox(&self, inbox: mpsc::UnboundedSender<InboundSupply>);
}

/// A message received on a pubsub topic
#[derive(Debug, Clone)]
pub struct PubSubMessage {
    pub from: PeerId,
    pub data: Vec<u8>,
}

#[async_trait]
pub trait PubSub: Send + Sync {
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), TransportError>;

    fn subscribe(&self, topic: &str) -> Result<mpsc::UnboundedReceiver<PubSubMessage>, TransportError>;
}
