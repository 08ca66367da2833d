//! P2P networking layer using rust-libp2p
//!
//! TCP transport, Noise encryption and Yamux multiplexing, with Ping,
//! Identify and the Hop request-response protocol on top. The Hop protocol
//! carries both supply messages and block pulls in a CBOR envelope.

use cid::Cid;
use libp2p::identity::Keypair;
use libp2p::request_response::{self, ProtocolSupport};
use libp2p::{identify, noise, ping, tcp, yamux, StreamProtocol, Swarm, SwarmBuilder};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::authorizer::{AddRequest, RetrievalRequest, Voucher};

/// Request-response protocol spoken between Hop nodes
pub const HOP_PROTOCOL: &str = "/hop/supply/1.0.0";

/// Identify protocol version advertised to peers
pub const IDENTIFY_PROTOCOL: &str = "/hop/1.0.0";

#[derive(Error, Debug)]
pub enum P2PError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Swarm error: {0}")]
    Swarm(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Voucher as it travels with a pull; the content id travels beside it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireVoucher {
    Add { size: u64 },
    Retrieval,
}

impl WireVoucher {
    pub fn into_voucher(self, payload_cid: Cid) -> Voucher {
        match self {
            WireVoucher::Add { size } => Voucher::Add(AddRequest::new(payload_cid, size)),
            WireVoucher::Retrieval => Voucher::Retrieval(RetrievalRequest::new(payload_cid)),
        }
    }
}

impl From<&Voucher> for WireVoucher {
    fn from(voucher: &Voucher) -> Self {
        match voucher {
            Voucher::Add(req) => WireVoucher::Add { size: req.size() },
            Voucher::Retrieval(_) => WireVoucher::Retrieval,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HopRequest {
    /// Protobuf-encoded `SupplyMessage`
    Supply(Vec<u8>),
    Pull { cid: Vec<u8>, voucher: WireVoucher },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HopResponse {
    Ack,
    Block(Vec<u8>),
    Rejected(String),
    NotFound,
    Error(String),
}

/// Network behavior with Ping, Identify and the Hop protocol
#[derive(libp2p::swarm::NetworkBehaviour)]
pub struct Behaviour {
    pub ping: ping::Behaviour,
    pub identify: identify::Behaviour,
    pub hop: request_response::cbor::Behaviour<HopRequest, HopResponse>,
}

/// Create a swarm for `keypair`. `request_timeout` bounds every Hop
/// request, pulls included.
pub fn create_swarm(keypair: Keypair, request_timeout: Duration) -> Result<Swarm<Behaviour>, P2PError> {
    let peer_id = keypair.public().to_peer_id();
    tracing::info!("Local peer ID: {}", peer_id);

    let swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            tcp::Config::default().nodelay(true),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(|e| P2PError::Transport(e.to_string()))?
        .with_behaviour(|key| Behaviour {
            ping: ping::Behaviour::new(ping::Config::new()),
            identify: identify::Behaviour::new(identify::Config::new(
                IDENTIFY_PROTOCOL.to_string(),
                key.public(),
            )),
            hop: request_response::cbor::Behaviour::new(
                [(StreamProtocol::new(HOP_PROTOCOL), ProtocolSupport::Full)],
                request_response::Config::default().with_request_timeout(request_timeout),
            ),
        })
        .map_err(|e| P2PError::Swarm(e.to_string()))?
        .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(60)))
        .build();

    Ok(swarm)
}
