//! Supply protocol messages
//!
//! Protobuf messages exchanged between supply engines, defined with prost
//! derive macros. A `SupplyMessage` carries exactly one of an add request
//! or a transfer-completed notice.

use cid::Cid;
use prost::Message as ProstMessage;

use crate::authorizer::AddRequest;
use crate::content_id::{parse_cid, CidError};

#[derive(Clone, PartialEq, prost::Message)]
pub struct SupplyMessage {
    #[prost(message, optional, tag = "1")]
    pub add_request: Option<AddRequestMessage>,

    #[prost(message, optional, tag = "2")]
    pub completed: Option<TransferCompletedMessage>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AddRequestMessage {
    #[prost(bytes = "vec", tag = "1")]
    pub payload_cid: Vec<u8>,

    #[prost(uint64, tag = "2")]
    pub size: u64,
}

/// Sent by a replicating peer once it holds a verified copy
#[derive(Clone, PartialEq, prost::Message)]
pub struct TransferCompletedMessage {
    #[prost(bytes = "vec", tag = "1")]
    pub payload_cid: Vec<u8>,
}

/// Decoded, validated form of a `SupplyMessage`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupplyPayload {
    Add(AddRequest),
    Completed(Cid),
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("Decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Encode error: {0}")]
    Encode(#[from] prost::EncodeError),

    #[error("Invalid CID in message: {0}")]
    InvalidCid(#[from] CidError),

    #[error("Message carries no payload")]
    Empty,

    #[error("Message carries more than one payload")]
    Ambiguous,
}

impl SupplyMessage {
    pub fn add_request(request: &AddRequest) -> Self {
        Self {
            add_request: Some(AddRequestMessage {
                payload_cid: request.payload_cid().to_bytes(),
                size: request.size(),
            }),
            completed: None,
        }
    }

    pub fn completed(cid: &Cid) -> Self {
        Self {
            add_request: None,
            completed: Some(TransferCompletedMessage {
                payload_cid: cid.to_bytes(),
            }),
        }
    }

    /// Validate and convert into the typed payload
    pub fn payload(&self) -> Result<SupplyPayload, MessageError> {
        match (&self.add_request, &self.completed) {
            (Some(add), None) => {
                let cid = parse_cid(&add.payload_cid)?;
                Ok(SupplyPayload::Add(AddRequest::new(cid, add.size)))
            }
            (None, Some(done)) => Ok(SupplyPayload::Completed(parse_cid(&done.payload_cid)?)),
            (None, None) => Err(MessageError::Empty),
            (Some(_), Some(_)) => Err(MessageError::Ambiguous),
        }
    }
}

pub fn encode_message(msg: &SupplyMessage) -> Result<Vec<u8>, MessageError> {
    let mut buf = Vec::with_capacity(msg.encoded_len());
    msg.encode(&mut buf)?;
    Ok(buf)
}

pub fn decode_message(bytes: &[u8]) -> Result<SupplyMessage, MessageError> {
    Ok(SupplyMessage::decode(bytes)?)
}
