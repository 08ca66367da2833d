//! Pull-based data transfer sessions
//!
//! A requester opens a pull against a provider under a voucher. The
//! provider side drives the session through a `SessionResponder`: first an
//! accept or a reject, then the block bytes or a failure. Dropping the
//! `TransferSession` cancels it and the responder observes that.

use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use libp2p::PeerId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use crate::authorizer::{TransferAuthorizer, Voucher};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Accepted,
    Completed(Bytes),
    Rejected(String),
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Requested,
    Accepted,
    Completed,
    Rejected,
    Failed,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransferError {
    #[error("Transfer rejected by provider: {0}")]
    Rejected(String),

    #[error("Transfer timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transfer failed: {0}")]
    Failed(String),
}

/// Requester side of a pull
#[derive(Debug)]
pub struct TransferSession {
    requester: PeerId,
    provider: PeerId,
    payload_cid: Cid,
    state: SessionState,
    events: mpsc::Receiver<SessionEvent>,
    _cancel: oneshot::Sender<()>,
}

/// Provider side of a pull
#[derive(Debug)]
pub struct SessionResponder {
    events: mpsc::Sender<SessionEvent>,
    cancel: oneshot::Receiver<()>,
}

impl TransferSession {
    pub fn new(requester: PeerId, provider: PeerId, payload_cid: Cid) -> (Self, SessionResponder) {
        let (event_tx, event_rx) = mpsc::channel(4);
        let (cancel_tx, cancel_rx) = oneshot::channel();

        let session = Self {
            requester,
            provider,
            payload_cid,
            state: SessionState::Requested,
            events: event_rx,
            _cancel: cancel_tx,
        };
        let responder = SessionResponder {
            events: event_tx,
            cancel: cancel_rx,
        };

        (session, responder)
    }

    pub fn requester(&self) -> PeerId {
        self.requester
    }

    pub fn provider(&self) -> PeerId {
        self.provider
    }

    pub fn payload_cid(&self) -> Cid {
        self.payload_cid
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Wait for the block bytes. The whole session, accept included, must
    /// finish within `timeout`.
    pub async fn finish(mut self, timeout: Duration) -> Result<Bytes, TransferError> {
        match tokio::time::timeout(timeout, self.drive()).await {
            Ok(result) => result,
            Err(_) => {
                self.state = SessionState::Failed;
                Err(TransferError::Timeout(timeout))
            }
        }
    }

    async fn drive(&mut self) -> Result<Bytes, TransferError> {
        loop {
            let event = self.events.recv().await.ok_or_else(|| {
                TransferError::Failed("provider closed the session".to_string())
            })?;

            trace!(cid = %self.payload_cid, provider = %self.provider, ?event, "Session event");

            match event {
                SessionEvent::Accepted => self.state = SessionState::Accepted,
                SessionEvent::Completed(data) => {
                    self.state = SessionState::Completed;
                    return Ok(data);
                }
                SessionEvent::Rejected(reason) => {
                    self.state = SessionState::Rejected;
                    return Err(TransferError::Rejected(reason));
                }
                SessionEvent::Failed(reason) => {
                    self.state = SessionState::Failed;
                    return Err(TransferError::Failed(reason));
                }
            }
        }
    }
}

impl SessionResponder {
    pub async fn accepted(&self) -> bool {
        self.events.send(SessionEvent::Accepted).await.is_ok()
    }

    pub async fn completed(self, data: Bytes) -> bool {
        self.events.send(SessionEvent::Completed(data)).await.is_ok()
    }

    pub async fn rejected(self, reason: impl Into<String>) -> bool {
        self.events
            .send(SessionEvent::Rejected(reason.into()))
            .await
            .is_ok()
    }

    pub async fn failed(self, reason: impl Into<String>) -> bool {
        self.events.send(SessionEvent::Failed(reason.into())).await.is_ok()
    }

    /// Resolves once the requester drops its session
    pub async fn cancelled(&mut self) {
        let _ = (&mut self.cancel).await;
    }
}

/// Opens pulls against remote providers and serves pulls for local blocks
#[async_trait]
pub trait TransferProtocol: Send + Sync {
    /// Authorizer consulted for every pull this node is asked to serve
    fn install_authorizer(&self, authorizer: Arc<TransferAuthorizer>);

    async fn open_pull(
        &self,
        provider: PeerId,
        payload_cid: Cid,
        voucher: Voucher,
    ) -> Result<TransferSession, TransferError>;
}
