//! Transfer authorization
//!
//! Every pull is opened with a voucher describing why the bytes are being
//! moved. The authorizer maps each request kind to a validator, fixed at
//! construction, and turns a voucher plus the requesting peer into an
//! accept/reject outcome. Rejection is a value, never an error.

use cid::Cid;
use libp2p::PeerId;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Offer to replicate a piece of content. Immutable once created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddRequest {
    payload_cid: Cid,
    size: u64,
}

impl AddRequest {
    pub fn new(payload_cid: Cid, size: u64) -> Self {
        Self { payload_cid, size }
    }

    pub fn payload_cid(&self) -> Cid {
        self.payload_cid
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

/// Request to read a block the provider already holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RetrievalRequest {
    payload_cid: Cid,
}

impl RetrievalRequest {
    pub fn new(payload_cid: Cid) -> Self {
        Self { payload_cid }
    }

    pub fn payload_cid(&self) -> Cid {
        self.payload_cid
    }
}

/// The closed set of request kinds a transfer can be opened under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Add,
    Retrieval,
}

/// Authorization token presented when opening a pull
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Voucher {
    Add(AddRequest),
    Retrieval(RetrievalRequest),
}

impl Voucher {
    pub fn kind(&self) -> RequestKind {
        match self {
            Voucher::Add(_) => RequestKind::Add,
            Voucher::Retrieval(_) => RequestKind::Retrieval,
        }
    }

    pub fn payload_cid(&self) -> Cid {
        match self {
            Voucher::Add(req) => req.payload_cid(),
            Voucher::Retrieval(req) => req.payload_cid(),
        }
    }
}

/// Outcome of validating a voucher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Accept,
    Reject(String),
}

impl Validation {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Validation::Accept)
    }
}

/// Policy deciding whether a proposed pull may go ahead
pub trait RequestValidator: Send + Sync {
    fn validate(&self, peer: &PeerId, voucher: &Voucher) -> Validation;
}

/// Accepts everything
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl RequestValidator for AcceptAll {
    fn validate(&self, _peer: &PeerId, _voucher: &Voucher) -> Validation {
        Validation::Accept
    }
}

/// Accepts only peers on a fixed list
#[derive(Debug, Clone)]
pub struct AllowList {
    peers: HashSet<PeerId>,
}

impl AllowList {
    pub fn new(peers: impl IntoIterator<Item = PeerId>) -> Self {
        Self {
            peers: peers.into_iter().collect(),
        }
    }
}

impl RequestValidator for AllowList {
    fn validate(&self, peer: &PeerId, _voucher: &Voucher) -> Validation {
        if self.peers.contains(peer) {
            Validation::Accept
        } else {
            Validation::Reject(format!("peer {} is not on the allow list", peer))
        }
    }
}

/// Rejects add requests larger than a byte budget. Retrievals pass.
#[derive(Debug, Clone, Copy)]
pub struct MaxSize {
    max_bytes: u64,
}

impl MaxSize {
    pub fn new(max_bytes: u64) -> Self {
        Self { max_bytes }
    }
}

impl RequestValidator for MaxSize {
    fn validate(&self, _peer: &PeerId, voucher: &Voucher) -> Validation {
        match voucher {
            Voucher::Add(req) if req.size() > self.max_bytes => Validation::Reject(format!(
                "content size {} exceeds limit {}",
                req.size(),
                self.max_bytes
            )),
            _ => Validation::Accept,
        }
    }
}

/// Fixed-window rate limit per requesting peer
pub struct RateLimit {
    max_requests: u32,
    window: Duration,
    windows: Mutex<HashMap<PeerId, (Instant, u32)>>,
}

impl RateLimit {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }
}

impl RequestValidator for RateLimit {
    fn validate(&self, peer: &PeerId, _voucher: &Voucher) -> Validation {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let entry = windows.entry(*peer).or_insert((now, 0));

        if now.duration_since(entry.0) >= self.window {
            *entry = (now, 0);
        }

        if entry.1 >= self.max_requests {
            return Validation::Reject(format!(
                "peer {} exceeded {} requests per {:?}",
                peer, self.max_requests, self.window
            ));
        }

        entry.1 += 1;
        Validation::Accept
    }
}

/// Validator table consulted for every inbound add request and every
/// pull this node is asked to serve
pub struct TransferAuthorizer {
    validators: HashMap<RequestKind, Arc<dyn RequestValidator>>,
}

impl TransferAuthorizer {
    pub fn builder() -> AuthorizerBuilder {
        AuthorizerBuilder {
            validators: HashMap::new(),
        }
    }

    /// Accept every kind of request
    pub fn accept_all() -> Self {
        Self::builder()
            .register(RequestKind::Add, AcceptAll)
            .register(RequestKind::Retrieval, AcceptAll)
            .build()
    }

    pub fn authorize(&self, peer: &PeerId, voucher: &Voucher) -> Validation {
        let kind = voucher.kind();
        let outcome = match self.validators.get(&kind) {
            Some(validator) => validator.validate(peer, voucher),
            None => Validation::Reject(format!("no validator registered for {:?}", kind)),
        };

        if let Validation::Reject(reason) = &outcome {
            debug!(
                peer = %peer,
                cid = %voucher.payload_cid(),
                kind = ?kind,
                "Rejected transfer request: {}",
                reason
            );
        }

        outcome
    }
}

impl Default for TransferAuthorizer {
    fn default() -> Self {
        Self::accept_all()
    }
}

pub struct AuthorizerBuilder {
    validators: HashMap<RequestKind, Arc<dyn RequestValidator>>,
}

impl AuthorizerBuilder {
    /// Register the validator for `kind`, replacing any earlier one
    pub fn register<V>(mut self, kind: RequestKind, validator: V) -> Self
    where
        V: RequestValidator + 'static,
    {
        self.validators.insert(kind, Arc::new(validator));
        self
    }

    pub fn register_shared(mut self, kind: RequestKind, validator: Arc<dyn RequestValidator>) -> Self {
        self.validators.insert(kind, validator);
        self
    }

    pub fn build(self) -> TransferAuthorizer {
        TransferAuthorizer {
            validators: self.validators,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_id::content_cid;

    fn add_voucher(size: u64) -> Voucher {
        Voucher::Add(AddRequest::new(content_cid(b"payload").unwrap(), size))
    }

    fn retrieval_voucher() -> Voucher {
        Voucher::Retrieval(RetrievalRequest::new(content_cid(b"payload").unwrap()))
    }

    #[test]
    fn test_voucher_kind() {
        assert_eq!(add_voucher(1).kind(), RequestKind::Add);
        assert_eq!(retrieval_voucher().kind(), RequestKind::Retrieval);
        assert_eq!(
            add_voucher(1).payload_cid(),
            content_cid(b"payload").unwrap()
        );
    }

    #[test]
    fn test_accept_all_authorizer() {
        let auth = TransferAuthorizer::accept_all();
        let peer = PeerId::random();

        assert!(auth.authorize(&peer, &add_voucher(10)).is_accepted());
        assert!(auth.authorize(&peer, &retrieval_voucher()).is_accepted());
    }

    #[test]
    fn test_unregistered_kind_is_rejected() {
        let auth = TransferAuthorizer::builder()
            .register(RequestKind::Retrieval, AcceptAll)
            .build();
        let peer = PeerId::random();

        assert!(matches!(
            auth.authorize(&peer, &add_voucher(10)),
            Validation::Reject(_)
        ));
        assert!(auth.authorize(&peer, &retrieval_voucher()).is_accepted());
    }

    #[test]
    fn test_allow_list() {
        let trusted = PeerId::random();
        let stranger = PeerId::random();
        let auth = TransferAuthorizer::builder()
            .register(RequestKind::Add, AllowList::new([trusted]))
            .build();

        assert!(auth.authorize(&trusted, &add_voucher(1)).is_accepted());
        assert!(!auth.authorize(&stranger, &add_voucher(1)).is_accepted());
    }

    #[test]
    fn test_max_size() {
        let policy = MaxSize::new(1024);
        let peer = PeerId::random();

        assert!(policy.validate(&peer, &add_voucher(1024)).is_accepted());
        assert!(!policy.validate(&peer, &add_voucher(1025)).is_accepted());
        assert!(policy.validate(&peer, &retrieval_voucher()).is_accepted());
    }

    #[test]
    fn test_rate_limit_per_peer() {
        let policy = RateLimit::new(2, Duration::from_secs(60));
        let a = PeerId::random();
        let b = PeerId::random();

        assert!(policy.validate(&a, &add_voucher(1)).is_accepted());
        assert!(policy.validate(&a, &add_voucher(1)).is_accepted());
        assert!(!policy.validate(&a, &add_voucher(1)).is_accepted());

        // other peers have their own window
        assert!(policy.validate(&b, &add_voucher(1)).is_accepted());
    }

    #[test]
    fn test_rate_limit_window_resets() {
        let policy = RateLimit::new(1, Duration::from_millis(20));
        let peer = PeerId::random();

        assert!(policy.validate(&peer, &add_voucher(1)).is_accepted());
        assert!(!policy.validate(&peer, &add_voucher(1)).is_accepted());

        std::thread::sleep(Duration::from_millis(30));
        assert!(policy.validate(&peer, &add_voucher(1)).is_accepted());
    }
}
