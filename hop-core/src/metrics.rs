//! Prometheus metrics for the supply engine and exchange
//!
//! Thread-safe metrics collection using atomic types

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Metrics collector shared by every component of a node
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    // Peer connection metrics
    peer_connections: AtomicUsize,
    total_peers_seen: AtomicU64,

    // Supply: announcer side
    announcements: AtomicU64,
    add_requests_sent: AtomicU64,
    add_request_send_failures: AtomicU64,
    providers_registered: AtomicU64,
    events_published: AtomicU64,

    // Supply: replicating side
    add_requests_received: AtomicU64,
    add_requests_accepted: AtomicU64,
    add_requests_rejected: AtomicU64,
    pulls_succeeded: AtomicU64,
    pulls_failed: AtomicU64,
    bytes_pulled: AtomicU64,

    // Retrieval
    retrievals_local: AtomicU64,
    retrievals_remote: AtomicU64,
    retrievals_failed: AtomicU64,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                peer_connections: AtomicUsize::new(0),
                total_peers_seen: AtomicU64::new(0),
                announcements: AtomicU64::new(0),
                add_requests_sent: AtomicU64::new(0),
                add_request_send_failures: AtomicU64::new(0),
                providers_registered: AtomicU64::new(0),
                events_published: AtomicU64::new(0),
                add_requests_received: AtomicU64::new(0),
                add_requests_accepted: AtomicU64::new(0),
                add_requests_rejected: AtomicU64::new(0),
                pulls_succeeded: AtomicU64::new(0),
                pulls_failed: AtomicU64::new(0),
                bytes_pulled: AtomicU64::new(0),
                retrievals_local: AtomicU64::new(0),
                retrievals_remote: AtomicU64::new(0),
                retrievals_failed: AtomicU64::new(0),
                start_time: Instant::now(),
            }),
        }
    }

    fn load(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    // Peer connection metrics

    pub fn peer_connected(&self) {
        self.inner.peer_connections.fetch_add(1, Ordering::Relaxed);
        self.inner.total_peers_seen.fetch_add(1, Ordering::Relaxed);
    }

    pub fn peer_disconnected(&self) {
        let _ = self.inner.peer_connections.fetch_update(
            Ordering::Relaxed,
            Ordering::Relaxed,
            |n| n.checked_sub(1),
        );
    }

    pub fn peer_connections(&self) -> usize {
        self.inner.peer_connections.load(Ordering::Relaxed)
    }

    pub fn total_peers_seen(&self) -> u64 {
        Self::load(&self.inner.total_peers_seen)
    }

    // Announcer side

    pub fn announcement(&self) {
        self.inner.announcements.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_request_sent(&self) {
        self.inner.add_requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_request_send_failed(&self) {
        self.inner
            .add_request_send_failures
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn provider_registered(&self) {
        self.inner.providers_registered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_published(&self) {
        self.inner.events_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn announcements(&self) -> u64 {
        Self::load(&self.inner.announcements)
    }

    pub fn add_requests_sent(&self) -> u64 {
        Self::load(&self.inner.add_requests_sent)
    }

    pub fn add_request_send_failures(&self) -> u64 {
        Self::load(&self.inner.add_request_send_failures)
    }

    pub fn providers_registered(&self) -> u64 {
        Self::load(&self.inner.providers_registered)
    }

    pub fn events_published(&self) -> u64 {
        Self::load(&self.inner.events_published)
    }

    // Replicating side

    pub fn add_request_received(&self) {
        self.inner.add_requests_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_request_accepted(&self) {
        self.inner.add_requests_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_request_rejected(&self) {
        self.inner.add_requests_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pull_succeeded(&self, size: usize) {
        self.inner.pulls_succeeded.fetch_add(1, Ordering::Relaxed);
        self.inner
            .bytes_pulled
            .fetch_add(size as u64, Ordering::Relaxed);
    }

    pub fn pull_failed(&self) {
        self.inner.pulls_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_requests_received(&self) -> u64 {
        Self::load(&self.inner.add_requests_received)
    }

    pub fn add_requests_accepted(&self) -> u64 {
        Self::load(&self.inner.add_requests_accepted)
    }

    pub fn add_requests_rejected(&self) -> u64 {
        Self::load(&self.inner.add_requests_rejected)
    }

    pub fn pulls_succeeded(&self) -> u64 {
        Self::load(&self.inner.pulls_succeeded)
    }

    pub fn pulls_failed(&self) -> u64 {
        Self::load(&self.inner.pulls_failed)
    }

    pub fn bytes_pulled(&self) -> u64 {
        Self::load(&self.inner.bytes_pulled)
    }

    // Retrieval

    pub fn retrieval_local(&self) {
        self.inner.retrievals_local.fetch_add(1, Ordering::Relaxed);
    }

    pub fn retrieval_remote(&self) {
        self.inner.retrievals_remote.fetch_add(1, Ordering::Relaxed);
    }

    pub fn retrieval_failed(&self) {
        self.inner.retrievals_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn retrievals_local(&self) -> u64 {
        Self::load(&self.inner.retrievals_local)
    }

    pub fn retrievals_remote(&self) -> u64 {
        Self::load(&self.inner.retrievals_remote)
    }

    pub fn retrievals_failed(&self) -> u64 {
        Self::load(&self.inner.retrievals_failed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.inner.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-formatted metrics text
    pub fn to_prometheus(&self, block_count: usize, total_bytes: usize, provider_entries: usize) -> String {
        let gauges = [
            ("hop_block_count", "Total number of blocks stored", block_count as u64),
            ("hop_block_bytes", "Total bytes of block data stored", total_bytes as u64),
            ("hop_provider_entries", "Known (content, provider) pairs", provider_entries as u64),
            ("hop_peer_connections", "Current number of active peer connections", self.peer_connections() as u64),
        ];
        let counters = [
            ("hop_uptime_seconds", "Time since node started in seconds", self.uptime_seconds()),
            ("hop_total_peers_seen", "Total number of peer connections since start", self.total_peers_seen()),
            ("hop_announcements_total", "Content announcements made by this node", self.announcements()),
            ("hop_add_requests_sent_total", "Add requests delivered to peers", self.add_requests_sent()),
            ("hop_add_request_send_failures_total", "Add requests that could not be delivered after retries", self.add_request_send_failures()),
            ("hop_providers_registered_total", "Peers registered as providers of announced content", self.providers_registered()),
            ("hop_events_published_total", "Replication events published to subscribers", self.events_published()),
            ("hop_add_requests_received_total", "Add requests received from peers", self.add_requests_received()),
            ("hop_add_requests_accepted_total", "Add requests accepted by the authorizer", self.add_requests_accepted()),
            ("hop_add_requests_rejected_total", "Add requests rejected by the authorizer", self.add_requests_rejected()),
            ("hop_pulls_succeeded_total", "Pull transfers that completed and verified", self.pulls_succeeded()),
            ("hop_pulls_failed_total", "Pull transfers that failed, timed out or mismatched", self.pulls_failed()),
            ("hop_bytes_pulled_total", "Bytes received through pull transfers", self.bytes_pulled()),
            ("hop_retrievals_local_total", "Blocks served from the local store", self.retrievals_local()),
            ("hop_retrievals_remote_total", "Blocks fetched from a provider", self.retrievals_remote()),
            ("hop_retrievals_failed_total", "Blocks not found anywhere", self.retrievals_failed()),
        ];

        let mut out = String::new();
        for (name, help, value) in gauges {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} gauge\n{name} {value}\n\n"
            ));
        }
        for (name, help, value) in counters {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n\n"
            ));
        }
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
