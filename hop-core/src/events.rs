//! Replication event bus
//!
//! Fans out "peer X now provides content Y" events to subscribers. Each
//! subscriber owns a bounded queue drained by its own task, so a slow
//! callback only delays itself. Publishing never blocks: when a queue is
//! full the event is handed to a detached send.

use cid::Cid;
use libp2p::PeerId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// A peer finished replicating content and is now a provider of it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Event {
    pub payload_cid: Cid,
    pub provider: PeerId,
}

pub const DEFAULT_QUEUE_DEPTH: usize = 64;

/// Detached sends allowed per subscriber once its queue is full
pub const DEFAULT_OVERFLOW_LIMIT: usize = 1024;

struct Subscriber {
    queue: mpsc::Sender<Event>,
    revoked: Arc<AtomicBool>,
    overflow: Arc<AtomicUsize>,
}

struct BusInner {
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
    queue_depth: usize,
    overflow_limit: usize,
    dropped: AtomicU64,
}

#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(queue_depth: usize) -> Self {
        Self::with_overflow_limit(queue_depth, DEFAULT_OVERFLOW_LIMIT)
    }

    /// Like `new`, but at most `overflow_limit` events per subscriber wait
    /// in detached sends; further events for that subscriber are dropped
    /// and counted.
    pub fn with_overflow_limit(queue_depth: usize, overflow_limit: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                queue_depth: queue_depth.max(1),
                overflow_limit,
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Register `callback` for every event published from now on. Must be
    /// called from within a tokio runtime.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (queue, mut rx) = mpsc::channel::<Event>(self.inner.queue_depth);
        let revoked = Arc::new(AtomicBool::new(false));

        self.inner.subscribers.lock().insert(
            id,
            Subscriber {
                queue,
                revoked: Arc::clone(&revoked),
                overflow: Arc::new(AtomicUsize::new(0)),
            },
        );

        let flag = Arc::clone(&revoked);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if flag.load(Ordering::Acquire) {
                    break;
                }
                callback(event);
            }
            trace!(subscriber = id, "Event dispatcher stopped");
        });

        debug!(subscriber = id, "Subscribed to replication events");

        Subscription {
            inner: Arc::new(SubscriptionInner {
                id,
                revoked,
                bus: Arc::downgrade(&self.inner),
            }),
        }
    }

    /// Queue `event` for every live subscriber
    pub fn publish(&self, event: Event) {
        let queues: Vec<(mpsc::Sender<Event>, Arc<AtomicUsize>)> = self
            .inner
            .subscribers
            .lock()
            .values()
            .filter(|s| !s.revoked.load(Ordering::Acquire))
            .map(|s| (s.queue.clone(), Arc::clone(&s.overflow)))
            .collect();

        for (queue, overflow) in queues {
            match queue.try_send(event) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(event)) => {
                    if overflow.fetch_add(1, Ordering::AcqRel) >= self.inner.overflow_limit {
                        overflow.fetch_sub(1, Ordering::AcqRel);
                        self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(cid = %event.payload_cid, "Subscriber is not keeping up, dropping event");
                        continue;
                    }
                    tokio::spawn(async move {
                        let _ = queue.send(event).await;
                        overflow.fetch_sub(1, Ordering::AcqRel);
                    });
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Events dropped because a subscriber's backlog hit its limit
    pub fn dropped_events(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_DEPTH)
    }
}

struct SubscriptionInner {
    id: u64,
    revoked: Arc<AtomicBool>,
    bus: Weak<BusInner>,
}

/// Handle to a registered callback. Dropping it keeps the subscription
/// alive; call `unsubscribe` to stop delivery.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
}

impl Subscription {
    /// Stop delivering events. Events whose callback has not started yet
    /// are dropped. Safe to call repeatedly and from inside the callback.
    pub fn unsubscribe(&self) {
        if self.inner.revoked.swap(true, Ordering::AcqRel) {
            return;
        }

        // removing the entry drops the queue sender and ends the dispatcher
        if let Some(bus) = self.inner.bus.upgrade() {
            bus.subscribers.lock().remove(&self.inner.id);
        }
        debug!(subscriber = self.inner.id, "Unsubscribed from replication events");
    }

    pub fn is_active(&self) -> bool {
        !self.inner.revoked.load(Ordering::Acquire)
    }
}
