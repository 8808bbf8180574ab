//! Live fan-out to dashboard connections.
//!
//! Delivery is at-most-once and never blocks ingestion: a subscriber whose
//! buffer is full misses the reading, a closed one is pruned, and a
//! panicking one is isolated from the rest.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use telemetry_model::NormalizedReading;

pub type SubscriberId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("subscriber buffer full")]
    Full,
    #[error("subscriber closed")]
    Closed,
}

pub trait Subscriber: Send + Sync {
    /// Must not block.
    fn deliver(&self, reading: Arc<NormalizedReading>) -> Result<(), DeliveryError>;
}

/// Buffers readings for an async consumer such as a WebSocket task.
pub struct ChannelSubscriber {
    tx: mpsc::Sender<Arc<NormalizedReading>>,
}

impl ChannelSubscriber {
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<Arc<NormalizedReading>>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

impl Subscriber for ChannelSubscriber {
    fn deliver(&self, reading: Arc<NormalizedReading>) -> Result<(), DeliveryError> {
        self.tx.try_send(reading).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

/// Adapts a closure into a [`Subscriber`].
pub struct FnSubscriber<F>(pub F);

impl<F> Subscriber for FnSubscriber<F>
where
    F: Fn(Arc<NormalizedReading>) -> Result<(), DeliveryError> + Send + Sync,
{
    fn deliver(&self, reading: Arc<NormalizedReading>) -> Result<(), DeliveryError> {
        (self.0)(reading)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifyReport {
    pub delivered: usize,
    pub dropped: usize,
    pub failed: usize,
    pub pruned: usize,
}

#[derive(Default)]
pub struct SubscriberRegistry {
    next_id: AtomicU64,
    subscribers: RwLock<HashMap<SubscriberId, Arc<dyn Subscriber>>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, subscriber: Arc<dyn Subscriber>) -> SubscriberId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, subscriber);
        debug!(subscriber_id = id, "subscriber added");
        id
    }

    pub fn remove(&self, id: SubscriberId) -> bool {
        let removed = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some();
        if removed {
            debug!(subscriber_id = id, "subscriber removed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.subscribers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers to a snapshot of the current subscribers; registrations
    /// made during the call take effect from the next reading.
    pub fn notify_all(&self, reading: &NormalizedReading) -> NotifyReport {
        let snapshot: Vec<(SubscriberId, Arc<dyn Subscriber>)> = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, s)| (*id, s.clone()))
            .collect();

        let mut report = NotifyReport::default();
        if snapshot.is_empty() {
            return report;
        }

        let shared = Arc::new(reading.clone());
        let mut closed = Vec::new();
        for (id, subscriber) in snapshot {
            let payload = shared.clone();
            match catch_unwind(AssertUnwindSafe(|| subscriber.deliver(payload))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(DeliveryError::Full)) => {
                    report.dropped += 1;
                    warn!(subscriber_id = id, "subscriber lagging, reading dropped");
                }
                Ok(Err(DeliveryError::Closed)) => closed.push(id),
                Err(_) => {
                    report.failed += 1;
                    error!(subscriber_id = id, "subscriber panicked during delivery");
                }
            }
        }

        for id in closed {
            if self.remove(id) {
                report.pruned += 1;
            }
        }
        report
    }
}
