use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

struct Subscriber<T> {
    tx: mpsc::Sender<T>,
    done: CancellationToken,
}

/// Fan-out registry of bounded subscriber channels
///
/// Sends never block: a full channel drops the item for that subscriber only,
/// and a subscriber whose done token fired or whose receiver is gone is removed.
pub struct SubscriberRegistry<T> {
    subscribers: DashMap<u64, Subscriber<T>>,
    next_id: AtomicU64,
    buffer: usize,
    name: &'static str,
}

impl<T: Clone + Send + 'static> SubscriberRegistry<T> {
    pub fn new(name: &'static str, buffer: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(0),
            buffer: buffer.max(1),
            name,
        }
    }

    /// Register a subscriber that lives until `done` fires or the receiver is dropped
    pub fn subscribe(self: &Arc<Self>, done: CancellationToken) -> mpsc::Receiver<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);
        self.subscribers.insert(
            id,
            Subscriber {
                tx: tx.clone(),
                done: done.clone(),
            },
        );

        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = done.cancelled() => {}
                _ = tx.closed() => {}
            }
            if let Some(registry) = registry.upgrade() {
                registry.remove(id);
            }
        });

        rx
    }

    /// Deliver `item` to every live subscriber
    pub fn broadcast(&self, item: &T) {
        self.subscribers.retain(|id, subscriber| {
            if subscriber.done.is_cancelled() {
                tracing::debug!(registry = self.name, id, "removing finished subscriber");
                return false;
            }
            match subscriber.tx.try_send(item.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    tracing::trace!(registry = self.name, id, "subscriber lagging, dropped item");
                    true
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(registry = self.name, id, "removing closed subscriber");
                    false
                }
            }
        });
    }

    fn remove(&self, id: u64) {
        if self.subscribers.remove(&id).is_some() {
            tracing::debug!(registry = self.name, id, "subscriber removed");
        }
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}
