//! In-process publish/subscribe for [`BotEvent`]s.
//!
//! Every subscriber owns a bounded `async_channel` receiver. Publishing never
//! blocks: a subscriber that falls behind loses events (with a warning)
//! rather than stalling the gateway read loop, and subscribers whose receiver
//! was dropped are pruned on the next publish.

use std::sync::{Arc, Mutex};

use async_channel::{Receiver, Sender, TrySendError};
use tracing::{trace, warn};

use crate::events::BotEvent;

/// Default per-subscriber buffer.
pub const DEFAULT_CAPACITY: usize = 256;

/// Cheap to clone; all clones share the same subscriber list.
#[derive(Clone)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Sender<BotEvent>>>>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
        }
    }

    /// Register a new subscriber. It sees every event published from now on.
    pub fn subscribe(&self) -> Receiver<BotEvent> {
        let (tx, rx) = async_channel::bounded(self.capacity);
        self.lock().push(tx);
        rx
    }

    /// Fan an event out to every live subscriber. Returns how many received it.
    pub fn publish(&self, event: BotEvent) -> usize {
        let mut subscribers = self.lock();
        let mut delivered = 0;
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(event = event.name(), "subscriber lagging, event dropped");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
        trace!(event = event.name(), delivered, "published event");
        delivered
    }

    /// Number of live subscribers (closed ones are only pruned on publish).
    pub fn subscriber_count(&self) -> usize {
        self.lock().iter().filter(|tx| !tx.is_closed()).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Sender<BotEvent>>> {
        // A panic while holding this lock cannot leave the Vec half-updated,
        // so a poisoned guard is still safe to use.
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .field("capacity", &self.capacity)
            .finish()
    }
}
