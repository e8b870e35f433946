//! Live feed of session events for supervisors and local UIs.
//!
//! Each subscriber owns a bounded queue. Publishing never blocks: when a
//! subscriber falls behind, its oldest event is dropped and counted.
//! Subscriptions that have been dropped are pruned on the next publish.

use proctor_daemon_protocol::Alert;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FeedEvent {
    SessionStarted {
        session_id: String,
        started_at: String,
    },
    /// Published once the session store has accepted the alert.
    Alert(Alert),
    DeliveryPending {
        backlog: usize,
    },
    DeliveryRestored,
    DeliveryRejected {
        code: String,
        message: String,
    },
    SessionEnded {
        session_id: String,
        risk_score: u32,
    },
}

struct Slot {
    queue: Mutex<SlotQueue>,
    ready: Condvar,
}

struct SlotQueue {
    events: VecDeque<FeedEvent>,
    dropped: u64,
}

/// Cloneable publishing handle.
#[derive(Clone)]
pub struct LiveFeed {
    capacity: usize,
    subscribers: Arc<Mutex<Vec<Weak<Slot>>>>,
}

impl LiveFeed {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let slot = Arc::new(Slot {
            queue: Mutex::new(SlotQueue {
                events: VecDeque::with_capacity(self.capacity.min(64)),
                dropped: 0,
            }),
            ready: Condvar::new(),
        });
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(&slot));
        Subscription { slot }
    }

    pub fn publish(&self, event: FeedEvent) {
        let live: Vec<Arc<Slot>> = {
            let mut subscribers = self
                .subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            subscribers.retain(|slot| slot.strong_count() > 0);
            subscribers.iter().filter_map(Weak::upgrade).collect()
        };

        for slot in live {
            {
                let mut queue = slot.queue.lock().unwrap_or_else(PoisonError::into_inner);
                if queue.events.len() >= self.capacity {
                    queue.events.pop_front();
                    queue.dropped += 1;
                }
                queue.events.push_back(event.clone());
            }
            slot.ready.notify_all();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|slot| slot.strong_count() > 0)
            .count()
    }
}

pub struct Subscription {
    slot: Arc<Slot>,
}

impl Subscription {
    pub fn try_next(&self) -> Option<FeedEvent> {
        self.queue().events.pop_front()
    }

    /// Waits up to `timeout` for the next event.
    pub fn next_timeout(&self, timeout: Duration) -> Option<FeedEvent> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.queue();
        loop {
            if let Some(event) = queue.events.pop_front() {
                return Some(event);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            queue = self
                .slot
                .ready
                .wait_timeout(queue, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub fn drain(&self) -> Vec<FeedEvent> {
        self.queue().events.drain(..).collect()
    }

    /// Events lost to overflow since this subscription was created.
    pub fn dropped_count(&self) -> u64 {
        self.queue().dropped
    }

    fn queue(&self) -> std::sync::MutexGuard<'_, SlotQueue> {
        self.slot
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
