//! Bounded FIFO queues backing the coordinator.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

/// Work item riding one of the pipeline queues.
///
/// Lifecycle: pending while queued, processing once popped, then either
/// committed (dropped from the queue on success), re-enqueued with an
/// incremented `retry_count`, or dropped with an error signal once retries
/// are exhausted.
#[derive(Clone, Debug)]
pub struct QueueItem<T> {
    pub payload: T,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
    /// Earliest instant the item is eligible to drain again; pushed into the
    /// future when a transient failure re-enqueues it.
    pub not_before: DateTime<Utc>,
}

/// What a queue does when a push finds it at capacity.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OverflowPolicy {
    /// Keep accepting items; occupancy is bounded naturally by upstream
    /// event production and trade data is never silently dropped.
    Grow,
    /// Evict the oldest item to make room. Only safe for queues carrying
    /// derived, re-computable work.
    ShedOldest,
}

/// Result of an enqueue attempt.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PushOutcome {
    /// An older item was evicted to admit this one.
    pub shed: bool,
    /// This push crossed the backpressure threshold (fires once per
    /// crossing, not once per enqueue).
    pub warned: bool,
}

/// Multi-producer, single-consumer FIFO with a soft occupancy bound.
///
/// Crossing 80% of `max_len` emits one backpressure warning; the trigger
/// re-arms when occupancy falls back below the threshold.
pub struct BoundedQueue<T> {
    name: &'static str,
    items: Mutex<VecDeque<QueueItem<T>>>,
    max_len: usize,
    policy: OverflowPolicy,
    pressured: AtomicBool,
}

impl<T> BoundedQueue<T> {
    pub fn new(name: &'static str, max_len: usize, policy: OverflowPolicy) -> Self {
        Self {
            name,
            items: Mutex::new(VecDeque::new()),
            max_len: max_len.max(1),
            policy,
            pressured: AtomicBool::new(false),
        }
    }

    /// Append a fresh item, applying the overflow policy at capacity.
    pub fn push(&self, payload: T, now: DateTime<Utc>) -> PushOutcome {
        let mut outcome = PushOutcome::default();
        let len = {
            let mut items = self.items.lock().expect("queue lock poisoned");
            if items.len() >= self.max_len && self.policy == OverflowPolicy::ShedOldest {
                items.pop_front();
                outcome.shed = true;
            }
            items.push_back(QueueItem {
                payload,
                enqueued_at: now,
                retry_count: 0,
                not_before: now,
            });
            items.len()
        };
        if outcome.shed {
            debug!(queue = self.name, "queue full; shed oldest item");
        }
        outcome.warned = self.update_pressure(len);
        outcome
    }

    /// Put a failed item back for another attempt. Admission is not
    /// re-checked: the item already held a slot.
    pub fn requeue(&self, item: QueueItem<T>) {
        let mut items = self.items.lock().expect("queue lock poisoned");
        items.push_back(item);
    }

    /// Pop up to `max` items in FIFO order.
    ///
    /// With `now` supplied, items still inside their retry delay are left at
    /// the front; passing `None` ignores delays (used by the shutdown
    /// drain).
    pub fn pop_batch(&self, max: usize, now: Option<DateTime<Utc>>) -> Vec<QueueItem<T>> {
        let mut ready = Vec::new();
        let len = {
            let mut items = self.items.lock().expect("queue lock poisoned");
            let mut held = Vec::new();
            while ready.len() < max {
                let Some(item) = items.pop_front() else { break };
                match now {
                    Some(now) if item.not_before > now => held.push(item),
                    _ => ready.push(item),
                }
            }
            for item in held.into_iter().rev() {
                items.push_front(item);
            }
            items.len()
        };
        self.update_pressure(len);
        ready
    }

    pub fn len(&self) -> usize {
        self.items.lock().expect("queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn update_pressure(&self, len: usize) -> bool {
        let threshold = self.max_len * 4 / 5;
        if len >= threshold.max(1) {
            if !self.pressured.swap(true, Ordering::Relaxed) {
                warn!(
                    queue = self.name,
                    len,
                    max = self.max_len,
                    "queue occupancy crossed 80% of capacity"
                );
                return true;
            }
        } else {
            self.pressured.store(false, Ordering::Relaxed);
        }
        false
    }
}
