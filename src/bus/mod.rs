//! In-process event bus.
//!
//! The gateway is the single authority that emits [`Event`]s; WebSocket
//! clients and internal tasks subscribe.  Delivery is best-effort: a slow
//! subscriber drops its oldest queued events rather than back-pressuring
//! the publisher.
//!
//! `seq` is minted under the same mutex that guards the subscriber set, so
//! it is strictly increasing process-wide with no duplicates or gaps.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::sync::Notify;

use crate::domain::Event;

/// Default per-subscriber queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

// ─── Subscription ─────────────────────────────────────────────────────────────

struct SubscriberState {
    queue: Mutex<VecDeque<Event>>,
    notify: Notify,
    closed: AtomicBool,
    capacity: usize,
}

/// A handle to a bounded event queue registered on the bus.
///
/// Subscriptions are identity-compared: two subscriptions with identical
/// contents are still distinct registrations.  Dropping the handle closes
/// the subscription; the bus prunes closed entries on the next publish.
pub struct Subscription {
    state: Arc<SubscriberState>,
}

impl Subscription {
    /// Receive the next event, waiting if the queue is empty.
    ///
    /// Returns `None` once the subscription is closed and drained.
    pub async fn recv(&self) -> Option<Event> {
        loop {
            if let Some(evt) = self.pop() {
                return Some(evt);
            }
            if self.state.closed.load(Ordering::Acquire) {
                return None;
            }
            self.state.notify.notified().await;
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&self) -> Option<Event> {
        self.pop()
    }

    /// Mark the subscription closed and wake any pending `recv`.
    pub fn close(&self) {
        self.state.closed.store(true, Ordering::Release);
        self.state.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    /// Number of queued, undelivered events.
    pub fn len(&self) -> usize {
        self.state.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn pop(&self) -> Option<Event> {
        self.state.queue.lock().ok()?.pop_front()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

// ─── EventBus ─────────────────────────────────────────────────────────────────

struct BusInner {
    seq: u64,
    subs: Vec<Arc<SubscriberState>>,
}

/// Ordered sequence allocator + fan-out to bounded per-subscriber queues.
pub struct EventBus {
    inner: Mutex<BusInner>,
    capacity: usize,
}

impl EventBus {
    /// Create with the default queue capacity (1000).
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Create with an explicit per-subscriber queue capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(BusInner {
                seq: 0,
                subs: Vec::new(),
            }),
            capacity,
        }
    }

    /// Atomically increment and return the process-wide sequence number.
    pub fn next_seq(&self) -> u64 {
        let mut inner = lock_inner(&self.inner);
        inner.seq += 1;
        inner.seq
    }

    /// Register a new bounded subscriber queue.
    pub fn subscribe(&self) -> Subscription {
        let state = Arc::new(SubscriberState {
            queue: Mutex::new(VecDeque::with_capacity(self.capacity.min(64))),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            capacity: self.capacity,
        });
        lock_inner(&self.inner).subs.push(Arc::clone(&state));
        Subscription { state }
    }

    /// Close and remove a subscription.
    pub fn unsubscribe(&self, sub: &Subscription) {
        sub.close();
        lock_inner(&self.inner)
            .subs
            .retain(|s| !Arc::ptr_eq(s, &sub.state));
    }

    /// Broadcast to every live subscriber without blocking.
    ///
    /// A full queue drops its oldest entry to make room; if no room can be
    /// made (zero capacity) the new event is dropped for that subscriber.
    pub fn publish(&self, evt: Event) {
        let subs: Vec<Arc<SubscriberState>> = {
            let mut inner = lock_inner(&self.inner);
            inner.subs.retain(|s| !s.closed.load(Ordering::Acquire));
            inner.subs.clone()
        };

        for sub in subs {
            let Ok(mut queue) = sub.queue.lock() else {
                continue;
            };
            if sub.capacity == 0 {
                continue;
            }
            if queue.len() >= sub.capacity {
                queue.pop_front();
            }
            queue.push_back(evt.clone());
            drop(queue);
            sub.notify.notify_one();
        }
    }

    /// Number of live subscriptions (used by tests and diagnostics).
    pub fn subscriber_count(&self) -> usize {
        lock_inner(&self.inner).subs.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Acquire the bus mutex, recovering from poisoning (a panicked publisher
/// must not wedge the whole control plane).
fn lock_inner(inner: &Mutex<BusInner>) -> std::sync::MutexGuard<'_, BusInner> {
    match inner.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
