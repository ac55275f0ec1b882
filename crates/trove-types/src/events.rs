//! Callback-list publish/subscribe.
//!
//! An [`EventBus`] holds an ordered list of subscriber callbacks. Every
//! published event is delivered to the subscribers in subscription order.
//! `subscribe_once` callbacks are removed before they run, and
//! [`EventBus::unsubscribe`] may be called from inside a callback: a
//! subscriber removed mid-delivery does not see the event being delivered
//! unless it has already been called.
//!
//! # Example
//!
//! ```ignore
//! let bus = EventBus::<MonitorEvent>::new();
//! let id = bus.subscribe(|ev| println!("{}", ev.name()));
//! bus.subscribe_once(|_| println!("first event only"));
//! bus.publish(&MonitorEvent::UpToDate);
//! bus.unsubscribe(id);
//! ```

use std::sync::Arc;

use parking_lot::Mutex;

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Subscriber<T> {
    id: SubscriberId,
    once: bool,
    callback: Callback<T>,
}

struct BusInner<T> {
    next_id: u64,
    subscribers: Vec<Subscriber<T>>,
}

/// Ordered subscriber list for events of type `T`.
pub struct EventBus<T> {
    inner: Mutex<BusInner<T>>,
}

impl<T> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for EventBus<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.len())
            .finish()
    }
}

impl<T> EventBus<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BusInner {
                next_id: 1,
                subscribers: Vec::new(),
            }),
        }
    }

    fn add(&self, once: bool, callback: Callback<T>) -> SubscriberId {
        let mut inner = self.inner.lock();
        let id = SubscriberId(inner.next_id);
        inner.next_id += 1;
        inner.subscribers.push(Subscriber { id, once, callback });
        id
    }

    /// Subscribe to every event.
    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> SubscriberId {
        self.add(false, Arc::new(callback))
    }

    /// Subscribe to the next event only.
    pub fn subscribe_once(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> SubscriberId {
        self.add(true, Arc::new(callback))
    }

    /// Remove a subscriber. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.subscribers.len();
        inner.subscribers.retain(|s| s.id != id);
        inner.subscribers.len() != before
    }

    /// Remove every subscriber.
    pub fn clear(&self) {
        self.inner.lock().subscribers.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to current subscribers. Returns how many were called.
    ///
    /// The lock is not held while callbacks run, so callbacks may subscribe
    /// or unsubscribe.
    pub fn publish(&self, event: &T) -> usize {
        let snapshot: Vec<(SubscriberId, bool, Callback<T>)> = {
            let mut inner = self.inner.lock();
            let snapshot = inner
                .subscribers
                .iter()
                .map(|s| (s.id, s.once, Arc::clone(&s.callback)))
                .collect();
            inner.subscribers.retain(|s| !s.once);
            snapshot
        };

        let mut delivered = 0;
        for (id, once, callback) in snapshot {
            // Skip anything unsubscribed by an earlier callback in this round.
            // Once-subscribers were already removed above and always run.
            let live = once || self.inner.lock().subscribers.iter().any(|s| s.id == id);
            if live {
                callback(event);
                delivered += 1;
            }
        }
        delivered
    }
}
