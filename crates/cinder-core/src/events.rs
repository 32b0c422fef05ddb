//! Keyspace events.
//!
//! Each shard publishes one event per mutation, synchronously, to a
//! list of plain callback subscribers. The arrow points one way: the
//! shard owns its subscriber list and subscribers hold no reference
//! back, so serialization never has to traverse a cycle, and the list
//! is simply not part of what goes over the wire or to disk.
//!
//! A subscriber that panics is isolated with `catch_unwind`: the
//! remaining subscribers still observe the event.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use tracing::warn;

/// What happened to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEventKind {
    Added,
    Updated,
    Deleted,
    Expired,
    ExpireSet,
}

/// A single keyspace event.
#[derive(Debug, Clone)]
pub struct KeyEvent {
    /// Index of the shard the key lives in.
    pub shard: usize,
    pub key: String,
    pub kind: KeyEventKind,
    /// Wall-clock instant of the mutation, in milliseconds.
    pub at: i64,
}

/// A keyspace event callback.
pub type Subscriber = Arc<dyn Fn(&KeyEvent) + Send + Sync>;

/// Per-shard subscriber registry.
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<Subscriber>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback for every future event on this shard.
    pub fn subscribe(&self, subscriber: Subscriber) {
        if let Ok(mut subs) = self.subscribers.write() {
            subs.push(subscriber);
        }
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().map(|s| s.len()).unwrap_or(0)
    }

    /// Delivers `event` to every subscriber in registration order.
    pub fn publish(&self, event: &KeyEvent) {
        let subs = match self.subscribers.read() {
            Ok(subs) => subs,
            Err(_) => return,
        };
        for sub in subs.iter() {
            let result = panic::catch_unwind(AssertUnwindSafe(|| sub(event)));
            if result.is_err() {
                warn!(key = %event.key, "keyspace event subscriber panicked");
            }
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event(kind: KeyEventKind) -> KeyEvent {
        KeyEvent {
            shard: 0,
            key: "k".into(),
            kind,
            at: 0,
        }
    }

    #[test]
    fn subscribers_see_events_in_order() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let count = Arc::clone(&count);
            bus.subscribe(Arc::new(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            }));
        }

        bus.publish(&event(KeyEventKind::Added));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn panicking_subscriber_does_not_block_others() {
        let bus = EventBus::new();
        let reached = Arc::new(AtomicUsize::new(0));

        bus.subscribe(Arc::new(|_| panic!("bad subscriber")));
        let reached2 = Arc::clone(&reached);
        bus.subscribe(Arc::new(move |_| {
            reached2.fetch_add(1, Ordering::SeqCst);
        }));

        bus.publish(&event(KeyEventKind::Deleted));
        assert_eq!(reached.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn publish_with_no_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(&event(KeyEventKind::Expired));
    }
}
