//! Readiness reporting and subscriber registries, the poll/kqueue
//! analogue. Subscribers are held weakly and pruned on notify, so a
//! dropped subscriber unregisters itself.

use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

bitflags::bitflags! {
    /// Which transitions a subscriber cares about. End-of-file and
    /// broken-pipe transitions are always delivered.
    pub struct Interest: u8 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
    }
}

/// Snapshot of a channel's state as seen by poll.
///
/// `eof` and `broken_pipe` are sub-conditions, not errors: `readable`
/// is also true at end-of-file so a draining reader wakes up, and
/// `writable` is also true on a broken channel so a writer learns about
/// it promptly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    /// No more data will arrive (distinct from "empty but still open")
    pub eof: bool,
    /// The consuming side is gone
    pub broken_pipe: bool,
    /// Bytes currently buffered
    pub buffered: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

impl SubscriptionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Receiver for readiness transitions.
pub trait ReadinessSubscriber: Send + Sync {
    fn on_ready(&self, readiness: Readiness);
}

struct Entry {
    id: SubscriptionId,
    interest: Interest,
    subscriber: Weak<dyn ReadinessSubscriber>,
}

/// Per-channel subscriber list.
pub(crate) struct SubscriberSet {
    entries: spin::Mutex<Vec<Entry>>,
}

impl SubscriberSet {
    pub fn new() -> Self {
        Self {
            entries: spin::Mutex::new(Vec::new()),
        }
    }

    pub fn insert(
        &self,
        id: SubscriptionId,
        interest: Interest,
        subscriber: &Arc<dyn ReadinessSubscriber>,
    ) {
        self.entries.lock().push(Entry {
            id,
            interest,
            subscriber: Arc::downgrade(subscriber),
        });
    }

    /// Returns whether the id was registered here.
    pub fn remove(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| e.id != id);
        entries.len() != before
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Deliver `readiness` to every live subscriber whose interest it
    /// touches. Dead subscribers are pruned. Delivery happens outside the
    /// list lock, so a subscriber may re-enter subscribe/unsubscribe.
    pub fn notify(&self, readiness: Readiness) {
        let mut targets = Vec::new();
        {
            let mut entries = self.entries.lock();
            entries.retain(|e| {
                let subscriber = match e.subscriber.upgrade() {
                    Some(s) => s,
                    None => return false,
                };
                let relevant = (readiness.readable && e.interest.contains(Interest::READABLE))
                    || (readiness.writable && e.interest.contains(Interest::WRITABLE))
                    || readiness.eof
                    || readiness.broken_pipe;
                if relevant {
                    targets.push(subscriber);
                }
                true
            });
        }
        for subscriber in targets {
            subscriber.on_ready(readiness);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    struct Counter {
        calls: AtomicUsize,
        last_eof: AtomicUsize,
    }
    impl Counter {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                last_eof: AtomicUsize::new(0),
            })
        }
    }
    impl ReadinessSubscriber for Counter {
        fn on_ready(&self, readiness: Readiness) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.last_eof.store(readiness.eof as usize, Ordering::SeqCst);
        }
    }

    fn readable() -> Readiness {
        Readiness {
            readable: true,
            buffered: 1,
            ..Readiness::default()
        }
    }

    #[test]
    fn test_interest_filtering() {
        let set = SubscriberSet::new();
        let counter = Counter::new();
        let subscriber: Arc<dyn ReadinessSubscriber> = counter.clone();
        set.insert(SubscriptionId::next(), Interest::WRITABLE, &subscriber);

        set.notify(readable());
        assert_eq!(counter.calls.load(Ordering::SeqCst), 0);

        // EOF always delivered
        set.notify(Readiness {
            eof: true,
            readable: true,
            ..Readiness::default()
        });
        assert_eq!(counter.calls.load(Ordering::SeqCst), 1);
        assert_eq!(counter.last_eof.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_and_prune() {
        let set = SubscriberSet::new();
        let counter = Counter::new();
        let subscriber: Arc<dyn ReadinessSubscriber> = counter.clone();

        let id = SubscriptionId::next();
        set.insert(id, Interest::READABLE, &subscriber);
        assert!(set.remove(id));
        assert!(!set.remove(id));

        set.insert(SubscriptionId::next(), Interest::READABLE, &subscriber);
        drop(subscriber);
        drop(counter);
        set.notify(readable());
        assert!(set.entries.lock().is_empty());
    }
}
