//! In-process observers of the shared state.
//!
//! Every mutation publishes one immutable `Arc<SharedState>` to all
//! observers, synchronously and in subscription order. A panicking observer
//! is logged and skipped; the rest still run.
//!
//! Publishes carry the revision assigned when the mutation happened. A
//! revision older than one already delivered is dropped, so observers never
//! step backwards even when two threads publish concurrently.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex};
use tracing::{trace, warn};

use crate::types::SharedState;

type Observer = Arc<dyn Fn(Arc<SharedState>) + Send + Sync>;

#[derive(Default)]
struct HubInner {
    next_id: u64,
    observers: BTreeMap<u64, Observer>,
}

/// Fan-out of state snapshots to registered callbacks
#[derive(Clone)]
pub struct SubscriberHub {
    inner: Arc<Mutex<HubInner>>,
    // Reentrant so an observer may mutate the session it observes.
    delivery: Arc<ReentrantMutex<()>>,
    latest: Arc<AtomicU64>,
}

impl Default for SubscriberHub {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriberHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner::default())),
            delivery: Arc::new(ReentrantMutex::new(())),
            latest: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Register `observer`; keep the returned handle to unsubscribe.
    pub fn subscribe(&self, observer: impl Fn(Arc<SharedState>) + Send + Sync + 'static) -> Subscription {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.observers.insert(id, Arc::new(observer));
        Subscription {
            id,
            hub: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver `state`, produced at `revision`, to every observer.
    ///
    /// The observer list is copied out first so callbacks may subscribe,
    /// unsubscribe or read session state without deadlocking. Delivery stops
    /// early if a callback caused a newer revision to be published.
    pub fn publish(&self, revision: u64, state: Arc<SharedState>) {
        let _delivering = self.delivery.lock();
        if self.latest.fetch_max(revision, Ordering::SeqCst) >= revision {
            trace!(revision, "Dropping superseded state");
            return;
        }

        let observers: Vec<(u64, Observer)> = self
            .inner
            .lock()
            .observers
            .iter()
            .map(|(id, o)| (*id, o.clone()))
            .collect();

        for (id, observer) in observers {
            if self.latest.load(Ordering::SeqCst) > revision {
                break;
            }
            let snapshot = state.clone();
            if panic::catch_unwind(AssertUnwindSafe(|| observer(snapshot))).is_err() {
                warn!(observer = id, "State observer panicked");
            }
        }
    }

    /// Remove every observer.
    pub fn clear(&self) {
        self.inner.lock().observers.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle returned by [`SubscriberHub::subscribe`].
///
/// Dropping the handle does not unsubscribe; call [`Subscription::unsubscribe`].
#[derive(Debug, Clone)]
pub struct Subscription {
    id: u64,
    hub: Weak<Mutex<HubInner>>,
}

impl Subscription {
    /// Stop receiving updates. Safe to call more than once.
    pub fn unsubscribe(&self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.lock().observers.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_publish_reaches_all_observers() {
        let hub = SubscriberHub::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let count = count.clone();
            let _sub = hub.subscribe(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }

        hub.publish(1, Arc::new(SharedState::default()));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_panicking_observer_does_not_block_others() {
        let hub = SubscriberHub::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let _bad = hub.subscribe(|_| panic!("observer failure"));
        let seen_clone = seen.clone();
        let _good = hub.subscribe(move |state| {
            seen_clone.store(state.seq as usize, Ordering::SeqCst);
        });

        let state = SharedState {
            seq: 7,
            ..Default::default()
        };
        hub.publish(1, Arc::new(state));
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let hub = SubscriberHub::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let sub = hub.subscribe(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        sub.unsubscribe();
        sub.unsubscribe();
        hub.publish(1, Arc::new(SharedState::default()));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(hub.is_empty());
    }

    #[test]
    fn test_unsubscribe_after_hub_dropped() {
        let hub = SubscriberHub::new();
        let sub = hub.subscribe(|_| {});
        drop(hub);
        sub.unsubscribe();
    }

    fn at_seq(seq: u64) -> Arc<SharedState> {
        Arc::new(SharedState {
            seq,
            ..Default::default()
        })
    }

    #[test]
    fn test_superseded_revision_is_dropped() {
        let hub = SubscriberHub::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let _sub = hub.subscribe(move |state| seen_clone.lock().push(state.seq));

        hub.publish(2, at_seq(2));
        hub.publish(1, at_seq(1));
        hub.publish(2, at_seq(2));
        hub.publish(3, at_seq(3));

        assert_eq!(*seen.lock(), vec![2, 3]);
    }

    #[test]
    fn test_nested_publish_wins() {
        let hub = SubscriberHub::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let nested = hub.clone();
        let _first = hub.subscribe(move |state| {
            if state.seq == 1 {
                nested.publish(2, at_seq(2));
            }
        });
        let seen_clone = seen.clone();
        let _second = hub.subscribe(move |state| seen_clone.lock().push(state.seq));

        hub.publish(1, at_seq(1));
        assert_eq!(*seen.lock(), vec![2]);
    }
}
