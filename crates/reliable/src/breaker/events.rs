//! State-change and service-level notifications
//!
//! Subscribers are kept in an ordered map keyed by a monotonically
//! increasing [`SubscriptionId`], so iteration order is registration order.
//! Callbacks run synchronously on the thread that performed the mutation,
//! after the mutation, with no internal lock held.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::state::CircuitState;

/// Handle returned by a subscription, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

/// A state transition that has just happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    pub from: CircuitState,
    pub to: CircuitState,
}

/// A failure-count change that has just happened
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServiceLevelChange {
    pub failure_count: u32,
    pub threshold: u32,
    /// Percentage in `[0, 100]`; 100 means healthy
    pub service_level: f64,
}

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Ordered list of callbacks for one kind of event
pub(crate) struct Observers<T> {
    callbacks: RwLock<BTreeMap<SubscriptionId, Callback<T>>>,
}

impl<T> Observers<T> {
    pub(crate) fn new() -> Self {
        Self {
            callbacks: RwLock::new(BTreeMap::new()),
        }
    }

    pub(crate) fn subscribe(&self, id: SubscriptionId, callback: Callback<T>) {
        self.callbacks.write().insert(id, callback);
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.callbacks.write().remove(&id).is_some()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.callbacks.read().is_empty()
    }

    /// Invoke every callback in registration order
    ///
    /// The callback list is snapshotted first so a callback may subscribe,
    /// unsubscribe, trip or reset the breaker without deadlocking.
    pub(crate) fn notify(&self, event: &T) {
        let snapshot: Vec<Callback<T>> = self.callbacks.read().values().cloned().collect();
        for callback in snapshot {
            callback(event);
        }
    }
}

/// Allocator for subscription handles shared by all observer lists of a breaker
#[derive(Debug, Default)]
pub(crate) struct SubscriptionIds(AtomicU64);

impl SubscriptionIds {
    pub(crate) fn next(&self) -> SubscriptionId {
        SubscriptionId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}
