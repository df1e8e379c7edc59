//! Synchronous multicast observables.
//!
//! The state machine publishes effects, transitions, and status changes
//! through these channels. Emission is synchronous: every callback registered
//! *before* the emission runs before `emit` returns. Callbacks registered
//! during an emission are not called until the next emission.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// A unique identifier for a subscription.
pub type SubscriptionId = u64;

/// Callback type for an observable of `T`.
pub type ObserverCallback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Thread-safe multicast channel with a `subscribe -> unsubscribe` contract.
pub struct Observable<T> {
    /// Map of subscription IDs to callbacks.
    callbacks: RwLock<HashMap<SubscriptionId, ObserverCallback<T>>>,
    /// Counter for generating unique subscription IDs.
    next_id: AtomicU64,
}

impl<T> Observable<T> {
    /// Create a new empty observable.
    pub fn new() -> Self {
        Self {
            callbacks: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe to emissions.
    ///
    /// Returns a subscription ID that can be used to unsubscribe later.
    pub fn subscribe(&self, callback: ObserverCallback<T>) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut callbacks = self.callbacks.write().unwrap();
        callbacks.insert(id, callback);
        id
    }

    /// Unsubscribe. Returns `true` if the subscription was found and removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut callbacks = self.callbacks.write().unwrap();
        callbacks.remove(&id).is_some()
    }

    /// Emit a value to all callbacks registered before this call.
    ///
    /// The callback list is snapshotted before invocation, so callbacks may
    /// subscribe or unsubscribe re-entrantly without deadlocking, and a
    /// subscriber added mid-emission waits for the next emission.
    pub fn emit(&self, value: &T) {
        let snapshot: Vec<(SubscriptionId, ObserverCallback<T>)> = {
            let callbacks = self.callbacks.read().unwrap();
            let mut entries: Vec<_> = callbacks
                .iter()
                .map(|(id, cb)| (*id, Arc::clone(cb)))
                .collect();
            entries.sort_by_key(|(id, _)| *id);
            entries
        };
        for (id, callback) in snapshot {
            // Skip callbacks unsubscribed by an earlier callback in this emission.
            let still_subscribed = {
                let callbacks = self.callbacks.read().unwrap();
                callbacks.contains_key(&id)
            };
            if still_subscribed {
                callback(value);
            }
        }
    }

    /// Get the number of active subscriptions.
    pub fn subscriber_count(&self) -> usize {
        let callbacks = self.callbacks.read().unwrap();
        callbacks.len()
    }

    /// Check if there are any active subscriptions.
    pub fn has_subscribers(&self) -> bool {
        let callbacks = self.callbacks.read().unwrap();
        !callbacks.is_empty()
    }

    /// Clear all subscriptions.
    pub fn clear(&self) {
        let mut callbacks = self.callbacks.write().unwrap();
        callbacks.clear();
    }
}

impl<T> Default for Observable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observable")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}
