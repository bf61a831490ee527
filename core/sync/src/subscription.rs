//! Publish/subscribe registry with owned cancellation.
//!
//! Used by the connectivity monitor and the status feed. Each subscriber
//! gets a [`SubscriberHandle`]; dropping it (or calling `unsubscribe`)
//! removes the callback, so no global listener list can leak.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;
type Registry<T> = Mutex<HashMap<u64, Callback<T>>>;

/// A set of subscriber callbacks.
pub struct Subscribers<T> {
    registry: Arc<Registry<T>>,
    next_id: Arc<AtomicU64>,
}

impl<T> Clone for Subscribers<T> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            next_id: self.next_id.clone(),
        }
    }
}

impl<T: 'static> Default for Subscribers<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Subscribers<T> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Register a callback; it stays active for the lifetime of the handle.
    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> SubscriberHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry
            .lock()
            .expect("subscriber registry poisoned")
            .insert(id, Arc::new(callback));

        SubscriberHandle {
            id,
            unregister: Box::new({
                let registry = Arc::downgrade(&self.registry);
                move |id| {
                    if let Some(registry) = registry.upgrade() {
                        registry
                            .lock()
                            .expect("subscriber registry poisoned")
                            .remove(&id);
                    }
                }
            }),
        }
    }

    /// Deliver `value` to every current subscriber.
    ///
    /// Callbacks run outside the registry lock, so a subscriber may itself
    /// subscribe or unsubscribe without deadlocking.
    pub fn notify(&self, value: &T) {
        let callbacks: Vec<Callback<T>> = self
            .registry
            .lock()
            .expect("subscriber registry poisoned")
            .values()
            .cloned()
            .collect();
        for callback in callbacks {
            callback(value);
        }
    }

    /// Number of active subscribers.
    pub fn len(&self) -> usize {
        self.registry
            .lock()
            .expect("subscriber registry poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Owned cancellation for one subscription. Unsubscribes on drop.
pub struct SubscriberHandle {
    id: u64,
    unregister: Box<dyn Fn(u64) + Send + Sync>,
}

impl SubscriberHandle {
    /// Remove the subscription explicitly.
    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Drop for SubscriberHandle {
    fn drop(&mut self) {
        (self.unregister)(self.id);
    }
}
