//! Sync status projection for presentation layers.
//!
//! Derived, never stored: recomputed from store counters after every outbox
//! mutation and engine phase transition, then pushed to subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

use medipost_common::Result;
use medipost_store::LocalStore;

use crate::connectivity::ConnectivityMonitor;
use crate::subscription::{SubscriberHandle, Subscribers};

/// Read-only snapshot of the sync machinery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub is_online: bool,
    pub is_syncing: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Live outbox entries awaiting transmission.
    pub pending_operations: u64,
    /// Records whose latest version the server has not acknowledged.
    pub unsynced_entities: u64,
    /// Permanently failed entries needing operator attention.
    pub dead_letters: u64,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            is_online: false,
            is_syncing: false,
            last_sync_at: None,
            pending_operations: 0,
            unsynced_entities: 0,
            dead_letters: 0,
        }
    }
}

/// Observable projection over the store and engine flags.
///
/// Cheap to clone; all clones share the same snapshot and subscribers.
#[derive(Clone)]
pub struct StatusFeed {
    store: LocalStore,
    monitor: ConnectivityMonitor,
    syncing: Arc<AtomicBool>,
    current: Arc<Mutex<SyncStatus>>,
    subscribers: Subscribers<SyncStatus>,
}

impl StatusFeed {
    pub fn new(store: LocalStore, monitor: ConnectivityMonitor) -> Self {
        Self {
            store,
            monitor,
            syncing: Arc::new(AtomicBool::new(false)),
            current: Arc::new(Mutex::new(SyncStatus::default())),
            subscribers: Subscribers::new(),
        }
    }

    /// Latest computed snapshot (may lag the store until next recompute).
    pub fn current(&self) -> SyncStatus {
        self.current.lock().expect("status feed poisoned").clone()
    }

    /// Whether a sync cycle is currently running.
    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    /// Engine-only: flip the syncing flag and recompute.
    pub fn set_syncing(&self, syncing: bool) {
        self.syncing.store(syncing, Ordering::SeqCst);
        if let Err(e) = self.recompute() {
            debug!("Status recompute failed: {}", e);
        }
    }

    /// Rebuild the snapshot from the store and notify subscribers on change.
    pub fn recompute(&self) -> Result<SyncStatus> {
        let status = SyncStatus {
            is_online: self.monitor.is_online(),
            is_syncing: self.syncing.load(Ordering::SeqCst),
            last_sync_at: self.store.last_sync_at()?,
            pending_operations: self.store.pending_operations()?,
            unsynced_entities: self.store.unsynced_entities()?,
            dead_letters: self.store.dead_letter_count()?,
        };

        let changed = {
            let mut current = self.current.lock().expect("status feed poisoned");
            if *current != status {
                *current = status.clone();
                true
            } else {
                false
            }
        };
        if changed {
            self.subscribers.notify(&status);
        }
        Ok(status)
    }

    /// Subscribe to snapshot changes.
    pub fn subscribe(
        &self,
        callback: impl Fn(&SyncStatus) + Send + Sync + 'static,
    ) -> SubscriberHandle {
        self.subscribers.subscribe(callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::ReachabilityProbe;
    use async_trait::async_trait;
    use medipost_common::{EntityType, Operation};
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    struct AlwaysUp;

    #[async_trait]
    impl ReachabilityProbe for AlwaysUp {
        async fn check(&self) -> bool {
            true
        }
    }

    fn feed() -> (LocalStore, StatusFeed) {
        let store = LocalStore::in_memory().unwrap();
        let monitor = ConnectivityMonitor::new(Arc::new(AlwaysUp), true, Duration::ZERO);
        let feed = StatusFeed::new(store.clone(), monitor);
        (store, feed)
    }

    #[tokio::test]
    async fn test_recompute_reflects_outbox() {
        let (store, feed) = feed();

        store
            .transact(|tx| {
                let data = json!({"id": "p1"});
                tx.put(EntityType::Patient, "p1", &data)?;
                tx.enqueue(EntityType::Patient, "p1", Operation::Create, data)?;
                Ok(())
            })
            .unwrap();

        let status = feed.recompute().unwrap();
        assert_eq!(status.pending_operations, 1);
        assert_eq!(status.unsynced_entities, 1);
        assert!(status.is_online);
        assert!(!status.is_syncing);
    }

    #[tokio::test]
    async fn test_subscribers_notified_on_change_only() {
        let (store, feed) = feed();
        let notifications = Arc::new(AtomicU32::new(0));

        let seen = notifications.clone();
        let _handle = feed.subscribe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        // first recompute flips is_online from the default false
        feed.recompute().unwrap();
        let baseline = notifications.load(Ordering::SeqCst);

        // no store change: no notification
        feed.recompute().unwrap();
        assert_eq!(notifications.load(Ordering::SeqCst), baseline);

        store
            .put(EntityType::Patient, "p1", &json!({"id": "p1"}))
            .unwrap();
        feed.recompute().unwrap();
        assert_eq!(notifications.load(Ordering::SeqCst), baseline + 1);
    }
}
