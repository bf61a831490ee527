//! MediPost Sync Engine
//!
//! This module keeps the device and the central server reconciled, including:
//! - Connectivity detection with an active reachability probe
//! - Push/pull cycles with single-flight coalescing
//! - Per-entity retry with exponential backoff and dead-lettering
//! - A status feed consumed by presentation layers
//! - Background scheduling owned by the application lifecycle

pub mod connectivity;
pub mod engine;
pub mod retry;
pub mod scheduler;
pub mod status;
pub mod subscription;

// Re-export main types
pub use connectivity::{ConnectivityMonitor, ReachabilityProbe, RemoteProbe};
pub use engine::{SyncConfig, SyncEngine, SyncReport};
pub use retry::{retry, retry_with_config, BackoffTracker, RetryConfig, RetryExecutor};
pub use scheduler::{ScheduleMode, SyncNotifier, SyncRequest, SyncScheduler, SyncSchedulerHandle};
pub use status::{StatusFeed, SyncStatus};
pub use subscription::{SubscriberHandle, Subscribers};
