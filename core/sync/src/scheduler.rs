//! Sync scheduling: interval timer, manual triggers and shutdown.
//!
//! The scheduler is an explicit background task owned by the application
//! lifecycle, not an ambient global interval. Tests inject the sync function
//! and drive it deterministically.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::interval;
use tracing::{debug, error, info};

use medipost_common::{Error, Result};

use crate::engine::SyncReport;

/// When the scheduler fires on its own.
#[derive(Debug, Clone)]
pub enum ScheduleMode {
    /// Only explicit requests trigger a sync.
    Manual,
    /// Sync at regular intervals (plus explicit requests).
    Periodic { every: Duration },
}

/// Request types handled by the scheduler task.
#[derive(Debug)]
pub enum SyncRequest {
    /// Run a cycle now.
    Force,
    /// Stop the scheduler task.
    Shutdown,
}

type RequestTx = mpsc::Sender<(SyncRequest, Option<oneshot::Sender<SyncReport>>)>;
type RequestRx = mpsc::Receiver<(SyncRequest, Option<oneshot::Sender<SyncReport>>)>;

/// Handle for requesting syncs and shutting the task down.
pub struct SyncScheduler {
    request_tx: RequestTx,
    shutdown: Arc<AtomicBool>,
}

impl SyncScheduler {
    /// Create a scheduler with the given mode.
    pub fn new(mode: ScheduleMode) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(64);
        let shutdown = Arc::new(AtomicBool::new(false));

        let scheduler = Self {
            request_tx: request_tx.clone(),
            shutdown: shutdown.clone(),
        };
        let handle = SyncSchedulerHandle {
            mode,
            request_tx,
            request_rx: Some(request_rx),
            shutdown,
        };

        (scheduler, handle)
    }

    /// Request a sync and wait for its report.
    pub async fn request_sync(&self) -> Result<SyncReport> {
        let (response_tx, response_rx) = oneshot::channel();
        self.request_tx
            .send((SyncRequest::Force, Some(response_tx)))
            .await
            .map_err(|_| Error::Busy("Sync scheduler not running".to_string()))?;
        response_rx
            .await
            .map_err(|_| Error::Busy("Sync scheduler dropped the request".to_string()))
    }

    /// A cloneable, non-blocking trigger for callbacks (connectivity
    /// transitions, the write path).
    pub fn notifier(&self) -> SyncNotifier {
        SyncNotifier {
            request_tx: self.request_tx.clone(),
        }
    }

    /// Stop the scheduler task.
    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.request_tx.send((SyncRequest::Shutdown, None)).await;
    }
}

/// Fire-and-forget sync trigger; safe to call from subscriber callbacks.
#[derive(Clone)]
pub struct SyncNotifier {
    request_tx: RequestTx,
}

impl SyncNotifier {
    /// Nudge the scheduler. Dropped silently if the queue is full or the
    /// scheduler is gone; the next interval tick catches up.
    pub fn notify(&self) {
        if let Err(e) = self.request_tx.try_send((SyncRequest::Force, None)) {
            debug!("Sync nudge dropped: {}", e);
        }
    }
}

/// The background half of the scheduler.
pub struct SyncSchedulerHandle {
    mode: ScheduleMode,
    request_tx: RequestTx,
    request_rx: Option<RequestRx>,
    shutdown: Arc<AtomicBool>,
}

impl SyncSchedulerHandle {
    /// Run the scheduler loop.
    ///
    /// Spawn this in a tokio task; `sync_fn` is called for every trigger.
    /// The engine's single-flight flag deduplicates overlapping triggers, so
    /// the scheduler never has to.
    pub async fn run<F, Fut>(mut self, sync_fn: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = SyncReport> + Send,
    {
        let mut request_rx = self.request_rx.take().expect("Handle can only be run once");
        let mut ticker = match self.mode {
            ScheduleMode::Periodic { every } => Some(interval(every)),
            ScheduleMode::Manual => None,
        };
        if let Some(ticker) = ticker.as_mut() {
            // the first tick fires immediately; consume it so startup does
            // not race the caller's own initial sync
            ticker.tick().await;
        }

        info!("Sync scheduler started");

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            tokio::select! {
                request = request_rx.recv() => {
                    match request {
                        Some((SyncRequest::Shutdown, _)) | None => break,
                        Some((SyncRequest::Force, reply)) => {
                            debug!("Processing sync request");
                            let report = sync_fn().await;
                            if !report.errors.is_empty() {
                                error!("Sync reported {} errors", report.errors.len());
                            }
                            if let Some(reply) = reply {
                                let _ = reply.send(report);
                            }
                        }
                    }
                }

                _ = Self::tick(&mut ticker) => {
                    debug!("Interval sync");
                    let report = sync_fn().await;
                    if !report.errors.is_empty() {
                        error!("Periodic sync reported {} errors", report.errors.len());
                    }
                }
            }
        }

        info!("Sync scheduler stopped");
    }

    async fn tick(ticker: &mut Option<tokio::time::Interval>) {
        match ticker {
            Some(ticker) => {
                ticker.tick().await;
            }
            // manual mode: wait forever so select! only sees requests
            None => std::future::pending::<()>().await,
        }
    }

    /// Sender side, for wiring additional trigger sources before `run`.
    pub fn notifier(&self) -> SyncNotifier {
        SyncNotifier {
            request_tx: self.request_tx.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn test_request_sync_runs_and_replies() {
        let (scheduler, handle) = SyncScheduler::new(ScheduleMode::Manual);

        let runs = Arc::new(AtomicU32::new(0));
        let runs_clone = runs.clone();
        let task = tokio::spawn(async move {
            handle
                .run(move || {
                    let runs = runs_clone.clone();
                    async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        SyncReport {
                            pushed: 1,
                            ..SyncReport::default()
                        }
                    }
                })
                .await;
        });

        let report = scheduler.request_sync().await.unwrap();
        assert_eq!(report.pushed, 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        scheduler.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_notifier_is_fire_and_forget() {
        let (scheduler, handle) = SyncScheduler::new(ScheduleMode::Manual);

        let runs = Arc::new(AtomicU32::new(0));
        let runs_clone = runs.clone();
        let task = tokio::spawn(async move {
            handle
                .run(move || {
                    let runs = runs_clone.clone();
                    async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        SyncReport::default()
                    }
                })
                .await;
        });

        scheduler.notifier().notify();
        // a request with a reply channel acts as a barrier behind the nudge
        scheduler.request_sync().await.unwrap();
        assert!(runs.load(Ordering::SeqCst) >= 2);

        scheduler.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_periodic_mode_fires() {
        let (scheduler, handle) = SyncScheduler::new(ScheduleMode::Periodic {
            every: Duration::from_millis(10),
        });

        let runs = Arc::new(AtomicU32::new(0));
        let runs_clone = runs.clone();
        let task = tokio::spawn(async move {
            handle
                .run(move || {
                    let runs = runs_clone.clone();
                    async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        SyncReport::default()
                    }
                })
                .await;
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(runs.load(Ordering::SeqCst) >= 2);

        scheduler.shutdown().await;
        task.await.unwrap();
    }
}
