//! Composition root: wires the store, remote client, connectivity monitor,
//! sync engine and scheduler into one application object with a lifecycle.

pub mod config;
pub mod session;

pub use config::AppConfig;
pub use session::SessionManager;

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

use medipost_common::Result;
use medipost_records::RecordService;
use medipost_remote::{HttpRemoteApi, RemoteApi};
use medipost_store::LocalStore;
use medipost_sync::{
    ConnectivityMonitor, RemoteProbe, ScheduleMode, StatusFeed, SubscriberHandle, SyncConfig,
    SyncEngine, SyncScheduler,
};

/// A running MediPost application.
pub struct App {
    pub store: LocalStore,
    pub records: RecordService,
    pub monitor: ConnectivityMonitor,
    pub feed: StatusFeed,
    pub engine: Arc<SyncEngine>,
    pub scheduler: SyncScheduler,
    pub session: SessionManager,
    scheduler_task: JoinHandle<()>,
    // keeps the OFFLINE→ONLINE trigger alive for the app's lifetime
    _connectivity_sub: SubscriberHandle,
}

impl App {
    /// Start against the configured HTTP server.
    pub fn start(config: AppConfig) -> Result<App> {
        let remote: Arc<dyn RemoteApi> = Arc::new(HttpRemoteApi::new(
            &config.server_url,
            config.request_timeout(),
        )?);
        let store = LocalStore::open(&config.database_path)?;
        Self::start_with(config, store, remote)
    }

    /// Start with an injected store and remote client (tests, demos).
    pub fn start_with(
        config: AppConfig,
        store: LocalStore,
        remote: Arc<dyn RemoteApi>,
    ) -> Result<App> {
        let probe = Arc::new(RemoteProbe::new(remote.clone(), config.probe_timeout()));
        let monitor = ConnectivityMonitor::new(probe, true, config.debounce());
        let feed = StatusFeed::new(store.clone(), monitor.clone());

        let sync_config = SyncConfig {
            batch_size: config.outbox_batch_size,
            max_attempts: config.max_attempts,
            stale_age: config.stale_age(),
            ..SyncConfig::default()
        };
        let engine = Arc::new(SyncEngine::new(
            store.clone(),
            remote,
            monitor.clone(),
            feed.clone(),
            sync_config,
        ));

        let mode = match config.sync_interval() {
            Some(every) => ScheduleMode::Periodic { every },
            None => ScheduleMode::Manual,
        };
        let (scheduler, handle) = SyncScheduler::new(mode);

        // reconnecting is a sync trigger; the engine coalesces the rest
        let notifier = scheduler.notifier();
        let connectivity_sub = monitor.subscribe(move |online| {
            if *online {
                notifier.notify();
            }
        });

        // writes recompute the feed and nudge the scheduler
        let records = {
            let feed = feed.clone();
            let notifier = scheduler.notifier();
            RecordService::new(store.clone()).with_write_hook(move || {
                let _ = feed.recompute();
                notifier.notify();
            })
        };

        let scheduler_task = {
            let engine = engine.clone();
            tokio::spawn(async move {
                handle.run(move || {
                    let engine = engine.clone();
                    async move { engine.sync().await }
                })
                .await;
            })
        };

        let session = SessionManager::new(store.clone(), engine.clone());

        info!("MediPost application started");
        Ok(App {
            store,
            records,
            monitor,
            feed,
            engine,
            scheduler,
            session,
            scheduler_task,
            _connectivity_sub: connectivity_sub,
        })
    }

    /// Request an immediate sync cycle and wait for its report.
    pub async fn force_sync(&self) -> Result<medipost_sync::SyncReport> {
        self.scheduler.request_sync().await
    }

    /// Stop the background scheduler and release the app.
    pub async fn shutdown(self) {
        self.scheduler.shutdown().await;
        let _ = self.scheduler_task.await;
        info!("MediPost application stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medipost_records::{new_client_id, Patient, Sex};
    use medipost_remote::MockRemoteApi;

    fn test_config() -> AppConfig {
        AppConfig {
            sync_interval_secs: 0,
            debounce_ms: 0,
            ..AppConfig::default()
        }
    }

    fn patient() -> Patient {
        Patient {
            id: new_client_id(),
            family_name: "Diallo".to_string(),
            given_name: None,
            sex: Sex::Male,
            birth_year: None,
            phone: None,
            village: None,
            site_id: "site-1".to_string(),
            registration_no: None,
        }
    }

    #[tokio::test]
    async fn test_end_to_end_write_then_sync() {
        let store = LocalStore::in_memory().unwrap();
        let remote = MockRemoteApi::new();
        let app = App::start_with(test_config(), store, Arc::new(remote.clone())).unwrap();

        app.session
            .login("u1", "agent@post.example", "Awa", "nurse", "site-1")
            .unwrap();
        app.records.create(&patient()).unwrap();

        let report = app.force_sync().await.unwrap();
        // the write hook's nudge may have synced first; either way the
        // outbox must be drained
        assert!(report.pushed == 1 || report.pushed == 0);
        assert_eq!(app.store.pending_operations().unwrap(), 0);
        assert_eq!(app.feed.current().pending_operations, 0);

        app.shutdown().await;
    }

    #[tokio::test]
    async fn test_logout_wipes_but_login_preserves() {
        let store = LocalStore::in_memory().unwrap();
        let remote = MockRemoteApi::new();
        remote.set_reachable(false);
        let app = App::start_with(test_config(), store, Arc::new(remote.clone())).unwrap();

        app.session
            .login("u1", "agent@post.example", "Awa", "nurse", "site-1")
            .unwrap();
        app.records.create(&patient()).unwrap();

        // re-login does not touch records or outbox
        app.session
            .login("u1", "agent@post.example", "Awa", "nurse", "site-1")
            .unwrap();
        assert_eq!(app.store.pending_operations().unwrap(), 1);

        app.session.logout().unwrap();
        assert_eq!(app.store.pending_operations().unwrap(), 0);
        assert!(app.session.current().unwrap().is_none());

        app.shutdown().await;
    }
}
