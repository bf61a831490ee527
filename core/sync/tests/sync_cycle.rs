//! End-to-end sync cycles against an in-memory store and mock server.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use medipost_common::EntityType;
use medipost_records::{new_client_id, Patient, RecordService, Sex};
use medipost_remote::{MockFailure, MockRemoteApi, RemoteApi, RemoteRecord};
use medipost_store::LocalStore;
use medipost_sync::{
    ConnectivityMonitor, ReachabilityProbe, RemoteProbe, RetryConfig, StatusFeed, SyncConfig,
    SyncEngine,
};

struct Harness {
    store: LocalStore,
    remote: MockRemoteApi,
    feed: StatusFeed,
    engine: Arc<SyncEngine>,
    service: RecordService,
}

fn fast_config() -> SyncConfig {
    SyncConfig {
        batch_size: 10,
        retry: RetryConfig::new(2)
            .with_initial_delay(Duration::from_millis(1))
            .with_jitter(false),
        backoff: RetryConfig::new(5)
            .with_initial_delay(Duration::ZERO)
            .with_jitter(false),
        max_attempts: 5,
        stale_age: Duration::from_secs(3600),
    }
}

fn harness() -> Harness {
    let store = LocalStore::in_memory().unwrap();
    let remote = MockRemoteApi::new();
    let api: Arc<dyn RemoteApi> = Arc::new(remote.clone());
    let probe = Arc::new(RemoteProbe::new(api.clone(), Duration::from_secs(1)));
    let monitor = ConnectivityMonitor::new(probe, true, Duration::ZERO);
    let feed = StatusFeed::new(store.clone(), monitor.clone());
    let engine = Arc::new(SyncEngine::new(
        store.clone(),
        api,
        monitor.clone(),
        feed.clone(),
        fast_config(),
    ));
    let service = RecordService::new(store.clone());

    Harness {
        store,
        remote,
        feed,
        engine,
        service,
    }
}

fn patient(name: &str) -> Patient {
    Patient {
        id: new_client_id(),
        family_name: name.to_string(),
        given_name: None,
        sex: Sex::Female,
        birth_year: Some(1990),
        phone: None,
        village: Some("Koundara".to_string()),
        site_id: "site-1".to_string(),
        registration_no: None,
    }
}

/// Scenario A: offline create leaves one pending CREATE visible in the feed.
#[tokio::test]
async fn offline_create_queues_one_operation() {
    let h = harness();
    h.remote.set_reachable(false);

    h.service.create(&patient("Diallo")).unwrap();

    let report = h.engine.sync().await;
    assert!(report.offline);
    assert_eq!(report.pushed, 0);

    let status = h.feed.recompute().unwrap();
    assert!(!status.is_online);
    assert_eq!(status.pending_operations, 1);
    assert_eq!(status.unsynced_entities, 1);
}

/// Scenario B: going online and forcing a sync drains the outbox and
/// rewrites the client-local id to the server-assigned one.
#[tokio::test]
async fn force_sync_drains_outbox_and_rewrites_id() {
    let h = harness();
    h.remote.set_reachable(false);
    let p = patient("Diallo");
    h.service.create(&p).unwrap();
    assert!(h.engine.sync().await.offline);

    h.remote.set_reachable(true);
    let report = h.engine.sync().await;
    assert!(!report.offline);
    assert_eq!(report.pushed, 1);

    let status = h.feed.current();
    assert_eq!(status.pending_operations, 0);
    assert_eq!(status.unsynced_entities, 0);
    assert!(status.last_sync_at.is_some());

    let patients = h.service.list::<Patient>().unwrap();
    assert_eq!(patients.len(), 1);
    assert!(patients[0].id.starts_with("srv-"));
    assert_ne!(patients[0].id, p.id);
    assert!(h
        .remote
        .record(EntityType::Patient, &patients[0].id)
        .is_some());
}

/// Scenario C: two offline updates leave exactly one UPDATE entry carrying
/// the latest payload.
#[tokio::test]
async fn offline_updates_coalesce_to_latest_payload() {
    let h = harness();

    // seed a synced patient so the updates do not fold into a create
    let mut p = patient("Diallo");
    h.service.create(&p).unwrap();
    h.engine.sync().await;
    p.id = h.service.list::<Patient>().unwrap()[0].id.clone();

    h.remote.set_reachable(false);
    p.village = Some("Sambailo".to_string());
    h.service.update(&p).unwrap();
    p.village = Some("Termesse".to_string());
    h.service.update(&p).unwrap();

    assert_eq!(h.store.pending_operations().unwrap(), 1);
    let pending = h.store.transact(|tx| tx.dequeue_batch(10, 0)).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].payload["village"], "Termesse");
}

/// Scenario D: a validation rejection dead-letters the entry, the cycle
/// keeps going for independent entities, and the feed reports the failure.
#[tokio::test]
async fn validation_rejection_dead_letters_and_cycle_continues() {
    let h = harness();
    h.remote.set_reachable(false);

    let bad = patient("Diallo");
    let good = patient("Barry");
    h.service.create(&bad).unwrap();
    h.service.create(&good).unwrap();

    h.remote.set_reachable(true);
    h.remote
        .fail_entity(EntityType::Patient, &bad.id, MockFailure::Rejected(422), 1);

    let report = h.engine.sync().await;
    assert_eq!(report.dead_lettered, 1);
    assert_eq!(report.pushed, 1);

    let status = h.feed.current();
    assert_eq!(status.dead_letters, 1);
    assert_eq!(status.pending_operations, 0);

    let letters = h.store.transact(|tx| tx.dead_letters()).unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].entity_id, bad.id);
}

/// Scenario E: a pulled server record for an entity with a pending local
/// write is held, and the pull cursor does not advance past it.
#[tokio::test]
async fn pending_local_write_wins_over_pulled_record() {
    let h = harness();

    // seed a synced patient
    let mut p = patient("Diallo");
    h.service.create(&p).unwrap();
    h.engine.sync().await;
    p.id = h.service.list::<Patient>().unwrap()[0].id.clone();
    let cursor_before = h.store.last_sync_at().unwrap();

    // local edit that will fail to push for this cycle
    p.village = Some("Sambailo".to_string());
    h.service.update(&p).unwrap();
    h.remote
        .fail_entity(EntityType::Patient, &p.id, MockFailure::Server(503), 3);

    // concurrent server-side edit of the same record
    h.remote.insert_server_record(RemoteRecord {
        entity_type: EntityType::Patient,
        id: p.id.clone(),
        version: 99,
        updated_at: Utc::now(),
        deleted: false,
        data: json!({"id": p.id, "family_name": "Diallo", "village": "ServerTown"}),
    });

    let report = h.engine.sync().await;
    assert_eq!(report.push_failed, 1);
    assert_eq!(report.held, 1);

    // local edit retained, cursor unchanged
    let local: Patient = h.service.get(&p.id).unwrap().unwrap();
    assert_eq!(local.village.as_deref(), Some("Sambailo"));
    assert_eq!(h.store.last_sync_at().unwrap(), cursor_before);

    // entry kept its idempotency key across the failed cycle
    let pending = h.store.transact(|tx| tx.dequeue_batch(10, 0)).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempt_count, 1);

    // next cycle pushes the local edit and reconciles
    let report = h.engine.sync().await;
    assert_eq!(report.pushed, 1);
    let local: Patient = h.service.list::<Patient>().unwrap().remove(0);
    assert_eq!(local.village.as_deref(), Some("Sambailo"));
    assert_eq!(h.store.pending_operations().unwrap(), 0);
    assert_eq!(h.store.unsynced_entities().unwrap(), 0);
}

/// Round trip: a record created offline, synced and pulled back equals the
/// original modulo the id rewrite and the synced flag.
#[tokio::test]
async fn offline_create_round_trips_through_server() {
    let h = harness();
    h.remote.set_reachable(false);
    let original = patient("Diallo");
    h.service.create(&original).unwrap();

    h.remote.set_reachable(true);
    h.engine.sync().await;
    // a second cycle pulls the server's canonical copy back
    h.engine.sync().await;

    let synced: Patient = h.service.list::<Patient>().unwrap().remove(0);
    assert!(synced.id.starts_with("srv-"));
    assert_eq!(synced.family_name, original.family_name);
    assert_eq!(synced.sex, original.sex);
    assert_eq!(synced.birth_year, original.birth_year);
    assert_eq!(synced.village, original.village);
    assert_eq!(synced.site_id, original.site_id);

    let record = h.store.get(EntityType::Patient, &synced.id).unwrap().unwrap();
    assert!(record.synced);
}

/// Children created offline follow their parent's id confirmation.
#[tokio::test]
async fn offline_child_references_are_rewritten_with_parent() {
    let h = harness();
    h.remote.set_reachable(false);

    let p = patient("Diallo");
    h.service.create(&p).unwrap();
    let encounter = medipost_records::Encounter {
        id: new_client_id(),
        patient_id: p.id.clone(),
        site_id: "site-1".to_string(),
        clinician_id: "u1".to_string(),
        date: chrono::NaiveDate::from_ymd_opt(2025, 6, 2).unwrap(),
        reason: Some("fever".to_string()),
        temperature_c: Some(38.9),
        pulse_bpm: None,
        systolic_mmhg: None,
        diastolic_mmhg: None,
        weight_kg: None,
        height_cm: None,
        notes: None,
    };
    h.service.create(&encounter).unwrap();

    h.remote.set_reachable(true);
    let report = h.engine.sync().await;
    assert_eq!(report.pushed, 2);

    let patients = h.service.list::<Patient>().unwrap();
    let encounters = h.service.list::<medipost_records::Encounter>().unwrap();
    assert!(patients[0].id.starts_with("srv-"));
    assert_eq!(encounters[0].patient_id, patients[0].id);

    // the server stored the rewritten reference, not the local- id
    let server_encounter = h
        .remote
        .record(EntityType::Encounter, &encounters[0].id)
        .unwrap();
    assert_eq!(server_encounter.data["patient_id"], patients[0].id.as_str());
}

/// Transient failures keep the idempotency key stable, so a retried push
/// applies exactly once server-side.
#[tokio::test]
async fn retried_push_applies_exactly_once() {
    let h = harness();
    h.remote.set_reachable(false);
    let p = patient("Diallo");
    h.service.create(&p).unwrap();

    let key = {
        let pending = h.store.transact(|tx| tx.dequeue_batch(10, 0)).unwrap();
        pending[0].idempotency_key.clone()
    };

    h.remote.set_reachable(true);
    // enough failures to exhaust the in-cycle retries once
    h.remote
        .fail_entity(EntityType::Patient, &p.id, MockFailure::Network, 3);

    let report = h.engine.sync().await;
    assert_eq!(report.push_failed, 1);

    let report = h.engine.sync().await;
    assert_eq!(report.pushed, 1);
    assert_eq!(h.remote.applications(&key), 1);
}

/// A probe that holds the cycle open long enough for triggers to pile up.
struct SlowProbe {
    inner: MockRemoteApi,
    delay: Duration,
}

#[async_trait]
impl ReachabilityProbe for SlowProbe {
    async fn check(&self) -> bool {
        tokio::time::sleep(self.delay).await;
        self.inner.health().await.is_ok()
    }
}

/// Concurrent triggers coalesce into at most one running cycle.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_triggers_run_one_cycle_at_a_time() {
    let store = LocalStore::in_memory().unwrap();
    let remote = MockRemoteApi::new();
    let api: Arc<dyn RemoteApi> = Arc::new(remote.clone());
    let probe = Arc::new(SlowProbe {
        inner: remote.clone(),
        delay: Duration::from_millis(100),
    });
    let monitor = ConnectivityMonitor::new(probe, true, Duration::ZERO);
    let feed = StatusFeed::new(store.clone(), monitor.clone());
    let engine = Arc::new(SyncEngine::new(
        store,
        api,
        monitor,
        feed,
        fast_config(),
    ));

    let barrier = Arc::new(tokio::sync::Barrier::new(10));
    let mut tasks = Vec::new();
    for _ in 0..10 {
        let engine = engine.clone();
        let barrier = barrier.clone();
        tasks.push(tokio::spawn(async move {
            barrier.wait().await;
            engine.sync().await
        }));
    }

    let mut reports = Vec::new();
    for task in tasks {
        reports.push(task.await.unwrap());
    }

    let driven = reports.iter().filter(|r| !r.coalesced).count();
    let coalesced = reports.iter().filter(|r| r.coalesced).count();
    assert_eq!(driven, 1);
    assert_eq!(coalesced, 9);
    // the driver ran the initial cycle plus at most one coalesced rerun
    assert!(remote.pull_count() <= 2);
}
