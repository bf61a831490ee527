//! In-memory remote API for testing and development.
//!
//! Behaves like the real server where it matters to the sync engine:
//! server-assigned ids on create, idempotency-key deduplication (a replayed
//! mutation returns the original acknowledgment without applying twice), and
//! a `changes_since` feed ordered by server time. Failures can be scripted
//! per call or per entity to exercise retry and dead-letter paths.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use medipost_common::{EntityType, Error, Result};

use crate::api::{PullBatch, PushAck, RemoteApi, RemoteRecord};

/// A failure the mock should return instead of applying a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    /// Transport-level failure.
    Network,
    /// Request timed out.
    Timeout,
    /// Server-side 5xx.
    Server(u16),
    /// Validation 4xx.
    Rejected(u16),
}

impl MockFailure {
    fn to_error(self) -> Error {
        match self {
            MockFailure::Network => Error::Network("Connection refused".to_string()),
            MockFailure::Timeout => Error::Timeout("Request timed out".to_string()),
            MockFailure::Server(status) => Error::Server {
                status,
                message: "Internal error".to_string(),
            },
            MockFailure::Rejected(status) => Error::Rejected {
                status,
                message: "Validation failed".to_string(),
            },
        }
    }
}

#[derive(Default)]
struct MockState {
    records: BTreeMap<(EntityType, String), RemoteRecord>,
    /// Acknowledgments by idempotency key; a replay returns the stored ack.
    applied: HashMap<String, PushAck>,
    /// How many times each key actually mutated state (for tests).
    applications: HashMap<String, u32>,
    /// Failures consumed by the next mutations, in order.
    queued_failures: VecDeque<MockFailure>,
    /// Remaining scripted failures per entity.
    entity_failures: HashMap<(EntityType, String), (MockFailure, u32)>,
    reachable: bool,
    pull_count: u32,
}

/// In-memory [`RemoteApi`] implementation.
#[derive(Clone)]
pub struct MockRemoteApi {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockRemoteApi {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRemoteApi {
    /// Create a reachable, empty mock server.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                reachable: true,
                ..MockState::default()
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("mock state poisoned")
    }

    /// Toggle reachability; unreachable fails health and every call.
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// Fail the next mutation with the given failure.
    pub fn enqueue_failure(&self, failure: MockFailure) {
        self.lock().queued_failures.push_back(failure);
    }

    /// Fail the next `times` mutations touching one entity.
    pub fn fail_entity(&self, entity: EntityType, id: &str, failure: MockFailure, times: u32) {
        self.lock()
            .entity_failures
            .insert((entity, id.to_string()), (failure, times));
    }

    /// Seed a record directly on the "server" (for pull tests).
    pub fn insert_server_record(&self, record: RemoteRecord) {
        let mut state = self.lock();
        state
            .records
            .insert((record.entity_type, record.id.clone()), record);
    }

    /// Current server-side record, if any.
    pub fn record(&self, entity: EntityType, id: &str) -> Option<RemoteRecord> {
        self.lock().records.get(&(entity, id.to_string())).cloned()
    }

    /// How many times a key's mutation was actually applied.
    pub fn applications(&self, idempotency_key: &str) -> u32 {
        self.lock()
            .applications
            .get(idempotency_key)
            .copied()
            .unwrap_or(0)
    }

    /// Number of `changes_since` calls served.
    pub fn pull_count(&self) -> u32 {
        self.lock().pull_count
    }

    fn check_failures(
        state: &mut MockState,
        entity: EntityType,
        id: &str,
    ) -> Result<()> {
        if !state.reachable {
            return Err(Error::Network("Server unreachable".to_string()));
        }
        if let Some(failure) = state.queued_failures.pop_front() {
            return Err(failure.to_error());
        }
        let key = (entity, id.to_string());
        if let Some((failure, times)) = state.entity_failures.get_mut(&key) {
            if *times > 0 {
                *times -= 1;
                let failure = *failure;
                if *times == 0 {
                    state.entity_failures.remove(&key);
                }
                return Err(failure.to_error());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteApi for MockRemoteApi {
    async fn health(&self) -> Result<()> {
        if self.lock().reachable {
            Ok(())
        } else {
            Err(Error::Network("Server unreachable".to_string()))
        }
    }

    async fn create(
        &self,
        entity: EntityType,
        payload: &serde_json::Value,
        idempotency_key: &str,
    ) -> Result<PushAck> {
        let mut state = self.lock();
        let client_id = payload
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        if let Some(ack) = state.applied.get(idempotency_key) {
            return Ok(ack.clone());
        }
        Self::check_failures(&mut state, entity, &client_id)?;

        let server_id = format!("srv-{}", Uuid::new_v4());
        let mut data = payload.clone();
        if let Some(obj) = data.as_object_mut() {
            obj.insert("id".to_string(), serde_json::Value::String(server_id.clone()));
        }

        // The server adopts the client's version counter for
        // client-originated mutations.
        let version = payload.get("version").and_then(|v| v.as_i64()).unwrap_or(1);

        let record = RemoteRecord {
            entity_type: entity,
            id: server_id.clone(),
            version,
            updated_at: Utc::now(),
            deleted: false,
            data,
        };
        state.records.insert((entity, server_id.clone()), record);

        let ack = PushAck { server_id, version };
        state
            .applied
            .insert(idempotency_key.to_string(), ack.clone());
        *state
            .applications
            .entry(idempotency_key.to_string())
            .or_insert(0) += 1;
        Ok(ack)
    }

    async fn update(
        &self,
        entity: EntityType,
        id: &str,
        payload: &serde_json::Value,
        idempotency_key: &str,
    ) -> Result<PushAck> {
        let mut state = self.lock();

        if let Some(ack) = state.applied.get(idempotency_key) {
            return Ok(ack.clone());
        }
        Self::check_failures(&mut state, entity, id)?;

        let key = (entity, id.to_string());
        let claimed = payload.get("version").and_then(|v| v.as_i64());
        let record = state
            .records
            .get_mut(&key)
            .ok_or_else(|| Error::NotFound(format!("{entity} {id}")))?;
        // Adopt the client's counter, never regressing the server's own.
        record.version = claimed.unwrap_or(record.version + 1).max(record.version + 1);
        record.updated_at = Utc::now();
        record.data = payload.clone();
        let version = record.version;

        let ack = PushAck {
            server_id: id.to_string(),
            version,
        };
        state
            .applied
            .insert(idempotency_key.to_string(), ack.clone());
        *state
            .applications
            .entry(idempotency_key.to_string())
            .or_insert(0) += 1;
        Ok(ack)
    }

    async fn delete(&self, entity: EntityType, id: &str, idempotency_key: &str) -> Result<()> {
        let mut state = self.lock();

        if state.applied.contains_key(idempotency_key) {
            return Ok(());
        }
        Self::check_failures(&mut state, entity, id)?;

        let key = (entity, id.to_string());
        if let Some(record) = state.records.get_mut(&key) {
            record.deleted = true;
            record.version += 1;
            record.updated_at = Utc::now();
        }

        state.applied.insert(
            idempotency_key.to_string(),
            PushAck {
                server_id: id.to_string(),
                version: 0,
            },
        );
        *state
            .applications
            .entry(idempotency_key.to_string())
            .or_insert(0) += 1;
        Ok(())
    }

    async fn list(
        &self,
        entity: EntityType,
        updated_since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RemoteRecord>> {
        let state = self.lock();
        if !state.reachable {
            return Err(Error::Network("Server unreachable".to_string()));
        }

        Ok(state
            .records
            .values()
            .filter(|r| r.entity_type == entity && !r.deleted)
            .filter(|r| match updated_since {
                Some(cursor) => r.updated_at > cursor,
                None => true,
            })
            .cloned()
            .collect())
    }

    async fn changes_since(&self, since: Option<DateTime<Utc>>) -> Result<PullBatch> {
        let mut state = self.lock();
        if !state.reachable {
            return Err(Error::Network("Server unreachable".to_string()));
        }
        state.pull_count += 1;

        let records = state
            .records
            .values()
            .filter(|r| match since {
                Some(cursor) => r.updated_at > cursor,
                None => true,
            })
            .cloned()
            .collect();

        Ok(PullBatch {
            records,
            server_time: Utc::now(),
        })
    }
}
