//! Remote API trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use medipost_common::{EntityType, Result};

/// Server acknowledgment of an applied mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushAck {
    /// Authoritative id of the entity. For creates this may differ from the
    /// client-generated id, in which case local references are rewritten.
    pub server_id: String,
    /// Version acknowledged by the server.
    pub version: i64,
}

/// One record in a pull response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub entity_type: EntityType,
    pub id: String,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted: bool,
    pub data: serde_json::Value,
}

/// A page of server-side changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullBatch {
    pub records: Vec<RemoteRecord>,
    /// Server clock at response time; becomes the next pull cursor. Device
    /// clocks are never used for ordering.
    pub server_time: DateTime<Utc>,
}

/// Client for the central server.
///
/// Every mutation carries an `idempotency_key` the server deduplicates on:
/// re-sending the same key must not create a duplicate server record. All
/// implementations must bound each call with an explicit timeout.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Lightweight reachability check.
    ///
    /// # Errors
    /// - Network/timeout errors when the server cannot be reached
    async fn health(&self) -> Result<()>;

    /// Create an entity.
    ///
    /// # Postconditions
    /// - Returns the authoritative id and version
    /// - Re-sending the same `idempotency_key` returns the original
    ///   acknowledgment without applying a second create
    async fn create(
        &self,
        entity: EntityType,
        payload: &serde_json::Value,
        idempotency_key: &str,
    ) -> Result<PushAck>;

    /// Update an entity by id.
    async fn update(
        &self,
        entity: EntityType,
        id: &str,
        payload: &serde_json::Value,
        idempotency_key: &str,
    ) -> Result<PushAck>;

    /// Delete an entity by id.
    async fn delete(&self, entity: EntityType, id: &str, idempotency_key: &str) -> Result<()>;

    /// Current server records of one entity type, optionally restricted to
    /// those changed since a point in time.
    async fn list(
        &self,
        entity: EntityType,
        updated_since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RemoteRecord>>;

    /// Changes applied on the server since the cursor (full snapshot when
    /// `None`). This is the pull-phase feed; it spans all entity types so
    /// one response advances one cursor.
    async fn changes_since(&self, since: Option<DateTime<Utc>>) -> Result<PullBatch>;
}
