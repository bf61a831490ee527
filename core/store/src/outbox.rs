//! The outbox: an ordered, deduplicated record of pending mutations.
//!
//! Entries are created in the same transaction as the domain write they
//! describe and removed only once the server durably accepts the operation.
//! Enqueueing collapses redundant work so that at most one CREATE-or-UPDATE
//! entry is live per entity:
//!
//! - a DELETE cancels a pending CREATE (the entity never reached the server)
//! - a DELETE replaces a pending UPDATE
//! - an UPDATE folds its payload into the pending CREATE or UPDATE, keeping
//!   the original entry id and idempotency key so retries stay idempotent
//!   and FIFO order is preserved

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

use medipost_common::{EntityType, Error, Operation, Result};

use crate::store::{db_err, parse_ts, LocalStore, StoreTx};

/// One pending mutation awaiting transmission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Monotonic id; defines replay order.
    pub entry_id: i64,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation: Operation,
    /// Entity snapshot at enqueue (or latest coalesce) time.
    pub payload: serde_json::Value,
    /// Generated once at enqueue time, never regenerated on retry.
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
    pub attempt_count: u32,
    pub last_error: Option<String>,
}

/// A permanently failed entry, kept visible until discarded or requeued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub entry_id: i64,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation: Operation,
    pub payload: serde_json::Value,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub failed_at: DateTime<Utc>,
    pub reason: String,
}

impl<'c> StoreTx<'c> {
    /// Queue a mutation, applying the collapsing rules.
    ///
    /// Returns the live entry for the entity, or `None` when a DELETE
    /// cancelled a pending CREATE and nothing remains to transmit.
    pub fn enqueue(
        &self,
        entity: EntityType,
        entity_id: &str,
        operation: Operation,
        payload: serde_json::Value,
    ) -> Result<Option<OutboxEntry>> {
        let pending = self.pending_for(entity, entity_id)?;

        match operation {
            Operation::Create => self.insert_entry(entity, entity_id, operation, &payload).map(Some),
            Operation::Update => {
                if let Some(live) = pending
                    .iter()
                    .find(|e| matches!(e.operation, Operation::Create | Operation::Update))
                {
                    // Coalesce into the existing entry: same ordering slot,
                    // same idempotency key, latest payload.
                    let json = serde_json::to_string(&payload)
                        .map_err(|e| Error::Serialization(e.to_string()))?;
                    self.conn
                        .execute(
                            "UPDATE outbox SET payload = ?1 WHERE entry_id = ?2",
                            params![json, live.entry_id],
                        )
                        .map_err(db_err)?;
                    debug!(
                        "Coalesced update for {} {} into entry {}",
                        entity, entity_id, live.entry_id
                    );
                    let mut coalesced = live.clone();
                    coalesced.payload = payload;
                    Ok(Some(coalesced))
                } else {
                    self.insert_entry(entity, entity_id, operation, &payload).map(Some)
                }
            }
            Operation::Delete => {
                let had_pending_create =
                    pending.iter().any(|e| e.operation == Operation::Create);
                self.conn
                    .execute(
                        "DELETE FROM outbox WHERE entity_type = ?1 AND entity_id = ?2",
                        params![entity.as_str(), entity_id],
                    )
                    .map_err(db_err)?;

                if had_pending_create {
                    // The entity never reached the server; nothing to delete
                    // remotely.
                    debug!("Delete cancelled pending create for {} {}", entity, entity_id);
                    Ok(None)
                } else {
                    self.insert_entry(entity, entity_id, operation, &payload).map(Some)
                }
            }
        }
    }

    fn insert_entry(
        &self,
        entity: EntityType,
        entity_id: &str,
        operation: Operation,
        payload: &serde_json::Value,
    ) -> Result<OutboxEntry> {
        let idempotency_key = uuid::Uuid::new_v4().to_string();
        let created_at = Utc::now();
        let json =
            serde_json::to_string(payload).map_err(|e| Error::Serialization(e.to_string()))?;

        self.conn
            .execute(
                r#"
                INSERT INTO outbox
                (entity_type, entity_id, operation, payload, idempotency_key, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    entity.as_str(),
                    entity_id,
                    operation.as_str(),
                    json,
                    idempotency_key,
                    created_at.to_rfc3339(),
                ],
            )
            .map_err(db_err)?;

        Ok(OutboxEntry {
            entry_id: self.conn.last_insert_rowid(),
            entity_type: entity,
            entity_id: entity_id.to_string(),
            operation,
            payload: payload.clone(),
            idempotency_key,
            created_at,
            attempt_count: 0,
            last_error: None,
        })
    }

    /// Pending entries for one entity, in replay order.
    pub fn pending_for(&self, entity: EntityType, entity_id: &str) -> Result<Vec<OutboxEntry>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "{ENTRY_COLUMNS} WHERE entity_type = ?1 AND entity_id = ?2 ORDER BY entry_id"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![entity.as_str(), entity_id], raw_entry)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        rows.into_iter().map(entry_from_raw).collect()
    }

    /// Whether the entity has any pending mutation (used by the pull-phase
    /// conflict rule).
    pub fn has_pending(&self, entity: EntityType, entity_id: &str) -> Result<bool> {
        let n: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM outbox WHERE entity_type = ?1 AND entity_id = ?2",
                params![entity.as_str(), entity_id],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(n > 0)
    }

    /// Up to `max_n` entries with `entry_id > after`, ascending.
    ///
    /// FIFO is required: later operations on an entity may depend on earlier
    /// ones having been applied server-side. The cursor keeps a cycle from
    /// re-reading entries it already failed.
    pub fn dequeue_batch(&self, max_n: usize, after: i64) -> Result<Vec<OutboxEntry>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "{ENTRY_COLUMNS} WHERE entry_id > ?1 ORDER BY entry_id LIMIT ?2"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![after, max_n as i64], raw_entry)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        rows.into_iter().map(entry_from_raw).collect()
    }

    /// Remove an entry after the server durably accepted it.
    pub fn acknowledge(&self, entry_id: i64) -> Result<()> {
        let n = self
            .conn
            .execute("DELETE FROM outbox WHERE entry_id = ?1", params![entry_id])
            .map_err(db_err)?;
        if n == 0 {
            return Err(Error::NotFound(format!("Outbox entry {entry_id}")));
        }
        Ok(())
    }

    /// Record a failed attempt, leaving the entry in place for retry.
    pub fn mark_failed(&self, entry_id: i64, error: &str) -> Result<()> {
        let n = self
            .conn
            .execute(
                r#"
                UPDATE outbox
                SET attempt_count = attempt_count + 1, last_error = ?1
                WHERE entry_id = ?2
                "#,
                params![error, entry_id],
            )
            .map_err(db_err)?;
        if n == 0 {
            return Err(Error::NotFound(format!("Outbox entry {entry_id}")));
        }
        Ok(())
    }

    /// Abandon an entry permanently, keeping it visible as a dead letter.
    pub fn move_to_dead_letter(&self, entry_id: i64, reason: &str) -> Result<()> {
        let n = self
            .conn
            .execute(
                r#"
                INSERT INTO dead_letter
                (entry_id, entity_type, entity_id, operation, payload, idempotency_key,
                 created_at, attempt_count, last_error, failed_at, reason)
                SELECT entry_id, entity_type, entity_id, operation, payload, idempotency_key,
                       created_at, attempt_count, last_error, ?1, ?2
                FROM outbox WHERE entry_id = ?3
                "#,
                params![Utc::now().to_rfc3339(), reason, entry_id],
            )
            .map_err(db_err)?;
        if n == 0 {
            return Err(Error::NotFound(format!("Outbox entry {entry_id}")));
        }
        self.conn
            .execute("DELETE FROM outbox WHERE entry_id = ?1", params![entry_id])
            .map_err(db_err)?;
        warn!("Dead-lettered outbox entry {}: {}", entry_id, reason);
        Ok(())
    }

    /// Dead-letter entries that exhausted the retry ceiling and outlived
    /// `max_age`. Returns how many were moved.
    pub fn cleanup_stale(&self, max_age: Duration, max_attempts: u32) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age)
                .map_err(|e| Error::InvalidInput(e.to_string()))?;
        let mut stmt = self
            .conn
            .prepare(
                "SELECT entry_id FROM outbox WHERE attempt_count > ?1 AND created_at < ?2",
            )
            .map_err(db_err)?;
        let stale: Vec<i64> = stmt
            .query_map(params![max_attempts, cutoff.to_rfc3339()], |row| row.get(0))
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;

        for entry_id in &stale {
            self.move_to_dead_letter(*entry_id, "Retry ceiling exceeded")?;
        }
        Ok(stale.len())
    }

    /// All dead letters, oldest failure first.
    pub fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        let mut stmt = self
            .conn
            .prepare(
                r#"
                SELECT entry_id, entity_type, entity_id, operation, payload, idempotency_key,
                       created_at, attempt_count, last_error, failed_at, reason
                FROM dead_letter ORDER BY failed_at
                "#,
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    raw_entry(row)?,
                    row.get::<_, String>(9)?,
                    row.get::<_, String>(10)?,
                ))
            })
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;

        rows.into_iter()
            .map(|(raw, failed_at, reason)| {
                let entry = entry_from_raw(raw)?;
                Ok(DeadLetter {
                    entry_id: entry.entry_id,
                    entity_type: entry.entity_type,
                    entity_id: entry.entity_id,
                    operation: entry.operation,
                    payload: entry.payload,
                    idempotency_key: entry.idempotency_key,
                    created_at: entry.created_at,
                    attempt_count: entry.attempt_count,
                    last_error: entry.last_error,
                    failed_at: parse_ts(&failed_at)?,
                    reason,
                })
            })
            .collect()
    }

    /// Drop a dead letter after the user chose to discard it.
    pub fn discard_dead_letter(&self, entry_id: i64) -> Result<()> {
        let n = self
            .conn
            .execute(
                "DELETE FROM dead_letter WHERE entry_id = ?1",
                params![entry_id],
            )
            .map_err(db_err)?;
        if n == 0 {
            return Err(Error::NotFound(format!("Dead letter {entry_id}")));
        }
        Ok(())
    }

    /// Put a dead letter back on the queue for a fresh round of attempts.
    ///
    /// The idempotency key is preserved so a mutation that actually reached
    /// the server the first time is not applied twice.
    pub fn requeue_dead_letter(&self, entry_id: i64) -> Result<OutboxEntry> {
        let row = self
            .conn
            .query_row(
                r#"
                SELECT entity_type, entity_id, operation, payload, idempotency_key
                FROM dead_letter WHERE entry_id = ?1
                "#,
                params![entry_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| Error::NotFound(format!("Dead letter {entry_id}")))?;

        let (entity_type, entity_id, operation, payload, idempotency_key) = row;
        let created_at = Utc::now();
        self.conn
            .execute(
                r#"
                INSERT INTO outbox
                (entity_type, entity_id, operation, payload, idempotency_key, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    entity_type,
                    entity_id,
                    operation,
                    payload,
                    idempotency_key,
                    created_at.to_rfc3339(),
                ],
            )
            .map_err(db_err)?;
        let new_id = self.conn.last_insert_rowid();
        self.discard_dead_letter(entry_id)?;

        Ok(OutboxEntry {
            entry_id: new_id,
            entity_type: EntityType::from_str(&entity_type)?,
            entity_id,
            operation: Operation::from_str(&operation)?,
            payload: serde_json::from_str(&payload)
                .map_err(|e| Error::Serialization(e.to_string()))?,
            idempotency_key,
            created_at,
            attempt_count: 0,
            last_error: None,
        })
    }
}

/// Convenience handle over the outbox tables of a [`LocalStore`].
///
/// Each call runs in its own transaction; multi-step invariants (a domain
/// write plus its enqueue) go through [`LocalStore::transact`] directly.
#[derive(Clone)]
pub struct OutboxQueue {
    store: LocalStore,
}

impl OutboxQueue {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    pub fn enqueue(
        &self,
        entity: EntityType,
        entity_id: &str,
        operation: Operation,
        payload: serde_json::Value,
    ) -> Result<Option<OutboxEntry>> {
        self.store
            .transact(|tx| tx.enqueue(entity, entity_id, operation, payload))
    }

    pub fn dequeue_batch(&self, max_n: usize, after: i64) -> Result<Vec<OutboxEntry>> {
        self.store.with_view(|view| view.dequeue_batch(max_n, after))
    }

    pub fn acknowledge(&self, entry_id: i64) -> Result<()> {
        self.store.transact(|tx| tx.acknowledge(entry_id))
    }

    pub fn mark_failed(&self, entry_id: i64, error: &str) -> Result<()> {
        self.store.transact(|tx| tx.mark_failed(entry_id, error))
    }

    pub fn move_to_dead_letter(&self, entry_id: i64, reason: &str) -> Result<()> {
        self.store
            .transact(|tx| tx.move_to_dead_letter(entry_id, reason))
    }

    pub fn cleanup_stale(&self, max_age: Duration, max_attempts: u32) -> Result<usize> {
        self.store
            .transact(|tx| tx.cleanup_stale(max_age, max_attempts))
    }

    pub fn has_pending(&self, entity: EntityType, entity_id: &str) -> Result<bool> {
        self.store.with_view(|view| view.has_pending(entity, entity_id))
    }

    pub fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        self.store.with_view(|view| view.dead_letters())
    }

    pub fn discard_dead_letter(&self, entry_id: i64) -> Result<()> {
        self.store.transact(|tx| tx.discard_dead_letter(entry_id))
    }

    pub fn requeue_dead_letter(&self, entry_id: i64) -> Result<OutboxEntry> {
        self.store.transact(|tx| tx.requeue_dead_letter(entry_id))
    }
}

const ENTRY_COLUMNS: &str = "SELECT entry_id, entity_type, entity_id, operation, payload, \
                             idempotency_key, created_at, attempt_count, last_error FROM outbox";

type RawEntry = (
    i64,
    String,
    String,
    String,
    String,
    String,
    String,
    u32,
    Option<String>,
);

fn raw_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawEntry> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn entry_from_raw(raw: RawEntry) -> Result<OutboxEntry> {
    let (
        entry_id,
        entity_type,
        entity_id,
        operation,
        payload,
        idempotency_key,
        created_at,
        attempt_count,
        last_error,
    ) = raw;
    Ok(OutboxEntry {
        entry_id,
        entity_type: EntityType::from_str(&entity_type)?,
        entity_id,
        operation: Operation::from_str(&operation)?,
        payload: serde_json::from_str(&payload)
            .map_err(|e| Error::Serialization(e.to_string()))?,
        idempotency_key,
        created_at: parse_ts(&created_at)?,
        attempt_count,
        last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn queue() -> (LocalStore, OutboxQueue) {
        let store = LocalStore::in_memory().unwrap();
        let outbox = OutboxQueue::new(store.clone());
        (store, outbox)
    }

    #[test]
    fn test_fifo_order() {
        let (_store, outbox) = queue();

        for i in 0..3 {
            outbox
                .enqueue(
                    EntityType::Patient,
                    &format!("p{i}"),
                    Operation::Create,
                    json!({"id": format!("p{i}")}),
                )
                .unwrap();
        }

        let batch = outbox.dequeue_batch(10, 0).unwrap();
        assert_eq!(batch.len(), 3);
        assert!(batch.windows(2).all(|w| w[0].entry_id < w[1].entry_id));
        assert_eq!(batch[0].entity_id, "p0");

        let after = outbox.dequeue_batch(10, batch[0].entry_id).unwrap();
        assert_eq!(after.len(), 2);
        assert_eq!(after[0].entity_id, "p1");
    }

    #[test]
    fn test_updates_coalesce_keeping_key_and_slot() {
        let (_store, outbox) = queue();

        let first = outbox
            .enqueue(
                EntityType::Patient,
                "p1",
                Operation::Update,
                json!({"id": "p1", "village": "Koundara"}),
            )
            .unwrap()
            .unwrap();

        // an unrelated entry lands in between
        outbox
            .enqueue(EntityType::Patient, "p2", Operation::Create, json!({"id": "p2"}))
            .unwrap();

        let second = outbox
            .enqueue(
                EntityType::Patient,
                "p1",
                Operation::Update,
                json!({"id": "p1", "village": "Sambailo"}),
            )
            .unwrap()
            .unwrap();

        assert_eq!(second.entry_id, first.entry_id);
        assert_eq!(second.idempotency_key, first.idempotency_key);

        let batch = outbox.dequeue_batch(10, 0).unwrap();
        assert_eq!(batch.len(), 2);
        let p1 = batch.iter().find(|e| e.entity_id == "p1").unwrap();
        assert_eq!(p1.payload["village"], "Sambailo");
        assert_eq!(p1.entry_id, first.entry_id);
    }

    #[test]
    fn test_update_folds_into_pending_create() {
        let (_store, outbox) = queue();

        let create = outbox
            .enqueue(
                EntityType::Patient,
                "p1",
                Operation::Create,
                json!({"id": "p1", "village": "Koundara"}),
            )
            .unwrap()
            .unwrap();

        let folded = outbox
            .enqueue(
                EntityType::Patient,
                "p1",
                Operation::Update,
                json!({"id": "p1", "village": "Sambailo"}),
            )
            .unwrap()
            .unwrap();

        assert_eq!(folded.entry_id, create.entry_id);
        assert_eq!(folded.operation, Operation::Create);

        let batch = outbox.dequeue_batch(10, 0).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].operation, Operation::Create);
        assert_eq!(batch[0].payload["village"], "Sambailo");
    }

    #[test]
    fn test_delete_cancels_pending_create() {
        let (store, outbox) = queue();

        outbox
            .enqueue(EntityType::Patient, "p1", Operation::Create, json!({"id": "p1"}))
            .unwrap();
        let result = outbox
            .enqueue(EntityType::Patient, "p1", Operation::Delete, json!({"id": "p1"}))
            .unwrap();

        assert!(result.is_none());
        assert_eq!(store.pending_operations().unwrap(), 0);
    }

    #[test]
    fn test_delete_replaces_pending_update() {
        let (_store, outbox) = queue();

        outbox
            .enqueue(EntityType::Patient, "p1", Operation::Update, json!({"id": "p1"}))
            .unwrap();
        let delete = outbox
            .enqueue(EntityType::Patient, "p1", Operation::Delete, json!({"id": "p1"}))
            .unwrap()
            .unwrap();

        let batch = outbox.dequeue_batch(10, 0).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].operation, Operation::Delete);
        assert_eq!(batch[0].entry_id, delete.entry_id);
    }

    #[test]
    fn test_mark_failed_keeps_entry() {
        let (_store, outbox) = queue();

        let entry = outbox
            .enqueue(EntityType::Patient, "p1", Operation::Create, json!({"id": "p1"}))
            .unwrap()
            .unwrap();
        outbox.mark_failed(entry.entry_id, "503 unavailable").unwrap();

        let batch = outbox.dequeue_batch(10, 0).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].attempt_count, 1);
        assert_eq!(batch[0].last_error.as_deref(), Some("503 unavailable"));
    }

    #[test]
    fn test_acknowledge_removes_entry() {
        let (store, outbox) = queue();

        let entry = outbox
            .enqueue(EntityType::Patient, "p1", Operation::Create, json!({"id": "p1"}))
            .unwrap()
            .unwrap();
        outbox.acknowledge(entry.entry_id).unwrap();

        assert_eq!(store.pending_operations().unwrap(), 0);
        assert!(outbox.acknowledge(entry.entry_id).is_err());
    }

    #[test]
    fn test_dead_letter_and_requeue_preserve_key() {
        let (store, outbox) = queue();

        let entry = outbox
            .enqueue(EntityType::Patient, "p1", Operation::Create, json!({"id": "p1"}))
            .unwrap()
            .unwrap();
        outbox
            .move_to_dead_letter(entry.entry_id, "422 missing site_id")
            .unwrap();

        assert_eq!(store.pending_operations().unwrap(), 0);
        let letters = outbox.dead_letters().unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].reason, "422 missing site_id");

        let requeued = outbox.requeue_dead_letter(entry.entry_id).unwrap();
        assert_eq!(requeued.idempotency_key, entry.idempotency_key);
        assert_eq!(requeued.attempt_count, 0);
        assert!(outbox.dead_letters().unwrap().is_empty());
        assert_eq!(store.pending_operations().unwrap(), 1);
    }

    #[test]
    fn test_cleanup_stale_moves_exhausted_entries() {
        let (store, outbox) = queue();

        let entry = outbox
            .enqueue(EntityType::Patient, "p1", Operation::Create, json!({"id": "p1"}))
            .unwrap()
            .unwrap();
        for _ in 0..6 {
            outbox.mark_failed(entry.entry_id, "timeout").unwrap();
        }

        // Entry is young: attempt ceiling alone is not enough.
        assert_eq!(
            outbox
                .cleanup_stale(Duration::from_secs(3600), 5)
                .unwrap(),
            0
        );

        // Zero max_age makes it immediately stale.
        assert_eq!(outbox.cleanup_stale(Duration::ZERO, 5).unwrap(), 1);
        assert_eq!(store.pending_operations().unwrap(), 0);
        assert_eq!(store.dead_letter_count().unwrap(), 1);
    }
}

#[cfg(test)]
mod collapse_laws {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[derive(Debug, Clone)]
    enum Op {
        Create,
        Update(u8),
        Delete,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Create),
            any::<u8>().prop_map(Op::Update),
            Just(Op::Delete),
        ]
    }

    proptest! {
        /// After any sequence of enqueues on one entity, the outbox holds at
        /// most one CREATE-or-UPDATE entry for it, and never a DELETE for an
        /// entity whose CREATE never left the device.
        #[test]
        fn collapsed_outbox_stays_minimal(ops in proptest::collection::vec(op_strategy(), 1..12)) {
            let store = LocalStore::in_memory().unwrap();
            let outbox = OutboxQueue::new(store);

            let mut created_locally = false;
            for op in &ops {
                match op {
                    Op::Create => {
                        outbox.enqueue(
                            EntityType::Patient,
                            "p1",
                            Operation::Create,
                            json!({"id": "p1"}),
                        ).unwrap();
                        created_locally = true;
                    }
                    Op::Update(v) => {
                        outbox.enqueue(
                            EntityType::Patient,
                            "p1",
                            Operation::Update,
                            json!({"id": "p1", "rev": v}),
                        ).unwrap();
                    }
                    Op::Delete => {
                        outbox.enqueue(
                            EntityType::Patient,
                            "p1",
                            Operation::Delete,
                            json!({"id": "p1"}),
                        ).unwrap();
                        created_locally = false;
                    }
                }
            }

            let pending = outbox.dequeue_batch(100, 0).unwrap();
            let upserts = pending.iter()
                .filter(|e| matches!(e.operation, Operation::Create | Operation::Update))
                .count();
            prop_assert!(upserts <= 1);

            let has_create = pending.iter().any(|e| e.operation == Operation::Create);
            let has_delete = pending.iter().any(|e| e.operation == Operation::Delete);
            prop_assert!(!(has_create && has_delete));

            if has_delete {
                // a DELETE only survives when the entity had reached the
                // server before (no locally-pending create)
                prop_assert!(!created_locally || !has_create);
            }
        }
    }
}
