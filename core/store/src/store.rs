//! The local store: records, sync metadata and the user session.
//!
//! All writes go through [`LocalStore::transact`], which hands the caller a
//! [`StoreTx`] view over a SQLite transaction. Everything done through the
//! view commits together or not at all, so a reader never observes a domain
//! write without its outbox entry.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use medipost_common::{EntityType, Error, Result};

use crate::schema;

/// Envelope around one stored domain entity.
///
/// The entity-specific fields live in `data`; the envelope carries the
/// bookkeeping the sync engine needs. `version` never decreases, and
/// `synced == true` means `version` equals the last server-acknowledged
/// version of this record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub entity_type: EntityType,
    pub id: String,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
    pub synced: bool,
    pub data: serde_json::Value,
}

/// The signed-in user, seeded at login.
///
/// Login only writes this row; records and the outbox survive a re-login on
/// the same device so unsynced work is preserved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSession {
    pub id: String,
    pub email: String,
    pub name: String,
    pub role: String,
    pub site_id: String,
    pub logged_in_at: DateTime<Utc>,
}

/// Filter for record listings.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    /// Restrict to synced (`Some(true)`) or unsynced (`Some(false)`) records.
    pub synced: Option<bool>,
    /// Cap the number of rows returned.
    pub limit: Option<usize>,
}

/// Handle to the device-local SQLite database.
///
/// Cheap to clone; all clones share one connection behind a mutex.
#[derive(Clone)]
pub struct LocalStore {
    conn: Arc<Mutex<Connection>>,
}

impl LocalStore {
    /// Open (or create) the database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).map_err(db_err)?;
        schema::init(&conn)?;
        info!("Local store opened at {}", path.as_ref().display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        schema::init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("Store mutex poisoned".to_string()))
    }

    /// Run `f` inside a write transaction.
    ///
    /// Every operation performed through the [`StoreTx`] commits atomically;
    /// if `f` returns an error the transaction rolls back and the error is
    /// passed through untouched.
    pub fn transact<T>(&self, f: impl FnOnce(&StoreTx<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;
        let result = f(&StoreTx { conn: &tx });
        match result {
            Ok(value) => {
                tx.commit().map_err(db_err)?;
                Ok(value)
            }
            Err(e) => Err(e),
        }
    }

    /// Run a read-only closure against the live connection.
    pub(crate) fn with_view<T>(&self, f: impl FnOnce(&StoreTx<'_>) -> Result<T>) -> Result<T> {
        let conn = self.lock()?;
        f(&StoreTx { conn: &conn })
    }

    /// Read the current local view of a record.
    pub fn get(&self, entity: EntityType, id: &str) -> Result<Option<Record>> {
        self.with_view(|view| view.get(entity, id))
    }

    /// List all records of one entity type, most recently updated first.
    pub fn list(&self, entity: EntityType) -> Result<Vec<Record>> {
        self.with_view(|view| view.list(entity))
    }

    /// List records of one entity type matching the filter.
    pub fn list_filtered(&self, entity: EntityType, filter: &ListFilter) -> Result<Vec<Record>> {
        self.with_view(|view| view.list_filtered(entity, filter))
    }

    /// Upsert a record outside any larger transaction.
    pub fn put(&self, entity: EntityType, id: &str, data: &serde_json::Value) -> Result<Record> {
        self.transact(|tx| tx.put(entity, id, data))
    }

    /// Number of live outbox entries.
    pub fn pending_operations(&self) -> Result<u64> {
        self.with_view(|view| view.count("SELECT COUNT(*) FROM outbox"))
    }

    /// Number of records not yet acknowledged by the server.
    pub fn unsynced_entities(&self) -> Result<u64> {
        self.with_view(|view| view.count("SELECT COUNT(*) FROM records WHERE synced = 0"))
    }

    /// Number of dead-lettered entries awaiting operator action.
    pub fn dead_letter_count(&self) -> Result<u64> {
        self.with_view(|view| view.count("SELECT COUNT(*) FROM dead_letter"))
    }

    /// The pull cursor: server time of the last fully-applied pull.
    pub fn last_sync_at(&self) -> Result<Option<DateTime<Utc>>> {
        self.with_view(|view| view.last_sync_at())
    }

    /// Current user session, if any.
    pub fn session(&self) -> Result<Option<UserSession>> {
        self.with_view(|view| view.session())
    }

    /// Seed the session row at login. Does not touch records or the outbox.
    pub fn save_session(&self, session: &UserSession) -> Result<()> {
        self.transact(|tx| tx.save_session(session))
    }

    /// Wipe records, outbox, dead letters, sync metadata and the session.
    ///
    /// Logout only. Callers must not invoke this while a sync cycle is in
    /// flight; the session layer enforces that rule.
    pub fn clear_all(&self) -> Result<()> {
        self.transact(|tx| {
            for table in [
                "records",
                "outbox",
                "dead_letter",
                "sync_meta",
                "user_session",
            ] {
                tx.conn
                    .execute(&format!("DELETE FROM {table}"), [])
                    .map_err(db_err)?;
            }
            Ok(())
        })?;
        info!("Local store cleared");
        Ok(())
    }
}

/// View over a store transaction (or, for reads, the live connection).
pub struct StoreTx<'c> {
    pub(crate) conn: &'c Connection,
}

impl<'c> StoreTx<'c> {
    /// Upsert a record by id, bumping its version and clearing `synced`.
    ///
    /// This is the path for local (user) writes; server-confirmed state goes
    /// through [`StoreTx::put_synced`] instead.
    pub fn put(
        &self,
        entity: EntityType,
        id: &str,
        data: &serde_json::Value,
    ) -> Result<Record> {
        let current_version: Option<i64> = self
            .conn
            .query_row(
                "SELECT version FROM records WHERE entity_type = ?1 AND id = ?2",
                params![entity.as_str(), id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;

        let record = Record {
            entity_type: entity,
            id: id.to_string(),
            version: current_version.unwrap_or(0) + 1,
            updated_at: Utc::now(),
            synced: false,
            data: data.clone(),
        };

        self.write_record(&record)?;
        debug!("Put {} {} v{}", entity, id, record.version);
        Ok(record)
    }

    /// Apply server-confirmed state verbatim, marked synced.
    ///
    /// The version must not regress; callers check before applying.
    pub fn put_synced(&self, record: &Record) -> Result<()> {
        let current_version: Option<i64> = self
            .conn
            .query_row(
                "SELECT version FROM records WHERE entity_type = ?1 AND id = ?2",
                params![record.entity_type.as_str(), record.id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        if let Some(current) = current_version {
            if record.version < current {
                return Err(Error::InvalidInput(format!(
                    "Refusing to regress {} {} from v{current} to v{}",
                    record.entity_type, record.id, record.version
                )));
            }
        }

        let mut synced = record.clone();
        synced.synced = true;
        self.write_record(&synced)
    }

    fn write_record(&self, record: &Record) -> Result<()> {
        let data = serde_json::to_string(&record.data)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        self.conn
            .execute(
                r#"
                INSERT OR REPLACE INTO records
                (entity_type, id, version, updated_at, synced, data)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    record.entity_type.as_str(),
                    record.id,
                    record.version,
                    record.updated_at.to_rfc3339(),
                    record.synced as i32,
                    data,
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    /// Mark a record as acknowledged at the given server version.
    pub fn mark_synced(&self, entity: EntityType, id: &str, version: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE records SET synced = 1, version = ?1 WHERE entity_type = ?2 AND id = ?3",
                params![version, entity.as_str(), id],
            )
            .map_err(db_err)?;
        Ok(())
    }

    /// Get a record by id.
    pub fn get(&self, entity: EntityType, id: &str) -> Result<Option<Record>> {
        let row = self
            .conn
            .query_row(
                r#"
                SELECT entity_type, id, version, updated_at, synced, data
                FROM records WHERE entity_type = ?1 AND id = ?2
                "#,
                params![entity.as_str(), id],
                raw_record,
            )
            .optional()
            .map_err(db_err)?;
        row.map(record_from_raw).transpose()
    }

    /// List records of one entity type, most recently updated first.
    pub fn list(&self, entity: EntityType) -> Result<Vec<Record>> {
        self.list_filtered(entity, &ListFilter::default())
    }

    /// List records of one entity type matching the filter.
    pub fn list_filtered(&self, entity: EntityType, filter: &ListFilter) -> Result<Vec<Record>> {
        let mut sql = String::from(
            "SELECT entity_type, id, version, updated_at, synced, data \
             FROM records WHERE entity_type = ?1",
        );
        if let Some(synced) = filter.synced {
            sql.push_str(if synced { " AND synced = 1" } else { " AND synced = 0" });
        }
        sql.push_str(" ORDER BY updated_at DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut stmt = self.conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params![entity.as_str()], raw_record)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        rows.into_iter().map(record_from_raw).collect()
    }

    /// Remove a record. Missing records are not an error: a pulled deletion
    /// may race a local delete.
    pub fn delete_record(&self, entity: EntityType, id: &str) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM records WHERE entity_type = ?1 AND id = ?2",
                params![entity.as_str(), id],
            )
            .map_err(db_err)?;
        Ok(())
    }

    /// Rewrite a client-local id to the server-assigned one.
    ///
    /// Covers the record's own key, the `id` field inside its data, every
    /// declared reference field in dependent records, and the same fields in
    /// pending outbox payloads, so queued child operations push with the
    /// confirmed parent id.
    pub fn rewrite_entity_id(
        &self,
        entity: EntityType,
        old_id: &str,
        new_id: &str,
    ) -> Result<()> {
        if old_id == new_id {
            return Ok(());
        }

        self.conn
            .execute(
                "UPDATE records SET id = ?1 WHERE entity_type = ?2 AND id = ?3",
                params![new_id, entity.as_str(), old_id],
            )
            .map_err(db_err)?;

        if let Some(mut record) = self.get(entity, new_id)? {
            if rewrite_field(&mut record.data, "id", old_id, new_id) {
                self.update_record_data(entity, new_id, &record.data)?;
            }
        }

        for (child, field) in EntityType::referencing(entity) {
            for mut record in self.list(child)? {
                if rewrite_field(&mut record.data, field, old_id, new_id) {
                    self.update_record_data(child, &record.id, &record.data)?;
                }
            }
            self.rewrite_outbox_payloads(child, field, old_id, new_id)?;
        }

        // Entries queued against the entity itself (a DELETE enqueued after
        // the CREATE was acknowledged) follow the new id as well.
        self.conn
            .execute(
                "UPDATE outbox SET entity_id = ?1 WHERE entity_type = ?2 AND entity_id = ?3",
                params![new_id, entity.as_str(), old_id],
            )
            .map_err(db_err)?;
        self.rewrite_outbox_payloads(entity, "id", old_id, new_id)?;

        debug!("Rewrote {} id {} -> {}", entity, old_id, new_id);
        Ok(())
    }

    fn update_record_data(
        &self,
        entity: EntityType,
        id: &str,
        data: &serde_json::Value,
    ) -> Result<()> {
        let json =
            serde_json::to_string(data).map_err(|e| Error::Serialization(e.to_string()))?;
        self.conn
            .execute(
                "UPDATE records SET data = ?1 WHERE entity_type = ?2 AND id = ?3",
                params![json, entity.as_str(), id],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn rewrite_outbox_payloads(
        &self,
        entity: EntityType,
        field: &str,
        old_id: &str,
        new_id: &str,
    ) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare("SELECT entry_id, payload FROM outbox WHERE entity_type = ?1")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![entity.as_str()], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;

        for (entry_id, payload) in rows {
            let mut value: serde_json::Value = serde_json::from_str(&payload)
                .map_err(|e| Error::Serialization(e.to_string()))?;
            if rewrite_field(&mut value, field, old_id, new_id) {
                let json = serde_json::to_string(&value)
                    .map_err(|e| Error::Serialization(e.to_string()))?;
                self.conn
                    .execute(
                        "UPDATE outbox SET payload = ?1 WHERE entry_id = ?2",
                        params![json, entry_id],
                    )
                    .map_err(db_err)?;
            }
        }
        Ok(())
    }

    /// Pull cursor, if a pull has completed before.
    pub fn last_sync_at(&self) -> Result<Option<DateTime<Utc>>> {
        let value: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM sync_meta WHERE key = 'last_sync_at'",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        value.map(|v| parse_ts(&v)).transpose()
    }

    /// Advance the pull cursor. Only called once a pull batch fully applied.
    pub fn set_last_sync_at(&self, at: DateTime<Utc>) -> Result<()> {
        self.conn
            .execute(
                r#"
                INSERT OR REPLACE INTO sync_meta (key, value, updated_at)
                VALUES ('last_sync_at', ?1, ?2)
                "#,
                params![at.to_rfc3339(), Utc::now().to_rfc3339()],
            )
            .map_err(db_err)?;
        Ok(())
    }

    /// Current user session, if any.
    pub fn session(&self) -> Result<Option<UserSession>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, email, name, role, site_id, logged_in_at FROM user_session",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err)?;

        row.map(|(id, email, name, role, site_id, logged_in_at)| {
            Ok(UserSession {
                id,
                email,
                name,
                role,
                site_id,
                logged_in_at: parse_ts(&logged_in_at)?,
            })
        })
        .transpose()
    }

    /// Replace the session row.
    pub fn save_session(&self, session: &UserSession) -> Result<()> {
        // one session per device
        self.conn
            .execute("DELETE FROM user_session", [])
            .map_err(db_err)?;
        self.conn
            .execute(
                r#"
                INSERT INTO user_session (id, email, name, role, site_id, logged_in_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    session.id,
                    session.email,
                    session.name,
                    session.role,
                    session.site_id,
                    session.logged_in_at.to_rfc3339(),
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub(crate) fn count(&self, sql: &str) -> Result<u64> {
        let n: i64 = self.conn.query_row(sql, [], |row| row.get(0)).map_err(db_err)?;
        Ok(n as u64)
    }
}

type RawRecord = (String, String, i64, String, i32, String);

fn raw_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn record_from_raw(raw: RawRecord) -> Result<Record> {
    let (entity_type, id, version, updated_at, synced, data) = raw;
    Ok(Record {
        entity_type: EntityType::from_str(&entity_type)?,
        id,
        version,
        updated_at: parse_ts(&updated_at)?,
        synced: synced != 0,
        data: serde_json::from_str(&data).map_err(|e| Error::Serialization(e.to_string()))?,
    })
}

/// Replace `field` in a JSON object if it currently equals `old_id`.
fn rewrite_field(
    value: &mut serde_json::Value,
    field: &str,
    old_id: &str,
    new_id: &str,
) -> bool {
    if let Some(obj) = value.as_object_mut() {
        if obj.get(field).and_then(|v| v.as_str()) == Some(old_id) {
            obj.insert(field.to_string(), serde_json::Value::String(new_id.to_string()));
            return true;
        }
    }
    false
}

pub(crate) fn db_err(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Serialization(format!("Bad timestamp {s}: {e}")))
}
