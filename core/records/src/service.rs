//! Presentation-facing read/write path over the local store.
//!
//! Writes are optimistic: the record lands locally first, paired in the same
//! transaction with the outbox entry that will replay it to the server. An
//! optional write hook lets the application recompute the status feed and
//! nudge the sync scheduler after each mutation without this crate knowing
//! about either.

use std::sync::Arc;
use tracing::debug;

use medipost_common::{EntityType, Error, Operation, Result};
use medipost_store::{LocalStore, Record};

use crate::entities::{Diagnosis, Encounter, Entity, MedicationOrder, Patient, Procedure, Referral};

type WriteHook = Arc<dyn Fn() + Send + Sync>;

/// Full view of one encounter.
#[derive(Debug, Clone)]
pub struct EncounterDetails {
    pub encounter: Encounter,
    pub diagnoses: Vec<Diagnosis>,
    pub medication_orders: Vec<MedicationOrder>,
    pub procedures: Vec<Procedure>,
    pub referral: Option<Referral>,
}

/// The write path presentation layers use.
#[derive(Clone)]
pub struct RecordService {
    store: LocalStore,
    write_hook: Option<WriteHook>,
}

impl RecordService {
    pub fn new(store: LocalStore) -> Self {
        Self {
            store,
            write_hook: None,
        }
    }

    /// Install a callback invoked after every committed mutation.
    pub fn with_write_hook(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.write_hook = Some(Arc::new(hook));
        self
    }

    /// Create an entity locally and queue its CREATE.
    pub fn create<E: Entity>(&self, entity: &E) -> Result<Record> {
        let data = serde_json::to_value(entity)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        let record = self.store.transact(|tx| {
            let record = tx.put(E::ENTITY_TYPE, entity.id(), &data)?;
            tx.enqueue(
                E::ENTITY_TYPE,
                entity.id(),
                Operation::Create,
                outbox_payload(&data, record.version),
            )?;
            Ok(record)
        })?;
        debug!("Created {} {}", E::ENTITY_TYPE, entity.id());
        self.after_write();
        Ok(record)
    }

    /// Update an entity locally and queue (or coalesce) its UPDATE.
    pub fn update<E: Entity>(&self, entity: &E) -> Result<Record> {
        let data = serde_json::to_value(entity)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        let record = self.store.transact(|tx| {
            if tx.get(E::ENTITY_TYPE, entity.id())?.is_none() {
                return Err(Error::NotFound(format!(
                    "{} {}",
                    E::ENTITY_TYPE,
                    entity.id()
                )));
            }
            let record = tx.put(E::ENTITY_TYPE, entity.id(), &data)?;
            tx.enqueue(
                E::ENTITY_TYPE,
                entity.id(),
                Operation::Update,
                outbox_payload(&data, record.version),
            )?;
            Ok(record)
        })?;
        debug!("Updated {} {}", E::ENTITY_TYPE, entity.id());
        self.after_write();
        Ok(record)
    }

    /// Delete an entity locally and queue its DELETE (which may cancel a
    /// pending CREATE outright).
    pub fn delete(&self, entity: EntityType, id: &str) -> Result<()> {
        self.store.transact(|tx| {
            tx.delete_record(entity, id)?;
            tx.enqueue(
                entity,
                id,
                Operation::Delete,
                serde_json::json!({ "id": id }),
            )?;
            Ok(())
        })?;
        debug!("Deleted {} {}", entity, id);
        self.after_write();
        Ok(())
    }

    /// Read one entity.
    pub fn get<E: Entity>(&self, id: &str) -> Result<Option<E>> {
        match self.store.get(E::ENTITY_TYPE, id)? {
            Some(record) => decode::<E>(record).map(Some),
            None => Ok(None),
        }
    }

    /// Read all entities of one type.
    pub fn list<E: Entity>(&self) -> Result<Vec<E>> {
        self.store
            .list(E::ENTITY_TYPE)?
            .into_iter()
            .map(decode::<E>)
            .collect()
    }

    /// Substring search over name, phone and village.
    pub fn search_patients(&self, query: &str, limit: usize) -> Result<Vec<Patient>> {
        let needle = query.to_lowercase();
        let mut matches = Vec::new();
        for patient in self.list::<Patient>()? {
            let hit = patient.family_name.to_lowercase().contains(&needle)
                || patient
                    .given_name
                    .as_deref()
                    .is_some_and(|n| n.to_lowercase().contains(&needle))
                || patient.phone.as_deref().is_some_and(|p| p.contains(query))
                || patient
                    .village
                    .as_deref()
                    .is_some_and(|v| v.to_lowercase().contains(&needle));
            if hit {
                matches.push(patient);
                if matches.len() >= limit {
                    break;
                }
            }
        }
        Ok(matches)
    }

    /// A patient's encounters, most recent first.
    pub fn patient_encounters(&self, patient_id: &str) -> Result<Vec<Encounter>> {
        let mut encounters: Vec<Encounter> = self
            .list::<Encounter>()?
            .into_iter()
            .filter(|e| e.patient_id == patient_id)
            .collect();
        encounters.sort_by(|a, b| b.date.cmp(&a.date));
        Ok(encounters)
    }

    /// Everything recorded under one encounter.
    pub fn encounter_details(&self, encounter_id: &str) -> Result<Option<EncounterDetails>> {
        let Some(encounter) = self.get::<Encounter>(encounter_id)? else {
            return Ok(None);
        };

        let diagnoses = self
            .list::<Diagnosis>()?
            .into_iter()
            .filter(|d| d.encounter_id == encounter_id)
            .collect();
        let medication_orders = self
            .list::<MedicationOrder>()?
            .into_iter()
            .filter(|m| m.encounter_id == encounter_id)
            .collect();
        let procedures = self
            .list::<Procedure>()?
            .into_iter()
            .filter(|p| p.encounter_id == encounter_id)
            .collect();
        let referral = self
            .list::<Referral>()?
            .into_iter()
            .find(|r| r.encounter_id == encounter_id);

        Ok(Some(EncounterDetails {
            encounter,
            diagnoses,
            medication_orders,
            procedures,
            referral,
        }))
    }

    fn after_write(&self) {
        if let Some(hook) = &self.write_hook {
            hook();
        }
    }
}

/// The payload transmitted for a mutation: the entity snapshot plus the
/// record version the server adopts on acknowledgment.
fn outbox_payload(data: &serde_json::Value, version: i64) -> serde_json::Value {
    let mut payload = data.clone();
    if let Some(obj) = payload.as_object_mut() {
        obj.insert("version".to_string(), serde_json::Value::from(version));
    }
    payload
}

fn decode<E: Entity>(record: Record) -> Result<E> {
    serde_json::from_value(record.data).map_err(|e| Error::Serialization(e.to_string()))
}
