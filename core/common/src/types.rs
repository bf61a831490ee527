//! Common types used throughout MediPost.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Kind of clinical record handled by the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Patient,
    Encounter,
    Diagnosis,
    MedicationOrder,
    Procedure,
    Referral,
}

impl EntityType {
    /// All entity types, in dependency order (parents before children).
    pub const ALL: [EntityType; 6] = [
        EntityType::Patient,
        EntityType::Encounter,
        EntityType::Diagnosis,
        EntityType::MedicationOrder,
        EntityType::Procedure,
        EntityType::Referral,
    ];

    /// Stable string tag used in storage and on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Patient => "patient",
            EntityType::Encounter => "encounter",
            EntityType::Diagnosis => "diagnosis",
            EntityType::MedicationOrder => "medication_order",
            EntityType::Procedure => "procedure",
            EntityType::Referral => "referral",
        }
    }

    /// REST collection segment for this entity type.
    pub fn collection_path(&self) -> &'static str {
        match self {
            EntityType::Patient => "patients",
            EntityType::Encounter => "encounters",
            EntityType::Diagnosis => "diagnoses",
            EntityType::MedicationOrder => "medication-orders",
            EntityType::Procedure => "procedures",
            EntityType::Referral => "referrals",
        }
    }

    /// Fields of this entity that hold the id of another entity.
    ///
    /// Children created offline reference their parent through these fields;
    /// when the parent's CREATE is acknowledged with a server-assigned id,
    /// every listed field is rewritten along with the parent's own key.
    pub fn reference_fields(&self) -> &'static [(&'static str, EntityType)] {
        match self {
            EntityType::Patient => &[],
            EntityType::Encounter => &[("patient_id", EntityType::Patient)],
            EntityType::Diagnosis => &[("encounter_id", EntityType::Encounter)],
            EntityType::MedicationOrder => &[("encounter_id", EntityType::Encounter)],
            EntityType::Procedure => &[("encounter_id", EntityType::Encounter)],
            EntityType::Referral => &[("encounter_id", EntityType::Encounter)],
        }
    }

    /// Entity types (and the field name) that reference `target`.
    pub fn referencing(target: EntityType) -> Vec<(EntityType, &'static str)> {
        let mut out = Vec::new();
        for entity in EntityType::ALL {
            for (field, referenced) in entity.reference_fields() {
                if *referenced == target {
                    out.push((entity, *field));
                }
            }
        }
        out
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "patient" => Ok(EntityType::Patient),
            "encounter" => Ok(EntityType::Encounter),
            "diagnosis" => Ok(EntityType::Diagnosis),
            "medication_order" => Ok(EntityType::MedicationOrder),
            "procedure" => Ok(EntityType::Procedure),
            "referral" => Ok(EntityType::Referral),
            other => Err(Error::InvalidInput(format!(
                "Unknown entity type: {other}"
            ))),
        }
    }
}

/// Kind of pending mutation carried by an outbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    /// Stable string tag used in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Operation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Operation::Create),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(Error::InvalidInput(format!("Unknown operation: {other}"))),
        }
    }
}
