//! Typed clinical entities.
//!
//! Each entity carries its own stable `id`; ids generated on the device are
//! prefixed `local-` and rewritten to the server-assigned id when the CREATE
//! is acknowledged. Reference fields (`patient_id`, `encounter_id`) are
//! declared in [`EntityType::reference_fields`] so the rewrite can follow
//! them.

use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use medipost_common::EntityType;

/// Generate a client-local id for an entity created offline.
pub fn new_client_id() -> String {
    format!("local-{}", Uuid::new_v4())
}

/// A domain entity the sync engine can store and transmit.
pub trait Entity: Serialize + DeserializeOwned {
    const ENTITY_TYPE: EntityType;

    fn id(&self) -> &str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sex {
    #[serde(rename = "M")]
    Male,
    #[serde(rename = "F")]
    Female,
}

/// A person registered at the health post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patient {
    pub id: String,
    pub family_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub given_name: Option<String>,
    pub sex: Sex,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub birth_year: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub village: Option<String>,
    pub site_id: String,
    /// Paper-register number carried over from the post's ledger.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_no: Option<String>,
}

impl Entity for Patient {
    const ENTITY_TYPE: EntityType = EntityType::Patient;

    fn id(&self) -> &str {
        &self.id
    }
}

/// One consultation visit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Encounter {
    pub id: String,
    pub patient_id: String,
    pub site_id: String,
    pub clinician_id: String,
    pub date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature_c: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pulse_bpm: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub systolic_mmhg: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diastolic_mmhg: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight_kg: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height_cm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl Entity for Encounter {
    const ENTITY_TYPE: EntityType = EntityType::Encounter;

    fn id(&self) -> &str {
        &self.id
    }
}

/// A diagnosis made during an encounter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub id: String,
    pub encounter_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icd10_code: Option<String>,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl Entity for Diagnosis {
    const ENTITY_TYPE: EntityType = EntityType::Diagnosis;

    fn id(&self) -> &str {
        &self.id
    }
}

/// A prescription issued during an encounter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MedicationOrder {
    pub id: String,
    pub encounter_id: String,
    pub medication: String,
    pub dosage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_days: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl Entity for MedicationOrder {
    const ENTITY_TYPE: EntityType = EntityType::MedicationOrder;

    fn id(&self) -> &str {
        &self.id
    }
}

/// A procedure performed during an encounter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Procedure {
    pub id: String,
    pub encounter_id: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
}

impl Entity for Procedure {
    const ENTITY_TYPE: EntityType = EntityType::Procedure;

    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferralStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
}

/// A referral to a district facility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Referral {
    pub id: String,
    pub encounter_id: String,
    pub destination: String,
    pub reason: String,
    pub status: ReferralStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_at: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl Entity for Referral {
    const ENTITY_TYPE: EntityType = EntityType::Referral;

    fn id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patient_serde_round_trip() {
        let patient = Patient {
            id: new_client_id(),
            family_name: "Diallo".to_string(),
            given_name: Some("Fatou".to_string()),
            sex: Sex::Female,
            birth_year: Some(1987),
            phone: None,
            village: Some("Koundara".to_string()),
            site_id: "site-4".to_string(),
            registration_no: None,
        };

        let json = serde_json::to_value(&patient).unwrap();
        assert_eq!(json["sex"], "F");
        assert!(json.get("phone").is_none());

        let back: Patient = serde_json::from_value(json).unwrap();
        assert_eq!(back, patient);
    }

    #[test]
    fn test_client_ids_are_marked_local() {
        assert!(new_client_id().starts_with("local-"));
    }

    #[test]
    fn test_reference_fields_match_struct_fields() {
        // the declared reference fields must exist in the serialized form,
        // otherwise the id rewrite silently misses them
        let encounter = Encounter {
            id: "e1".to_string(),
            patient_id: "p1".to_string(),
            site_id: "s1".to_string(),
            clinician_id: "u1".to_string(),
            date: NaiveDate::from_ymd_opt(2025, 3, 14).unwrap(),
            reason: None,
            temperature_c: None,
            pulse_bpm: None,
            systolic_mmhg: None,
            diastolic_mmhg: None,
            weight_kg: None,
            height_cm: None,
            notes: None,
        };
        let json = serde_json::to_value(&encounter).unwrap();
        for (field, _) in EntityType::Encounter.reference_fields() {
            assert!(json.get(*field).is_some(), "missing {field}");
        }
    }
}
