//! Clinical domain entities and the presentation-facing record service.
//!
//! The only write path presentation layers may use: every mutation commits
//! the domain write and its outbox entry in one transaction, so a crash can
//! never leave a write without the pending operation that will carry it to
//! the server.

pub mod entities;
pub mod service;

pub use entities::{
    new_client_id, Diagnosis, Encounter, Entity, MedicationOrder, Patient, Procedure, Referral,
    ReferralStatus, Sex,
};
pub use service::{EncounterDetails, RecordService};
