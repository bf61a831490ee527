//! Durable local storage for MediPost.
//!
//! This module is the system of record on the device: clinical records, the
//! pending-write outbox, the dead-letter table and sync metadata all live in
//! one SQLite database, accessed through scoped transactions so that a domain
//! write and the outbox entry describing it commit atomically.
//!
//! # Design Principles
//! - Single owner: only this crate touches the database schema
//! - Atomicity: a record write and its outbox entry are one transaction
//! - Nothing swallowed: every storage-engine error reaches the caller

pub mod outbox;
pub mod schema;
pub mod store;

pub use outbox::{DeadLetter, OutboxEntry, OutboxQueue};
pub use store::{ListFilter, LocalStore, Record, StoreTx, UserSession};
