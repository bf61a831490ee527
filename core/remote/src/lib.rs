//! Remote API client for the central MediPost server.
//!
//! The sync engine talks to the server exclusively through the [`RemoteApi`]
//! trait: per-entity mutations carrying an idempotency key the server must
//! honor, plus a `changes_since` feed for the pull phase. Two
//! implementations live here — the production HTTP client and an in-memory
//! mock used by tests and demos.

pub mod api;
pub mod http;
pub mod mock;

pub use api::{PullBatch, PushAck, RemoteApi, RemoteRecord};
pub use http::HttpRemoteApi;
pub use mock::{MockFailure, MockRemoteApi};
