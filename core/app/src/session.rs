//! Login/logout lifecycle around the local store.
//!
//! Login seeds the session row and nothing else: records and the outbox
//! survive a re-login on the same device so unsynced work is preserved.
//! Logout wipes everything, but never while a sync cycle is in flight.

use chrono::Utc;
use std::sync::Arc;
use tracing::info;

use medipost_common::{Error, Result};
use medipost_store::{LocalStore, UserSession};
use medipost_sync::SyncEngine;

pub struct SessionManager {
    store: LocalStore,
    engine: Arc<SyncEngine>,
}

impl SessionManager {
    pub fn new(store: LocalStore, engine: Arc<SyncEngine>) -> Self {
        Self { store, engine }
    }

    /// Seed identity for the signed-in user.
    pub fn login(
        &self,
        id: &str,
        email: &str,
        name: &str,
        role: &str,
        site_id: &str,
    ) -> Result<UserSession> {
        let session = UserSession {
            id: id.to_string(),
            email: email.to_string(),
            name: name.to_string(),
            role: role.to_string(),
            site_id: site_id.to_string(),
            logged_in_at: Utc::now(),
        };
        self.store.save_session(&session)?;
        info!("Session opened for {}", session.email);
        Ok(session)
    }

    /// The signed-in user, if any.
    pub fn current(&self) -> Result<Option<UserSession>> {
        self.store.session()
    }

    /// Wipe all local state.
    ///
    /// Refused while a sync cycle is running: the cycle owns the in-flight
    /// lock and a concurrent wipe would pull the tables out from under it.
    pub fn logout(&self) -> Result<()> {
        if self.engine.is_syncing() {
            return Err(Error::Busy(
                "Cannot log out while a sync cycle is running".to_string(),
            ));
        }
        self.store.clear_all()?;
        info!("Session closed, local data wiped");
        Ok(())
    }
}
