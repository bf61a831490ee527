//! Application configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use medipost_common::{Error, Result};

/// Configuration loaded at startup (JSON file or defaults).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Path to the local SQLite database.
    pub database_path: PathBuf,
    /// Base URL of the central server API.
    pub server_url: String,
    /// Timeout applied to every remote request, in seconds.
    pub request_timeout_secs: u64,
    /// Timeout for the connectivity probe, in seconds.
    pub probe_timeout_secs: u64,
    /// Hysteresis window before connectivity changes reach subscribers, in
    /// milliseconds.
    pub debounce_ms: u64,
    /// Background sync interval, in seconds. Zero disables the timer.
    pub sync_interval_secs: u64,
    /// Outbox entries fetched per push batch.
    pub outbox_batch_size: usize,
    /// Attempt ceiling before an old entry is dead-lettered.
    pub max_attempts: u32,
    /// Age (hours) past which an exhausted entry is dead-lettered.
    pub stale_age_hours: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: default_data_dir().join("medipost.db"),
            server_url: "https://sync.medipost.example".to_string(),
            request_timeout_secs: 15,
            probe_timeout_secs: 3,
            debounce_ms: 1500,
            sync_interval_secs: 60,
            outbox_batch_size: 25,
            max_attempts: 5,
            stale_age_hours: 168,
        }
    }
}

impl AppConfig {
    /// Load from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&content)
    }

    /// Persist to a JSON file, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path.as_ref(), self.to_json()?)?;
        Ok(())
    }

    /// Serialize configuration to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn sync_interval(&self) -> Option<Duration> {
        (self.sync_interval_secs > 0).then(|| Duration::from_secs(self.sync_interval_secs))
    }

    pub fn stale_age(&self) -> Duration {
        Duration::from_secs(self.stale_age_hours * 3600)
    }
}

/// Default data directory for the device.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("medipost")
}
