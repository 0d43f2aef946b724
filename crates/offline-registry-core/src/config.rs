//! Sync configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for the sync queue processor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncConfig {
    /// Attempts allowed before an item is marked failed
    pub max_retries: u32,
    /// First backoff delay
    pub base_delay_ms: u64,
    /// Upper bound on any backoff delay
    pub max_delay_ms: u64,
    /// Per remote call timeout
    pub request_timeout_ms: u64,
    /// Items processed concurrently
    pub worker_limit: usize,
    /// Periodic pass interval while online
    pub poll_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            request_timeout_ms: 15_000,
            worker_limit: 4,
            poll_interval_ms: 30_000,
        }
    }
}

impl SyncConfig {
    /// Parse from JSON; missing keys take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn worker_limit(&self) -> usize {
        self.worker_limit.max(1)
    }
}
