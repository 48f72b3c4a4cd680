//! Coordinator and gateway configuration.

use std::time::Duration;

/// Sync configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Upper bound for every remote call (query, subscribe, write, delete)
    pub remote_timeout: Duration,
    /// Buffered commands (refresh / re-project) for the conversations worker
    pub command_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            remote_timeout: Duration::from_secs(10),
            command_capacity: 64,
        }
    }
}

impl SyncConfig {
    /// Short timeouts so tests fail fast.
    pub fn for_testing() -> Self {
        Self {
            remote_timeout: Duration::from_millis(500),
            command_capacity: 16,
        }
    }

    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = timeout;
        self
    }
}
