use std::time::Duration;

use common::knobs::{
    INDEX_MAINTENANCE_BATCH_SIZE,
    INDEX_MAINTENANCE_ENABLED,
    INDEX_MAINTENANCE_MAX_RETRIES,
    INDEX_MAINTENANCE_RETRY_DELAY,
    INDEX_RECONCILER_RETRY_DELAY,
    INDEX_SCHEDULER_BUSY_MAX_RETRIES,
    INDEX_SCHEDULER_BUSY_RETRY_DELAY,
    INDEX_WORKERS_INITIAL_BACKOFF,
};

/// Tunables for index maintenance, read once from the knobs.
#[derive(Clone, Debug)]
pub struct MaintenanceConfig {
    /// When false handles are still opened and kept current, but no
    /// maintenance task ever starts.
    pub enabled: bool,
    pub batch_size: usize,
    /// Consecutive transient failures of one task before it gives up.
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub reconciler_retry_delay: Duration,
    pub busy_retry_delay: Duration,
    pub busy_max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: *INDEX_MAINTENANCE_ENABLED,
            batch_size: *INDEX_MAINTENANCE_BATCH_SIZE,
            max_retries: *INDEX_MAINTENANCE_MAX_RETRIES,
            retry_delay: *INDEX_MAINTENANCE_RETRY_DELAY,
            reconciler_retry_delay: *INDEX_RECONCILER_RETRY_DELAY,
            busy_retry_delay: *INDEX_SCHEDULER_BUSY_RETRY_DELAY,
            busy_max_retries: *INDEX_SCHEDULER_BUSY_MAX_RETRIES,
            initial_backoff: *INDEX_WORKERS_INITIAL_BACKOFF,
            max_backoff: Duration::from_secs(30),
        }
    }
}
