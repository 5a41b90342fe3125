//! Tunable limits and parameters for the storage node.
//!
//! Every knob can be overridden with an environment variable of the same
//! name. Maintenance code does not read these directly: they are collected
//! once into a `MaintenanceConfig` so tests can override fields in place.
use std::{
    sync::LazyLock,
    time::Duration,
};

use cmd_util::env::env_config;

/// Set to false to keep index handles open without ever running populate or
/// cleanup tasks.
pub static INDEX_MAINTENANCE_ENABLED: LazyLock<bool> =
    LazyLock::new(|| env_config("INDEX_MAINTENANCE_ENABLED", true));

/// Records processed per maintenance transaction. Bounds transaction size and
/// lock hold time.
pub static INDEX_MAINTENANCE_BATCH_SIZE: LazyLock<usize> =
    LazyLock::new(|| env_config("INDEX_MAINTENANCE_BATCH_SIZE", 100));

/// Consecutive transient storage failures a maintenance task tolerates before
/// escalating to the node fault handler.
pub static INDEX_MAINTENANCE_MAX_RETRIES: LazyLock<u32> =
    LazyLock::new(|| env_config("INDEX_MAINTENANCE_MAX_RETRIES", 10));

/// Delay between retries of a maintenance batch after a transient failure.
pub static INDEX_MAINTENANCE_RETRY_DELAY: LazyLock<Duration> = LazyLock::new(|| {
    Duration::from_millis(env_config("INDEX_MAINTENANCE_RETRY_DELAY_MS", 1000))
});

/// Delay before the reconciler retries indexes it failed to open or close.
pub static INDEX_RECONCILER_RETRY_DELAY: LazyLock<Duration> = LazyLock::new(|| {
    Duration::from_millis(env_config("INDEX_RECONCILER_RETRY_DELAY_MS", 1000))
});

/// Delay between attempts when the scheduler lock is held by someone else.
pub static INDEX_SCHEDULER_BUSY_RETRY_DELAY: LazyLock<Duration> = LazyLock::new(|| {
    Duration::from_millis(env_config("INDEX_SCHEDULER_BUSY_RETRY_DELAY_MS", 50))
});

pub static INDEX_SCHEDULER_BUSY_MAX_RETRIES: LazyLock<u32> =
    LazyLock::new(|| env_config("INDEX_SCHEDULER_BUSY_MAX_RETRIES", 20));

/// Initial backoff for background workers that wait on the storage
/// environment, eg opening the progress store after gaining leadership.
pub static INDEX_WORKERS_INITIAL_BACKOFF: LazyLock<Duration> = LazyLock::new(|| {
    Duration::from_millis(env_config("INDEX_WORKERS_INITIAL_BACKOFF_MS", 500))
});

/// Number of tokio worker threads. 0 means one per core.
pub static RUNTIME_WORKER_THREADS: LazyLock<usize> =
    LazyLock::new(|| env_config("RUNTIME_WORKER_THREADS", 0));

/// Stack size of runtime threads, including the thread tests run on.
pub static RUNTIME_STACK_SIZE: LazyLock<usize> =
    LazyLock::new(|| env_config("RUNTIME_STACK_SIZE", 4 * 1024 * 1024));
