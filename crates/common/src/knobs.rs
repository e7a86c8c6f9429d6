//! Tunable operational parameters. Every knob can be overridden with an
//! environment variable of the same name; defaults are chosen for a typical
//! restore against a colocated server.

use std::{
    sync::LazyLock,
    time::Duration,
};

use crate::env::env_config;

/// Max retries for a data job that fails because its target object is not yet
/// visible on the worker's connection.
pub static OBJECT_MISSING_MAX_RETRIES: LazyLock<u32> =
    LazyLock::new(|| env_config("PARLOAD_OBJECT_MISSING_MAX_RETRIES", 10));

/// Initial backoff after a visibility failure.
pub static RETRY_INITIAL_BACKOFF: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("PARLOAD_RETRY_INITIAL_BACKOFF_MS", 500)));

/// Backoff cap for the visibility retry loop.
pub static RETRY_MAX_BACKOFF: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("PARLOAD_RETRY_MAX_BACKOFF_MS", 5000)));

/// Every N-th visibility retry forces a connection reset to invalidate any
/// cached metadata view on the server side.
pub static RECONNECT_EVERY_N_RETRIES: LazyLock<u32> =
    LazyLock::new(|| env_config("PARLOAD_RECONNECT_EVERY_N_RETRIES", 3));

/// Reconnect attempts after a connection-level failure before giving up on
/// the job.
pub static TRANSIENT_MAX_RECONNECTS: LazyLock<u32> =
    LazyLock::new(|| env_config("PARLOAD_TRANSIENT_MAX_RECONNECTS", 3));

/// Attempts for a schema job (the job itself is re-enqueued on failure).
pub static SCHEMA_JOB_MAX_RETRIES: LazyLock<u32> =
    LazyLock::new(|| env_config("PARLOAD_SCHEMA_JOB_MAX_RETRIES", 3));

/// The dispatcher rebuilds its cached table list after this many slow-path
/// scans; a rebuild is forced when producers announce end of data files.
pub static TABLE_REFRESH_INTERVAL: LazyLock<usize> =
    LazyLock::new(|| env_config("PARLOAD_TABLE_REFRESH_INTERVAL", 100));

/// Bounded wait for a decoder side-process to produce its first bytes.
pub static DECOMPRESS_OPEN_TIMEOUT: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("PARLOAD_DECOMPRESS_OPEN_TIMEOUT_SECS", 30)));

/// Delay before the post-spawn liveness check of a decoder side-process.
pub static DECOMPRESS_HEALTH_CHECK_DELAY: LazyLock<Duration> = LazyLock::new(|| {
    Duration::from_millis(env_config("PARLOAD_DECOMPRESS_HEALTH_CHECK_DELAY_MS", 10))
});

/// Cadence of the periodic progress log line.
pub static PROGRESS_INTERVAL: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("PARLOAD_PROGRESS_INTERVAL_SECS", 30)));

/// Dispatch statistics are logged every N dispatcher iterations.
pub static DISPATCH_STATS_INTERVAL: LazyLock<u64> =
    LazyLock::new(|| env_config("PARLOAD_DISPATCH_STATS_INTERVAL", 1000));
