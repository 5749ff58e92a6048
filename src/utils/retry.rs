//! Retry utilities: backoff builders and retryable error classification.
//!
//! Uses `backon` for exponential backoff with jitter. The engine itself only
//! retries lock waits and failed projection batches; conflict retries are
//! left to callers, who can use [`conflict_backoff`] with
//! [`is_retryable`].

use std::time::Duration;

use backon::ExponentialBuilder;

use crate::config::ProjectionsConfig;
use crate::error::StoreError;

/// Polling backoff while waiting on an exclusive stream lock.
///
/// - Min delay: 5ms
/// - Max delay: a quarter of the timeout, capped at 250ms
/// - Attempts: bounded by the caller's timeout, not by count
pub fn lock_wait_backoff(timeout: Duration) -> ExponentialBuilder {
    let max_delay = (timeout / 4).clamp(Duration::from_millis(5), Duration::from_millis(250));
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(5))
        .with_max_delay(max_delay)
        .with_max_times(usize::MAX)
        .with_jitter()
}

/// Delay between attempts at a failing async projection batch.
pub fn projection_backoff(config: &ProjectionsConfig) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(config.retry_min_delay_ms))
        .with_max_delay(Duration::from_millis(config.retry_max_delay_ms))
        .with_max_times(config.max_retries)
        .with_jitter()
}

/// Backoff for callers retrying after a concurrency conflict.
///
/// - Min delay: 10ms
/// - Max delay: 1s
/// - Max attempts: 8
/// - Jitter enabled
pub fn conflict_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_secs(1))
        .with_max_times(8)
        .with_jitter()
}

/// Determines if an error is worth retrying after re-reading the stream.
///
/// Retryable:
/// - `VersionConflict`: another writer advanced the stream
/// - `StreamLocked`: another writer holds the exclusive lock
///
/// Everything else will fail the same way again.
pub fn is_retryable(error: &StoreError) -> bool {
    error.is_concurrency_conflict()
}
