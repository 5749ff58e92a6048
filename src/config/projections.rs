//! Async projection daemon settings.

use std::time::Duration;

use serde::Deserialize;

/// Background catch-up tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProjectionsConfig {
    /// Idle poll interval when no commit notification arrives.
    pub poll_interval_ms: u64,
    /// Events folded per transaction.
    pub batch_size: u32,
    /// A sequence gap older than this is assumed abandoned and skipped.
    /// Must exceed twice `storage.busy_timeout_ms`.
    pub stale_sequence_threshold_ms: u64,
    /// Consecutive failed batches before a projection is marked faulted.
    pub max_retries: usize,
    pub retry_min_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl ProjectionsConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stale_sequence_threshold(&self) -> Duration {
        Duration::from_millis(self.stale_sequence_threshold_ms)
    }
}

impl Default for ProjectionsConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 250,
            batch_size: 500,
            stale_sequence_threshold_ms: 15_000,
            max_retries: 5,
            retry_min_delay_ms: 50,
            retry_max_delay_ms: 5_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_projections_config_default() {
        let config = ProjectionsConfig::default();
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.batch_size, 500);
        assert_eq!(config.stale_sequence_threshold(), Duration::from_secs(15));
        assert_eq!(config.max_retries, 5);
    }
}
