//! Store configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod events;
mod projections;
mod storage;

pub use events::{EventsConfig, LockPolicyKind, LockingConfig};
pub use projections::ProjectionsConfig;
pub use storage::{StorageConfig, DEFAULT_DATABASE_URL};

use serde::Deserialize;

use crate::error::{Result, StoreError};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "annals.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "ANNALS_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "ANNALS";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "ANNALS_LOG";

/// Main store configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub events: EventsConfig,
    pub projections: ProjectionsConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `annals.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix, `__` separated
    pub fn load(path: Option<&str>) -> Result<Self> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config: Config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// File-backed store at `path` with every other setting defaulted.
    pub fn for_path(path: impl AsRef<std::path::Path>) -> Self {
        Self {
            storage: StorageConfig::at_path(path),
            ..Self::default()
        }
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.storage.max_connections == 0 {
            return Err(StoreError::Configuration(
                "storage.max_connections must be at least 1".into(),
            ));
        }
        if self.projections.batch_size == 0 {
            return Err(StoreError::Configuration(
                "projections.batch_size must be at least 1".into(),
            ));
        }
        // a writer holds reserved numbers while it waits for a pooled
        // connection and then for SQLite's write lock, each bounded by the
        // busy timeout; a shorter threshold would skip numbers still in flight
        let in_flight_ms = self.storage.busy_timeout_ms.saturating_mul(2);
        if self.projections.stale_sequence_threshold_ms <= in_flight_ms {
            return Err(StoreError::Configuration(format!(
                "projections.stale_sequence_threshold_ms ({}) must exceed twice storage.busy_timeout_ms ({})",
                self.projections.stale_sequence_threshold_ms, self.storage.busy_timeout_ms
            )));
        }
        if self.events.default_tenant.trim().is_empty() {
            return Err(StoreError::Configuration(
                "events.default_tenant must not be empty".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;
    use crate::events::StreamIdentity;
    use crate::tenancy::TenancyStyle;

    #[test]
    fn test_config_default_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.storage.url, DEFAULT_DATABASE_URL);
    }

    #[test]
    fn test_config_from_yaml() {
        let yaml = r#"
storage:
  url: "sqlite::memory:"
  max_connections: 1
events:
  stream_identity: key
  tenancy: conjoined
  locking:
    policy: wait
    wait_timeout_ms: 100
projections:
  batch_size: 10
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.storage.max_connections, 1);
        assert_eq!(config.events.stream_identity, StreamIdentity::Key);
        assert_eq!(config.events.tenancy, TenancyStyle::Conjoined);
        assert_eq!(config.events.locking.policy, LockPolicyKind::Wait);
        assert_eq!(config.projections.batch_size, 10);
        // untouched sections keep their defaults
        assert_eq!(config.projections.max_retries, 5);
        assert_eq!(config.events.locking.lease_secs, 30);
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let mut config = Config::default();
        config.projections.batch_size = 0;
        assert!(matches!(
            config.validate(),
            Err(StoreError::Configuration(_))
        ));
    }

    #[test]
    fn test_validate_rejects_stale_threshold_within_busy_timeout() {
        let mut config = Config::default();
        config.storage.busy_timeout_ms = 5_000;
        config.projections.stale_sequence_threshold_ms = 3_000;
        assert!(matches!(
            config.validate(),
            Err(StoreError::Configuration(_))
        ));

        config.projections.stale_sequence_threshold_ms = 10_000;
        assert!(config.validate().is_err());

        config.projections.stale_sequence_threshold_ms = 10_001;
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_load_reads_file_and_env_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.yaml");
        std::fs::write(
            &path,
            "storage:\n  url: \"sqlite://from-file.db\"\nprojections:\n  batch_size: 42\n",
        )
        .unwrap();

        std::env::set_var("ANNALS__PROJECTIONS__BATCH_SIZE", "7");
        let config = Config::load(path.to_str());
        std::env::remove_var("ANNALS__PROJECTIONS__BATCH_SIZE");

        let config = config.unwrap();
        assert_eq!(config.storage.url, "sqlite://from-file.db");
        assert_eq!(config.projections.batch_size, 7);
    }

    #[test]
    #[serial]
    fn test_load_missing_required_file_fails() {
        let result = Config::load(Some("/nonexistent/annals-config.yaml"));
        assert!(matches!(result, Err(StoreError::Config(_))));
    }
}
