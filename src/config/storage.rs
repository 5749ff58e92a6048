//! Storage configuration types.

use std::time::Duration;

use serde::Deserialize;

/// Default database location.
pub const DEFAULT_DATABASE_URL: &str = "sqlite://annals.db";

/// SQLite connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Connection URL (`sqlite://path`, `sqlite:path` or `sqlite::memory:`).
    pub url: String,
    /// Pool size.
    pub max_connections: u32,
    /// How long a writer waits on SQLite's database lock before failing.
    pub busy_timeout_ms: u64,
    /// Use write-ahead logging so readers don't block the writer.
    pub wal: bool,
    pub create_if_missing: bool,
}

impl StorageConfig {
    /// File-backed database at `path`.
    pub fn at_path(path: impl AsRef<std::path::Path>) -> Self {
        Self {
            url: format!("sqlite://{}", path.as_ref().display()),
            ..Self::default()
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// In-memory databases vanish with their last connection.
    pub fn is_memory(&self) -> bool {
        self.url.contains(":memory:") || self.url.contains("mode=memory")
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: 5,
            busy_timeout_ms: 5_000,
            wal: true,
            create_if_missing: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_config_default() {
        let storage = StorageConfig::default();
        assert_eq!(storage.url, "sqlite://annals.db");
        assert_eq!(storage.max_connections, 5);
        assert_eq!(storage.busy_timeout(), Duration::from_secs(5));
        assert!(storage.wal);
        assert!(!storage.is_memory());
    }

    #[test]
    fn test_at_path() {
        let storage = StorageConfig::at_path("/tmp/x/events.db");
        assert_eq!(storage.url, "sqlite:///tmp/x/events.db");
        assert!(StorageConfig {
            url: "sqlite::memory:".into(),
            ..Default::default()
        }
        .is_memory());
    }
}
