//! Error types for the event store.
//!
//! A single [`StoreError`] enum covers every failure the engine surfaces.
//! Concurrency failures (`VersionConflict`, `StreamLocked`) are always
//! returned to the caller; nothing in the core retries them.

use thiserror::Error;

use crate::events::StreamId;

/// Errors raised by the event store.
#[derive(Debug, Error)]
pub enum StoreError {
    // =========================================================================
    // Stream lifecycle
    // =========================================================================
    #[error("stream '{stream_id}' does not exist")]
    StreamNotFound { stream_id: StreamId },

    #[error("stream '{stream_id}' must be started with at least one event")]
    EmptyStream { stream_id: StreamId },

    #[error("stream '{stream_id}' already exists")]
    ExistingStreamCollision { stream_id: StreamId },

    #[error("stream '{stream_id}' is archived")]
    StreamArchived { stream_id: StreamId },

    #[error("stream id '{stream_id}' does not match the configured {expected} identity")]
    InvalidStreamIdentity {
        stream_id: StreamId,
        expected: &'static str,
    },

    // =========================================================================
    // Concurrency
    // =========================================================================
    /// The persisted version moved since the caller last looked.
    #[error("version conflict on stream '{stream_id}': expected {expected}, actual {actual}")]
    VersionConflict {
        stream_id: StreamId,
        expected: i64,
        actual: i64,
    },

    /// Another session holds the exclusive lock on this stream.
    #[error("stream '{stream_id}' is locked by another writer")]
    StreamLocked { stream_id: StreamId },

    // =========================================================================
    // Tenancy
    // =========================================================================
    #[error("stream '{stream_id}' belongs to tenant '{actual}', not '{expected}'")]
    TenantMismatch {
        stream_id: StreamId,
        expected: String,
        actual: String,
    },

    // =========================================================================
    // Projections
    // =========================================================================
    #[error("projection '{projection}' has no rule for event type '{event_type}'")]
    UnhandledEvent {
        projection: String,
        event_type: String,
    },

    #[error("projection '{name}' is not registered")]
    ProjectionNotFound { name: String },

    // =========================================================================
    // Infrastructure
    // =========================================================================
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("config loading error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// True for failures a caller may resolve by re-reading and retrying.
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(
            self,
            StoreError::VersionConflict { .. } | StoreError::StreamLocked { .. }
        )
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<uuid::Error> for StoreError {
    fn from(err: uuid::Error) -> Self {
        StoreError::Serialization(format!("invalid uuid: {err}"))
    }
}

impl From<chrono::ParseError> for StoreError {
    fn from(err: chrono::ParseError) -> Self {
        StoreError::Serialization(format!("invalid timestamp: {err}"))
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let conflict = StoreError::VersionConflict {
            stream_id: StreamId::from("order-1"),
            expected: 2,
            actual: 4,
        };
        assert_eq!(
            conflict.to_string(),
            "version conflict on stream 'order-1': expected 2, actual 4"
        );

        let mismatch = StoreError::TenantMismatch {
            stream_id: StreamId::from("order-1"),
            expected: "blue".to_string(),
            actual: "red".to_string(),
        };
        assert_eq!(
            mismatch.to_string(),
            "stream 'order-1' belongs to tenant 'red', not 'blue'"
        );
    }

    #[test]
    fn test_concurrency_classification() {
        let id = StreamId::from("s");
        assert!(StoreError::StreamLocked { stream_id: id.clone() }.is_concurrency_conflict());
        assert!(StoreError::VersionConflict {
            stream_id: id.clone(),
            expected: 1,
            actual: 2
        }
        .is_concurrency_conflict());
        assert!(!StoreError::StreamNotFound { stream_id: id }.is_concurrency_conflict());
    }

    #[test]
    fn test_sqlx_error_conversion() {
        let err: StoreError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, StoreError::Database(_)));
    }
}
