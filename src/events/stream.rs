//! Stream metadata and the per-stream unit of work.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{Event, PendingEvent, StreamId};
use crate::error::{Result, StoreError};

/// Persisted stream record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamState {
    pub id: StreamId,
    /// Aggregate type tag supplied at start.
    pub stream_type: Option<String>,
    /// Equals the version of the last committed event.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub is_archived: bool,
    pub tenant_id: String,
}

/// Whether the action creates the stream or extends it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamActionKind {
    Start,
    Append,
}

/// How the concurrency guard treats an append.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConcurrencyMode {
    /// Compare-and-swap on the stream version.
    #[default]
    Optimistic,
    /// The session holds the stream's exclusive lock.
    Exclusive,
}

/// Pending events for one stream inside a session.
#[derive(Debug, Clone)]
pub struct StreamAction {
    pub stream_id: StreamId,
    pub tenant_id: String,
    pub kind: StreamActionKind,
    pub stream_type: Option<String>,
    pub events: Vec<PendingEvent>,
    /// Version the caller believes is current; `None` skips the check.
    pub expected_version: Option<i64>,
    pub mode: ConcurrencyMode,
}

impl StreamAction {
    /// A stream must be established by at least one event.
    pub fn start(
        stream_id: StreamId,
        tenant_id: impl Into<String>,
        stream_type: Option<String>,
        events: Vec<PendingEvent>,
    ) -> Result<Self> {
        if events.is_empty() {
            return Err(StoreError::EmptyStream { stream_id });
        }
        Ok(Self {
            stream_id,
            tenant_id: tenant_id.into(),
            kind: StreamActionKind::Start,
            stream_type,
            events,
            expected_version: None,
            mode: ConcurrencyMode::Optimistic,
        })
    }

    pub fn append(
        stream_id: StreamId,
        tenant_id: impl Into<String>,
        events: Vec<PendingEvent>,
        expected_version: Option<i64>,
    ) -> Self {
        Self {
            stream_id,
            tenant_id: tenant_id.into(),
            kind: StreamActionKind::Append,
            stream_type: None,
            events,
            expected_version,
            mode: ConcurrencyMode::Optimistic,
        }
    }

    pub fn is_start(&self) -> bool {
        self.kind == StreamActionKind::Start
    }

    /// Version the stream reaches once this action commits.
    pub fn resulting_version(&self, current_version: i64) -> i64 {
        current_version + self.events.len() as i64
    }

    /// Number the pending events.
    ///
    /// Versions continue from `current_version`; sequences are taken from the
    /// reserved block in authored order.
    pub fn prepare(
        &self,
        current_version: i64,
        sequences: &[i64],
        now: DateTime<Utc>,
    ) -> Result<Vec<Event>> {
        if sequences.len() != self.events.len() {
            return Err(StoreError::Configuration(format!(
                "stream '{}' has {} pending events but {} reserved sequences",
                self.stream_id,
                self.events.len(),
                sequences.len()
            )));
        }

        Ok(self
            .events
            .iter()
            .zip(sequences)
            .enumerate()
            .map(|(index, (pending, &sequence))| Event {
                id: pending.id,
                stream_id: self.stream_id.clone(),
                version: current_version + 1 + index as i64,
                sequence,
                timestamp: now,
                event_type: pending.event_type.clone(),
                data: pending.data.clone(),
                tenant_id: self.tenant_id.clone(),
                stream_type: self.stream_type.clone(),
                metadata: pending.metadata.clone(),
                is_archived: false,
            })
            .collect())
    }
}
