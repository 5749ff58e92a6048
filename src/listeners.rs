//! Post-commit hooks.
//!
//! Listeners see each committed unit of work with final versions and
//! sequences, for side effects such as outbox publication. They run after
//! the transaction committed, so their failures are logged and never undo
//! the write.

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;
use crate::events::{Event, StreamId, StreamState};

/// Outcome of one successful `save_changes`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Commit {
    pub tenant_id: String,
    /// Newly committed events across all streams, in sequence order.
    pub events: Vec<Event>,
    /// Stream records as of this commit for every started or appended stream.
    pub streams: Vec<StreamState>,
    pub archived: Vec<StreamId>,
    pub deleted: Vec<StreamId>,
}

impl Commit {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.archived.is_empty() && self.deleted.is_empty()
    }

    /// Highest sequence written, if any.
    pub fn max_sequence(&self) -> Option<i64> {
        self.events.iter().map(|e| e.sequence).max()
    }

    pub fn events_for<'a>(&'a self, stream_id: &'a StreamId) -> impl Iterator<Item = &'a Event> + 'a {
        self.events.iter().filter(move |e| &e.stream_id == stream_id)
    }
}

/// Observer of committed units of work.
#[async_trait]
pub trait CommitListener: Send + Sync {
    async fn after_commit(&self, commit: &Commit) -> Result<()>;
}
