//! Sessions: the unit of work.
//!
//! A session collects stream actions and queued operations in memory, then
//! writes them all in one transaction on [`Session::save_changes`]. Argument
//! checks (identity mode, empty starts, duplicate starts) fail immediately
//! at the call site; concurrency checks run inside the transaction.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::SqliteConnection;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::events::{
    ConcurrencyMode, DomainEvent, PendingEvent, StreamAction, StreamActionKind, StreamId, StreamState,
};
use crate::listeners::Commit;
use crate::storage::reader::select_stream;
use crate::store::StoreInner;

pub(crate) mod pipeline;

/// Caller statements run inside the session's write transaction.
#[async_trait]
pub trait UnitOfWorkOperation: Send + Sync {
    /// Short label for logs.
    fn describe(&self) -> String {
        "custom operation".to_string()
    }

    async fn execute(&self, conn: &mut SqliteConnection) -> Result<()>;
}

/// Queued non-append work, executed in queue order after all appends.
pub(crate) enum SessionOperation {
    Archive(StreamId),
    Delete(StreamId),
    Custom(Box<dyn UnitOfWorkOperation>),
}

/// A tenant-scoped unit of work against the store.
pub struct Session {
    store: Arc<StoreInner>,
    tenant_id: String,
    /// Lock owner identity for exclusive holds.
    owner: Uuid,
    actions: Vec<StreamAction>,
    operations: Vec<SessionOperation>,
    /// Versions observed by `fetch_for_writing`.
    expectations: HashMap<StreamId, i64>,
    /// Streams this session holds exclusively.
    exclusive: HashSet<StreamId>,
}

impl Session {
    pub(crate) fn new(store: Arc<StoreInner>, tenant_id: String) -> Self {
        Self {
            store,
            tenant_id,
            owner: Uuid::new_v4(),
            actions: Vec::new(),
            operations: Vec::new(),
            expectations: HashMap::new(),
            exclusive: HashSet::new(),
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Serialize a typed payload with the store's serializer.
    pub fn event<E: DomainEvent>(&self, payload: &E) -> Result<PendingEvent> {
        PendingEvent::new(payload, self.store.options.serializer.as_ref())
    }

    /// Create a new stream from its first events.
    pub fn start_stream(&mut self, stream_id: impl Into<StreamId>, events: Vec<PendingEvent>) -> Result<()> {
        self.start(stream_id.into(), None, events)
    }

    /// Create a new stream tagged with an aggregate type.
    pub fn start_stream_with_type(
        &mut self,
        stream_id: impl Into<StreamId>,
        stream_type: impl Into<String>,
        events: Vec<PendingEvent>,
    ) -> Result<()> {
        self.start(stream_id.into(), Some(stream_type.into()), events)
    }

    fn start(&mut self, stream_id: StreamId, stream_type: Option<String>, events: Vec<PendingEvent>) -> Result<()> {
        self.check_writable(&stream_id)?;
        if self.actions.iter().any(|a| a.stream_id == stream_id) {
            return Err(StoreError::ExistingStreamCollision { stream_id });
        }
        let action = StreamAction::start(stream_id, self.tenant_id.clone(), stream_type, events)?;
        self.actions.push(action);
        Ok(())
    }

    /// Append to an existing stream.
    pub fn append(&mut self, stream_id: impl Into<StreamId>, events: Vec<PendingEvent>) -> Result<()> {
        self.append_inner(stream_id.into(), None, events)
    }

    /// Append, asserting the stream currently stands at `expected_version`.
    ///
    /// For a stream already started or appended in this session the
    /// expectation covers those pending events too.
    pub fn append_expected(
        &mut self,
        stream_id: impl Into<StreamId>,
        expected_version: i64,
        events: Vec<PendingEvent>,
    ) -> Result<()> {
        self.append_inner(stream_id.into(), Some(expected_version), events)
    }

    fn append_inner(
        &mut self,
        stream_id: StreamId,
        expected_version: Option<i64>,
        events: Vec<PendingEvent>,
    ) -> Result<()> {
        self.check_writable(&stream_id)?;

        if let Some(action) = self.actions.iter_mut().find(|a| a.stream_id == stream_id) {
            if let Some(expected) = expected_version {
                let pending = action.events.len() as i64;
                let base = match action.kind {
                    StreamActionKind::Start => Some(0),
                    StreamActionKind::Append => action.expected_version,
                };
                match base {
                    Some(base) if base + pending != expected => {
                        return Err(StoreError::VersionConflict {
                            stream_id,
                            expected,
                            actual: base + pending,
                        });
                    }
                    Some(_) => {}
                    None => action.expected_version = Some(expected - pending),
                }
            }
            action.events.extend(events);
            return Ok(());
        }

        if events.is_empty() {
            return Ok(());
        }

        let expected = expected_version.or_else(|| self.expectations.get(&stream_id).copied());
        let mut action = StreamAction::append(stream_id, self.tenant_id.clone(), events, expected);
        if self.exclusive.contains(&action.stream_id) {
            action.mode = ConcurrencyMode::Exclusive;
        }
        self.actions.push(action);
        Ok(())
    }

    /// Read a stream's state and pin its version as the optimistic
    /// expectation for later appends in this session.
    pub async fn fetch_for_writing(&mut self, stream_id: impl Into<StreamId>) -> Result<StreamState> {
        let stream_id = stream_id.into();
        let state = self.load_owned_stream(&stream_id).await?;
        self.expect(&stream_id, state.version);
        Ok(state)
    }

    /// Take the stream's exclusive lock, then pin its version.
    ///
    /// The lock is held until `save_changes` commits or rolls back, or the
    /// session is dropped.
    pub async fn fetch_for_exclusive_writing(&mut self, stream_id: impl Into<StreamId>) -> Result<StreamState> {
        let stream_id = stream_id.into();
        // fail on missing or foreign streams before claiming anything
        self.load_owned_stream(&stream_id).await?;

        self.store
            .locks
            .acquire(&stream_id, &self.tenant_id, self.owner)
            .await?;
        self.exclusive.insert(stream_id.clone());

        let state = self.load_owned_stream(&stream_id).await?;
        self.expect(&stream_id, state.version);
        for action in self.actions.iter_mut().filter(|a| a.stream_id == stream_id) {
            action.mode = ConcurrencyMode::Exclusive;
        }
        debug!(stream_id = %stream_id, owner = %self.owner, "Exclusive hold taken");
        Ok(state)
    }

    fn expect(&mut self, stream_id: &StreamId, version: i64) {
        self.expectations.insert(stream_id.clone(), version);
        for action in self
            .actions
            .iter_mut()
            .filter(|a| &a.stream_id == stream_id && a.kind == StreamActionKind::Append)
        {
            action.expected_version = Some(version);
        }
    }

    async fn load_owned_stream(&self, stream_id: &StreamId) -> Result<StreamState> {
        stream_id.ensure_identity(self.store.identity())?;
        let state = select_stream(&self.store.pool, self.store.identity(), stream_id)
            .await?
            .ok_or_else(|| StoreError::StreamNotFound {
                stream_id: stream_id.clone(),
            })?;
        if state.tenant_id != self.tenant_id {
            return Err(StoreError::TenantMismatch {
                stream_id: stream_id.clone(),
                expected: self.tenant_id.clone(),
                actual: state.tenant_id,
            });
        }
        Ok(state)
    }

    /// Queue a soft archive of the stream.
    pub fn archive_stream(&mut self, stream_id: impl Into<StreamId>) -> Result<()> {
        let stream_id = stream_id.into();
        self.check_writable(&stream_id)?;
        self.operations.push(SessionOperation::Archive(stream_id));
        Ok(())
    }

    /// Queue a hard delete of the stream and its events.
    pub fn delete_stream(&mut self, stream_id: impl Into<StreamId>) -> Result<()> {
        let stream_id = stream_id.into();
        self.check_writable(&stream_id)?;
        self.operations.push(SessionOperation::Delete(stream_id));
        Ok(())
    }

    /// Queue caller statements to run in the same transaction.
    pub fn queue_operation(&mut self, operation: impl UnitOfWorkOperation + 'static) {
        self.operations
            .push(SessionOperation::Custom(Box::new(operation)));
    }

    pub fn pending_event_count(&self) -> usize {
        self.actions.iter().map(|a| a.events.len()).sum()
    }

    pub fn has_changes(&self) -> bool {
        !self.actions.is_empty() || !self.operations.is_empty()
    }

    /// Commit everything queued in this session as one transaction.
    ///
    /// The queued work is consumed whether or not the commit succeeds, and
    /// exclusive holds are released either way.
    pub async fn save_changes(&mut self) -> Result<Commit> {
        let work = pipeline::UnitOfWork {
            tenant_id: self.tenant_id.clone(),
            owner: self.owner,
            actions: std::mem::take(&mut self.actions),
            operations: std::mem::take(&mut self.operations),
            holds_locks: !self.exclusive.is_empty(),
        };
        self.exclusive.clear();
        self.expectations.clear();

        pipeline::save_changes(&self.store, work).await
    }

    fn check_writable(&self, stream_id: &StreamId) -> Result<()> {
        stream_id.ensure_identity(self.store.identity())?;
        if *stream_id == self.store.tombstones.stream_id() {
            return Err(StoreError::Configuration(format!(
                "stream {stream_id} is reserved for tombstones"
            )));
        }
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.exclusive.is_empty() {
            self.store.locks.release_in_background(self.owner);
        }
    }
}
