//! The append pipeline behind `Session::save_changes`.
//!
//! Sequence numbers are reserved before the write transaction opens, so a
//! rollback or a cancelled future orphans them. [`Orphans`] makes sure they
//! reach tombstone recovery on every path except a successful commit.

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::SessionOperation;
use crate::error::{Result, StoreError};
use crate::events::{Event, StreamAction, StreamActionKind, StreamState};
use crate::listeners::Commit;
use crate::projections::ProjectionContext;
use crate::storage::archive::archive_stream;
use crate::storage::guard::ConcurrencyGuard;
use crate::storage::helpers::now;
use crate::storage::locks::release_owner;
use crate::storage::reader::select_stream;
use crate::storage::tombstone::write_tombstones;
use crate::storage::writer::{delete_stream_rows, insert_events, insert_stream};
use crate::storage::{StreamLocks, TombstoneRecovery, WriteTransaction};
use crate::store::StoreInner;

/// Everything one `save_changes` call commits.
pub(crate) struct UnitOfWork {
    pub tenant_id: String,
    pub owner: Uuid,
    pub actions: Vec<StreamAction>,
    pub operations: Vec<SessionOperation>,
    pub holds_locks: bool,
}

impl UnitOfWork {
    fn event_count(&self) -> usize {
        self.actions.iter().map(|a| a.events.len()).sum()
    }

    fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.operations.is_empty()
    }
}

/// Reserved numbers and held locks that need cleanup unless the unit of
/// work commits.
struct Orphans {
    tombstones: TombstoneRecovery,
    locks: StreamLocks,
    owner: Uuid,
    sequences: Vec<i64>,
    holds_locks: bool,
}

impl Orphans {
    /// The commit landed: nothing left to clean up.
    fn disarm(&mut self) {
        self.sequences.clear();
        self.holds_locks = false;
    }
}

impl Drop for Orphans {
    fn drop(&mut self) {
        if !self.sequences.is_empty() {
            warn!(
                count = self.sequences.len(),
                "Unit of work abandoned, queueing reserved sequences for tombstoning"
            );
            self.tombstones.enqueue(std::mem::take(&mut self.sequences));
        }
        if self.holds_locks {
            self.locks.release_in_background(self.owner);
        }
    }
}

#[tracing::instrument(
    name = "session.save_changes",
    skip_all,
    fields(tenant = %work.tenant_id, streams = work.actions.len(), operations = work.operations.len())
)]
pub(crate) async fn save_changes(store: &StoreInner, work: UnitOfWork) -> Result<Commit> {
    if work.is_empty() {
        if work.holds_locks {
            store.locks.release(work.owner).await?;
        }
        return Ok(Commit {
            tenant_id: work.tenant_id,
            ..Commit::default()
        });
    }

    let mut orphans = Orphans {
        tombstones: store.tombstones.clone(),
        locks: store.locks.clone(),
        owner: work.owner,
        sequences: Vec::new(),
        holds_locks: work.holds_locks,
    };

    let result = async {
        store.tombstones.flush_pending().await?;
        orphans.sequences = store.tombstones.reserve(work.event_count()).await?;
        write(store, &work, &orphans.sequences).await
    }
    .await;

    match result {
        Ok(commit) => {
            orphans.disarm();
            publish(store, &commit).await;
            Ok(commit)
        }
        Err(e) => {
            warn!(error = %e, "Unit of work rolled back");
            if orphans.holds_locks {
                if let Err(release) = store.locks.release(work.owner).await {
                    warn!(error = %release, "Failed to release stream locks after rollback");
                }
                orphans.holds_locks = false;
            }
            let recovered = store.tombstones.recover(&orphans.sequences).await;
            match recovered {
                Ok(()) => orphans.sequences.clear(),
                Err(recovery) => {
                    warn!(error = %recovery, "Orphaned sequences queued for the next write");
                }
            }
            Err(e)
        }
    }
}

async fn write(store: &StoreInner, work: &UnitOfWork, sequences: &[i64]) -> Result<Commit> {
    let mut tx = WriteTransaction::begin(&store.pool).await?;
    let applied = apply(store, tx.conn(), work, sequences).await;
    match applied {
        Ok(commit) => {
            tx.commit().await?;
            Ok(commit)
        }
        Err(e) => {
            if let Err(rollback) = tx.rollback().await {
                warn!(error = %rollback, "Rollback failed, discarding connection");
            }
            Err(e)
        }
    }
}

async fn apply(
    store: &StoreInner,
    conn: &mut SqliteConnection,
    work: &UnitOfWork,
    sequences: &[i64],
) -> Result<Commit> {
    let timestamp = now();
    let mut commit = Commit {
        tenant_id: work.tenant_id.clone(),
        ..Commit::default()
    };

    let mut offset = 0;
    for action in &work.actions {
        let block = &sequences[offset..offset + action.events.len()];
        offset += action.events.len();

        let (events, state) = write_action(store, conn, action, work.owner, block, timestamp).await?;
        commit.events.extend(events);
        commit.streams.push(state);
    }

    for operation in &work.operations {
        run_operation(store, conn, &work.tenant_id, operation, timestamp, &mut commit).await?;
    }

    if !commit.events.is_empty() {
        let ctx = ProjectionContext {
            serializer: store.options.serializer.clone(),
            identity: store.identity(),
        };
        for projection in store.options.projections.inline() {
            projection.apply(&mut *conn, &ctx, &commit.events).await?;
        }
    }

    if work.holds_locks {
        release_owner(&mut *conn, work.owner).await?;
    }

    Ok(commit)
}

/// Validate, version and insert one stream action.
async fn write_action(
    store: &StoreInner,
    conn: &mut SqliteConnection,
    action: &StreamAction,
    owner: Uuid,
    sequences: &[i64],
    timestamp: DateTime<Utc>,
) -> Result<(Vec<Event>, StreamState)> {
    let identity = store.identity();
    let persisted = select_stream(&mut *conn, identity, &action.stream_id).await?;
    let count = action.events.len() as i64;

    let implicit_start = action.kind == StreamActionKind::Append
        && persisted.is_none()
        && store.options.config.events.implicit_stream_creation;

    let (events, state) = if action.kind == StreamActionKind::Start || implicit_start {
        if implicit_start {
            debug!(stream_id = %action.stream_id, "Creating stream implicitly on append");
        } else {
            ConcurrencyGuard::validate(conn, action, persisted.as_ref(), owner).await?;
        }
        if let Some(expected) = action.expected_version.filter(|v| *v != 0) {
            return Err(StoreError::VersionConflict {
                stream_id: action.stream_id.clone(),
                expected,
                actual: 0,
            });
        }
        insert_stream(conn, action, count, timestamp).await?;
        let events = action.prepare(0, sequences, timestamp)?;
        let state = StreamState {
            id: action.stream_id.clone(),
            stream_type: action.stream_type.clone(),
            version: count,
            created_at: timestamp,
            last_modified: timestamp,
            is_archived: false,
            tenant_id: action.tenant_id.clone(),
        };
        (events, state)
    } else {
        ConcurrencyGuard::validate(conn, action, persisted.as_ref(), owner).await?;
        let Some(mut stream) = persisted else {
            return Err(StoreError::StreamNotFound {
                stream_id: action.stream_id.clone(),
            });
        };

        let mut numbered = action.clone();
        numbered.stream_type = stream.stream_type.clone();
        let new_version = numbered.resulting_version(stream.version);
        ConcurrencyGuard::advance_version(conn, &action.stream_id, stream.version, new_version, timestamp).await?;
        let events = numbered.prepare(stream.version, sequences, timestamp)?;

        stream.version = new_version;
        stream.last_modified = timestamp;
        (events, stream)
    };

    insert_events(conn, &events).await?;
    debug!(
        stream_id = %action.stream_id,
        version = state.version,
        events = events.len(),
        "Stream written"
    );
    Ok((events, state))
}

async fn run_operation(
    store: &StoreInner,
    conn: &mut SqliteConnection,
    tenant_id: &str,
    operation: &SessionOperation,
    timestamp: DateTime<Utc>,
    commit: &mut Commit,
) -> Result<()> {
    let identity = store.identity();
    match operation {
        SessionOperation::Archive(stream_id) => {
            archive_stream(conn, identity, stream_id, tenant_id, timestamp).await?;
            for state in commit.streams.iter_mut().filter(|s| &s.id == stream_id) {
                state.is_archived = true;
            }
            commit.archived.push(stream_id.clone());
        }
        SessionOperation::Delete(stream_id) => {
            let stream = select_stream(&mut *conn, identity, stream_id)
                .await?
                .ok_or_else(|| StoreError::StreamNotFound {
                    stream_id: stream_id.clone(),
                })?;
            if stream.tenant_id != tenant_id {
                return Err(StoreError::TenantMismatch {
                    stream_id: stream_id.clone(),
                    expected: tenant_id.to_string(),
                    actual: stream.tenant_id,
                });
            }
            let freed = delete_stream_rows(conn, stream_id).await?;
            write_tombstones(conn, identity, &freed).await?;
            commit.events.retain(|e| &e.stream_id != stream_id);
            commit.streams.retain(|s| &s.id != stream_id);
            commit.deleted.push(stream_id.clone());
            info!(stream_id = %stream_id, freed = freed.len(), "Stream deleted");
        }
        SessionOperation::Custom(custom) => {
            debug!(operation = %custom.describe(), "Running queued operation");
            custom.execute(conn).await?;
        }
    }
    Ok(())
}

/// Post-commit notification. Never fails the commit.
async fn publish(store: &StoreInner, commit: &Commit) {
    if let Some(sequence) = commit.max_sequence() {
        store.high_water.send_if_modified(|current| {
            if sequence > *current {
                *current = sequence;
                true
            } else {
                false
            }
        });
    }

    for listener in &store.listeners {
        if let Err(e) = listener.after_commit(commit).await {
            warn!(error = %e, "Commit listener failed");
        }
    }
}
