//! Tombstone recovery.
//!
//! Sequence numbers are reserved outside the write transaction, so a
//! rollback leaves them unused. A permanent, well-known stream absorbs them:
//! one sentinel event per orphaned number, so every number up to the
//! store's maximum maps to a persisted event.

use std::sync::{Arc, Mutex, MutexGuard};

use sqlx::{SqliteConnection, SqlitePool};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::guard::ConcurrencyGuard;
use super::helpers::now;
use super::reader::{
    select_existing_sequences, select_max_sequence, select_sequences_after, select_stream,
};
use super::sequence::SequenceOracle;
use super::transaction::WriteTransaction;
use super::writer::{insert_events, insert_stream};
use crate::error::{Result, StoreError};
use crate::events::{PendingEvent, StreamAction, StreamId, StreamIdentity};
use crate::tenancy::DEFAULT_TENANT;

/// Event type of sentinel events.
pub const TOMBSTONE_EVENT_TYPE: &str = "tombstone";
/// Stream tag of the tombstone stream.
pub const TOMBSTONE_STREAM_TYPE: &str = "tombstone";
/// Tombstone stream identity when streams are keyed by string.
pub const TOMBSTONE_STREAM_KEY: &str = "annals_tombstones";

/// Tombstone stream identity when streams are keyed by guid.
pub fn tombstone_stream_guid() -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, TOMBSTONE_STREAM_KEY.as_bytes())
}

pub fn tombstone_stream_id(identity: StreamIdentity) -> StreamId {
    match identity {
        StreamIdentity::Guid => StreamId::Guid(tombstone_stream_guid()),
        StreamIdentity::Key => StreamId::Key(TOMBSTONE_STREAM_KEY.to_string()),
    }
}

fn sentinel() -> PendingEvent {
    PendingEvent::raw(TOMBSTONE_EVENT_TYPE, b"{}".to_vec())
}

/// Attach tombstones to `sequences` inside an open write transaction.
///
/// Numbers that already carry an event are skipped: a unit of work
/// cancelled while its commit was in flight may have landed after all.
/// Creates the tombstone stream first if it is missing.
pub async fn write_tombstones(
    conn: &mut SqliteConnection,
    identity: StreamIdentity,
    sequences: &[i64],
) -> Result<()> {
    let taken = select_existing_sequences(&mut *conn, sequences).await?;
    if !taken.is_empty() {
        debug!(count = taken.len(), "Skipping sequences that already hold events");
    }
    let sequences: Vec<i64> = sequences
        .iter()
        .copied()
        .filter(|s| !taken.contains(s))
        .collect();
    if sequences.is_empty() {
        return Ok(());
    }
    let sequences = sequences.as_slice();

    let stream_id = tombstone_stream_id(identity);
    let timestamp = now();
    let events: Vec<PendingEvent> = sequences.iter().map(|_| sentinel()).collect();
    let count = events.len() as i64;

    match select_stream(&mut *conn, identity, &stream_id).await? {
        Some(stream) => {
            let mut action = StreamAction::append(stream_id.clone(), DEFAULT_TENANT, events, None);
            action.stream_type = Some(TOMBSTONE_STREAM_TYPE.to_string());
            let numbered = action.prepare(stream.version, sequences, timestamp)?;
            ConcurrencyGuard::advance_version(
                conn,
                &stream_id,
                stream.version,
                stream.version + count,
                timestamp,
            )
            .await?;
            insert_events(conn, &numbered).await?;
        }
        None => {
            let action = StreamAction::start(
                stream_id,
                DEFAULT_TENANT,
                Some(TOMBSTONE_STREAM_TYPE.to_string()),
                events,
            )?;
            let numbered = action.prepare(0, sequences, timestamp)?;
            insert_stream(conn, &action, count, timestamp).await?;
            insert_events(conn, &numbered).await?;
        }
    }

    debug!(count, "Wrote tombstones");
    Ok(())
}

/// Fills sequence gaps left by failed writes.
#[derive(Clone)]
pub struct TombstoneRecovery {
    pool: SqlitePool,
    identity: StreamIdentity,
    oracle: SequenceOracle,
    pending: Arc<Mutex<Vec<i64>>>,
}

impl TombstoneRecovery {
    pub fn new(pool: SqlitePool, identity: StreamIdentity, oracle: SequenceOracle) -> Self {
        Self {
            pool,
            identity,
            oracle,
            pending: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn stream_id(&self) -> StreamId {
        tombstone_stream_id(self.identity)
    }

    /// Create the tombstone stream with its sentinel event. Idempotent.
    ///
    /// Returns true when this call created it.
    pub async fn establish_tombstone_stream(&self) -> Result<bool> {
        let stream_id = self.stream_id();
        if select_stream(&self.pool, self.identity, &stream_id).await?.is_some() {
            return Ok(false);
        }

        let batch = Requeue::new(self, self.reserve(1).await?);
        let created = self.establish_with(&stream_id, &batch.sequences).await?;
        batch.confirm();
        if created {
            info!(stream_id = %stream_id, "Tombstone stream established");
        }
        Ok(created)
    }

    async fn establish_with(&self, stream_id: &StreamId, sequences: &[i64]) -> Result<bool> {
        let mut tx = WriteTransaction::begin(&self.pool).await?;
        let existed = select_stream(tx.conn(), self.identity, stream_id)
            .await?
            .is_some();
        // a concurrent opener got there first; the reserved number still becomes a tombstone
        write_tombstones(tx.conn(), self.identity, sequences).await?;
        tx.commit().await?;
        Ok(!existed)
    }

    /// Reserve `count` sequence numbers.
    ///
    /// The increment runs on its own task. If the caller is dropped before
    /// the block reaches it, the block goes to the pending queue.
    pub async fn reserve(&self, count: usize) -> Result<Vec<i64>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let handoff = Handoff::new(self.clone());
        let (done, finished) = oneshot::channel();
        let slot = Arc::clone(&handoff.slot);
        let recovery = self.clone();
        tokio::spawn(async move {
            let reserved = recovery.oracle.reserve(count).await.map(|block| {
                let mut slot = lock(&slot);
                if slot.abandoned {
                    warn!(count = block.len(), "Reservation abandoned, queueing it for tombstoning");
                    recovery.enqueue(block);
                } else {
                    slot.block = Some(block);
                }
            });
            let _ = done.send(reserved);
        });

        finished
            .await
            .map_err(|_| StoreError::Configuration("sequence reservation task ended early".into()))??;
        Ok(handoff.take())
    }

    /// Tombstone orphaned numbers now.
    ///
    /// Callers keep ownership of `sequences` and queue them on failure.
    pub async fn recover(&self, sequences: &[i64]) -> Result<()> {
        if sequences.is_empty() {
            return Ok(());
        }
        self.write(sequences).await?;
        info!(count = sequences.len(), "Tombstoned orphaned sequences");
        Ok(())
    }

    /// Remember numbers to tombstone before the next write.
    pub fn enqueue(&self, sequences: Vec<i64>) {
        if sequences.is_empty() {
            return;
        }
        lock(&self.pending).extend(sequences);
    }

    pub fn pending(&self) -> Vec<i64> {
        lock(&self.pending).clone()
    }

    /// Write every queued tombstone. Queued numbers survive a failure or a
    /// dropped caller.
    pub async fn flush_pending(&self) -> Result<usize> {
        let mut sequences = std::mem::take(&mut *lock(&self.pending));
        if sequences.is_empty() {
            return Ok(0);
        }
        sequences.sort_unstable();
        sequences.dedup();

        let batch = Requeue::new(self, sequences);
        self.write(&batch.sequences).await?;
        let flushed = batch.confirm();
        info!(count = flushed, "Flushed queued tombstones");
        Ok(flushed)
    }

    /// Sequence numbers in `1..=max persisted` with no event row.
    pub async fn gaps(&self) -> Result<Vec<i64>> {
        const PAGE: u32 = 1_000;

        let max = select_max_sequence(&self.pool).await?;
        let mut gaps = Vec::new();
        let mut expected = 1;
        while expected <= max {
            let page = select_sequences_after(&self.pool, expected - 1, PAGE).await?;
            if page.is_empty() {
                break;
            }
            for sequence in &page {
                gaps.extend(expected..*sequence);
                expected = sequence + 1;
            }
        }
        Ok(gaps)
    }

    async fn write(&self, sequences: &[i64]) -> Result<()> {
        let mut tx = WriteTransaction::begin(&self.pool).await?;
        write_tombstones(tx.conn(), self.identity, sequences).await?;
        tx.commit().await
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Numbers taken off the queue, put back unless confirmed written.
struct Requeue<'a> {
    recovery: &'a TombstoneRecovery,
    sequences: Vec<i64>,
}

impl<'a> Requeue<'a> {
    fn new(recovery: &'a TombstoneRecovery, sequences: Vec<i64>) -> Self {
        Self {
            recovery,
            sequences,
        }
    }

    fn confirm(mut self) -> usize {
        let count = self.sequences.len();
        self.sequences.clear();
        count
    }
}

impl Drop for Requeue<'_> {
    fn drop(&mut self) {
        self.recovery.enqueue(std::mem::take(&mut self.sequences));
    }
}

#[derive(Default)]
struct Slot {
    block: Option<Vec<i64>>,
    abandoned: bool,
}

/// Caller side of a reservation running on its own task.
struct Handoff {
    recovery: TombstoneRecovery,
    slot: Arc<Mutex<Slot>>,
}

impl Handoff {
    fn new(recovery: TombstoneRecovery) -> Self {
        Self {
            recovery,
            slot: Arc::new(Mutex::new(Slot::default())),
        }
    }

    fn take(&self) -> Vec<i64> {
        lock(&self.slot).block.take().unwrap_or_default()
    }
}

impl Drop for Handoff {
    fn drop(&mut self) {
        let mut slot = lock(&self.slot);
        slot.abandoned = true;
        if let Some(block) = slot.block.take() {
            warn!(count = block.len(), "Reservation abandoned, queueing it for tombstoning");
            self.recovery.enqueue(block);
        }
    }
}
