//! Async projection daemon tests.
//!
//! Run with: cargo test --test projection_daemon

mod common;

use std::time::Duration;

use async_trait::async_trait;
use sqlx::SqliteConnection;

use annals::projections::aggregate_store::list_documents;
use annals::projections::{ProjectionContext, ProjectionStatus};
use annals::{Event, EventStore, Projection, ProjectionLifecycle, StoreError, StreamId};
use common::*;

const PARTY: &str = "party";

async fn async_store() -> TestStore {
    open_with(|b| b.projection(party_aggregation(PARTY, ProjectionLifecycle::Async))).await
}

async fn write_party(store: &EventStore, id: &StreamId, joiners: &[&str], leavers: &[&str]) {
    let mut session = store.open_session();
    let mut events = vec![session.event(&joined(joiners)).unwrap()];
    if !leavers.is_empty() {
        events.push(session.event(&departed(leavers)).unwrap());
    }
    session.start_stream(id.clone(), events).unwrap();
    session.save_changes().await.expect("party should commit");
}

/// Poll until `check` passes or two seconds go by.
async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

// =============================================================================
// Catch-up and rebuild
// =============================================================================

#[tokio::test]
async fn test_catch_up_folds_async_projection() {
    let test = async_store().await;
    let party = party_aggregation(PARTY, ProjectionLifecycle::Async);
    let id = StreamId::new_guid();
    write_party(&test.store, &id, &["Rand", "Egwene"], &["Egwene"]).await;

    let daemon = test.store.daemon();
    let reached = daemon.catch_up(PARTY).await.expect("catch up should succeed");
    assert_eq!(reached, test.store.sequences().current().await.unwrap());

    let loaded = test.store.load_aggregate(&party, &id).await.unwrap().unwrap();
    assert_eq!(loaded.members, names(&["Rand"]));

    let progress = daemon.progress(PARTY).await.unwrap().unwrap();
    assert_eq!(progress.last_sequence, reached);
    assert_eq!(progress.status, ProjectionStatus::Running);
    assert_eq!(progress.error_count, 0);

    // nothing new: the checkpoint stays put
    assert_eq!(daemon.catch_up(PARTY).await.unwrap(), reached);
}

#[tokio::test]
async fn test_catch_up_spans_many_small_batches() {
    let test = open_configured(
        |c| c.projections.batch_size = 2,
        |b| b.projection(party_aggregation(PARTY, ProjectionLifecycle::Async)),
    )
    .await;
    let party = party_aggregation(PARTY, ProjectionLifecycle::Async);

    let ids: Vec<StreamId> = (0..5).map(|_| StreamId::new_guid()).collect();
    for id in &ids {
        write_party(&test.store, id, &["Lan", "Moiraine"], &["Lan"]).await;
    }

    test.store.daemon().catch_up_all().await.unwrap();
    for id in &ids {
        let loaded = test.store.load_aggregate(&party, id).await.unwrap().unwrap();
        assert_eq!(loaded.members, names(&["Moiraine"]));
    }
}

#[tokio::test]
async fn test_rebuild_reproduces_identical_documents() {
    let test = async_store().await;
    let daemon = test.store.daemon();

    let (first, second, archived) = (StreamId::new_guid(), StreamId::new_guid(), StreamId::new_guid());
    write_party(&test.store, &first, &["Rand", "Mat"], &[]).await;
    write_party(&test.store, &second, &["Elayne", "Aviendha", "Min"], &["Min"]).await;
    write_party(&test.store, &archived, &["Siuan"], &[]).await;

    let mut session = test.store.open_session();
    session.archive_stream(archived.clone()).unwrap();
    session.save_changes().await.unwrap();

    daemon.catch_up(PARTY).await.unwrap();
    let before = list_documents(test.store.pool(), PARTY).await.unwrap();
    assert_eq!(before.len(), 3);

    let reached = daemon.rebuild(PARTY).await.expect("rebuild should succeed");
    assert_eq!(reached, test.store.sequences().current().await.unwrap());

    let after = list_documents(test.store.pool(), PARTY).await.unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_rebuild_of_inline_aggregation() {
    let test = open_with(|b| b.projection(party_aggregation(PARTY, ProjectionLifecycle::Inline))).await;
    let id = StreamId::new_guid();
    write_party(&test.store, &id, &["Thom"], &[]).await;
    let before = list_documents(test.store.pool(), PARTY).await.unwrap();

    test.store.daemon().rebuild(PARTY).await.unwrap();
    let after = list_documents(test.store.pool(), PARTY).await.unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_unknown_projection_name() {
    let test = async_store().await;
    let err = test.store.daemon().catch_up("nope").await.unwrap_err();
    assert!(matches!(err, StoreError::ProjectionNotFound { .. }));
    let err = test.store.daemon().rebuild("nope").await.unwrap_err();
    assert!(matches!(err, StoreError::ProjectionNotFound { .. }));
}

// =============================================================================
// High-water mark
// =============================================================================

#[tokio::test]
async fn test_high_water_mark_waits_on_gap_then_skips_it() {
    let test = open_configured(
        |c| {
            c.storage.busy_timeout_ms = 50;
            c.projections.stale_sequence_threshold_ms = 200;
        },
        |b| b.projection(party_aggregation(PARTY, ProjectionLifecycle::Async)),
    )
    .await;
    let daemon = test.store.daemon();

    let id = StreamId::new_guid();
    write_party(&test.store, &id, &["Rand"], &[]).await;
    let settled = daemon.high_water_mark().await.unwrap();
    assert_eq!(settled, test.store.sequences().current().await.unwrap());

    // a reservation nobody commits leaves a hole below the next event
    test.store.sequences().reserve(1).await.unwrap();
    write_party(&test.store, &StreamId::new_guid(), &["Mat"], &[]).await;
    let top = test.store.sequences().current().await.unwrap();

    assert_eq!(daemon.high_water_mark().await.unwrap(), settled);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(daemon.high_water_mark().await.unwrap(), top);
}

// =============================================================================
// Workers
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_worker_follows_new_commits() {
    let test = async_store().await;
    let party = party_aggregation(PARTY, ProjectionLifecycle::Async);
    let handle = test.store.daemon().start();

    let id = StreamId::new_guid();
    write_party(&test.store, &id, &["Nynaeve", "Lan"], &["Lan"]).await;

    let store = test.store.clone();
    let folded = eventually(|| {
        let store = store.clone();
        let party = &party;
        let id = id.clone();
        async move {
            matches!(
                store.load_aggregate(party, &id).await,
                Ok(Some(loaded)) if loaded.members == names(&["Nynaeve"])
            )
        }
    })
    .await;
    assert!(folded, "worker should fold the new stream");

    handle.shutdown().await;
    let progress = test.store.daemon().progress(PARTY).await.unwrap().unwrap();
    assert_eq!(progress.status, ProjectionStatus::Stopped);
}

struct Broken;

#[async_trait]
impl Projection for Broken {
    fn name(&self) -> &str {
        "broken"
    }

    fn lifecycle(&self) -> ProjectionLifecycle {
        ProjectionLifecycle::Async
    }

    async fn apply(
        &self,
        _conn: &mut SqliteConnection,
        _ctx: &ProjectionContext,
        _events: &[Event],
    ) -> annals::Result<()> {
        Err(StoreError::Configuration("projection broke".into()))
    }

    async fn reset(&self, _conn: &mut SqliteConnection) -> annals::Result<()> {
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failing_worker_is_marked_faulted() {
    let test = open_configured(|c| c.projections.max_retries = 2, |b| b.projection(Broken)).await;
    write_party(&test.store, &StreamId::new_guid(), &["Padan"], &[]).await;

    let handle = test.store.daemon().start();
    let daemon = test.store.daemon();
    let faulted = eventually(|| {
        let daemon = daemon.clone();
        async move {
            matches!(
                daemon.progress("broken").await,
                Ok(Some(progress)) if progress.status == ProjectionStatus::Faulted
            )
        }
    })
    .await;
    assert!(faulted, "worker should give up after its retries");

    let progress = daemon.progress("broken").await.unwrap().unwrap();
    assert_eq!(progress.error_count, 3);
    assert_eq!(progress.last_sequence, 0);
    assert!(progress.last_error.unwrap().contains("projection broke"));
    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failing_projection_does_not_block_others() {
    let test = open_configured(
        |c| c.projections.max_retries = 1,
        |b| {
            b.projection(Broken)
                .projection(party_aggregation(PARTY, ProjectionLifecycle::Async))
        },
    )
    .await;
    let party = party_aggregation(PARTY, ProjectionLifecycle::Async);
    let handle = test.store.daemon().start();

    let id = StreamId::new_guid();
    write_party(&test.store, &id, &["Loial"], &[]).await;

    let store = test.store.clone();
    let folded = eventually(|| {
        let store = store.clone();
        let party = &party;
        let id = id.clone();
        async move { matches!(store.load_aggregate(party, &id).await, Ok(Some(_))) }
    })
    .await;
    assert!(folded);
    handle.shutdown().await;
}
