//! Inline aggregation and live aggregation tests.
//!
//! Run with: cargo test --test aggregation

mod common;

use std::time::Duration;

use chrono::Utc;

use annals::projections::aggregate_store::list_documents;
use annals::projections::DocumentStatus;
use annals::{AggregateQuery, EventReader, FetchOptions, ProjectionLifecycle, StoreError, StreamId};
use common::*;

const PARTY: &str = "party";

async fn inline_store() -> TestStore {
    open_with(|b| b.projection(party_aggregation(PARTY, ProjectionLifecycle::Inline))).await
}

// =============================================================================
// Inline documents
// =============================================================================

#[tokio::test]
async fn test_inline_document_follows_each_commit() {
    let test = inline_store().await;
    let party = party_aggregation(PARTY, ProjectionLifecycle::Inline);
    let id = StreamId::new_guid();

    let mut session = test.store.open_session();
    let start = vec![
        session.event(&joined(&["Rand", "Mat", "Perrin", "Thom"])).unwrap(),
        session.event(&departed(&["Thom"])).unwrap(),
    ];
    session.start_stream(id.clone(), start).unwrap();
    session.save_changes().await.unwrap();

    let loaded = test.store.load_aggregate(&party, &id).await.unwrap().unwrap();
    assert_eq!(loaded.members, names(&["Rand", "Mat", "Perrin"]));

    let more = vec![session.event(&departed(&["Mat", "Perrin"])).unwrap()];
    session.append(id.clone(), more).unwrap();
    session.save_changes().await.unwrap();

    let loaded = test.store.load_aggregate(&party, &id).await.unwrap().unwrap();
    assert_eq!(loaded.members, names(&["Rand"]));
    assert_eq!(loaded.changes, 3);

    let docs = list_documents(test.store.pool(), PARTY).await.unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].version, 3);
    assert_eq!(docs[0].status, DocumentStatus::Live);
}

#[tokio::test]
async fn test_failing_inline_fold_rolls_back_the_append() {
    let test = inline_store().await;
    let party = party_aggregation(PARTY, ProjectionLifecycle::Inline);
    let id = StreamId::new_guid();

    let mut session = test.store.open_session();
    let first = vec![session.event(&joined(&["Egwene"])).unwrap()];
    session.start_stream(id.clone(), first).unwrap();
    session.save_changes().await.unwrap();

    // right event type, payload the fold cannot decode
    session.append(id.clone(), vec![raw("members_departed")]).unwrap();
    let err = session.save_changes().await.unwrap_err();
    assert!(matches!(err, StoreError::Serialization(_)));

    let state = test.store.reader().fetch_stream_state(&id).await.unwrap().unwrap();
    assert_eq!(state.version, 1);
    let loaded = test.store.load_aggregate(&party, &id).await.unwrap().unwrap();
    assert_eq!(loaded.members, names(&["Egwene"]));
    assert!(test.store.tombstone_gaps().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unrelated_streams_get_no_document() {
    let test = inline_store().await;
    let id = StreamId::new_guid();

    let mut session = test.store.open_session();
    session.start_stream(id.clone(), raws(&["ledger_opened"])).unwrap();
    session.save_changes().await.unwrap();

    assert!(list_documents(test.store.pool(), PARTY).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_event_marks_document_deleted() {
    let test = inline_store().await;
    let party = party_aggregation(PARTY, ProjectionLifecycle::Inline);
    let id = StreamId::new_guid();

    let mut session = test.store.open_session();
    let events = vec![
        session.event(&joined(&["Nynaeve"])).unwrap(),
        session.event(&PartyDisbanded {}).unwrap(),
    ];
    session.start_stream(id.clone(), events).unwrap();
    session.save_changes().await.unwrap();

    assert!(test.store.load_aggregate(&party, &id).await.unwrap().is_none());
    let docs = list_documents(test.store.pool(), PARTY).await.unwrap();
    assert_eq!(docs[0].status, DocumentStatus::Deleted);
    assert!(docs[0].data.is_none());
}

#[tokio::test]
async fn test_async_aggregation_is_not_folded_inline() {
    let test = open_with(|b| b.projection(party_aggregation(PARTY, ProjectionLifecycle::Async))).await;
    let party = party_aggregation(PARTY, ProjectionLifecycle::Async);
    let id = StreamId::new_guid();

    let mut session = test.store.open_session();
    let events = vec![session.event(&joined(&["Min"])).unwrap()];
    session.start_stream(id.clone(), events).unwrap();
    session.save_changes().await.unwrap();

    assert!(test.store.load_aggregate(&party, &id).await.unwrap().is_none());
}

// =============================================================================
// Live aggregation
// =============================================================================

async fn party_history(test: &TestStore, id: &StreamId) -> chrono::DateTime<Utc> {
    let mut session = test.store.open_session();
    let events = vec![
        session.event(&joined(&["Rand", "Mat", "Perrin"])).unwrap(),
        session.event(&departed(&["Perrin"])).unwrap(),
    ];
    session.start_stream(id.clone(), events).unwrap();
    session.save_changes().await.unwrap();

    let between = Utc::now();
    tokio::time::sleep(Duration::from_millis(15)).await;

    let events = vec![session.event(&departed(&["Mat"])).unwrap()];
    session.append(id.clone(), events).unwrap();
    session.save_changes().await.unwrap();
    between
}

#[tokio::test]
async fn test_live_aggregation_matches_latest_state() {
    let test = open_store().await;
    let party = party_aggregation(PARTY, ProjectionLifecycle::Async);
    let id = StreamId::new_guid();
    party_history(&test, &id).await;

    let live = test
        .store
        .aggregate_stream(&party, &id, AggregateQuery::latest())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(live.members, names(&["Rand"]));
}

#[tokio::test]
async fn test_live_aggregation_at_version() {
    let test = open_store().await;
    let party = party_aggregation(PARTY, ProjectionLifecycle::Async);
    let id = StreamId::new_guid();
    party_history(&test, &id).await;

    let first = test
        .store
        .aggregate_stream(&party, &id, AggregateQuery::at_version(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.members, names(&["Rand", "Mat", "Perrin"]));

    let second = test
        .store
        .aggregate_stream(&party, &id, AggregateQuery::at_version(2))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.members, names(&["Rand", "Mat"]));
}

#[tokio::test]
async fn test_live_aggregation_as_of_timestamp() {
    let test = open_store().await;
    let party = party_aggregation(PARTY, ProjectionLifecycle::Async);
    let id = StreamId::new_guid();
    let before = Utc::now() - chrono::Duration::seconds(1);
    let between = party_history(&test, &id).await;

    let earlier = test
        .store
        .aggregate_stream(&party, &id, AggregateQuery::as_of(between))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(earlier.members, names(&["Rand", "Mat"]));

    let nothing = test
        .store
        .aggregate_stream(&party, &id, AggregateQuery::as_of(before))
        .await
        .unwrap();
    assert!(nothing.is_none());
}

#[tokio::test]
async fn test_live_aggregation_of_missing_or_archived_stream() {
    let test = open_store().await;
    let party = party_aggregation(PARTY, ProjectionLifecycle::Async);

    let missing = test
        .store
        .aggregate_stream(&party, &StreamId::new_guid(), AggregateQuery::latest())
        .await
        .unwrap();
    assert!(missing.is_none());

    let id = StreamId::new_guid();
    party_history(&test, &id).await;
    let mut session = test.store.open_session();
    session.archive_stream(id.clone()).unwrap();
    session.save_changes().await.unwrap();

    let hidden = test
        .store
        .aggregate_stream(&party, &id, AggregateQuery::latest())
        .await
        .unwrap();
    assert!(hidden.is_none());

    let archived = test
        .store
        .aggregate_stream(&party, &id, AggregateQuery::latest().include_archived())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(archived.members, names(&["Rand"]));
}

#[tokio::test]
async fn test_live_fold_agrees_with_stored_document() {
    let test = inline_store().await;
    let party = party_aggregation(PARTY, ProjectionLifecycle::Inline);
    let id = StreamId::new_guid();
    party_history(&test, &id).await;

    let stored = test.store.load_aggregate(&party, &id).await.unwrap();
    let live = test
        .store
        .aggregate_stream(&party, &id, AggregateQuery::latest())
        .await
        .unwrap();
    assert_eq!(stored, live);

    let events = test
        .store
        .reader()
        .fetch_stream(&id, FetchOptions::new())
        .await
        .unwrap();
    assert_eq!(events.len(), 3);
}
