//! Multi-tenancy tests.
//!
//! Run with: cargo test --test tenancy

mod common;

use annals::{AggregateQuery, EventReader, FetchOptions, ProjectionLifecycle, StoreError, StreamId, TenancyStyle, DEFAULT_TENANT};
use common::*;

async fn conjoined_store() -> TestStore {
    open_configured(
        |c| c.events.tenancy = TenancyStyle::Conjoined,
        |b| b.projection(party_aggregation("party", ProjectionLifecycle::Inline)),
    )
    .await
}

#[tokio::test]
async fn test_events_are_tagged_with_session_tenant() {
    let test = conjoined_store().await;
    let id = StreamId::new_guid();

    let mut session = test.store.open_session_for_tenant("two-rivers").unwrap();
    assert_eq!(session.tenant_id(), "two-rivers");
    session.start_stream(id.clone(), raws(&["a"])).unwrap();
    let commit = session.save_changes().await.unwrap();

    assert_eq!(commit.tenant_id, "two-rivers");
    assert_eq!(commit.events[0].tenant_id, "two-rivers");
    assert_eq!(commit.streams[0].tenant_id, "two-rivers");
}

#[tokio::test]
async fn test_appending_to_another_tenants_stream_is_rejected() {
    let test = conjoined_store().await;
    let id = StreamId::new_guid();

    let mut owner = test.store.open_session_for_tenant("two-rivers").unwrap();
    owner.start_stream(id.clone(), raws(&["a"])).unwrap();
    owner.save_changes().await.unwrap();

    let mut intruder = test.store.open_session_for_tenant("caemlyn").unwrap();
    intruder.append(id.clone(), raws(&["b"])).unwrap();
    let err = intruder.save_changes().await.unwrap_err();
    match err {
        StoreError::TenantMismatch { expected, actual, .. } => {
            assert_eq!(expected, "caemlyn");
            assert_eq!(actual, "two-rivers");
        }
        other => panic!("expected tenant mismatch, got {other:?}"),
    }

    let err = intruder.fetch_for_writing(id.clone()).await.unwrap_err();
    assert!(matches!(err, StoreError::TenantMismatch { .. }));

    intruder.archive_stream(id.clone()).unwrap();
    let err = intruder.save_changes().await.unwrap_err();
    assert!(matches!(err, StoreError::TenantMismatch { .. }));
}

#[tokio::test]
async fn test_stream_ids_are_unique_across_tenants() {
    let test = conjoined_store().await;
    let id = StreamId::new_guid();

    let mut first = test.store.open_session_for_tenant("two-rivers").unwrap();
    first.start_stream(id.clone(), raws(&["a"])).unwrap();
    first.save_changes().await.unwrap();

    let mut second = test.store.open_session_for_tenant("caemlyn").unwrap();
    second.start_stream(id.clone(), raws(&["a"])).unwrap();
    let err = second.save_changes().await.unwrap_err();
    assert!(matches!(err, StoreError::ExistingStreamCollision { .. }));
}

#[tokio::test]
async fn test_readers_see_only_their_tenant() {
    let test = conjoined_store().await;
    let (ours, theirs) = (StreamId::new_guid(), StreamId::new_guid());

    let mut session = test.store.open_session_for_tenant("two-rivers").unwrap();
    session.start_stream(ours.clone(), raws(&["a", "b"])).unwrap();
    session.save_changes().await.unwrap();
    let mut session = test.store.open_session_for_tenant("caemlyn").unwrap();
    session.start_stream(theirs.clone(), raws(&["c"])).unwrap();
    session.save_changes().await.unwrap();

    let reader = test.store.reader_for_tenant("two-rivers").unwrap();
    assert_eq!(reader.fetch_stream(&ours, FetchOptions::new()).await.unwrap().len(), 2);
    assert!(reader.fetch_stream(&theirs, FetchOptions::new()).await.unwrap().is_empty());
    assert!(reader.fetch_stream_state(&theirs).await.unwrap().is_none());

    let feed = reader.fetch_events_after(0, 100, false).await.unwrap();
    assert!(feed.iter().all(|e| e.tenant_id == "two-rivers"));
    assert_eq!(feed.len(), 2);

    let everything = test.store.reader_all_tenants().fetch_events_after(0, 100, false).await.unwrap();
    assert_eq!(everything.len(), 3);
}

#[tokio::test]
async fn test_inline_documents_are_kept_per_tenant() {
    let test = conjoined_store().await;
    let party = party_aggregation("party", ProjectionLifecycle::Inline);
    let id = StreamId::new_guid();

    let mut session = test.store.open_session_for_tenant("two-rivers").unwrap();
    let events = vec![session.event(&joined(&["Perrin", "Faile"])).unwrap()];
    session.start_stream(id.clone(), events).unwrap();
    session.save_changes().await.unwrap();

    let loaded = test
        .store
        .load_aggregate_for_tenant(&party, "two-rivers", &id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded.members, names(&["Perrin", "Faile"]));
    assert!(test
        .store
        .load_aggregate_for_tenant(&party, "caemlyn", &id)
        .await
        .unwrap()
        .is_none());
    assert!(test.store.load_aggregate(&party, &id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_live_aggregation_is_scoped_to_tenant() {
    let test = conjoined_store().await;
    let party = party_aggregation("party", ProjectionLifecycle::Inline);
    let id = StreamId::new_guid();

    let mut session = test.store.open_session_for_tenant("two-rivers").unwrap();
    let events = vec![
        session.event(&joined(&["Egwene", "Nynaeve"])).unwrap(),
        session.event(&departed(&["Nynaeve"])).unwrap(),
    ];
    session.start_stream(id.clone(), events).unwrap();
    session.save_changes().await.unwrap();

    let live = test
        .store
        .aggregate_stream_for_tenant(&party, "two-rivers", &id, AggregateQuery::latest())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(live.members, names(&["Egwene"]));

    let foreign = test
        .store
        .aggregate_stream_for_tenant(&party, "caemlyn", &id, AggregateQuery::latest())
        .await
        .unwrap();
    assert!(foreign.is_none());
    assert!(test
        .store
        .aggregate_stream(&party, &id, AggregateQuery::latest())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_single_tenant_store_rejects_named_tenants() {
    let test = open_store().await;

    assert!(matches!(
        test.store.open_session_for_tenant("caemlyn"),
        Err(StoreError::Configuration(_))
    ));
    assert!(test.store.reader_for_tenant("caemlyn").is_err());

    let session = test.store.open_session_for_tenant(DEFAULT_TENANT).unwrap();
    assert_eq!(session.tenant_id(), DEFAULT_TENANT);
}

#[tokio::test]
async fn test_empty_tenant_id_is_rejected() {
    let test = conjoined_store().await;
    assert!(matches!(
        test.store.open_session_for_tenant(" "),
        Err(StoreError::Configuration(_))
    ));
}
