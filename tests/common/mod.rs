//! Shared fixtures for integration tests.
//!
//! Every test gets its own file-backed SQLite database in a temp directory,
//! so tests run in parallel without sharing state.

#![allow(dead_code)]

use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use annals::config::Config;
use annals::projections::ProjectionLifecycle;
use annals::utils::bootstrap::init_test_tracing;
use annals::{Aggregation, DomainEvent, EventStore, EventStoreBuilder, PendingEvent};

/// A store plus the directory holding its database file.
pub struct TestStore {
    pub store: EventStore,
    pub config: Config,
    pub dir: TempDir,
}

/// Config for a fresh database in a new temp directory.
pub fn test_config() -> (Config, TempDir) {
    init_test_tracing();
    let dir = tempfile::tempdir().expect("temp dir should be created");
    let mut config = Config::for_path(dir.path().join("events.db"));
    config.projections.poll_interval_ms = 20;
    config.projections.retry_min_delay_ms = 5;
    config.projections.retry_max_delay_ms = 20;
    (config, dir)
}

pub async fn open_store() -> TestStore {
    open_with(|builder| builder).await
}

/// Open a fresh store after customizing config and builder.
pub async fn open_configured(
    configure: impl FnOnce(&mut Config),
    build: impl FnOnce(EventStoreBuilder) -> EventStoreBuilder,
) -> TestStore {
    let (mut config, dir) = test_config();
    configure(&mut config);
    let store = build(EventStore::builder(config.clone()))
        .open()
        .await
        .expect("store should open");
    TestStore { store, config, dir }
}

pub async fn open_with(build: impl FnOnce(EventStoreBuilder) -> EventStoreBuilder) -> TestStore {
    open_configured(|_| {}, build).await
}

/// Reopen the same database file with the same config.
pub async fn reopen(test: &TestStore, build: impl FnOnce(EventStoreBuilder) -> EventStoreBuilder) -> EventStore {
    build(EventStore::builder(test.config.clone()))
        .open()
        .await
        .expect("store should reopen")
}

/// Event with an opaque JSON body.
pub fn raw(event_type: &str) -> PendingEvent {
    PendingEvent::raw(event_type, format!("{{\"type\":\"{event_type}\"}}").into_bytes())
}

pub fn raws(types: &[&str]) -> Vec<PendingEvent> {
    types.iter().map(|t| raw(t)).collect()
}

// =============================================================================
// Party domain
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembersJoined {
    pub members: Vec<String>,
}
impl DomainEvent for MembersJoined {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembersDeparted {
    pub members: Vec<String>,
}
impl DomainEvent for MembersDeparted {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartyDisbanded {}
impl DomainEvent for PartyDisbanded {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Party {
    pub members: Vec<String>,
    pub changes: u32,
}

pub fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|n| n.to_string()).collect()
}

pub fn joined(list: &[&str]) -> MembersJoined {
    MembersJoined { members: names(list) }
}

pub fn departed(list: &[&str]) -> MembersDeparted {
    MembersDeparted { members: names(list) }
}

/// Members-of-a-party aggregation.
pub fn party_aggregation(name: &str, lifecycle: ProjectionLifecycle) -> Aggregation<Party> {
    Aggregation::<Party>::builder(name)
        .initial(Party::default)
        .apply(|party: &mut Party, e: MembersJoined| {
            party.members.extend(e.members);
            party.changes += 1;
        })
        .apply(|party: &mut Party, e: MembersDeparted| {
            party.members.retain(|m| !e.members.contains(m));
            party.changes += 1;
        })
        .delete_on::<PartyDisbanded>()
        .lifecycle(lifecycle)
        .build()
        .expect("party aggregation should build")
}
