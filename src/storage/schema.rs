//! Database schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query building,
//! plus the idempotent DDL applied when a store opens.

use sea_query::Iden;

/// Streams table schema.
#[derive(Iden)]
pub enum Streams {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "tenant_id"]
    TenantId,
    #[iden = "stream_type"]
    StreamType,
    #[iden = "version"]
    Version,
    #[iden = "created_at"]
    CreatedAt,
    #[iden = "last_modified"]
    LastModified,
    #[iden = "is_archived"]
    IsArchived,
}

/// Events table schema.
#[derive(Iden)]
pub enum Events {
    Table,
    #[iden = "sequence"]
    Sequence,
    #[iden = "id"]
    Id,
    #[iden = "stream_id"]
    StreamId,
    #[iden = "version"]
    Version,
    #[iden = "event_type"]
    EventType,
    #[iden = "data"]
    Data,
    #[iden = "timestamp"]
    Timestamp,
    #[iden = "tenant_id"]
    TenantId,
    #[iden = "stream_type"]
    StreamType,
    #[iden = "correlation_id"]
    CorrelationId,
    #[iden = "causation_id"]
    CausationId,
    #[iden = "headers"]
    Headers,
    #[iden = "is_archived"]
    IsArchived,
}

/// Named atomic counters.
#[derive(Iden)]
pub enum EventSequences {
    Table,
    #[iden = "name"]
    Name,
    #[iden = "value"]
    Value,
}

/// Exclusive stream locks.
#[derive(Iden)]
pub enum StreamLocks {
    Table,
    #[iden = "stream_id"]
    StreamId,
    #[iden = "tenant_id"]
    TenantId,
    #[iden = "owner"]
    Owner,
    #[iden = "acquired_at"]
    AcquiredAt,
    #[iden = "expires_at"]
    ExpiresAt,
}

/// Materialized aggregate documents.
#[derive(Iden)]
pub enum Aggregates {
    Table,
    #[iden = "projection"]
    Projection,
    #[iden = "tenant_id"]
    TenantId,
    #[iden = "stream_id"]
    StreamId,
    #[iden = "version"]
    Version,
    #[iden = "last_sequence"]
    LastSequence,
    #[iden = "status"]
    Status,
    #[iden = "data"]
    Data,
    #[iden = "updated_at"]
    UpdatedAt,
}

/// Async projection checkpoints.
#[derive(Iden)]
pub enum ProjectionProgress {
    Table,
    #[iden = "name"]
    Name,
    #[iden = "last_sequence"]
    LastSequence,
    #[iden = "status"]
    Status,
    #[iden = "last_error"]
    LastError,
    #[iden = "error_count"]
    ErrorCount,
    #[iden = "updated_at"]
    UpdatedAt,
}

/// Counter backing the store-wide event sequence.
pub const EVENT_SEQUENCE_NAME: &str = "events";

/// SQL for creating the streams table.
pub const CREATE_STREAMS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS streams (
    id TEXT NOT NULL PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    stream_type TEXT,
    version INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    last_modified TEXT NOT NULL,
    is_archived INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_streams_tenant ON streams(tenant_id);
"#;

/// SQL for creating the events table.
pub const CREATE_EVENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    sequence INTEGER NOT NULL PRIMARY KEY,
    id TEXT NOT NULL UNIQUE,
    stream_id TEXT NOT NULL,
    version INTEGER NOT NULL,
    event_type TEXT NOT NULL,
    data BLOB NOT NULL,
    timestamp TEXT NOT NULL,
    tenant_id TEXT NOT NULL,
    stream_type TEXT,
    correlation_id TEXT,
    causation_id TEXT,
    headers TEXT,
    is_archived INTEGER NOT NULL DEFAULT 0,
    UNIQUE (stream_id, version)
);

CREATE INDEX IF NOT EXISTS idx_events_tenant_sequence ON events(tenant_id, sequence);
"#;

/// SQL for creating the sequence counter table and seeding the event counter.
pub const CREATE_EVENT_SEQUENCES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS event_sequences (
    name TEXT NOT NULL PRIMARY KEY,
    value INTEGER NOT NULL
);

INSERT OR IGNORE INTO event_sequences (name, value) VALUES ('events', 0);
"#;

/// SQL for creating the exclusive lock table.
pub const CREATE_STREAM_LOCKS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS stream_locks (
    stream_id TEXT NOT NULL PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    owner TEXT NOT NULL,
    acquired_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);
"#;

/// SQL for creating the aggregate document table.
pub const CREATE_AGGREGATES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS aggregates (
    projection TEXT NOT NULL,
    tenant_id TEXT NOT NULL,
    stream_id TEXT NOT NULL,
    version INTEGER NOT NULL,
    last_sequence INTEGER NOT NULL,
    status TEXT NOT NULL,
    data BLOB,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (projection, tenant_id, stream_id)
);

CREATE INDEX IF NOT EXISTS idx_aggregates_stream ON aggregates(stream_id);
"#;

/// SQL for creating the projection checkpoint table.
pub const CREATE_PROJECTION_PROGRESS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS projection_progress (
    name TEXT NOT NULL PRIMARY KEY,
    last_sequence INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    last_error TEXT,
    error_count INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
);
"#;

/// All DDL, in dependency order.
pub const ALL_TABLES: [&str; 6] = [
    CREATE_STREAMS_TABLE,
    CREATE_EVENTS_TABLE,
    CREATE_EVENT_SEQUENCES_TABLE,
    CREATE_STREAM_LOCKS_TABLE,
    CREATE_AGGREGATES_TABLE,
    CREATE_PROJECTION_PROGRESS_TABLE,
];
