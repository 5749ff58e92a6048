//! Shared storage helper functions.
//!
//! Timestamp encoding and row mapping used by the readers and writers.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use super::schema::{Events, Streams};
use crate::error::Result;
use crate::events::{Event, EventMetadata, StreamId, StreamIdentity, StreamState};

/// Current time at stored precision, so committed and re-read values match.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// RFC 3339, UTC, microseconds. Lexical order equals chronological order.
pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(text: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(text)?.with_timezone(&Utc))
}

/// Columns selected for [`event_from_row`].
pub fn event_columns() -> [Events; 13] {
    [
        Events::Sequence,
        Events::Id,
        Events::StreamId,
        Events::Version,
        Events::EventType,
        Events::Data,
        Events::Timestamp,
        Events::TenantId,
        Events::StreamType,
        Events::CorrelationId,
        Events::CausationId,
        Events::Headers,
        Events::IsArchived,
    ]
}

pub fn event_from_row(row: &SqliteRow, identity: StreamIdentity) -> Result<Event> {
    let id: String = row.try_get("id")?;
    let stream_id: String = row.try_get("stream_id")?;
    let timestamp: String = row.try_get("timestamp")?;
    let headers: Option<String> = row.try_get("headers")?;

    let headers: BTreeMap<String, serde_json::Value> = match headers {
        Some(text) => serde_json::from_str(&text)?,
        None => BTreeMap::new(),
    };

    Ok(Event {
        id: Uuid::parse_str(&id)?,
        stream_id: StreamId::parse(identity, &stream_id)?,
        version: row.try_get("version")?,
        sequence: row.try_get("sequence")?,
        timestamp: parse_timestamp(&timestamp)?,
        event_type: row.try_get("event_type")?,
        data: row.try_get("data")?,
        tenant_id: row.try_get("tenant_id")?,
        stream_type: row.try_get("stream_type")?,
        metadata: EventMetadata {
            correlation_id: row.try_get("correlation_id")?,
            causation_id: row.try_get("causation_id")?,
            headers,
        },
        is_archived: row.try_get("is_archived")?,
    })
}

/// Columns selected for [`stream_from_row`].
pub fn stream_columns() -> [Streams; 7] {
    [
        Streams::Id,
        Streams::TenantId,
        Streams::StreamType,
        Streams::Version,
        Streams::CreatedAt,
        Streams::LastModified,
        Streams::IsArchived,
    ]
}

pub fn stream_from_row(row: &SqliteRow, identity: StreamIdentity) -> Result<StreamState> {
    let id: String = row.try_get("id")?;
    let created_at: String = row.try_get("created_at")?;
    let last_modified: String = row.try_get("last_modified")?;

    Ok(StreamState {
        id: StreamId::parse(identity, &id)?,
        stream_type: row.try_get("stream_type")?,
        version: row.try_get("version")?,
        created_at: parse_timestamp(&created_at)?,
        last_modified: parse_timestamp(&last_modified)?,
        is_archived: row.try_get("is_archived")?,
        tenant_id: row.try_get("tenant_id")?,
    })
}

/// Headers column value; empty maps are stored as NULL.
pub fn headers_to_column(metadata: &EventMetadata) -> Result<Option<String>> {
    if metadata.headers.is_empty() {
        Ok(None)
    } else {
        Ok(Some(serde_json::to_string(&metadata.headers)?))
    }
}
