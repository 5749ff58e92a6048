//! Durable write statements.
//!
//! Every function here runs on a connection that already holds the write
//! transaction; none of them commits.

use chrono::{DateTime, Utc};
use sea_query::{Expr, Query, SqliteQueryBuilder};
use sea_query_binder::SqlxBinder;
use sqlx::{Row, SqliteConnection};

use super::helpers::{format_timestamp, headers_to_column};
use super::schema::{Aggregates, Events, Streams};
use crate::error::{Result, StoreError};
use crate::events::{Event, StreamAction, StreamId};

/// Rows per multi-row insert, kept under SQLite's bound-parameter limit.
const INSERT_CHUNK: usize = 64;

/// Create the stream row for a `Start` action at its resulting version.
pub async fn insert_stream(
    conn: &mut SqliteConnection,
    action: &StreamAction,
    version: i64,
    now: DateTime<Utc>,
) -> Result<()> {
    let timestamp = format_timestamp(&now);
    let (sql, values) = Query::insert()
        .into_table(Streams::Table)
        .columns([
            Streams::Id,
            Streams::TenantId,
            Streams::StreamType,
            Streams::Version,
            Streams::CreatedAt,
            Streams::LastModified,
            Streams::IsArchived,
        ])
        .values_panic([
            action.stream_id.as_text().into(),
            action.tenant_id.as_str().into(),
            action.stream_type.clone().into(),
            version.into(),
            timestamp.clone().into(),
            timestamp.into(),
            false.into(),
        ])
        .build_sqlx(SqliteQueryBuilder);

    match sqlx::query_with(&sql, values).execute(&mut *conn).await {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
            Err(StoreError::ExistingStreamCollision {
                stream_id: action.stream_id.clone(),
            })
        }
        Err(e) => Err(e.into()),
    }
}

/// Bulk insert numbered events.
pub async fn insert_events(conn: &mut SqliteConnection, events: &[Event]) -> Result<()> {
    for chunk in events.chunks(INSERT_CHUNK) {
        let mut insert = Query::insert();
        insert.into_table(Events::Table).columns([
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
        ]);

        for event in chunk {
            insert.values_panic([
                event.sequence.into(),
                event.id.to_string().into(),
                event.stream_id.as_text().into(),
                event.version.into(),
                event.event_type.as_str().into(),
                event.data.clone().into(),
                format_timestamp(&event.timestamp).into(),
                event.tenant_id.as_str().into(),
                event.stream_type.clone().into(),
                event.metadata.correlation_id.clone().into(),
                event.metadata.causation_id.clone().into(),
                headers_to_column(&event.metadata)?.into(),
                event.is_archived.into(),
            ]);
        }

        let (sql, values) = insert.build_sqlx(SqliteQueryBuilder);
        sqlx::query_with(&sql, values).execute(&mut *conn).await?;
    }
    Ok(())
}

/// Physically remove a stream, returning the sequences its events held.
///
/// Materialized aggregate documents for the stream go with it.
pub async fn delete_stream_rows(conn: &mut SqliteConnection, stream_id: &StreamId) -> Result<Vec<i64>> {
    let id = stream_id.as_text();

    let (sql, values) = Query::select()
        .column(Events::Sequence)
        .from(Events::Table)
        .and_where(Expr::col(Events::StreamId).eq(id.as_str()))
        .order_by(Events::Sequence, sea_query::Order::Asc)
        .build_sqlx(SqliteQueryBuilder);
    let rows = sqlx::query_with(&sql, values).fetch_all(&mut *conn).await?;
    let sequences = rows
        .iter()
        .map(|row| row.try_get::<i64, _>("sequence"))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let (sql, values) = Query::delete()
        .from_table(Events::Table)
        .and_where(Expr::col(Events::StreamId).eq(id.as_str()))
        .build_sqlx(SqliteQueryBuilder);
    sqlx::query_with(&sql, values).execute(&mut *conn).await?;

    let (sql, values) = Query::delete()
        .from_table(Aggregates::Table)
        .and_where(Expr::col(Aggregates::StreamId).eq(id.as_str()))
        .build_sqlx(SqliteQueryBuilder);
    sqlx::query_with(&sql, values).execute(&mut *conn).await?;

    let (sql, values) = Query::delete()
        .from_table(Streams::Table)
        .and_where(Expr::col(Streams::Id).eq(id.as_str()))
        .build_sqlx(SqliteQueryBuilder);
    sqlx::query_with(&sql, values).execute(&mut *conn).await?;

    Ok(sequences)
}
