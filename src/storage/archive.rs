//! Stream archiving.
//!
//! Archiving is soft: the stream row and every event row get
//! `is_archived = 1` and drop out of default reads, but nothing is deleted.
//! It runs as a queued session operation inside the normal write
//! transaction.

use chrono::{DateTime, Utc};
use sea_query::{Expr, Query, SqliteQueryBuilder};
use sea_query_binder::SqlxBinder;
use sqlx::SqliteConnection;
use tracing::debug;

use super::helpers::format_timestamp;
use super::reader::select_stream;
use super::schema::{Events, Streams};
use crate::error::{Result, StoreError};
use crate::events::{StreamId, StreamIdentity};

/// Mark a stream and its events archived. Re-archiving is a no-op.
pub async fn archive_stream(
    conn: &mut SqliteConnection,
    identity: StreamIdentity,
    stream_id: &StreamId,
    tenant_id: &str,
    now: DateTime<Utc>,
) -> Result<()> {
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
    if stream.is_archived {
        return Ok(());
    }

    let id = stream_id.as_text();

    let (sql, values) = Query::update()
        .table(Streams::Table)
        .values([
            (Streams::IsArchived, true.into()),
            (Streams::LastModified, format_timestamp(&now).into()),
        ])
        .and_where(Expr::col(Streams::Id).eq(id.as_str()))
        .build_sqlx(SqliteQueryBuilder);
    sqlx::query_with(&sql, values).execute(&mut *conn).await?;

    let (sql, values) = Query::update()
        .table(Events::Table)
        .value(Events::IsArchived, true)
        .and_where(Expr::col(Events::StreamId).eq(id.as_str()))
        .build_sqlx(SqliteQueryBuilder);
    let archived = sqlx::query_with(&sql, values).execute(&mut *conn).await?;

    debug!(stream_id = %stream_id, events = archived.rows_affected(), "Archived stream");
    Ok(())
}
