//! Persisted aggregate documents.
//!
//! One row per (projection, tenant, stream) in `aggregates`. A row records
//! the stream version and sequence it reflects, so re-folding an event the
//! document already saw is skipped. Deleted aggregates keep their row with
//! status `deleted` and no data, so later events can revive them.

use sea_query::{Expr, OnConflict, Query, SqliteQueryBuilder};
use sea_query_binder::SqlxBinder;
use sqlx::{Row, SqliteConnection, SqliteExecutor};

use crate::error::{Result, StoreError};
use crate::events::StreamId;
use crate::storage::helpers::{format_timestamp, now};
use crate::storage::schema::Aggregates;

/// Lifecycle marker stored with each document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentStatus {
    Live,
    Deleted,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Live => "live",
            DocumentStatus::Deleted => "deleted",
        }
    }

    fn parse(text: &str) -> Result<Self> {
        match text {
            "live" => Ok(DocumentStatus::Live),
            "deleted" => Ok(DocumentStatus::Deleted),
            other => Err(StoreError::Serialization(format!(
                "unknown aggregate status '{other}'"
            ))),
        }
    }
}

/// One stored aggregate row.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateDocument {
    pub projection: String,
    pub tenant_id: String,
    pub stream_id: String,
    /// Stream version of the last folded event.
    pub version: i64,
    pub last_sequence: i64,
    pub status: DocumentStatus,
    /// Serialized state; `None` once deleted.
    pub data: Option<Vec<u8>>,
}

/// Load the document for one stream.
pub async fn load_document<'e, E: SqliteExecutor<'e>>(
    executor: E,
    projection: &str,
    tenant_id: &str,
    stream_id: &StreamId,
) -> Result<Option<AggregateDocument>> {
    let (sql, values) = Query::select()
        .columns([
            Aggregates::Projection,
            Aggregates::TenantId,
            Aggregates::StreamId,
            Aggregates::Version,
            Aggregates::LastSequence,
            Aggregates::Status,
            Aggregates::Data,
        ])
        .from(Aggregates::Table)
        .and_where(Expr::col(Aggregates::Projection).eq(projection))
        .and_where(Expr::col(Aggregates::TenantId).eq(tenant_id))
        .and_where(Expr::col(Aggregates::StreamId).eq(stream_id.as_text()))
        .build_sqlx(SqliteQueryBuilder);

    let row = sqlx::query_with(&sql, values).fetch_optional(executor).await?;
    let Some(row) = row else {
        return Ok(None);
    };

    let status: String = row.try_get("status")?;
    Ok(Some(AggregateDocument {
        projection: row.try_get("projection")?,
        tenant_id: row.try_get("tenant_id")?,
        stream_id: row.try_get("stream_id")?,
        version: row.try_get("version")?,
        last_sequence: row.try_get("last_sequence")?,
        status: DocumentStatus::parse(&status)?,
        data: row.try_get("data")?,
    }))
}

/// Insert or replace a document.
pub async fn save_document(conn: &mut SqliteConnection, document: &AggregateDocument) -> Result<()> {
    let (sql, values) = Query::insert()
        .into_table(Aggregates::Table)
        .columns([
            Aggregates::Projection,
            Aggregates::TenantId,
            Aggregates::StreamId,
            Aggregates::Version,
            Aggregates::LastSequence,
            Aggregates::Status,
            Aggregates::Data,
            Aggregates::UpdatedAt,
        ])
        .values_panic([
            document.projection.as_str().into(),
            document.tenant_id.as_str().into(),
            document.stream_id.as_str().into(),
            document.version.into(),
            document.last_sequence.into(),
            document.status.as_str().into(),
            document.data.clone().into(),
            format_timestamp(&now()).into(),
        ])
        .on_conflict(
            OnConflict::columns([
                Aggregates::Projection,
                Aggregates::TenantId,
                Aggregates::StreamId,
            ])
            .update_columns([
                Aggregates::Version,
                Aggregates::LastSequence,
                Aggregates::Status,
                Aggregates::Data,
                Aggregates::UpdatedAt,
            ])
            .to_owned(),
        )
        .build_sqlx(SqliteQueryBuilder);

    sqlx::query_with(&sql, values).execute(&mut *conn).await?;
    Ok(())
}

/// Remove every document of a projection. Returns the number removed.
pub async fn delete_documents(conn: &mut SqliteConnection, projection: &str) -> Result<u64> {
    let (sql, values) = Query::delete()
        .from_table(Aggregates::Table)
        .and_where(Expr::col(Aggregates::Projection).eq(projection))
        .build_sqlx(SqliteQueryBuilder);

    let result = sqlx::query_with(&sql, values).execute(&mut *conn).await?;
    Ok(result.rows_affected())
}

/// All documents of a projection, ordered by tenant then stream.
pub async fn list_documents<'e, E: SqliteExecutor<'e>>(
    executor: E,
    projection: &str,
) -> Result<Vec<AggregateDocument>> {
    let (sql, values) = Query::select()
        .columns([
            Aggregates::Projection,
            Aggregates::TenantId,
            Aggregates::StreamId,
            Aggregates::Version,
            Aggregates::LastSequence,
            Aggregates::Status,
            Aggregates::Data,
        ])
        .from(Aggregates::Table)
        .and_where(Expr::col(Aggregates::Projection).eq(projection))
        .order_by(Aggregates::TenantId, sea_query::Order::Asc)
        .order_by(Aggregates::StreamId, sea_query::Order::Asc)
        .build_sqlx(SqliteQueryBuilder);

    let rows = sqlx::query_with(&sql, values).fetch_all(executor).await?;
    rows.iter()
        .map(|row| {
            let status: String = row.try_get("status")?;
            Ok(AggregateDocument {
                projection: row.try_get("projection")?,
                tenant_id: row.try_get("tenant_id")?,
                stream_id: row.try_get("stream_id")?,
                version: row.try_get("version")?,
                last_sequence: row.try_get("last_sequence")?,
                status: DocumentStatus::parse(&status)?,
                data: row.try_get("data")?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_text() {
        for status in [DocumentStatus::Live, DocumentStatus::Deleted] {
            assert_eq!(DocumentStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(DocumentStatus::parse("archived").is_err());
    }
}
