//! Concurrency guard.
//!
//! Validates a stream action against the persisted stream before its events
//! are numbered, and owns the only write path to `streams.version`: a
//! compare-and-swap that fails when the version moved underneath the writer.

use chrono::{DateTime, Utc};
use sea_query::{Expr, Query, SqliteQueryBuilder};
use sea_query_binder::SqlxBinder;
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

use super::helpers::format_timestamp;
use super::locks::lock_holder;
use super::schema::Streams;
use crate::error::{Result, StoreError};
use crate::events::{ConcurrencyMode, StreamAction, StreamActionKind, StreamId, StreamState};

pub struct ConcurrencyGuard;

impl ConcurrencyGuard {
    /// Check an action inside the write transaction.
    pub async fn validate(
        conn: &mut SqliteConnection,
        action: &StreamAction,
        persisted: Option<&StreamState>,
        owner: Uuid,
    ) -> Result<()> {
        let holder = match (action.kind, persisted) {
            (StreamActionKind::Append, Some(_)) => lock_holder(&mut *conn, &action.stream_id).await?,
            _ => None,
        };
        Self::check(action, persisted, holder, owner)
    }

    /// Pure validation rules, in precedence order.
    pub fn check(
        action: &StreamAction,
        persisted: Option<&StreamState>,
        lock_holder: Option<Uuid>,
        owner: Uuid,
    ) -> Result<()> {
        let stream_id = &action.stream_id;

        if action.kind == StreamActionKind::Start {
            return match persisted {
                Some(_) => Err(StoreError::ExistingStreamCollision {
                    stream_id: stream_id.clone(),
                }),
                None => Ok(()),
            };
        }

        let stream = persisted.ok_or_else(|| StoreError::StreamNotFound {
            stream_id: stream_id.clone(),
        })?;

        if stream.tenant_id != action.tenant_id {
            return Err(StoreError::TenantMismatch {
                stream_id: stream_id.clone(),
                expected: action.tenant_id.clone(),
                actual: stream.tenant_id.clone(),
            });
        }

        if stream.is_archived {
            return Err(StoreError::StreamArchived {
                stream_id: stream_id.clone(),
            });
        }

        let locked_by_other = match (action.mode, lock_holder) {
            (_, Some(holder)) => holder != owner,
            // exclusive writers must still hold a live lease
            (ConcurrencyMode::Exclusive, None) => true,
            (ConcurrencyMode::Optimistic, None) => false,
        };
        if locked_by_other {
            return Err(StoreError::StreamLocked {
                stream_id: stream_id.clone(),
            });
        }

        if let Some(expected) = action.expected_version {
            if expected != stream.version {
                return Err(StoreError::VersionConflict {
                    stream_id: stream_id.clone(),
                    expected,
                    actual: stream.version,
                });
            }
        }

        Ok(())
    }

    /// Compare-and-swap the stream version from `expected` to `new_version`.
    pub async fn advance_version(
        conn: &mut SqliteConnection,
        stream_id: &StreamId,
        expected: i64,
        new_version: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let (sql, values) = Query::update()
            .table(Streams::Table)
            .values([
                (Streams::Version, new_version.into()),
                (Streams::LastModified, format_timestamp(&now).into()),
            ])
            .and_where(Expr::col(Streams::Id).eq(stream_id.as_text()))
            .and_where(Expr::col(Streams::Version).eq(expected))
            .build_sqlx(SqliteQueryBuilder);

        let result = sqlx::query_with(&sql, values).execute(&mut *conn).await?;
        if result.rows_affected() == 1 {
            return Ok(());
        }

        let (sql, values) = Query::select()
            .column(Streams::Version)
            .from(Streams::Table)
            .and_where(Expr::col(Streams::Id).eq(stream_id.as_text()))
            .build_sqlx(SqliteQueryBuilder);

        match sqlx::query_with(&sql, values).fetch_optional(&mut *conn).await? {
            Some(row) => Err(StoreError::VersionConflict {
                stream_id: stream_id.clone(),
                expected,
                actual: row.try_get("version")?,
            }),
            None => Err(StoreError::StreamNotFound {
                stream_id: stream_id.clone(),
            }),
        }
    }
}
