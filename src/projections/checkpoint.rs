//! Async projection checkpoints.
//!
//! `projection_progress` holds, per projection, the highest global sequence
//! whose effects are committed, plus fault bookkeeping. The checkpoint is
//! always written on the same transaction as the folded documents.

use chrono::{DateTime, Utc};
use sea_query::{Expr, OnConflict, Query, SqliteQueryBuilder};
use sea_query_binder::SqlxBinder;
use sqlx::{Row, SqliteExecutor};

use crate::error::{Result, StoreError};
use crate::storage::helpers::{format_timestamp, now, parse_timestamp};
use crate::storage::schema::ProjectionProgress as Progress;

/// Worker state recorded with the checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionStatus {
    Running,
    Rebuilding,
    /// Retries exhausted; the worker stopped.
    Faulted,
    Stopped,
}

impl ProjectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectionStatus::Running => "running",
            ProjectionStatus::Rebuilding => "rebuilding",
            ProjectionStatus::Faulted => "faulted",
            ProjectionStatus::Stopped => "stopped",
        }
    }

    fn parse(text: &str) -> Result<Self> {
        match text {
            "running" => Ok(ProjectionStatus::Running),
            "rebuilding" => Ok(ProjectionStatus::Rebuilding),
            "faulted" => Ok(ProjectionStatus::Faulted),
            "stopped" => Ok(ProjectionStatus::Stopped),
            other => Err(StoreError::Serialization(format!(
                "unknown projection status '{other}'"
            ))),
        }
    }
}

/// Stored checkpoint row.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionProgress {
    pub name: String,
    pub last_sequence: i64,
    pub status: ProjectionStatus,
    pub last_error: Option<String>,
    /// Consecutive failures since the last successful batch.
    pub error_count: i64,
    pub updated_at: DateTime<Utc>,
}

pub async fn load<'e, E: SqliteExecutor<'e>>(executor: E, name: &str) -> Result<Option<ProjectionProgress>> {
    let (sql, values) = Query::select()
        .columns([
            Progress::Name,
            Progress::LastSequence,
            Progress::Status,
            Progress::LastError,
            Progress::ErrorCount,
            Progress::UpdatedAt,
        ])
        .from(Progress::Table)
        .and_where(Expr::col(Progress::Name).eq(name))
        .build_sqlx(SqliteQueryBuilder);

    let row = sqlx::query_with(&sql, values).fetch_optional(executor).await?;
    let Some(row) = row else {
        return Ok(None);
    };

    let status: String = row.try_get("status")?;
    let updated_at: String = row.try_get("updated_at")?;
    Ok(Some(ProjectionProgress {
        name: row.try_get("name")?,
        last_sequence: row.try_get("last_sequence")?,
        status: ProjectionStatus::parse(&status)?,
        last_error: row.try_get("last_error")?,
        error_count: row.try_get("error_count")?,
        updated_at: parse_timestamp(&updated_at)?,
    }))
}

/// Last committed sequence, 0 before the first batch.
pub async fn position<'e, E: SqliteExecutor<'e>>(executor: E, name: &str) -> Result<i64> {
    Ok(load(executor, name).await?.map(|p| p.last_sequence).unwrap_or(0))
}

/// Advance the checkpoint after a successful batch and clear any fault.
pub async fn advance<'e, E: SqliteExecutor<'e>>(executor: E, name: &str, last_sequence: i64) -> Result<()> {
    upsert(
        executor,
        name,
        Some(last_sequence),
        ProjectionStatus::Running,
        None,
        0,
    )
    .await
}

/// Rewind to zero ahead of a rebuild.
pub async fn reset<'e, E: SqliteExecutor<'e>>(executor: E, name: &str) -> Result<()> {
    upsert(executor, name, Some(0), ProjectionStatus::Rebuilding, None, 0).await
}

/// Record a failed batch without moving the checkpoint.
pub async fn record_error<'e, E: SqliteExecutor<'e>>(
    executor: E,
    name: &str,
    error: &str,
    error_count: i64,
    status: ProjectionStatus,
) -> Result<()> {
    upsert(executor, name, None, status, Some(error), error_count).await
}

pub async fn set_status<'e, E: SqliteExecutor<'e>>(
    executor: E,
    name: &str,
    status: ProjectionStatus,
) -> Result<()> {
    let (sql, values) = Query::insert()
        .into_table(Progress::Table)
        .columns([
            Progress::Name,
            Progress::LastSequence,
            Progress::Status,
            Progress::ErrorCount,
            Progress::UpdatedAt,
        ])
        .values_panic([
            name.into(),
            0i64.into(),
            status.as_str().into(),
            0i64.into(),
            format_timestamp(&now()).into(),
        ])
        .on_conflict(
            OnConflict::column(Progress::Name)
                .update_columns([Progress::Status, Progress::UpdatedAt])
                .to_owned(),
        )
        .build_sqlx(SqliteQueryBuilder);

    sqlx::query_with(&sql, values).execute(executor).await?;
    Ok(())
}

async fn upsert<'e, E: SqliteExecutor<'e>>(
    executor: E,
    name: &str,
    last_sequence: Option<i64>,
    status: ProjectionStatus,
    last_error: Option<&str>,
    error_count: i64,
) -> Result<()> {
    let mut update = vec![
        Progress::Status,
        Progress::LastError,
        Progress::ErrorCount,
        Progress::UpdatedAt,
    ];
    if last_sequence.is_some() {
        update.push(Progress::LastSequence);
    }

    let (sql, values) = Query::insert()
        .into_table(Progress::Table)
        .columns([
            Progress::Name,
            Progress::LastSequence,
            Progress::Status,
            Progress::LastError,
            Progress::ErrorCount,
            Progress::UpdatedAt,
        ])
        .values_panic([
            name.into(),
            last_sequence.unwrap_or(0).into(),
            status.as_str().into(),
            last_error.map(str::to_string).into(),
            error_count.into(),
            format_timestamp(&now()).into(),
        ])
        .on_conflict(OnConflict::column(Progress::Name).update_columns(update).to_owned())
        .build_sqlx(SqliteQueryBuilder);

    sqlx::query_with(&sql, values).execute(executor).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_text_round_trip() {
        for status in [
            ProjectionStatus::Running,
            ProjectionStatus::Rebuilding,
            ProjectionStatus::Faulted,
            ProjectionStatus::Stopped,
        ] {
            assert_eq!(ProjectionStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(ProjectionStatus::parse("paused").is_err());
    }
}
