//! Lease-based exclusive stream locks.
//!
//! SQLite has no row-level locks, so exclusive writers claim a row in
//! `stream_locks`. A claim succeeds when no row exists, the existing row's
//! lease expired, or the row already belongs to the claimant. Claims are
//! released inside the holder's commit, after its rollback, or by lease
//! expiry if the holder vanished.

use std::time::Duration;

use backon::Retryable;
use chrono::Utc;
use sea_query::{Expr, OnConflict, Query, SqliteQueryBuilder};
use sea_query_binder::SqlxBinder;
use sqlx::{Row, SqliteExecutor, SqlitePool};
use tracing::{debug, warn};
use uuid::Uuid;

use super::helpers::{format_timestamp, now};
use super::schema::StreamLocks as Locks;
use crate::error::{Result, StoreError};
use crate::events::StreamId;
use crate::utils::retry::lock_wait_backoff;

/// Behaviour when a stream's lock is held by someone else.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LockWaitPolicy {
    /// Return `StreamLocked` immediately.
    #[default]
    FailFast,
    /// Poll with backoff until the lock frees up or the timeout passes.
    Wait { timeout: Duration },
}

/// Claims and releases exclusive stream locks.
#[derive(Clone)]
pub struct StreamLocks {
    pool: SqlitePool,
    lease: Duration,
    policy: LockWaitPolicy,
}

impl StreamLocks {
    pub fn new(pool: SqlitePool, lease: Duration, policy: LockWaitPolicy) -> Self {
        Self {
            pool,
            lease,
            policy,
        }
    }

    pub fn policy(&self) -> LockWaitPolicy {
        self.policy
    }

    /// Claim the stream for `owner`, honouring the wait policy.
    pub async fn acquire(&self, stream_id: &StreamId, tenant_id: &str, owner: Uuid) -> Result<()> {
        let attempt = || async {
            if self.try_acquire(stream_id, tenant_id, owner).await? {
                Ok(())
            } else {
                Err(StoreError::StreamLocked {
                    stream_id: stream_id.clone(),
                })
            }
        };

        match self.policy {
            LockWaitPolicy::FailFast => attempt().await,
            LockWaitPolicy::Wait { timeout } => {
                let waiting = attempt
                    .retry(lock_wait_backoff(timeout))
                    .when(|e| matches!(e, StoreError::StreamLocked { .. }));

                match tokio::time::timeout(timeout, waiting).await {
                    Ok(result) => result,
                    Err(_) => Err(StoreError::StreamLocked {
                        stream_id: stream_id.clone(),
                    }),
                }
            }
        }
    }

    /// One claim attempt. `Ok(false)` when another owner holds a live lease.
    pub async fn try_acquire(&self, stream_id: &StreamId, tenant_id: &str, owner: Uuid) -> Result<bool> {
        let acquired_at = now();
        let lease = chrono::Duration::from_std(self.lease)
            .map_err(|e| StoreError::Configuration(format!("invalid lock lease: {e}")))?;
        let expires_at = acquired_at + lease;
        let now_text = format_timestamp(&acquired_at);

        let (sql, values) = Query::insert()
            .into_table(Locks::Table)
            .columns([
                Locks::StreamId,
                Locks::TenantId,
                Locks::Owner,
                Locks::AcquiredAt,
                Locks::ExpiresAt,
            ])
            .values_panic([
                stream_id.as_text().into(),
                tenant_id.into(),
                owner.to_string().into(),
                now_text.clone().into(),
                format_timestamp(&expires_at).into(),
            ])
            .on_conflict(
                OnConflict::column(Locks::StreamId)
                    .update_columns([
                        Locks::TenantId,
                        Locks::Owner,
                        Locks::AcquiredAt,
                        Locks::ExpiresAt,
                    ])
                    .action_and_where(
                        Expr::col((Locks::Table, Locks::ExpiresAt))
                            .lt(now_text)
                            .or(Expr::col((Locks::Table, Locks::Owner)).eq(owner.to_string())),
                    )
                    .to_owned(),
            )
            .build_sqlx(SqliteQueryBuilder);

        let result = sqlx::query_with(&sql, values).execute(&self.pool).await?;
        let acquired = result.rows_affected() == 1;

        debug!(stream_id = %stream_id, owner = %owner, acquired, "Exclusive lock claim");
        Ok(acquired)
    }

    /// Drop every lock held by `owner`.
    pub async fn release(&self, owner: Uuid) -> Result<u64> {
        release_owner(&self.pool, owner).await
    }

    /// Release from a context that cannot await, such as `Drop`.
    ///
    /// Falls back to lease expiry when no runtime is available.
    pub fn release_in_background(&self, owner: Uuid) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let pool = self.pool.clone();
                handle.spawn(async move {
                    if let Err(e) = release_owner(&pool, owner).await {
                        warn!(owner = %owner, error = %e, "Failed to release abandoned stream locks");
                    }
                });
            }
            Err(_) => {
                warn!(owner = %owner, "No runtime to release stream locks, waiting for lease expiry");
            }
        }
    }
}

/// Delete `owner`'s locks on the given executor (pool or open transaction).
pub async fn release_owner<'e, E: SqliteExecutor<'e>>(executor: E, owner: Uuid) -> Result<u64> {
    let (sql, values) = Query::delete()
        .from_table(Locks::Table)
        .and_where(Expr::col(Locks::Owner).eq(owner.to_string()))
        .build_sqlx(SqliteQueryBuilder);

    let result = sqlx::query_with(&sql, values).execute(executor).await?;
    Ok(result.rows_affected())
}

/// Owner of a live lease on the stream, if any.
pub async fn lock_holder<'e, E: SqliteExecutor<'e>>(
    executor: E,
    stream_id: &StreamId,
) -> Result<Option<Uuid>> {
    let (sql, values) = Query::select()
        .column(Locks::Owner)
        .from(Locks::Table)
        .and_where(Expr::col(Locks::StreamId).eq(stream_id.as_text()))
        .and_where(Expr::col(Locks::ExpiresAt).gte(format_timestamp(&Utc::now())))
        .build_sqlx(SqliteQueryBuilder);

    let row = sqlx::query_with(&sql, values).fetch_optional(executor).await?;
    match row {
        Some(row) => {
            let owner: String = row.try_get("owner")?;
            Ok(Some(Uuid::parse_str(&owner)?))
        }
        None => Ok(None),
    }
}
