//! Event and stream queries.
//!
//! The free functions take any SQLite executor so the write pipeline and the
//! projection daemon can run them inside their own transactions;
//! [`SqliteEventReader`] wraps them for tenant-scoped reads on the pool.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_query::{Expr, Order, Query, SelectStatement, SqliteQueryBuilder};
use sea_query_binder::SqlxBinder;
use sqlx::{Row, SqliteExecutor, SqlitePool};

use super::helpers::{event_columns, event_from_row, format_timestamp, stream_columns, stream_from_row};
use super::schema::{Events, Streams};
use super::tombstone::TOMBSTONE_EVENT_TYPE;
use crate::error::Result;
use crate::events::{Event, StreamId, StreamIdentity, StreamState};

/// Bounds for a stream read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchOptions {
    /// Lowest version returned, inclusive.
    pub from_version: Option<i64>,
    /// Highest version returned, inclusive.
    pub to_version: Option<i64>,
    /// Only events recorded at or before this instant.
    pub as_of: Option<DateTime<Utc>>,
    pub include_archived: bool,
}

impl FetchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_version(mut self, version: i64) -> Self {
        self.from_version = Some(version);
        self
    }

    pub fn to_version(mut self, version: i64) -> Self {
        self.to_version = Some(version);
        self
    }

    pub fn as_of(mut self, timestamp: DateTime<Utc>) -> Self {
        self.as_of = Some(timestamp);
        self
    }

    pub fn include_archived(mut self) -> Self {
        self.include_archived = true;
        self
    }
}

/// Read side of the event log.
#[async_trait]
pub trait EventReader: Send + Sync {
    /// Events of one stream in version order.
    async fn fetch_stream(&self, stream_id: &StreamId, options: FetchOptions) -> Result<Vec<Event>>;

    async fn fetch_stream_state(&self, stream_id: &StreamId) -> Result<Option<StreamState>>;

    /// Events with a sequence above `sequence`, ascending, tombstones excluded.
    async fn fetch_events_after(
        &self,
        sequence: i64,
        limit: u32,
        include_archived: bool,
    ) -> Result<Vec<Event>>;

    /// Highest persisted sequence, 0 when empty.
    async fn max_sequence(&self) -> Result<i64>;
}

/// Tenant-scoped reader on the pool.
#[derive(Clone)]
pub struct SqliteEventReader {
    pool: SqlitePool,
    identity: StreamIdentity,
    /// `None` reads across all tenants.
    tenant: Option<String>,
}

impl SqliteEventReader {
    pub fn new(pool: SqlitePool, identity: StreamIdentity, tenant: Option<String>) -> Self {
        Self {
            pool,
            identity,
            tenant,
        }
    }

    pub fn tenant(&self) -> Option<&str> {
        self.tenant.as_deref()
    }
}

#[async_trait]
impl EventReader for SqliteEventReader {
    async fn fetch_stream(&self, stream_id: &StreamId, options: FetchOptions) -> Result<Vec<Event>> {
        select_stream_events(&self.pool, self.identity, stream_id, self.tenant.as_deref(), &options).await
    }

    async fn fetch_stream_state(&self, stream_id: &StreamId) -> Result<Option<StreamState>> {
        let state = select_stream(&self.pool, self.identity, stream_id).await?;
        Ok(match (&self.tenant, state) {
            (Some(tenant), Some(state)) if &state.tenant_id != tenant => None,
            (_, state) => state,
        })
    }

    async fn fetch_events_after(
        &self,
        sequence: i64,
        limit: u32,
        include_archived: bool,
    ) -> Result<Vec<Event>> {
        select_events_after(
            &self.pool,
            self.identity,
            sequence,
            limit,
            self.tenant.as_deref(),
            include_archived,
        )
        .await
    }

    async fn max_sequence(&self) -> Result<i64> {
        select_max_sequence(&self.pool).await
    }
}

fn tenant_filter(query: &mut SelectStatement, tenant: Option<&str>) {
    if let Some(tenant) = tenant {
        query.and_where(Expr::col(Events::TenantId).eq(tenant));
    }
}

/// Stream record regardless of tenant.
pub async fn select_stream<'e, E: SqliteExecutor<'e>>(
    executor: E,
    identity: StreamIdentity,
    stream_id: &StreamId,
) -> Result<Option<StreamState>> {
    let (sql, values) = Query::select()
        .columns(stream_columns())
        .from(Streams::Table)
        .and_where(Expr::col(Streams::Id).eq(stream_id.as_text()))
        .build_sqlx(SqliteQueryBuilder);

    let row = sqlx::query_with(&sql, values).fetch_optional(executor).await?;
    row.map(|row| stream_from_row(&row, identity)).transpose()
}

pub async fn select_stream_events<'e, E: SqliteExecutor<'e>>(
    executor: E,
    identity: StreamIdentity,
    stream_id: &StreamId,
    tenant: Option<&str>,
    options: &FetchOptions,
) -> Result<Vec<Event>> {
    let mut query = Query::select();
    query
        .columns(event_columns())
        .from(Events::Table)
        .and_where(Expr::col(Events::StreamId).eq(stream_id.as_text()));
    tenant_filter(&mut query, tenant);

    if let Some(from) = options.from_version {
        query.and_where(Expr::col(Events::Version).gte(from));
    }
    if let Some(to) = options.to_version {
        query.and_where(Expr::col(Events::Version).lte(to));
    }
    if let Some(as_of) = options.as_of {
        query.and_where(Expr::col(Events::Timestamp).lte(format_timestamp(&as_of)));
    }
    if !options.include_archived {
        query.and_where(Expr::col(Events::IsArchived).eq(false));
    }
    query.order_by(Events::Version, Order::Asc);

    let (sql, values) = query.build_sqlx(SqliteQueryBuilder);
    let rows = sqlx::query_with(&sql, values).fetch_all(executor).await?;
    rows.iter().map(|row| event_from_row(row, identity)).collect()
}

pub async fn select_events_after<'e, E: SqliteExecutor<'e>>(
    executor: E,
    identity: StreamIdentity,
    after: i64,
    limit: u32,
    tenant: Option<&str>,
    include_archived: bool,
) -> Result<Vec<Event>> {
    select_event_range(executor, identity, after, None, limit, tenant, include_archived).await
}

/// Events in `(after, up_to]`, ascending, tombstones excluded.
pub async fn select_event_range<'e, E: SqliteExecutor<'e>>(
    executor: E,
    identity: StreamIdentity,
    after: i64,
    up_to: Option<i64>,
    limit: u32,
    tenant: Option<&str>,
    include_archived: bool,
) -> Result<Vec<Event>> {
    let mut query = Query::select();
    query
        .columns(event_columns())
        .from(Events::Table)
        .and_where(Expr::col(Events::Sequence).gt(after))
        .and_where(Expr::col(Events::EventType).ne(TOMBSTONE_EVENT_TYPE));
    if let Some(up_to) = up_to {
        query.and_where(Expr::col(Events::Sequence).lte(up_to));
    }
    tenant_filter(&mut query, tenant);
    if !include_archived {
        query.and_where(Expr::col(Events::IsArchived).eq(false));
    }
    query.order_by(Events::Sequence, Order::Asc).limit(u64::from(limit));

    let (sql, values) = query.build_sqlx(SqliteQueryBuilder);
    let rows = sqlx::query_with(&sql, values).fetch_all(executor).await?;
    rows.iter().map(|row| event_from_row(row, identity)).collect()
}

/// Persisted sequence numbers above `after`, tombstones included.
pub async fn select_sequences_after<'e, E: SqliteExecutor<'e>>(
    executor: E,
    after: i64,
    limit: u32,
) -> Result<Vec<i64>> {
    let (sql, values) = Query::select()
        .column(Events::Sequence)
        .from(Events::Table)
        .and_where(Expr::col(Events::Sequence).gt(after))
        .order_by(Events::Sequence, Order::Asc)
        .limit(u64::from(limit))
        .build_sqlx(SqliteQueryBuilder);

    let rows = sqlx::query_with(&sql, values).fetch_all(executor).await?;
    rows.iter()
        .map(|row| row.try_get::<i64, _>("sequence").map_err(Into::into))
        .collect()
}

/// Which of `sequences` already have an event row.
pub async fn select_existing_sequences<'e, E: SqliteExecutor<'e>>(
    executor: E,
    sequences: &[i64],
) -> Result<Vec<i64>> {
    if sequences.is_empty() {
        return Ok(Vec::new());
    }
    let (sql, values) = Query::select()
        .column(Events::Sequence)
        .from(Events::Table)
        .and_where(Expr::col(Events::Sequence).is_in(sequences.iter().copied()))
        .build_sqlx(SqliteQueryBuilder);

    let rows = sqlx::query_with(&sql, values).fetch_all(executor).await?;
    rows.iter()
        .map(|row| row.try_get::<i64, _>("sequence").map_err(Into::into))
        .collect()
}

pub async fn select_max_sequence<'e, E: SqliteExecutor<'e>>(executor: E) -> Result<i64> {
    let (sql, values) = Query::select()
        .expr(Expr::col(Events::Sequence).max())
        .from(Events::Table)
        .build_sqlx(SqliteQueryBuilder);

    let row = sqlx::query_with(&sql, values).fetch_one(executor).await?;
    let max: Option<i64> = row.try_get(0)?;
    Ok(max.unwrap_or(0))
}
