//! Store-wide event sequence allocation.

use sea_query::{Expr, Query, SqliteQueryBuilder};
use sea_query_binder::SqlxBinder;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use super::schema::{EventSequences, EVENT_SEQUENCE_NAME};
use crate::error::{Result, StoreError};

/// Hands out contiguous blocks of global sequence numbers.
///
/// Each reservation is a single atomic increment committed on its own, so
/// numbers handed out are never returned even if the caller's write later
/// rolls back. Tombstone recovery fills those holes.
#[derive(Clone)]
pub struct SequenceOracle {
    pool: SqlitePool,
    name: String,
}

impl SequenceOracle {
    pub fn new(pool: SqlitePool) -> Self {
        Self::named(pool, EVENT_SEQUENCE_NAME)
    }

    pub fn named(pool: SqlitePool, name: impl Into<String>) -> Self {
        Self {
            pool,
            name: name.into(),
        }
    }

    /// Reserve `count` numbers, ascending.
    pub async fn reserve(&self, count: usize) -> Result<Vec<i64>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let (sql, values) = Query::update()
            .table(EventSequences::Table)
            .value(
                EventSequences::Value,
                Expr::col(EventSequences::Value).add(count as i64),
            )
            .and_where(Expr::col(EventSequences::Name).eq(self.name.as_str()))
            .returning_col(EventSequences::Value)
            .build_sqlx(SqliteQueryBuilder);

        let row = sqlx::query_with(&sql, values)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| {
                StoreError::Configuration(format!("sequence '{}' is not initialized", self.name))
            })?;

        let last: i64 = row.try_get(0)?;
        let first = last - count as i64 + 1;

        debug!(sequence = %self.name, first, last, "Reserved sequence block");
        Ok((first..=last).collect())
    }

    /// Highest number handed out so far.
    pub async fn current(&self) -> Result<i64> {
        let (sql, values) = Query::select()
            .column(EventSequences::Value)
            .from(EventSequences::Table)
            .and_where(Expr::col(EventSequences::Name).eq(self.name.as_str()))
            .build_sqlx(SqliteQueryBuilder);

        let row = sqlx::query_with(&sql, values)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(row.try_get("value")?),
            None => Ok(0),
        }
    }
}
