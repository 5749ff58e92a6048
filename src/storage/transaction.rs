//! Write transactions.
//!
//! `BEGIN IMMEDIATE` acquires SQLite's write lock upfront, preventing
//! deadlocks when concurrent DEFERRED transactions race to upgrade from
//! shared to exclusive. If a [`WriteTransaction`] is dropped while still
//! open (an error path that skipped rollback, or a cancelled future), its
//! connection is closed instead of returned to the pool, which rolls the
//! transaction back.

use sqlx::pool::PoolConnection;
use sqlx::{Sqlite, SqliteConnection, SqlitePool};
use tracing::warn;

use crate::error::Result;

pub struct WriteTransaction {
    conn: PoolConnection<Sqlite>,
    open: bool,
}

impl WriteTransaction {
    pub async fn begin(pool: &SqlitePool) -> Result<Self> {
        let mut conn = pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        Ok(Self { conn, open: true })
    }

    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut self.conn
    }

    pub async fn commit(mut self) -> Result<()> {
        sqlx::query("COMMIT").execute(&mut *self.conn).await?;
        self.open = false;
        Ok(())
    }

    pub async fn rollback(mut self) -> Result<()> {
        let result = sqlx::query("ROLLBACK").execute(&mut *self.conn).await;
        if result.is_ok() {
            self.open = false;
        }
        result?;
        Ok(())
    }
}

impl Drop for WriteTransaction {
    fn drop(&mut self) {
        if self.open {
            warn!("Write transaction dropped while open, closing its connection");
            self.conn.close_on_drop();
        }
    }
}
