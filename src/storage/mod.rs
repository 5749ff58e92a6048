//! SQLite storage for streams, events and projection state.

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::config::StorageConfig;
use crate::error::Result;

pub mod archive;
pub mod guard;
pub mod helpers;
pub mod locks;
pub mod reader;
pub mod schema;
pub mod sequence;
pub mod tombstone;
pub mod transaction;
pub mod writer;

pub use guard::ConcurrencyGuard;
pub use locks::{LockWaitPolicy, StreamLocks};
pub use reader::{EventReader, FetchOptions, SqliteEventReader};
pub use sequence::SequenceOracle;
pub use tombstone::{TombstoneRecovery, TOMBSTONE_EVENT_TYPE};
pub use transaction::WriteTransaction;

/// Open a connection pool for the configured database.
///
/// In-memory databases are pinned to one long-lived connection, since the
/// database disappears with its last connection.
pub async fn connect(config: &StorageConfig) -> Result<SqlitePool> {
    let mut options = SqliteConnectOptions::from_str(&config.url)?
        .busy_timeout(config.busy_timeout())
        .create_if_missing(config.create_if_missing);

    // pool waits count against the same budget as SQLite's lock waits
    let pool_options = if config.is_memory() {
        SqlitePoolOptions::new()
            .acquire_timeout(config.busy_timeout())
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        if config.wal {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }
        SqlitePoolOptions::new()
            .acquire_timeout(config.busy_timeout())
            .max_connections(config.max_connections)
    };

    let pool = pool_options.connect_with(options).await?;
    info!(url = %config.url, max_connections = config.max_connections, "Connected event storage");
    Ok(pool)
}

/// Create tables that don't exist yet.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    for ddl in schema::ALL_TABLES {
        sqlx::raw_sql(ddl).execute(pool).await?;
    }
    info!("Event storage schema initialized");
    Ok(())
}
