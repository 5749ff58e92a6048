//! Annals - an event store on SQLite.
//!
//! Append-only event streams with gapless per-stream versions and a
//! store-wide sequence, optimistic and exclusive concurrency control, and
//! aggregations folded inline with each commit or by a background daemon.
//!
//! ```no_run
//! # async fn demo() -> annals::Result<()> {
//! use annals::{Config, EventStore, PendingEvent, StreamId};
//!
//! let store = EventStore::open(Config::for_path("events.db")).await?;
//! let mut session = store.open_session();
//! session.start_stream(StreamId::new_guid(), vec![PendingEvent::raw("opened", b"{}".to_vec())])?;
//! let commit = session.save_changes().await?;
//! println!("committed up to sequence {:?}", commit.max_sequence());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod listeners;
pub mod projections;
pub mod serializer;
pub mod session;
pub mod storage;
pub mod store;
pub mod tenancy;
pub mod utils;

pub use config::Config;
pub use error::{Result, StoreError};
pub use events::{DomainEvent, Event, EventMetadata, PendingEvent, StreamId, StreamIdentity, StreamState};
pub use listeners::{Commit, CommitListener};
pub use projections::{
    AggregateQuery, AggregateState, Aggregation, Projection, ProjectionLifecycle, UnknownEventPolicy,
};
pub use serializer::{JsonSerializer, Serializer};
pub use session::{Session, UnitOfWorkOperation};
pub use storage::{EventReader, FetchOptions};
pub use store::{EventStore, EventStoreBuilder};
pub use tenancy::{TenancyStyle, DEFAULT_TENANT};
