//! The event store facade.
//!
//! [`EventStore`] is a cheap, cloneable handle. Everything it owns is built
//! once at open time and never mutated afterwards: the options, the
//! projection registry and the listeners.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::watch;
use tracing::info;

use crate::config::Config;
use crate::error::{Result, StoreError};
use crate::events::{StreamId, StreamIdentity};
use crate::listeners::CommitListener;
use crate::projections::aggregate_store::load_document;
use crate::projections::live::{self, AggregateQuery};
use crate::projections::{
    Aggregation, Projection, ProjectionContext, ProjectionDaemon, ProjectionRegistry,
};
use crate::serializer::{JsonSerializer, Serializer};
use crate::session::Session;
use crate::storage::reader::select_max_sequence;
use crate::storage::{
    self, SequenceOracle, SqliteEventReader, StreamLocks, TombstoneRecovery,
};
use crate::tenancy::Tenancy;

/// Immutable settings shared by every component of an open store.
pub struct StoreOptions {
    pub config: Config,
    pub serializer: Arc<dyn Serializer>,
    pub tenancy: Tenancy,
    pub projections: ProjectionRegistry,
}

pub(crate) struct StoreInner {
    pub(crate) pool: SqlitePool,
    pub(crate) options: StoreOptions,
    pub(crate) oracle: SequenceOracle,
    pub(crate) locks: StreamLocks,
    pub(crate) tombstones: TombstoneRecovery,
    pub(crate) listeners: Vec<Arc<dyn CommitListener>>,
    /// Highest committed sequence, watched by projection workers.
    pub(crate) high_water: watch::Sender<i64>,
    pub(crate) daemon: ProjectionDaemon,
}

impl StoreInner {
    pub(crate) fn identity(&self) -> StreamIdentity {
        self.options.config.events.stream_identity
    }
}

/// Handle to an open event store.
#[derive(Clone)]
pub struct EventStore {
    inner: Arc<StoreInner>,
}

impl EventStore {
    pub fn builder(config: Config) -> EventStoreBuilder {
        EventStoreBuilder::new(config)
    }

    /// Open with defaults: JSON payloads, no projections, no listeners.
    pub async fn open(config: Config) -> Result<Self> {
        Self::builder(config).open().await
    }

    pub fn options(&self) -> &StoreOptions {
        &self.inner.options
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.inner.pool
    }

    pub fn identity(&self) -> StreamIdentity {
        self.inner.identity()
    }

    pub fn serializer(&self) -> &dyn Serializer {
        self.inner.options.serializer.as_ref()
    }

    /// Unit of work for the default tenant.
    pub fn open_session(&self) -> Session {
        Session::new(
            Arc::clone(&self.inner),
            self.inner.options.tenancy.default_tenant().to_string(),
        )
    }

    pub fn open_session_for_tenant(&self, tenant_id: &str) -> Result<Session> {
        let tenant = self.inner.options.tenancy.resolve(Some(tenant_id))?;
        Ok(Session::new(Arc::clone(&self.inner), tenant))
    }

    /// Reader scoped to the default tenant.
    pub fn reader(&self) -> SqliteEventReader {
        self.reader_scoped(self.inner.options.tenancy.default_tenant())
    }

    pub fn reader_for_tenant(&self, tenant_id: &str) -> Result<SqliteEventReader> {
        let tenant = self.inner.options.tenancy.resolve(Some(tenant_id))?;
        Ok(self.reader_scoped(&tenant))
    }

    /// Reader over every tenant's events.
    pub fn reader_all_tenants(&self) -> SqliteEventReader {
        SqliteEventReader::new(self.inner.pool.clone(), self.identity(), None)
    }

    fn reader_scoped(&self, tenant: &str) -> SqliteEventReader {
        let filter = self
            .inner
            .options
            .tenancy
            .read_filter(tenant)
            .map(str::to_string);
        SqliteEventReader::new(self.inner.pool.clone(), self.identity(), filter)
    }

    pub fn sequences(&self) -> &SequenceOracle {
        &self.inner.oracle
    }

    /// Write tombstones still queued from earlier failures.
    pub async fn recover_tombstones(&self) -> Result<usize> {
        self.inner.tombstones.flush_pending().await
    }

    /// Sequence numbers with no persisted event.
    pub async fn tombstone_gaps(&self) -> Result<Vec<i64>> {
        self.inner.tombstones.gaps().await
    }

    pub fn tombstone_stream_id(&self) -> StreamId {
        self.inner.tombstones.stream_id()
    }

    /// Tombstone recovery, including the queue of numbers awaiting a write.
    pub fn tombstones(&self) -> &TombstoneRecovery {
        &self.inner.tombstones
    }

    /// Stored document of an aggregation for a default-tenant stream.
    pub async fn load_aggregate<S>(&self, aggregation: &Aggregation<S>, stream_id: &StreamId) -> Result<Option<S>>
    where
        S: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let tenant = self.inner.options.tenancy.default_tenant().to_string();
        self.load_aggregate_for_tenant(aggregation, &tenant, stream_id)
            .await
    }

    pub async fn load_aggregate_for_tenant<S>(
        &self,
        aggregation: &Aggregation<S>,
        tenant_id: &str,
        stream_id: &StreamId,
    ) -> Result<Option<S>>
    where
        S: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let tenant = self.inner.options.tenancy.resolve(Some(tenant_id))?;
        let document = load_document(&self.inner.pool, aggregation.name(), &tenant, stream_id).await?;
        match document {
            Some(document) => Ok(aggregation
                .state_from_document(&document, self.serializer())?
                .into_live()),
            None => Ok(None),
        }
    }

    /// Fold a default-tenant stream from the log without touching stored
    /// documents.
    pub async fn aggregate_stream<S>(
        &self,
        aggregation: &Aggregation<S>,
        stream_id: &StreamId,
        query: AggregateQuery,
    ) -> Result<Option<S>>
    where
        S: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let tenant = self.inner.options.tenancy.default_tenant().to_string();
        self.aggregate_stream_for_tenant(aggregation, &tenant, stream_id, query)
            .await
    }

    pub async fn aggregate_stream_for_tenant<S>(
        &self,
        aggregation: &Aggregation<S>,
        tenant_id: &str,
        stream_id: &StreamId,
        query: AggregateQuery,
    ) -> Result<Option<S>>
    where
        S: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let reader = self.reader_for_tenant(tenant_id)?;
        live::aggregate_stream(&reader, aggregation, stream_id, query, self.serializer()).await
    }

    /// Background runner and rebuild entry point for projections.
    pub fn daemon(&self) -> ProjectionDaemon {
        self.inner.daemon.clone()
    }
}

/// Assembles an [`EventStore`].
pub struct EventStoreBuilder {
    config: Config,
    pool: Option<SqlitePool>,
    serializer: Arc<dyn Serializer>,
    projections: Vec<Arc<dyn Projection>>,
    listeners: Vec<Arc<dyn CommitListener>>,
}

impl EventStoreBuilder {
    fn new(config: Config) -> Self {
        Self {
            config,
            pool: None,
            serializer: Arc::new(JsonSerializer),
            projections: Vec::new(),
            listeners: Vec::new(),
        }
    }

    /// Use a caller-owned pool instead of connecting from config.
    pub fn pool(mut self, pool: SqlitePool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn serializer(mut self, serializer: impl Serializer + 'static) -> Self {
        self.serializer = Arc::new(serializer);
        self
    }

    pub fn projection(mut self, projection: impl Projection + 'static) -> Self {
        self.projections.push(Arc::new(projection));
        self
    }

    pub fn listener(mut self, listener: impl CommitListener + 'static) -> Self {
        self.listeners.push(Arc::new(listener));
        self
    }

    pub async fn open(self) -> Result<EventStore> {
        let config = self.config;
        config.validate()?;

        let registry = ProjectionRegistry::new(self.projections)?;
        let pool = match self.pool {
            Some(pool) => pool,
            None => storage::connect(&config.storage).await?,
        };
        storage::init_schema(&pool).await?;

        let identity = config.events.stream_identity;
        let tenancy = Tenancy::new(config.events.tenancy, config.events.default_tenant.clone());
        let oracle = SequenceOracle::new(pool.clone());
        let locks = StreamLocks::new(
            pool.clone(),
            config.events.locking.lease(),
            config.events.locking.wait_policy(),
        );
        if let Some(found) = existing_identity_mismatch(&pool, identity).await? {
            return Err(StoreError::Configuration(format!(
                "store holds {found} stream ids but is configured for {} ids",
                identity.as_str()
            )));
        }
        let tombstones = TombstoneRecovery::new(pool.clone(), identity, oracle.clone());
        tombstones.establish_tombstone_stream().await?;

        let max_sequence = select_max_sequence(&pool).await?;
        let (high_water, notifications) = watch::channel(max_sequence);
        let daemon = ProjectionDaemon::new(
            pool.clone(),
            ProjectionContext {
                serializer: Arc::clone(&self.serializer),
                identity,
            },
            registry.clone(),
            config.projections.clone(),
            notifications,
        );

        info!(
            identity = identity.as_str(),
            tenancy = ?tenancy.style(),
            projections = registry.all().len(),
            listeners = self.listeners.len(),
            max_sequence,
            "Event store opened"
        );

        Ok(EventStore {
            inner: Arc::new(StoreInner {
                pool,
                options: StoreOptions {
                    config,
                    serializer: self.serializer,
                    tenancy,
                    projections: registry,
                },
                oracle,
                locks,
                tombstones,
                listeners: self.listeners,
                high_water,
                daemon,
            }),
        })
    }
}

/// Detects a database created under the other identity mode, by checking
/// whether the tombstone stream of that mode exists.
async fn existing_identity_mismatch(pool: &SqlitePool, identity: StreamIdentity) -> Result<Option<&'static str>> {
    let other = match identity {
        StreamIdentity::Guid => StreamIdentity::Key,
        StreamIdentity::Key => StreamIdentity::Guid,
    };
    let other_id = storage::tombstone::tombstone_stream_id(other);
    let found = storage::reader::select_stream(pool, other, &other_id).await?;
    Ok(found.map(|_| other.as_str()))
}
