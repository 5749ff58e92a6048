//! Projection runtime.
//!
//! A [`Projection`] folds committed events into derived state. Inline
//! projections run inside the append transaction; async projections are
//! driven by the [`ProjectionDaemon`](daemon::ProjectionDaemon) from a
//! durable checkpoint. [`Aggregation`](aggregation::Aggregation) is the
//! stock projection that materializes one document per stream.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::SqliteConnection;

use crate::error::{Result, StoreError};
use crate::events::{Event, StreamIdentity};
use crate::serializer::Serializer;

pub mod aggregate_store;
pub mod aggregation;
pub mod checkpoint;
pub mod daemon;
pub mod live;

pub use aggregate_store::{AggregateDocument, DocumentStatus};
pub use aggregation::{AggregateState, Aggregation, AggregationBuilder, UnknownEventPolicy};
pub use checkpoint::{ProjectionProgress, ProjectionStatus};
pub use daemon::ProjectionDaemon;
pub use live::AggregateQuery;

/// When a projection folds events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProjectionLifecycle {
    /// Inside the append transaction; a failure rolls the append back.
    #[default]
    Inline,
    /// In the background, from a checkpoint.
    Async,
}

/// What a projection needs from the store while folding.
#[derive(Clone)]
pub struct ProjectionContext {
    pub serializer: Arc<dyn Serializer>,
    pub identity: StreamIdentity,
}

/// Derived state maintained from the event log.
#[async_trait]
pub trait Projection: Send + Sync {
    /// Unique name; also the checkpoint key.
    fn name(&self) -> &str;

    fn lifecycle(&self) -> ProjectionLifecycle;

    /// Fold committed events, in sequence order, on the caller's transaction.
    ///
    /// Must tolerate events it has already seen.
    async fn apply(
        &self,
        conn: &mut SqliteConnection,
        ctx: &ProjectionContext,
        events: &[Event],
    ) -> Result<()>;

    /// Discard all derived state ahead of a rebuild.
    async fn reset(&self, conn: &mut SqliteConnection) -> Result<()>;
}

/// Immutable set of projections registered at store open.
#[derive(Clone, Default)]
pub struct ProjectionRegistry {
    projections: Vec<Arc<dyn Projection>>,
}

impl ProjectionRegistry {
    pub fn new(projections: Vec<Arc<dyn Projection>>) -> Result<Self> {
        let mut names = HashSet::new();
        for projection in &projections {
            if projection.name().trim().is_empty() {
                return Err(StoreError::Configuration("projection name must not be empty".into()));
            }
            if !names.insert(projection.name().to_string()) {
                return Err(StoreError::Configuration(format!(
                    "projection '{}' registered twice",
                    projection.name()
                )));
            }
        }
        Ok(Self { projections })
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Projection>> {
        self.projections
            .iter()
            .find(|p| p.name() == name)
            .cloned()
            .ok_or_else(|| StoreError::ProjectionNotFound {
                name: name.to_string(),
            })
    }

    pub fn all(&self) -> &[Arc<dyn Projection>] {
        &self.projections
    }

    pub fn inline(&self) -> impl Iterator<Item = &Arc<dyn Projection>> {
        self.with_lifecycle(ProjectionLifecycle::Inline)
    }

    pub fn asynchronous(&self) -> impl Iterator<Item = &Arc<dyn Projection>> {
        self.with_lifecycle(ProjectionLifecycle::Async)
    }

    fn with_lifecycle(&self, lifecycle: ProjectionLifecycle) -> impl Iterator<Item = &Arc<dyn Projection>> {
        self.projections
            .iter()
            .filter(move |p| p.lifecycle() == lifecycle)
    }
}
