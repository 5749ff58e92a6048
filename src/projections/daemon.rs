//! Async projection daemon.
//!
//! One tokio task per async projection pulls events past its checkpoint in
//! ascending global sequence order. Each batch folds and advances the
//! checkpoint in a single write transaction, so a crash never loses or
//! repeats committed effects. Workers never read past the high-water mark:
//! the highest sequence below which every number is persisted. A gap that
//! stays open longer than the stale threshold belongs to a writer that died
//! without tombstoning, and is skipped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use backon::BackoffBuilder;
use sqlx::SqlitePool;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::checkpoint::{self, ProjectionProgress, ProjectionStatus};
use super::{Projection, ProjectionContext, ProjectionRegistry};
use crate::config::ProjectionsConfig;
use crate::error::{Result, StoreError};
use crate::storage::reader::{select_event_range, select_sequences_after};
use crate::storage::WriteTransaction;
use crate::utils::retry::projection_backoff;

/// Rows scanned per high-water probe.
const HIGH_WATER_PAGE: u32 = 1_000;

/// Tracks the highest contiguous persisted sequence.
#[derive(Debug)]
pub(crate) struct HighWaterDetector {
    mark: i64,
    /// First missing number and when it was first seen missing.
    gap: Option<(i64, Instant)>,
    stale_after: Duration,
}

impl HighWaterDetector {
    pub(crate) fn new(stale_after: Duration) -> Self {
        Self {
            mark: 0,
            gap: None,
            stale_after,
        }
    }

    pub(crate) fn mark(&self) -> i64 {
        self.mark
    }

    /// Walk ascending persisted sequences above the mark.
    ///
    /// Returns false when it stopped at a gap that is not stale yet.
    pub(crate) fn observe(&mut self, sequences: &[i64], now: Instant) -> bool {
        for &sequence in sequences {
            let expected = self.mark + 1;
            if sequence < expected {
                continue;
            }
            if sequence == expected {
                self.mark = sequence;
                self.gap = None;
                continue;
            }

            match self.gap {
                Some((missing, since)) if missing == expected => {
                    if now.duration_since(since) < self.stale_after {
                        return false;
                    }
                    warn!(
                        from = expected,
                        to = sequence - 1,
                        "Skipping stale sequence gap"
                    );
                    self.mark = sequence;
                    self.gap = None;
                }
                _ => {
                    self.gap = Some((expected, now));
                    return false;
                }
            }
        }
        true
    }
}

struct DaemonInner {
    pool: SqlitePool,
    ctx: ProjectionContext,
    registry: ProjectionRegistry,
    config: ProjectionsConfig,
    notifications: watch::Receiver<i64>,
    detector: Mutex<HighWaterDetector>,
    /// Serializes batches of one projection between its worker and rebuilds.
    gates: HashMap<String, Arc<Mutex<()>>>,
}

/// Drives async projections and rebuilds.
#[derive(Clone)]
pub struct ProjectionDaemon {
    inner: Arc<DaemonInner>,
}

impl ProjectionDaemon {
    pub(crate) fn new(
        pool: SqlitePool,
        ctx: ProjectionContext,
        registry: ProjectionRegistry,
        config: ProjectionsConfig,
        notifications: watch::Receiver<i64>,
    ) -> Self {
        let gates = registry
            .all()
            .iter()
            .map(|p| (p.name().to_string(), Arc::new(Mutex::new(()))))
            .collect();
        let detector = Mutex::new(HighWaterDetector::new(config.stale_sequence_threshold()));

        Self {
            inner: Arc::new(DaemonInner {
                pool,
                ctx,
                registry,
                config,
                notifications,
                detector,
                gates,
            }),
        }
    }

    /// Spawn one worker per async projection.
    ///
    /// Workers run until [`DaemonHandle::stop`] or until the handle is dropped.
    pub fn start(&self) -> DaemonHandle {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let workers: Vec<JoinHandle<()>> = self
            .inner
            .registry
            .asynchronous()
            .map(|projection| {
                tokio::spawn(run_worker(
                    self.clone(),
                    Arc::clone(projection),
                    cancel_rx.clone(),
                ))
            })
            .collect();

        info!(workers = workers.len(), "Projection daemon started");
        DaemonHandle {
            cancel: cancel_tx,
            workers,
        }
    }

    /// Highest sequence every async projection may safely read up to.
    pub async fn high_water_mark(&self) -> Result<i64> {
        let mut detector = self.inner.detector.lock().await;
        loop {
            let sequences =
                select_sequences_after(&self.inner.pool, detector.mark(), HIGH_WATER_PAGE).await?;
            let consumed = detector.observe(&sequences, Instant::now());
            if !consumed || (sequences.len() as u32) < HIGH_WATER_PAGE {
                return Ok(detector.mark());
            }
        }
    }

    /// Process batches until the projection reaches the high-water mark.
    ///
    /// Returns the checkpoint reached.
    pub async fn catch_up(&self, name: &str) -> Result<i64> {
        let projection = self.inner.registry.get(name)?;
        while self.process_batch(projection.as_ref()).await? > 0 {}
        checkpoint::position(&self.inner.pool, name).await
    }

    /// Catch up every async projection in registration order.
    pub async fn catch_up_all(&self) -> Result<()> {
        let names: Vec<String> = self
            .inner
            .registry
            .asynchronous()
            .map(|p| p.name().to_string())
            .collect();
        for name in names {
            self.catch_up(&name).await?;
        }
        Ok(())
    }

    /// Discard a projection's documents and checkpoint, then replay the log.
    #[tracing::instrument(name = "projection.rebuild", skip(self))]
    pub async fn rebuild(&self, name: &str) -> Result<i64> {
        let projection = self.inner.registry.get(name)?;
        {
            let gate = self.gate(name)?;
            let _held = gate.lock().await;

            let mut tx = WriteTransaction::begin(&self.inner.pool).await?;
            let cleared = projection.reset(tx.conn()).await;
            let reset = match cleared {
                Ok(()) => checkpoint::reset(tx.conn(), name).await,
                Err(e) => Err(e),
            };
            match reset {
                Ok(()) => tx.commit().await?,
                Err(e) => {
                    let _ = tx.rollback().await;
                    return Err(e);
                }
            }
        }

        info!(projection = name, "Projection reset, replaying from sequence zero");
        let reached = self.catch_up(name).await?;
        info!(projection = name, checkpoint = reached, "Projection rebuilt");
        Ok(reached)
    }

    pub async fn progress(&self, name: &str) -> Result<Option<ProjectionProgress>> {
        self.inner.registry.get(name)?;
        checkpoint::load(&self.inner.pool, name).await
    }

    fn gate(&self, name: &str) -> Result<Arc<Mutex<()>>> {
        self.inner
            .gates
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::ProjectionNotFound {
                name: name.to_string(),
            })
    }

    /// Fold the next batch. Returns how far the checkpoint moved.
    async fn process_batch(&self, projection: &dyn Projection) -> Result<i64> {
        let name = projection.name();
        let gate = self.gate(name)?;
        let _held = gate.lock().await;

        let from = checkpoint::position(&self.inner.pool, name).await?;
        let ceiling = self.high_water_mark().await?;
        if ceiling <= from {
            return Ok(0);
        }

        let limit = self.inner.config.batch_size;
        let events = select_event_range(
            &self.inner.pool,
            self.inner.ctx.identity,
            from,
            Some(ceiling),
            limit,
            None,
            true,
        )
        .await?;
        // a short page means everything up to the ceiling was read
        let next = match events.last() {
            Some(last) if events.len() as u32 >= limit => last.sequence,
            _ => ceiling,
        };

        let mut tx = WriteTransaction::begin(&self.inner.pool).await?;
        let folded = projection.apply(tx.conn(), &self.inner.ctx, &events).await;
        let applied = match folded {
            Ok(()) => checkpoint::advance(tx.conn(), name, next).await,
            Err(e) => Err(e),
        };
        match applied {
            Ok(()) => tx.commit().await?,
            Err(e) => {
                let _ = tx.rollback().await;
                return Err(e);
            }
        }

        debug!(
            projection = name,
            from,
            to = next,
            events = events.len(),
            "Projection batch committed"
        );
        Ok(next - from)
    }
}

async fn run_worker(
    daemon: ProjectionDaemon,
    projection: Arc<dyn Projection>,
    mut cancel: watch::Receiver<bool>,
) {
    let name = projection.name().to_string();
    let config = daemon.inner.config.clone();
    let mut notifications = daemon.inner.notifications.clone();
    let mut backoff = projection_backoff(&config).build();
    let mut failures: i64 = 0;

    info!(projection = %name, "Projection worker started");

    loop {
        if *cancel.borrow() {
            break;
        }

        match daemon.process_batch(projection.as_ref()).await {
            Ok(advanced) => {
                if failures > 0 {
                    info!(projection = %name, failures, "Projection recovered");
                    failures = 0;
                    backoff = projection_backoff(&config).build();
                }
                if advanced > 0 {
                    continue;
                }
                tokio::select! {
                    changed = cancel.changed() => {
                        if changed.is_err() || *cancel.borrow() {
                            break;
                        }
                    }
                    Ok(()) = notifications.changed() => {}
                    _ = tokio::time::sleep(config.poll_interval()) => {}
                }
            }
            Err(e) => {
                failures += 1;
                let delay = backoff.next();
                let status = match delay {
                    Some(_) => ProjectionStatus::Running,
                    None => ProjectionStatus::Faulted,
                };
                if let Err(record) =
                    checkpoint::record_error(&daemon.inner.pool, &name, &e.to_string(), failures, status).await
                {
                    warn!(projection = %name, error = %record, "Failed to record projection fault");
                }

                let Some(delay) = delay else {
                    error!(projection = %name, failures, error = %e, "Projection faulted, worker stopped");
                    return;
                };
                warn!(
                    projection = %name,
                    attempt = failures,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Projection batch failed, retrying"
                );
                tokio::select! {
                    changed = cancel.changed() => {
                        if changed.is_err() || *cancel.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    if let Err(e) = checkpoint::set_status(&daemon.inner.pool, &name, ProjectionStatus::Stopped).await {
        warn!(projection = %name, error = %e, "Failed to record projection stop");
    }
    info!(projection = %name, "Projection worker stopped");
}

/// Handle to running projection workers.
pub struct DaemonHandle {
    cancel: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl DaemonHandle {
    /// Signal every worker to stop after its current batch.
    pub fn stop(&self) {
        let _ = self.cancel.send(true);
    }

    /// Stop and wait for the workers to exit.
    pub async fn shutdown(self) {
        self.stop();
        for worker in self.workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Projection worker ended abnormally");
            }
        }
    }
}
