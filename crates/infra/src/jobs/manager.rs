//! Lifecycle API of the consulta engine.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use consulta_core::{Consulta, ConsultaId, DomainError, ItemSeed};
use consulta_events::{EventBus, ProgressEvent, ProgressKind, Subscription};

use super::config::{CANCELLED_BY_USER, EngineConfig};
use super::context::{EngineContext, Mutation};
use super::lookup::LookupClient;
use super::registration::RegistrationSink;
use super::registry::{Claim, DocumentLocks, Removal, RunnerRegistry};
use super::runner;
use super::store::{ConsultaStore, StoreError};

/// Engine error.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Rejected before anything was persisted.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// `remove()` on a consulta whose runner is still active.
    #[error("consulta {0} has an active runner; pause or cancel it first")]
    Busy(ConsultaId),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// What one `recover_stale()` pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Stale consultas handed to a new runner.
    pub restarted: Vec<ConsultaId>,
    /// Stale consultas with nothing left pending, marked completed.
    pub completed: Vec<ConsultaId>,
    /// Stale consultas whose runner is still alive (e.g. stuck in a slow lookup).
    pub skipped_live: Vec<ConsultaId>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.restarted.is_empty() && self.completed.is_empty() && self.skipped_live.is_empty()
    }
}

/// Handle of the periodic recovery sweep.
#[derive(Debug)]
pub struct RecoverySweepHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl RecoverySweepHandle {
    /// Stop the sweep and wait for an in-progress pass to finish.
    pub async fn shutdown(self) {
        self.token.cancel();
        let _ = self.join.await;
    }
}

/// Creates, drives and controls background consultas.
///
/// All lifecycle calls are safe to issue concurrently from many tasks:
///
/// - document changes go through a per-consulta lock, so the runner and the
///   caller never overwrite each other
/// - lifecycle calls are serialized among themselves, and the runner
///   registry refuses a second live runner for the same consulta
///
/// Must be used from within a tokio runtime.
pub struct ConsultaManager<S, B> {
    ctx: Arc<EngineContext<S, B>>,
    ops: Arc<AsyncMutex<()>>,
}

impl<S, B> Clone for ConsultaManager<S, B> {
    fn clone(&self) -> Self {
        Self {
            ctx: Arc::clone(&self.ctx),
            ops: Arc::clone(&self.ops),
        }
    }
}

impl<S, B> ConsultaManager<S, B>
where
    S: ConsultaStore + 'static,
    B: EventBus<ProgressEvent> + 'static,
{
    pub fn new(
        store: S,
        bus: B,
        lookup: Arc<dyn LookupClient>,
        sink: Arc<dyn RegistrationSink>,
        config: EngineConfig,
    ) -> Self {
        Self {
            ctx: Arc::new(EngineContext {
                store,
                bus,
                lookup,
                sink,
                config,
                registry: RunnerRegistry::default(),
                locks: DocumentLocks::default(),
            }),
            ops: Arc::new(AsyncMutex::new(())),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    /// Persist a new running consulta and start its runner.
    pub async fn create(&self, seeds: Vec<ItemSeed>) -> Result<ConsultaId, EngineError> {
        let consulta =
            Consulta::new(seeds, self.ctx.config.item_delay, Utc::now()).map_err(|e| match e {
                DomainError::Validation(msg) => EngineError::InvalidInput(msg),
                other => EngineError::Domain(other),
            })?;
        let id = consulta.id;

        let _ops = self.ops.lock().await;
        self.ctx.store.insert(&consulta).await?;
        self.ctx.publish(ProgressKind::Created, &consulta);
        info!(
            engine = %self.ctx.config.name,
            consulta_id = %id,
            total_items = consulta.total_items,
            estimated_seconds = consulta.estimated_seconds_remaining,
            "consulta created"
        );

        self.start_runner(id);
        Ok(id)
    }

    /// Pause a running consulta. No-op for any other status or unknown ids.
    pub async fn pause(&self, id: ConsultaId) -> Result<(), EngineError> {
        let _ops = self.ops.lock().await;
        let paused = self
            .ctx
            .mutate(id, |c, now| Ok(c.pause(now).then_some(ProgressKind::Paused)))
            .await?;
        if let Mutation::Applied(c) = paused {
            self.ctx.registry.signal(id);
            info!(consulta_id = %id, processed_items = c.processed_items, "consulta paused");
        }
        Ok(())
    }

    /// Resume a paused consulta from its first pending item.
    pub async fn resume(&self, id: ConsultaId) -> Result<(), EngineError> {
        let _ops = self.ops.lock().await;
        let resumed = self
            .ctx
            .mutate(id, |c, now| Ok(c.resume(now).then_some(ProgressKind::Resumed)))
            .await?;
        if let Mutation::Applied(c) = resumed {
            info!(consulta_id = %id, processed_items = c.processed_items, "consulta resumed");
            self.start_runner(id);
        }
        Ok(())
    }

    /// Abort a running or paused consulta for good.
    pub async fn cancel(&self, id: ConsultaId) -> Result<(), EngineError> {
        let _ops = self.ops.lock().await;
        let cancelled = self
            .ctx
            .mutate(id, |c, now| {
                Ok(c.cancel(CANCELLED_BY_USER, now)
                    .then_some(ProgressKind::Cancelled))
            })
            .await?;
        if let Mutation::Applied(c) = cancelled {
            self.ctx.registry.signal(id);
            info!(consulta_id = %id, processed_items = c.processed_items, "consulta cancelled");
        }
        Ok(())
    }

    /// Delete a consulta.
    ///
    /// Fails with [`EngineError::Busy`] while its runner is active. A runner
    /// that was already signalled is waited for first, without blocking other
    /// lifecycle calls. Unknown ids are a no-op.
    pub async fn remove(&self, id: ConsultaId) -> Result<(), EngineError> {
        loop {
            let ops = self.ops.lock().await;
            match self.ctx.registry.take_for_removal(id) {
                Removal::Busy => return Err(EngineError::Busy(id)),
                Removal::Draining(done) => {
                    drop(ops);
                    debug!(consulta_id = %id, "waiting for runner to drain before removal");
                    done.cancelled().await;
                }
                Removal::Clear => {
                    if self.ctx.remove_document(id).await?.is_some() {
                        info!(consulta_id = %id, "consulta removed");
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Every stored consulta, in creation order.
    pub async fn list(&self) -> Result<Vec<Consulta>, EngineError> {
        Ok(self.ctx.store.list().await?)
    }

    pub async fn get(&self, id: ConsultaId) -> Result<Option<Consulta>, EngineError> {
        Ok(self.ctx.store.get(id).await?)
    }

    /// The most recently started consulta that is still running.
    pub async fn active(&self) -> Result<Option<Consulta>, EngineError> {
        Ok(self
            .ctx
            .store
            .list()
            .await?
            .into_iter()
            .filter(Consulta::is_running)
            .max_by_key(|c| c.started_at))
    }

    /// Whether a runner is currently advancing `id`.
    pub fn is_running(&self, id: ConsultaId) -> bool {
        self.ctx.registry.is_live(id)
    }

    /// Progress events of every consulta, from now on.
    pub fn subscribe(&self) -> Subscription<ProgressEvent> {
        self.ctx.bus.subscribe()
    }

    /// Pick up running consultas nobody has touched for `stale_after`.
    ///
    /// Safe to call repeatedly and concurrently with live runners.
    pub async fn recover_stale(&self) -> Result<RecoveryReport, EngineError> {
        let _ops = self.ops.lock().await;
        let now = Utc::now();
        let mut report = RecoveryReport::default();

        for consulta in self.ctx.store.list().await? {
            if !consulta.is_stale(now, self.ctx.config.stale_after) {
                continue;
            }
            let id = consulta.id;
            if self.ctx.registry.has_runner(id) {
                report.skipped_live.push(id);
                continue;
            }

            let recovered = self
                .ctx
                .mutate(id, |c, now| {
                    if !c.is_running() {
                        return Ok(None);
                    }
                    if c.has_pending() {
                        Ok(c.mark_recovered(now).then_some(ProgressKind::Recovered))
                    } else {
                        Ok(c.complete(now)?.then_some(ProgressKind::Completed))
                    }
                })
                .await;

            match recovered {
                Ok(Mutation::Applied(c)) if c.is_running() => {
                    warn!(
                        consulta_id = %id,
                        pending = c.summary().pending,
                        "restarting stale consulta"
                    );
                    self.start_runner(id);
                    report.restarted.push(id);
                }
                Ok(Mutation::Applied(_)) => {
                    info!(consulta_id = %id, "stale consulta had nothing pending; completed");
                    report.completed.push(id);
                }
                Ok(_) => {}
                Err(e) => {
                    error!(consulta_id = %id, error = %e, "failed to recover stale consulta");
                }
            }
        }

        Ok(report)
    }

    /// Run `recover_stale()` now and then every `recovery_interval`.
    pub fn spawn_recovery_sweep(&self) -> RecoverySweepHandle {
        let token = CancellationToken::new();
        let stop = token.clone();
        let manager = self.clone();
        let period = self.ctx.config.recovery_interval.max(Duration::from_millis(1));

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                match manager.recover_stale().await {
                    Ok(report) if report.is_empty() => debug!("recovery sweep found nothing stale"),
                    Ok(report) => info!(
                        restarted = report.restarted.len(),
                        completed = report.completed.len(),
                        skipped_live = report.skipped_live.len(),
                        "recovery sweep finished"
                    ),
                    Err(e) => error!(error = %e, "recovery sweep failed"),
                }
            }
            debug!(engine = %manager.ctx.config.name, "recovery sweep stopped");
        });

        RecoverySweepHandle { token, join }
    }

    /// Signal every runner and wait for them to exit.
    ///
    /// Stored statuses are left alone: consultas still `running` are picked
    /// up by stale recovery in the next process.
    pub async fn shutdown(&self) {
        let runners = {
            let _ops = self.ops.lock().await;
            self.ctx.registry.drain_all()
        };
        info!(engine = %self.ctx.config.name, runners = runners.len(), "shutting down consulta engine");
        for join in runners {
            let _ = join.await;
        }
    }

    /// Start a runner for `id` unless a live one exists. Callers hold `ops`.
    ///
    /// When the previous runner is still draining, a follow-up task waits
    /// for it and claims the slot afterwards, so the caller never blocks on
    /// an in-flight lookup.
    fn start_runner(&self, id: ConsultaId) -> bool {
        match self.ctx.registry.claim(id) {
            Claim::Claimed(ticket) => {
                let generation = ticket.generation;
                let join = tokio::spawn(runner::run(Arc::clone(&self.ctx), id, ticket));
                self.ctx.registry.attach(id, generation, join);
                true
            }
            Claim::Live => {
                debug!(consulta_id = %id, "runner already live");
                false
            }
            Claim::Draining(done) => {
                debug!(consulta_id = %id, "previous runner draining; deferring start");
                let manager = self.clone();
                tokio::spawn(async move {
                    done.cancelled().await;
                    let _ops = manager.ops.lock().await;
                    // The consulta may have been paused, cancelled or removed meanwhile.
                    match manager.ctx.store.get(id).await {
                        Ok(Some(c)) if c.is_running() => {
                            manager.start_runner(id);
                        }
                        Ok(_) => debug!(consulta_id = %id, "deferred start dropped; consulta not running"),
                        Err(e) => error!(consulta_id = %id, error = %e, "deferred start failed to load consulta"),
                    }
                });
                true
            }
            Claim::Closed => {
                debug!(consulta_id = %id, "engine shut down; runner not started");
                false
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn tracked_documents(&self) -> usize {
        self.ctx.locks.len()
    }
}
