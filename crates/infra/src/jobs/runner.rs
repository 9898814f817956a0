//! The runner: one tokio task per running consulta.
//!
//! Each iteration re-reads the document, looks up the first pending item,
//! records the outcome, registers it downstream when owed, then sleeps for
//! `item_delay` or until the cancellation token fires. The token is only
//! observed between items: an in-flight lookup always lands.

use std::any::Any;
use std::sync::Arc;

use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use consulta_core::{Consulta, ConsultaId, ConsultaStatus, ItemOutcome};
use consulta_events::{EventBus, ProgressEvent, ProgressKind};

use super::context::{EngineContext, Mutation};
use super::lookup::LookupClient;
use super::manager::EngineError;
use super::registration::{RegistrationError, RegistrationRequest, RegistrationSink};
use super::registry::{RunnerRegistry, RunnerTicket};
use super::store::{ConsultaStore, StoreError};

/// Why a runner stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stop {
    /// Paused, cancelled or shut down through the token.
    Signalled,
    /// The document is no longer `running`.
    NotRunning(ConsultaStatus),
    /// The document was deleted.
    Missing,
    Completed,
}

/// Releases a runner's registry slot when dropped, including on unwind.
struct SlotRelease<'a> {
    registry: &'a RunnerRegistry,
    id: ConsultaId,
    generation: u64,
}

impl Drop for SlotRelease<'_> {
    fn drop(&mut self) {
        self.registry.finish(self.id, self.generation);
    }
}

/// Task body of one runner. Always releases its registry slot on exit.
pub(crate) async fn run<S, B>(ctx: Arc<EngineContext<S, B>>, id: ConsultaId, ticket: RunnerTicket)
where
    S: ConsultaStore + 'static,
    B: EventBus<ProgressEvent> + 'static,
{
    let RunnerTicket { generation, token } = ticket;
    let slot = SlotRelease {
        registry: &ctx.registry,
        id,
        generation,
    };
    info!(engine = %ctx.config.name, consulta_id = %id, generation, "consulta runner started");

    match drive(&ctx, id, &token).await {
        Ok(stop) => info!(
            engine = %ctx.config.name,
            consulta_id = %id,
            generation,
            reason = ?stop,
            "consulta runner stopped"
        ),
        // The document stays `running`; stale recovery picks it up again.
        Err(e) => error!(
            engine = %ctx.config.name,
            consulta_id = %id,
            generation,
            error = %e,
            "consulta runner aborted"
        ),
    }

    drop(slot);
    ctx.forget_if_settled(id).await;
}

async fn drive<S, B>(
    ctx: &EngineContext<S, B>,
    id: ConsultaId,
    token: &CancellationToken,
) -> Result<Stop, EngineError>
where
    S: ConsultaStore,
    B: EventBus<ProgressEvent>,
{
    loop {
        if token.is_cancelled() {
            return Ok(Stop::Signalled);
        }

        let Some(consulta) = ctx.store.get(id).await? else {
            return Ok(Stop::Missing);
        };
        if !consulta.is_running() {
            return Ok(Stop::NotRunning(consulta.status));
        }

        let Some(index) = consulta.next_pending() else {
            complete(ctx, id).await?;
            return Ok(Stop::Completed);
        };

        let key = consulta.items[index].key.clone();
        let outcome = lookup_isolated(Arc::clone(&ctx.lookup), key.clone()).await;
        debug!(consulta_id = %id, index, key = %key, outcome = ?outcome, "lookup finished");

        let resolved = ctx
            .mutate(id, move |c, now| {
                let status = c.resolve_item(index, outcome, now)?;
                Ok(Some(ProgressKind::ItemResolved { index, status }))
            })
            .await;

        let more = match resolved {
            Ok(Mutation::Applied(updated)) => {
                register(ctx, id, index, &updated).await?;
                updated.has_pending()
            }
            Ok(Mutation::Unchanged(updated)) => updated.has_pending(),
            Ok(Mutation::Missing) => return Ok(Stop::Missing),
            Err(EngineError::Domain(e)) => {
                warn!(consulta_id = %id, index, error = %e, "item outcome discarded");
                true
            }
            Err(e) => return Err(e),
        };

        // The next iteration completes the consulta without waiting.
        if !more {
            continue;
        }

        tokio::select! {
            _ = token.cancelled() => return Ok(Stop::Signalled),
            _ = tokio::time::sleep(ctx.config.item_delay) => {}
        }
    }
}

async fn complete<S, B>(ctx: &EngineContext<S, B>, id: ConsultaId) -> Result<(), EngineError>
where
    S: ConsultaStore,
    B: EventBus<ProgressEvent>,
{
    let done = ctx
        .mutate(id, |c, now| Ok(c.complete(now)?.then_some(ProgressKind::Completed)))
        .await?;
    if let Mutation::Applied(consulta) = done {
        let summary = consulta.summary();
        info!(
            engine = %ctx.config.name,
            consulta_id = %id,
            total_items = consulta.total_items,
            success = summary.success,
            no_result = summary.no_result,
            error = summary.error,
            registered = summary.registered,
            "consulta completed"
        );
    }
    Ok(())
}

/// Register item `index` downstream, at most once.
///
/// The store marker is claimed before the call, so a failure or crash after
/// the claim means the item is never sent again.
async fn register<S, B>(
    ctx: &EngineContext<S, B>,
    id: ConsultaId,
    index: usize,
    consulta: &Consulta,
) -> Result<(), EngineError>
where
    S: ConsultaStore,
    B: EventBus<ProgressEvent>,
{
    let Some(item) = consulta.items.get(index) else {
        return Ok(());
    };
    if item.registered {
        return Ok(());
    }
    let Some(request) = RegistrationRequest::for_item(item) else {
        return Ok(());
    };

    match ctx.store.claim_registration(id, index).await {
        Ok(true) => {}
        Ok(false) => {
            debug!(consulta_id = %id, index, "registration already attempted");
            return Ok(());
        }
        Err(StoreError::NotFound(_)) => return Ok(()),
        Err(e) => return Err(e.into()),
    }

    let key = request.key.clone();
    match register_isolated(Arc::clone(&ctx.sink), request).await {
        Ok(()) => {
            let marked = ctx
                .mutate(id, move |c, now| {
                    Ok(c.mark_registered(index, now)?
                        .then_some(ProgressKind::ItemRegistered { index }))
                })
                .await;
            if let Err(e) = marked {
                warn!(consulta_id = %id, index, error = %e, "failed to flag item as registered");
            }
        }
        Err(e) => {
            warn!(consulta_id = %id, index, key = %key, error = %e, "registration failed; not retried");
        }
    }
    Ok(())
}

/// Run one lookup in its own task so a panicking client only fails the item.
async fn lookup_isolated(client: Arc<dyn LookupClient>, key: String) -> ItemOutcome {
    let task = tokio::spawn(async move { client.lookup(&key).await });
    match task.await {
        Ok(Ok(result)) => ItemOutcome::Resolved(result),
        Ok(Err(e)) => ItemOutcome::Failed(e.message),
        Err(e) => ItemOutcome::Failed(format!("lookup panicked: {}", join_failure(e))),
    }
}

async fn register_isolated(
    sink: Arc<dyn RegistrationSink>,
    request: RegistrationRequest,
) -> Result<(), RegistrationError> {
    let task = tokio::spawn(async move { sink.register(&request).await });
    match task.await {
        Ok(result) => result,
        Err(e) => Err(RegistrationError::new(format!(
            "sink panicked: {}",
            join_failure(e)
        ))),
    }
}

fn join_failure(e: JoinError) -> String {
    if !e.is_panic() {
        return e.to_string();
    }
    let payload: Box<dyn Any + Send> = e.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
