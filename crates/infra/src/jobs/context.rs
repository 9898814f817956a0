//! State shared by the manager and every runner it spawns.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;

use consulta_core::{Consulta, ConsultaId, DomainResult};
use consulta_events::{EventBus, ProgressEvent, ProgressKind};

use super::config::EngineConfig;
use super::lookup::LookupClient;
use super::manager::EngineError;
use super::registration::RegistrationSink;
use super::registry::{DocumentLocks, RunnerRegistry};
use super::store::ConsultaStore;

/// Outcome of [`EngineContext::mutate`].
#[derive(Debug)]
pub(crate) enum Mutation {
    /// The change was persisted and published; holds the new snapshot.
    Applied(Consulta),
    /// The transition did not apply; nothing was written.
    Unchanged(Consulta),
    Missing,
}

pub(crate) struct EngineContext<S, B> {
    pub store: S,
    pub bus: B,
    pub lookup: Arc<dyn LookupClient>,
    pub sink: Arc<dyn RegistrationSink>,
    pub config: EngineConfig,
    pub registry: RunnerRegistry,
    pub locks: DocumentLocks,
}

impl<S, B> EngineContext<S, B>
where
    S: ConsultaStore,
    B: EventBus<ProgressEvent>,
{
    /// Load, change, persist and publish one consulta under its document lock.
    ///
    /// `change` returns the event kind to publish, or `None` when the
    /// transition does not apply. Events of one consulta are published while
    /// the lock is held, so observers see them in version order.
    pub async fn mutate<F>(&self, id: ConsultaId, change: F) -> Result<Mutation, EngineError>
    where
        F: FnOnce(&mut Consulta, DateTime<Utc>) -> DomainResult<Option<ProgressKind>> + Send,
    {
        let lock = self.locks.lock_for(id);
        let mutation = {
            let _guard = lock.lock().await;

            match self.store.get(id).await? {
                None => Mutation::Missing,
                Some(mut consulta) => match change(&mut consulta, Utc::now())? {
                    Some(kind) => {
                        self.store.put(&consulta).await?;
                        self.publish(kind, &consulta);
                        Mutation::Applied(consulta)
                    }
                    None => Mutation::Unchanged(consulta),
                },
            }
        };

        let settled = match &mutation {
            Mutation::Applied(c) | Mutation::Unchanged(c) => c.status.is_terminal(),
            Mutation::Missing => true,
        };
        // A live runner releases the lock itself when it exits.
        if settled && !self.registry.has_runner(id) {
            self.locks.forget(id);
        }
        Ok(mutation)
    }

    /// Drop the document lock of `id` once nothing will write it again.
    ///
    /// Called by a runner after releasing its slot.
    pub async fn forget_if_settled(&self, id: ConsultaId) {
        match self.store.get(id).await {
            Ok(Some(c)) if !c.status.is_terminal() => {}
            Ok(_) => self.locks.forget(id),
            Err(e) => warn!(
                engine = %self.config.name,
                consulta_id = %id,
                error = %e,
                "could not check consulta after runner exit; keeping its lock"
            ),
        }
    }

    /// Delete a document, publishing its last snapshot.
    pub async fn remove_document(&self, id: ConsultaId) -> Result<Option<Consulta>, EngineError> {
        let lock = self.locks.lock_for(id);
        let removed = {
            let _guard = lock.lock().await;
            match self.store.get(id).await? {
                Some(consulta) => {
                    self.store.delete(id).await?;
                    self.publish(ProgressKind::Removed, &consulta);
                    Some(consulta)
                }
                None => None,
            }
        };
        self.locks.forget(id);
        Ok(removed)
    }

    /// Publish a snapshot. The store is the source of truth, so a failed
    /// publish is logged and otherwise ignored.
    pub fn publish(&self, kind: ProgressKind, consulta: &Consulta) {
        if let Err(e) = self.bus.publish(ProgressEvent::new(kind, consulta.clone())) {
            warn!(
                engine = %self.config.name,
                consulta_id = %consulta.id,
                version = consulta.version,
                error = ?e,
                "failed to publish progress event"
            );
        }
    }
}
