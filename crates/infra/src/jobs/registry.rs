//! Bookkeeping of live runners and per-document write locks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use consulta_core::ConsultaId;

/// Permission for one runner to drive one consulta.
#[derive(Debug)]
pub(crate) struct RunnerTicket {
    pub generation: u64,
    pub token: CancellationToken,
}

/// Result of [`RunnerRegistry::claim`].
#[derive(Debug)]
pub(crate) enum Claim {
    Claimed(RunnerTicket),
    /// A runner is active and has not been told to stop.
    Live,
    /// A signalled runner is still finishing its in-flight item; the token
    /// fires once it has released its slot.
    Draining(CancellationToken),
    /// The engine is shutting down.
    Closed,
}

/// Result of [`RunnerRegistry::take_for_removal`].
#[derive(Debug)]
pub(crate) enum Removal {
    Busy,
    Draining(CancellationToken),
    Clear,
}

#[derive(Debug)]
struct RunnerSlot {
    generation: u64,
    token: CancellationToken,
    done: CancellationToken,
    join: Option<JoinHandle<()>>,
}

impl RunnerSlot {
    /// The task is gone even though it never released the slot (it panicked).
    fn is_dead(&self) -> bool {
        self.join.as_ref().is_some_and(JoinHandle::is_finished)
    }
}

/// At most one runner per consulta.
///
/// A slot lives from `claim` until its runner calls `finish`, or until its
/// task is found dead. Generations keep a replaced runner from clearing the
/// slot of its successor.
#[derive(Debug, Default)]
pub(crate) struct RunnerRegistry {
    slots: Mutex<HashMap<ConsultaId, RunnerSlot>>,
    next_generation: AtomicU64,
    closed: AtomicBool,
}

impl RunnerRegistry {
    fn slots(&self) -> MutexGuard<'_, HashMap<ConsultaId, RunnerSlot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Test-and-set the runner slot of `id`.
    pub fn claim(&self, id: ConsultaId) -> Claim {
        if self.closed.load(Ordering::Acquire) {
            return Claim::Closed;
        }
        let mut slots = self.slots();

        if let Some(slot) = slots.get(&id) {
            if !slot.is_dead() {
                if !slot.token.is_cancelled() {
                    return Claim::Live;
                }
                return Claim::Draining(slot.done.clone());
            }
        }

        let ticket = RunnerTicket {
            generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
            token: CancellationToken::new(),
        };
        let previous = slots.insert(
            id,
            RunnerSlot {
                generation: ticket.generation,
                token: ticket.token.clone(),
                done: CancellationToken::new(),
                join: None,
            },
        );
        if let Some(dead) = previous {
            dead.done.cancel();
        }
        Claim::Claimed(ticket)
    }

    /// Hand the task of a freshly claimed slot to the registry.
    pub fn attach(&self, id: ConsultaId, generation: u64, join: JoinHandle<()>) {
        if let Some(slot) = self.slots().get_mut(&id) {
            if slot.generation == generation {
                slot.join = Some(join);
            }
        }
    }

    /// Called by a runner on exit, including unwinding.
    pub fn finish(&self, id: ConsultaId, generation: u64) {
        let mut slots = self.slots();
        if slots.get(&id).is_some_and(|slot| slot.generation == generation) {
            if let Some(slot) = slots.remove(&id) {
                slot.done.cancel();
            }
        }
    }

    /// Ask the runner of `id` (if any) to stop at its next item boundary.
    pub fn signal(&self, id: ConsultaId) {
        if let Some(slot) = self.slots().get(&id) {
            slot.token.cancel();
        }
    }

    /// A runner exists and has not been signalled.
    pub fn is_live(&self, id: ConsultaId) -> bool {
        self.slots()
            .get(&id)
            .is_some_and(|slot| !slot.is_dead() && !slot.token.is_cancelled())
    }

    /// A runner task exists, signalled or not.
    pub fn has_runner(&self, id: ConsultaId) -> bool {
        self.slots().get(&id).is_some_and(|slot| !slot.is_dead())
    }

    pub fn take_for_removal(&self, id: ConsultaId) -> Removal {
        let mut slots = self.slots();
        let state = slots
            .get(&id)
            .map(|slot| (slot.is_dead(), slot.token.is_cancelled(), slot.done.clone()));
        match state {
            Some((false, false, _)) => Removal::Busy,
            Some((false, true, done)) => Removal::Draining(done),
            Some((true, _, _)) => {
                if let Some(dead) = slots.remove(&id) {
                    dead.done.cancel();
                }
                Removal::Clear
            }
            None => Removal::Clear,
        }
    }

    /// Refuse new claims, signal every runner and hand back their tasks.
    ///
    /// Slots stay until each runner releases its own.
    pub fn drain_all(&self) -> Vec<JoinHandle<()>> {
        self.closed.store(true, Ordering::Release);
        self.slots()
            .values_mut()
            .filter_map(|slot| {
                slot.token.cancel();
                slot.join.take()
            })
            .collect()
    }
}

/// One async mutex per consulta document.
///
/// Serializes read-modify-write cycles on the same document, so a runner
/// writing an item outcome never overwrites a concurrent pause or cancel.
#[derive(Debug, Default)]
pub(crate) struct DocumentLocks {
    locks: Mutex<HashMap<ConsultaId, Arc<tokio::sync::Mutex<()>>>>,
}

impl DocumentLocks {
    fn locks(&self) -> MutexGuard<'_, HashMap<ConsultaId, Arc<tokio::sync::Mutex<()>>>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn lock_for(&self, id: ConsultaId) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.locks().entry(id).or_default())
    }

    /// Drop the lock of a consulta that will not be written again.
    pub fn forget(&self, id: ConsultaId) {
        self.locks().remove(&id);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.locks().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claimed(claim: Claim) -> RunnerTicket {
        match claim {
            Claim::Claimed(ticket) => ticket,
            other => panic!("expected a claim, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn second_claim_of_live_runner_is_refused() {
        let registry = RunnerRegistry::default();
        let id = ConsultaId::new();

        let ticket = claimed(registry.claim(id));
        assert!(matches!(registry.claim(id), Claim::Live));
        assert!(registry.is_live(id));

        registry.finish(id, ticket.generation);
        assert!(!registry.has_runner(id));
        claimed(registry.claim(id));
    }

    #[tokio::test]
    async fn signalled_runner_drains_before_a_new_claim() {
        let registry = RunnerRegistry::default();
        let id = ConsultaId::new();

        let ticket = claimed(registry.claim(id));
        let token = ticket.token.clone();
        let join = tokio::spawn(async move { token.cancelled().await });
        registry.attach(id, ticket.generation, join);

        registry.signal(id);
        assert!(!registry.is_live(id));

        let Claim::Draining(done) = registry.claim(id) else {
            panic!("expected draining runner");
        };
        assert!(registry.has_runner(id));
        // Still draining: every caller is told to wait.
        assert!(matches!(registry.claim(id), Claim::Draining(_)));

        registry.finish(id, ticket.generation);
        assert!(done.is_cancelled());

        let next = claimed(registry.claim(id));
        assert_ne!(next.generation, ticket.generation);

        // A late finish of the old generation leaves the new slot alone.
        registry.finish(id, ticket.generation);
        assert!(registry.is_live(id));
    }

    #[tokio::test]
    async fn dead_task_frees_its_slot() {
        let registry = RunnerRegistry::default();
        let id = ConsultaId::new();

        let ticket = claimed(registry.claim(id));
        let join = tokio::spawn(async {});
        tokio::task::yield_now().await;
        while !join.is_finished() {
            tokio::task::yield_now().await;
        }
        registry.attach(id, ticket.generation, join);

        // Never signalled, never finished, but the task is gone.
        assert!(!registry.is_live(id));
        assert!(!registry.has_runner(id));
        let next = claimed(registry.claim(id));
        assert_ne!(next.generation, ticket.generation);
    }

    #[tokio::test]
    async fn removal_is_refused_while_live_and_deferred_while_draining() {
        let registry = RunnerRegistry::default();
        let id = ConsultaId::new();

        let ticket = claimed(registry.claim(id));
        let token = ticket.token.clone();
        let join = tokio::spawn(async move { token.cancelled().await });
        registry.attach(id, ticket.generation, join);
        assert!(matches!(registry.take_for_removal(id), Removal::Busy));

        registry.signal(id);
        let Removal::Draining(done) = registry.take_for_removal(id) else {
            panic!("expected draining runner");
        };
        assert!(!done.is_cancelled());

        registry.finish(id, ticket.generation);
        assert!(done.is_cancelled());
        assert!(matches!(registry.take_for_removal(id), Removal::Clear));
    }

    #[tokio::test]
    async fn drain_all_signals_everything_and_closes() {
        let registry = RunnerRegistry::default();
        let tokens: Vec<_> = (0..3)
            .map(|_| claimed(registry.claim(ConsultaId::new())).token)
            .collect();

        registry.drain_all();
        assert!(tokens.iter().all(CancellationToken::is_cancelled));
        assert!(matches!(registry.claim(ConsultaId::new()), Claim::Closed));
    }

    #[tokio::test]
    async fn document_locks_are_shared_per_id() {
        let locks = DocumentLocks::default();
        let id = ConsultaId::new();

        let a = locks.lock_for(id);
        let b = locks.lock_for(id);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &locks.lock_for(ConsultaId::new())));
        assert_eq!(locks.len(), 2);

        let _guard = a.lock().await;
        assert!(b.try_lock().is_err());

        locks.forget(id);
        assert_eq!(locks.len(), 1);
    }
}
