//! Event publishing/subscription abstraction (mechanics only).
//!
//! The bus distributes [`ProgressEvent`](crate::ProgressEvent)s to any number
//! of observers (dashboards, exporters, tests):
//!
//! - **Transport-agnostic**: in-memory channels here; anything else behind the trait
//! - **At-least-once delivery**: observers must tolerate seeing a snapshot twice
//! - **Per-publisher ordering**: messages from one publisher arrive in publish order
//! - **No persistence**: the consulta store is the source of truth; after a
//!   restart an observer reconciles by listing the store
//!
//! Every event carries a full snapshot and its version, so an observer that
//! sees duplicates or reconnects late can simply keep the highest version.

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

/// A subscription to an event stream.
///
/// Each subscription gets a copy of every message published after it was
/// created (broadcast semantics). Dropping it unsubscribes; the bus prunes
/// dead subscribers on the next publish.
///
/// ```ignore
/// let subscription = manager.subscribe();
/// loop {
///     match subscription.recv_timeout(Duration::from_secs(1)) {
///         Ok(event) => render(event.consulta),
///         Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
///         Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
///     }
/// }
/// ```
///
/// Subscriptions are meant for a single consumer thread. Blocking methods
/// (`recv`, `recv_timeout`) must not be called from inside an async task;
/// use `try_recv`/`try_iter` there or move the consumer to a blocking thread.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain everything that is already queued, without blocking.
    pub fn try_iter(&self) -> impl Iterator<Item = M> + '_ {
        self.receiver.try_iter()
    }
}

/// Domain-agnostic event bus (pub/sub abstraction).
///
/// `publish()` can fail (e.g. poisoned lock, broken transport). The consulta
/// engine logs such failures and carries on: the document has already been
/// persisted, so observers can always reconcile from the store.
///
/// The trait requires `Send + Sync`; runners on different tasks publish
/// concurrently.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
