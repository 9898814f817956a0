//! Progress notification for background consultas.
//!
//! Mechanics (bus, subscriptions) are kept apart from the payload so the
//! engine can publish through any transport.

pub mod bus;
pub mod event;
pub mod in_memory_bus;
pub mod progress;

pub use bus::{EventBus, Subscription};
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use progress::{ProgressEvent, ProgressKind};
