//! Background consulta engine.
//!
//! ## Design
//!
//! - One consulta is a batch of CPFs looked up one at a time, with a fixed
//!   delay between items to respect the provider's rate limit
//! - Progress is persisted after every item, so a consulta survives restarts
//! - Pause/resume/cancel are cooperative: the in-flight lookup always lands
//! - At most one runner per consulta, enforced by an in-memory registry
//! - Orphaned `running` consultas are picked up again by a recovery sweep
//!
//! ## Components
//!
//! - `ConsultaStore`: persistence for consulta documents (in-memory or Postgres)
//! - `LookupClient`: the external per-CPF lookup
//! - `RegistrationSink`: downstream record of resolved CPFs
//! - `ConsultaManager`: lifecycle API; spawns one runner task per running consulta

pub mod config;
mod context;
pub mod lookup;
pub mod manager;
pub mod postgres;
pub mod registration;
mod registry;
mod runner;
pub mod store;

pub use config::{EngineConfig, CANCELLED_BY_USER};
pub use lookup::{lookup_batch, BatchLookup, LookupClient, LookupError};
pub use manager::{ConsultaManager, EngineError, RecoveryReport, RecoverySweepHandle};
pub use postgres::PostgresConsultaStore;
pub use registration::{
    InMemoryRegistrationSink, RegistrationError, RegistrationRequest, RegistrationSink,
    REGISTERED_STATUS,
};
pub use store::{ConsultaStore, InMemoryConsultaStore, StoreError};
