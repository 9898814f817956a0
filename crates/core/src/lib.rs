//! `consulta-core`: domain building blocks for background CPF consultations.
//!
//! This crate contains **pure domain** types (no infrastructure concerns): the
//! consulta document, its items, and every state transition they may undergo.

pub mod aggregate;
pub mod consulta;
pub mod error;
pub mod id;

pub use aggregate::AggregateRoot;
pub use consulta::{
    Consulta, ConsultaItem, ConsultaStatus, ConsultaSummary, ItemOutcome, ItemSeed, ItemStatus,
    LookupResult, Offer, NO_OFFER_MESSAGE,
};
pub use error::{DomainError, DomainResult};
pub use id::ConsultaId;
