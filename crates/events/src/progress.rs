//! Progress notifications emitted by the consulta engine.

use chrono::{DateTime, Utc};
use serde::Serialize;

use consulta_core::{AggregateRoot, Consulta, ConsultaId, ItemStatus};

use crate::event::Event;

/// What changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressKind {
    Created,
    /// An item left `pending` (success, no_result or error).
    ItemResolved { index: usize, status: ItemStatus },
    /// The registration sink accepted an item.
    ItemRegistered { index: usize },
    Paused,
    Resumed,
    /// A stale running consulta was picked up by a new runner.
    Recovered,
    Completed,
    Cancelled,
    /// The document was deleted; the snapshot is the last stored state.
    Removed,
}

/// A persisted change of one consulta, carrying the full snapshot after it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub kind: ProgressKind,
    pub consulta: Consulta,
    pub occurred_at: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(kind: ProgressKind, consulta: Consulta) -> Self {
        Self {
            kind,
            occurred_at: consulta.last_updated_at,
            consulta,
        }
    }

    pub fn consulta_id(&self) -> ConsultaId {
        self.consulta.id
    }

    /// Version of the snapshot. Grows with every persisted change of one
    /// consulta; a `Removed` event repeats the version of the last stored one.
    pub fn sequence(&self) -> u64 {
        self.consulta.version()
    }

    /// True for events after which the consulta will never change again.
    pub fn is_final(&self) -> bool {
        matches!(
            self.kind,
            ProgressKind::Completed | ProgressKind::Cancelled | ProgressKind::Removed
        )
    }
}

impl Event for ProgressEvent {
    fn event_type(&self) -> &'static str {
        match self.kind {
            ProgressKind::Created => "consulta.created",
            ProgressKind::ItemResolved { .. } => "consulta.item.resolved",
            ProgressKind::ItemRegistered { .. } => "consulta.item.registered",
            ProgressKind::Paused => "consulta.paused",
            ProgressKind::Resumed => "consulta.resumed",
            ProgressKind::Recovered => "consulta.recovered",
            ProgressKind::Completed => "consulta.completed",
            ProgressKind::Cancelled => "consulta.cancelled",
            ProgressKind::Removed => "consulta.removed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}
