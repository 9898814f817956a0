//! The consulta document: one batch of CPF lookups and the state of each item.
//!
//! Every mutation goes through a method on [`Consulta`] so the invariants hold
//! no matter who drives the document (runner, manager, recovery sweep):
//!
//! - items only move `pending -> {success, no_result, error}`
//! - `processed_items` never decreases and never exceeds `total_items`
//! - `completed` is reachable only once no item is `pending`, and is final
//! - `last_updated_at >= started_at`

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::aggregate::AggregateRoot;
use crate::error::{DomainError, DomainResult};
use crate::id::ConsultaId;

/// Message the provider sends when a CPF has no offer at all.
pub const NO_OFFER_MESSAGE: &str = "Nenhuma oferta encontrada.";

/// Lifecycle status of a consulta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsultaStatus {
    Running,
    Paused,
    Completed,
    /// Aborted as a whole (e.g. cancelled by the user); see `failure_reason`.
    Error,
}

impl ConsultaStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConsultaStatus::Completed | ConsultaStatus::Error)
    }
}

/// Resolution state of a single item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Success,
    NoResult,
    Error,
}

impl ItemStatus {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, ItemStatus::Pending)
    }
}

/// One offer returned by the provider for a CPF.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    /// Amount released to the worker.
    pub amount: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installments: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installment_amount: Option<f64>,
    /// Provider payload, kept verbatim for display.
    #[serde(default)]
    pub raw: serde_json::Value,
}

impl Offer {
    pub fn new(amount: f64) -> Self {
        Self {
            amount,
            installments: None,
            installment_amount: None,
            raw: serde_json::Value::Null,
        }
    }
}

/// Successful answer of the provider (which may still carry zero offers).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LookupResult {
    pub offers: Vec<Offer>,
    /// The provider answered, but flagged the answer as a refusal.
    #[serde(default)]
    pub provider_error: bool,
    #[serde(default)]
    pub message: String,
}

impl LookupResult {
    pub fn with_offers(offers: Vec<Offer>) -> Self {
        Self {
            offers,
            provider_error: false,
            message: String::new(),
        }
    }

    /// The provider's explicit "no offer found" answer.
    pub fn no_offer() -> Self {
        Self {
            offers: Vec::new(),
            provider_error: true,
            message: NO_OFFER_MESSAGE.to_string(),
        }
    }

    pub fn refused(message: impl Into<String>) -> Self {
        Self {
            offers: Vec::new(),
            provider_error: true,
            message: message.into(),
        }
    }

    /// Item status this answer resolves to.
    pub fn classify(&self) -> ItemStatus {
        if self.provider_error || self.offers.is_empty() {
            ItemStatus::NoResult
        } else {
            ItemStatus::Success
        }
    }

    /// True when the provider positively confirmed that there is nothing to offer.
    pub fn confirms_no_offer(&self) -> bool {
        self.provider_error && self.offers.is_empty() && self.message == NO_OFFER_MESSAGE
    }

    pub fn first_offer(&self) -> Option<&Offer> {
        self.offers.first()
    }
}

/// What happened to one lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    Resolved(LookupResult),
    Failed(String),
}

/// Input for one item of a new consulta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemSeed {
    /// CPF to look up.
    pub key: String,
    /// Worker name, carried along for registration and display.
    pub label: String,
}

impl ItemSeed {
    pub fn new(key: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            key: key.into().trim().to_string(),
            label: label.into().trim().to_string(),
        }
    }
}

/// One item of a consulta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsultaItem {
    pub key: String,
    pub label: String,
    pub status: ItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<LookupResult>,
    #[serde(default)]
    pub registered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ConsultaItem {
    fn pending(seed: ItemSeed) -> Self {
        Self {
            key: seed.key,
            label: seed.label,
            status: ItemStatus::Pending,
            result: None,
            registered: false,
            error_message: None,
        }
    }

    pub fn seed(&self) -> ItemSeed {
        ItemSeed {
            key: self.key.clone(),
            label: self.label.clone(),
        }
    }
}

/// Per-status item counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsultaSummary {
    pub pending: usize,
    pub success: usize,
    pub no_result: usize,
    pub error: usize,
    pub registered: usize,
}

/// A background consulta document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Consulta {
    pub id: ConsultaId,
    pub status: ConsultaStatus,
    pub total_items: usize,
    pub processed_items: usize,
    pub started_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    /// Non-authoritative hint, recomputed on every item outcome.
    pub estimated_seconds_remaining: u64,
    pub items: Vec<ConsultaItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Delay between items the estimate is based on.
    pub item_delay_ms: u64,
    #[serde(default)]
    pub version: u64,
}

impl Consulta {
    /// Build a new running consulta with every item pending.
    pub fn new(seeds: Vec<ItemSeed>, item_delay: Duration, now: DateTime<Utc>) -> DomainResult<Self> {
        if seeds.is_empty() {
            return Err(DomainError::validation("batch is empty"));
        }
        for (index, seed) in seeds.iter().enumerate() {
            if seed.key.trim().is_empty() {
                return Err(DomainError::validation(format!("item {index}: blank key")));
            }
            if seed.label.trim().is_empty() {
                return Err(DomainError::validation(format!("item {index}: blank label")));
            }
        }

        let total_items = seeds.len();
        let item_delay_ms = u64::try_from(item_delay.as_millis()).unwrap_or(u64::MAX);
        let mut consulta = Self {
            id: ConsultaId::new(),
            status: ConsultaStatus::Running,
            total_items,
            processed_items: 0,
            started_at: now,
            last_updated_at: now,
            estimated_seconds_remaining: 0,
            items: seeds.into_iter().map(ConsultaItem::pending).collect(),
            failure_reason: None,
            item_delay_ms,
            version: 0,
        };
        consulta.recompute_estimate();
        Ok(consulta)
    }

    pub fn is_running(&self) -> bool {
        self.status == ConsultaStatus::Running
    }

    /// Index of the first item still pending, in original order.
    pub fn next_pending(&self) -> Option<usize> {
        self.items.iter().position(|i| i.status == ItemStatus::Pending)
    }

    pub fn pending_seeds(&self) -> Vec<(usize, ItemSeed)> {
        self.items
            .iter()
            .enumerate()
            .filter(|(_, i)| i.status == ItemStatus::Pending)
            .map(|(idx, i)| (idx, i.seed()))
            .collect()
    }

    pub fn has_pending(&self) -> bool {
        self.next_pending().is_some()
    }

    pub fn summary(&self) -> ConsultaSummary {
        let mut summary = ConsultaSummary::default();
        for item in &self.items {
            match item.status {
                ItemStatus::Pending => summary.pending += 1,
                ItemStatus::Success => summary.success += 1,
                ItemStatus::NoResult => summary.no_result += 1,
                ItemStatus::Error => summary.error += 1,
            }
            if item.registered {
                summary.registered += 1;
            }
        }
        summary
    }

    /// A running consulta nobody has touched for longer than `threshold`.
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        let threshold = chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::MAX);
        self.is_running() && now - self.last_updated_at > threshold
    }

    /// Record the outcome of the lookup for item `index`.
    ///
    /// Allowed while paused or cancelled: the in-flight lookup still lands.
    pub fn resolve_item(
        &mut self,
        index: usize,
        outcome: ItemOutcome,
        now: DateTime<Utc>,
    ) -> DomainResult<ItemStatus> {
        if self.status == ConsultaStatus::Completed {
            return Err(DomainError::conflict("consulta already completed"));
        }
        let total = self.total_items;
        let item = self
            .items
            .get_mut(index)
            .ok_or_else(|| DomainError::invariant(format!("item {index} out of range ({total})")))?;
        if item.status.is_resolved() {
            return Err(DomainError::conflict(format!("item {index} already resolved")));
        }

        match outcome {
            ItemOutcome::Resolved(result) => {
                item.status = result.classify();
                item.result = Some(result);
            }
            ItemOutcome::Failed(message) => {
                item.status = ItemStatus::Error;
                item.error_message = Some(message);
            }
        }
        let status = item.status;

        self.processed_items = self.processed_items.max(index + 1).min(self.total_items);
        self.recompute_estimate();
        self.bump(now);
        Ok(status)
    }

    /// Flag item `index` as recorded downstream. Returns `false` if it already was.
    pub fn mark_registered(&mut self, index: usize, now: DateTime<Utc>) -> DomainResult<bool> {
        let item = self
            .items
            .get_mut(index)
            .ok_or_else(|| DomainError::invariant(format!("item {index} out of range")))?;
        if !item.status.is_resolved() {
            return Err(DomainError::conflict(format!("item {index} still pending")));
        }
        if item.registered {
            return Ok(false);
        }
        item.registered = true;
        self.bump(now);
        Ok(true)
    }

    pub fn pause(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != ConsultaStatus::Running {
            return false;
        }
        self.status = ConsultaStatus::Paused;
        self.bump(now);
        true
    }

    pub fn resume(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != ConsultaStatus::Paused {
            return false;
        }
        self.status = ConsultaStatus::Running;
        self.bump(now);
        true
    }

    /// Abort the whole consulta. Terminal.
    pub fn cancel(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = ConsultaStatus::Error;
        self.failure_reason = Some(reason.into());
        self.bump(now);
        true
    }

    /// Finish a running consulta. Fails while any item is still pending.
    pub fn complete(&mut self, now: DateTime<Utc>) -> DomainResult<bool> {
        if self.status != ConsultaStatus::Running {
            return Ok(false);
        }
        if let Some(index) = self.next_pending() {
            return Err(DomainError::invariant(format!(
                "cannot complete with item {index} pending"
            )));
        }
        self.status = ConsultaStatus::Completed;
        self.estimated_seconds_remaining = 0;
        self.bump(now);
        Ok(true)
    }

    /// Refresh `last_updated_at` of a running consulta picked up again after going stale.
    pub fn mark_recovered(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != ConsultaStatus::Running {
            return false;
        }
        self.bump(now);
        true
    }

    fn recompute_estimate(&mut self) {
        let remaining = self.total_items.saturating_sub(self.processed_items) as u64;
        let millis = remaining.saturating_mul(self.item_delay_ms);
        self.estimated_seconds_remaining = millis.div_ceil(1000);
    }

    fn bump(&mut self, now: DateTime<Utc>) {
        self.last_updated_at = self.last_updated_at.max(now);
        self.version += 1;
    }
}

impl AggregateRoot for Consulta {
    type Id = ConsultaId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}
