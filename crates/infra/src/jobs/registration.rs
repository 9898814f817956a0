//! Registration sink: records resolved CPFs in the downstream system of record.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;

use consulta_core::ConsultaItem;

/// Status every registered worker is recorded with.
pub const REGISTERED_STATUS: &str = "ativo";

/// One registration call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistrationRequest {
    pub key: String,
    pub label: String,
    pub status: String,
    pub has_amount: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
}

impl RegistrationRequest {
    /// Registration owed for a resolved item, if any.
    ///
    /// - offers found: registered, with the first offer's amount when positive
    /// - provider confirmed there is no offer: registered without amount
    /// - anything else (lookup errors, other refusals): nothing to register
    pub fn for_item(item: &ConsultaItem) -> Option<Self> {
        let result = item.result.as_ref()?;

        let amount = match result.first_offer() {
            Some(offer) if offer.amount > 0.0 => Some(offer.amount),
            Some(_) => None,
            None if result.confirms_no_offer() => None,
            None => return None,
        };

        Some(Self {
            key: item.key.clone(),
            label: item.label.clone(),
            status: REGISTERED_STATUS.to_string(),
            has_amount: amount.is_some(),
            amount,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("registration failed: {message}")]
pub struct RegistrationError {
    pub message: String,
}

impl RegistrationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Downstream system of record for lookup outcomes.
///
/// Called at most once per item; the engine never retries a failed call.
#[async_trait]
pub trait RegistrationSink: Send + Sync + 'static {
    async fn register(&self, request: &RegistrationRequest) -> Result<(), RegistrationError>;
}

/// In-memory sink for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryRegistrationSink {
    accepted: Mutex<Vec<RegistrationRequest>>,
    rejected_keys: Mutex<HashSet<String>>,
    attempts: Mutex<Vec<String>>,
}

impl InMemoryRegistrationSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every registration of `key` fail.
    pub fn reject(&self, key: impl Into<String>) {
        self.rejected_keys.lock().unwrap().insert(key.into());
    }

    pub fn all(&self) -> Vec<RegistrationRequest> {
        self.accepted.lock().unwrap().clone()
    }

    /// Keys of every call, accepted or not.
    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl RegistrationSink for InMemoryRegistrationSink {
    async fn register(&self, request: &RegistrationRequest) -> Result<(), RegistrationError> {
        self.attempts.lock().unwrap().push(request.key.clone());
        if self.rejected_keys.lock().unwrap().contains(&request.key) {
            return Err(RegistrationError::new(format!("{} rejected", request.key)));
        }
        self.accepted.lock().unwrap().push(request.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use consulta_core::{ItemStatus, LookupResult, Offer};

    use super::*;

    fn item(result: Option<LookupResult>, status: ItemStatus) -> ConsultaItem {
        ConsultaItem {
            key: "12345678901".into(),
            label: "Ana".into(),
            status,
            result,
            registered: false,
            error_message: None,
        }
    }

    #[test]
    fn offer_with_positive_amount_registers_the_amount() {
        let req = RegistrationRequest::for_item(&item(
            Some(LookupResult::with_offers(vec![Offer::new(1234.5), Offer::new(10.0)])),
            ItemStatus::Success,
        ))
        .unwrap();
        assert_eq!(req.status, "ativo");
        assert!(req.has_amount);
        assert_eq!(req.amount, Some(1234.5));
    }

    #[test]
    fn offer_with_zero_amount_registers_without_amount() {
        let req = RegistrationRequest::for_item(&item(
            Some(LookupResult::with_offers(vec![Offer::new(0.0)])),
            ItemStatus::Success,
        ))
        .unwrap();
        assert!(!req.has_amount);
        assert_eq!(req.amount, None);
    }

    #[test]
    fn confirmed_no_offer_registers_without_amount() {
        let req = RegistrationRequest::for_item(&item(
            Some(LookupResult::no_offer()),
            ItemStatus::NoResult,
        ))
        .unwrap();
        assert!(!req.has_amount);
    }

    #[test]
    fn other_refusals_and_errors_are_not_registered() {
        assert!(RegistrationRequest::for_item(&item(
            Some(LookupResult::refused("CPF não elegível")),
            ItemStatus::NoResult,
        ))
        .is_none());
        assert!(RegistrationRequest::for_item(&item(None, ItemStatus::Error)).is_none());
    }

    #[test]
    fn no_offer_message_without_provider_flag_is_not_registered() {
        let unflagged = LookupResult {
            provider_error: false,
            ..LookupResult::no_offer()
        };
        assert!(RegistrationRequest::for_item(&item(Some(unflagged), ItemStatus::NoResult)).is_none());
    }

    #[tokio::test]
    async fn in_memory_sink_records_and_rejects() {
        let sink = InMemoryRegistrationSink::new();
        sink.reject("bad");

        let mut req = RegistrationRequest::for_item(&item(
            Some(LookupResult::no_offer()),
            ItemStatus::NoResult,
        ))
        .unwrap();
        sink.register(&req).await.unwrap();

        req.key = "bad".into();
        assert!(sink.register(&req).await.is_err());

        assert_eq!(sink.all().len(), 1);
        assert_eq!(sink.attempts(), vec!["12345678901", "bad"]);
    }
}
