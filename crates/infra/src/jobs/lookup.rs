//! External lookup client interface.
//!
//! The transport (HTTP, auth headers, per-call timeout and retries) belongs to
//! the implementor; the engine only needs one call per CPF.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use consulta_core::{ItemOutcome, ItemSeed, LookupResult};

/// A lookup that failed before the provider gave an answer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct LookupError {
    pub message: String,
}

impl LookupError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Looks up the offers available for one CPF.
///
/// Must be safe to call repeatedly for the same key.
#[async_trait]
pub trait LookupClient: Send + Sync + 'static {
    async fn lookup(&self, key: &str) -> Result<LookupResult, LookupError>;
}

/// Result of one entry of [`lookup_batch`].
#[derive(Debug, Clone, PartialEq)]
pub struct BatchLookup {
    pub seed: ItemSeed,
    pub outcome: ItemOutcome,
}

/// Look up a small batch in the foreground, one CPF at a time.
///
/// Nothing is persisted; failures are returned per entry. `delay` is awaited
/// between two lookups, never after the last one.
pub async fn lookup_batch(
    client: &dyn LookupClient,
    seeds: &[ItemSeed],
    delay: Duration,
) -> Vec<BatchLookup> {
    let mut results = Vec::with_capacity(seeds.len());

    for (index, seed) in seeds.iter().enumerate() {
        if index > 0 && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let outcome = match client.lookup(&seed.key).await {
            Ok(result) => ItemOutcome::Resolved(result),
            Err(e) => ItemOutcome::Failed(e.message),
        };
        debug!(index, key = %seed.key, "foreground lookup finished");

        results.push(BatchLookup {
            seed: seed.clone(),
            outcome,
        });
    }

    results
}
