//! Strongly-typed identifiers.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Identifier of a background consulta (one batch run).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConsultaId(Uuid);

impl ConsultaId {
    /// Create a new identifier.
    ///
    /// Uses UUIDv7 (time-ordered), so ids sort by creation time.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Last eight characters of the id, as shown to operators.
    pub fn short(&self) -> String {
        let s = self.0.simple().to_string();
        s[s.len() - 8..].to_string()
    }
}

impl Default for ConsultaId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for ConsultaId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<Uuid> for ConsultaId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<ConsultaId> for Uuid {
    fn from(value: ConsultaId) -> Self {
        value.0
    }
}

impl FromStr for ConsultaId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid =
            Uuid::from_str(s).map_err(|e| DomainError::invalid_id(format!("ConsultaId: {e}")))?;
        Ok(Self(uuid))
    }
}
