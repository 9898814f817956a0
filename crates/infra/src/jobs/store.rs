//! Consulta document storage.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use consulta_core::{Consulta, ConsultaId};

/// Durable map from consulta id to consulta document, plus the one-time
/// registration markers of its items.
///
/// Writes are whole-document. The engine serializes writes to the same
/// document itself, so implementations need no cross-call transactions.
#[async_trait]
pub trait ConsultaStore: Send + Sync {
    /// Store a new document. Fails if the id is already taken.
    async fn insert(&self, consulta: &Consulta) -> Result<(), StoreError>;

    /// Get a document by id.
    async fn get(&self, id: ConsultaId) -> Result<Option<Consulta>, StoreError>;

    /// Replace an existing document.
    async fn put(&self, consulta: &Consulta) -> Result<(), StoreError>;

    /// Delete a document and its registration markers. Returns whether it existed.
    async fn delete(&self, id: ConsultaId) -> Result<bool, StoreError>;

    /// All documents, in insertion order.
    async fn list(&self) -> Result<Vec<Consulta>, StoreError>;

    /// Test-and-set the registration marker of one item.
    ///
    /// Returns `true` exactly once per `(id, index)`.
    async fn claim_registration(&self, id: ConsultaId, index: usize) -> Result<bool, StoreError>;
}

/// Store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("consulta not found: {0}")]
    NotFound(ConsultaId),
    #[error("consulta already exists: {0}")]
    AlreadyExists(ConsultaId),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

#[derive(Debug, Default)]
struct Documents {
    order: Vec<ConsultaId>,
    docs: HashMap<ConsultaId, Consulta>,
    registrations: HashSet<(ConsultaId, usize)>,
}

/// In-memory consulta store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryConsultaStore {
    inner: RwLock<Documents>,
}

impl InMemoryConsultaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Documents>, StoreError> {
        self.inner
            .read()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Documents>, StoreError> {
        self.inner
            .write()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }
}

#[async_trait]
impl ConsultaStore for InMemoryConsultaStore {
    async fn insert(&self, consulta: &Consulta) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        if inner.docs.contains_key(&consulta.id) {
            return Err(StoreError::AlreadyExists(consulta.id));
        }
        inner.order.push(consulta.id);
        inner.docs.insert(consulta.id, consulta.clone());
        Ok(())
    }

    async fn get(&self, id: ConsultaId) -> Result<Option<Consulta>, StoreError> {
        Ok(self.read()?.docs.get(&id).cloned())
    }

    async fn put(&self, consulta: &Consulta) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        match inner.docs.get_mut(&consulta.id) {
            Some(doc) => {
                *doc = consulta.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(consulta.id)),
        }
    }

    async fn delete(&self, id: ConsultaId) -> Result<bool, StoreError> {
        let mut inner = self.write()?;
        let existed = inner.docs.remove(&id).is_some();
        inner.order.retain(|o| *o != id);
        inner.registrations.retain(|(c, _)| *c != id);
        Ok(existed)
    }

    async fn list(&self) -> Result<Vec<Consulta>, StoreError> {
        let inner = self.read()?;
        Ok(inner
            .order
            .iter()
            .filter_map(|id| inner.docs.get(id).cloned())
            .collect())
    }

    async fn claim_registration(&self, id: ConsultaId, index: usize) -> Result<bool, StoreError> {
        let mut inner = self.write()?;
        if !inner.docs.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        Ok(inner.registrations.insert((id, index)))
    }
}

#[async_trait]
impl<T> ConsultaStore for Arc<T>
where
    T: ConsultaStore + ?Sized,
{
    async fn insert(&self, consulta: &Consulta) -> Result<(), StoreError> {
        (**self).insert(consulta).await
    }

    async fn get(&self, id: ConsultaId) -> Result<Option<Consulta>, StoreError> {
        (**self).get(id).await
    }

    async fn put(&self, consulta: &Consulta) -> Result<(), StoreError> {
        (**self).put(consulta).await
    }

    async fn delete(&self, id: ConsultaId) -> Result<bool, StoreError> {
        (**self).delete(id).await
    }

    async fn list(&self) -> Result<Vec<Consulta>, StoreError> {
        (**self).list().await
    }

    async fn claim_registration(&self, id: ConsultaId, index: usize) -> Result<bool, StoreError> {
        (**self).claim_registration(id, index).await
    }
}
