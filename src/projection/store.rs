use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::errors::StoreError;

/// Query-side storage for one kind of denormalized record, keyed by
/// aggregate id.
#[async_trait]
pub trait ReadModelStore<R>: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<R>, StoreError>;

    /// `false` when a record already existed; it is left untouched.
    async fn create_if_absent(&self, id: Uuid, record: R) -> Result<bool, StoreError>;

    /// `false` when there is no record to update.
    async fn update(&self, id: Uuid, change: &(dyn for<'r> Fn(&'r mut R) + Send + Sync)) -> Result<bool, StoreError>;
}

pub struct InMemoryReadModelStore<R> {
    records: RwLock<HashMap<Uuid, R>>,
}

impl<R> Default for InMemoryReadModelStore<R> {
    fn default() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }
}

impl<R: Clone> InMemoryReadModelStore<R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    pub async fn all(&self) -> Vec<R> {
        self.records.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl<R: Clone + Send + Sync + 'static> ReadModelStore<R> for InMemoryReadModelStore<R> {
    async fn get(&self, id: Uuid) -> Result<Option<R>, StoreError> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn create_if_absent(&self, id: Uuid, record: R) -> Result<bool, StoreError> {
        let mut records = self.records.write().await;
        if records.contains_key(&id) {
            return Ok(false);
        }
        records.insert(id, record);
        Ok(true)
    }

    async fn update(&self, id: Uuid, change: &(dyn for<'r> Fn(&'r mut R) + Send + Sync)) -> Result<bool, StoreError> {
        match self.records.write().await.get_mut(&id) {
            Some(record) => {
                change(record);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
