//! Layering of multiple stores behind one read interface.

use std::sync::Arc;

use cask_cas::Chunk;
use cask_types::ChunkId;

use crate::error::StoreError;
use crate::traits::Store;

/// An ordered list of backing stores queried front to back.
///
/// The first store holding a chunk wins; `ChunkMissing` advances to
/// the next store, any other error stops the search and surfaces.
/// Used for layering (fast local store in front of slower remotes),
/// where [`FailoverGroup`](crate::FailoverGroup) is used for
/// redundancy between equivalent stores.
pub struct StoreRouter {
    stores: Vec<Arc<dyn Store>>,
}

impl StoreRouter {
    /// Compose `stores` in query order.
    pub fn new(stores: Vec<Arc<dyn Store>>) -> Self {
        assert!(!stores.is_empty(), "router needs at least one store");
        Self { stores }
    }
}

#[async_trait::async_trait]
impl Store for StoreRouter {
    async fn get_chunk(&self, id: ChunkId) -> Result<Chunk, StoreError> {
        for store in &self.stores {
            match store.get_chunk(id).await {
                Ok(chunk) => return Ok(chunk),
                Err(StoreError::ChunkMissing(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::ChunkMissing(id))
    }

    async fn has_chunk(&self, id: ChunkId) -> Result<bool, StoreError> {
        for store in &self.stores {
            if store.has_chunk(id).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn location(&self) -> String {
        self.stores
            .iter()
            .map(|s| s.location())
            .collect::<Vec<_>>()
            .join(",")
    }

    async fn close(&self) -> Result<(), StoreError> {
        for store in &self.stores {
            store.close().await?;
        }
        Ok(())
    }
}
