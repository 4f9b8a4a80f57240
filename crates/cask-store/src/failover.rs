//! Redundancy between equivalent stores.

use std::sync::Arc;

use cask_cas::Chunk;
use cask_types::ChunkId;
use tracing::debug;

use crate::error::StoreError;
use crate::traits::Store;

/// An ordered group of *equivalent* stores tried one after another.
///
/// Unlike the router, any error — including `ChunkMissing` — advances
/// to the next member, because the members are replicas of the same
/// data and a miss on one is just another failure mode. Only when
/// every member has failed does the last error surface.
pub struct FailoverGroup {
    stores: Vec<Arc<dyn Store>>,
}

impl FailoverGroup {
    /// Compose equivalent `stores` in preference order.
    pub fn new(stores: Vec<Arc<dyn Store>>) -> Self {
        assert!(!stores.is_empty(), "failover group needs at least one store");
        Self { stores }
    }
}

#[async_trait::async_trait]
impl Store for FailoverGroup {
    async fn get_chunk(&self, id: ChunkId) -> Result<Chunk, StoreError> {
        let mut last_err = None;
        for store in &self.stores {
            match store.get_chunk(id).await {
                Ok(chunk) => return Ok(chunk),
                Err(e) => {
                    debug!(%id, store = %store.location(), error = %e, "failing over");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.expect("group has at least one store"))
    }

    async fn has_chunk(&self, id: ChunkId) -> Result<bool, StoreError> {
        let mut last_err = None;
        for store in &self.stores {
            match store.has_chunk(id).await {
                Ok(found) => return Ok(found),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.expect("group has at least one store"))
    }

    fn location(&self) -> String {
        self.stores
            .iter()
            .map(|s| s.location())
            .collect::<Vec<_>>()
            .join("|")
    }

    async fn close(&self) -> Result<(), StoreError> {
        for store in &self.stores {
            store.close().await?;
        }
        Ok(())
    }
}
