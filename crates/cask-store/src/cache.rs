//! Read-through chunk cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use cask_cas::Chunk;
use cask_types::ChunkId;
use tokio::sync::OnceCell;
use tracing::warn;

use crate::error::StoreError;
use crate::traits::{Store, WriteStore};

/// Wraps a (usually slow) primary store with a local writable cache.
///
/// Reads check the cache first; on a miss the chunk is fetched from
/// the primary and written back to the cache best-effort — a failed
/// cache write is logged but never fails the read.
///
/// Concurrent requests for the same ID are coalesced: at most one
/// primary fetch is in flight per chunk, so a cold cache doesn't
/// stampede the primary.
pub struct Cache {
    primary: Arc<dyn Store>,
    cache: Arc<dyn WriteStore>,
    in_flight: Mutex<HashMap<ChunkId, Arc<OnceCell<Chunk>>>>,
}

impl Cache {
    /// Wrap `primary` with `cache`.
    pub fn new(primary: Arc<dyn Store>, cache: Arc<dyn WriteStore>) -> Self {
        Self {
            primary,
            cache,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    async fn fetch_and_populate(&self, id: ChunkId) -> Result<Chunk, StoreError> {
        let chunk = self.primary.get_chunk(id).await?;
        if let Err(e) = self.cache.store_chunk(&chunk).await {
            warn!(%id, cache = %self.cache.location(), error = %e, "failed to populate cache");
        }
        Ok(chunk)
    }
}

#[async_trait::async_trait]
impl Store for Cache {
    async fn get_chunk(&self, id: ChunkId) -> Result<Chunk, StoreError> {
        match self.cache.get_chunk(id).await {
            Ok(chunk) => return Ok(chunk),
            Err(StoreError::ChunkMissing(_)) => {}
            // A broken cache must not take down reads; fall through to
            // the primary.
            Err(e) => warn!(%id, cache = %self.cache.location(), error = %e, "cache read failed"),
        }

        let cell = {
            let mut map = self.in_flight.lock().expect("lock poisoned");
            map.entry(id).or_insert_with(|| Arc::new(OnceCell::new())).clone()
        };
        let result = cell
            .get_or_try_init(|| self.fetch_and_populate(id))
            .await
            .cloned();

        let mut map = self.in_flight.lock().expect("lock poisoned");
        map.remove(&id);
        result
    }

    async fn has_chunk(&self, id: ChunkId) -> Result<bool, StoreError> {
        if self.cache.has_chunk(id).await.unwrap_or(false) {
            return Ok(true);
        }
        self.primary.has_chunk(id).await
    }

    fn location(&self) -> String {
        format!("cache({},{})", self.primary.location(), self.cache.location())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.cache.close().await?;
        self.primary.close().await
    }
}
