//! In-memory chunk store backend.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use cask_cas::Chunk;
use cask_types::ChunkId;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::StoreError;
use crate::traits::{PruneStore, Store, WriteStore};

/// In-memory chunk store backed by a `RwLock<HashMap>`.
///
/// Used as a test double, as a cache backend, and wherever chunks only
/// need to live for the duration of a process.
#[derive(Default)]
pub struct MemoryStore {
    chunks: RwLock<HashMap<ChunkId, Chunk>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of chunks currently held.
    pub fn len(&self) -> usize {
        self.chunks.read().expect("lock poisoned").len()
    }

    /// Whether the store holds no chunks.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn get_chunk(&self, id: ChunkId) -> Result<Chunk, StoreError> {
        let map = self.chunks.read().expect("lock poisoned");
        map.get(&id).cloned().ok_or(StoreError::ChunkMissing(id))
    }

    async fn has_chunk(&self, id: ChunkId) -> Result<bool, StoreError> {
        let map = self.chunks.read().expect("lock poisoned");
        Ok(map.contains_key(&id))
    }

    fn location(&self) -> String {
        "memory".to_string()
    }

    fn as_write_store(&self) -> Option<&dyn WriteStore> {
        Some(self)
    }
}

#[async_trait::async_trait]
impl WriteStore for MemoryStore {
    async fn store_chunk(&self, chunk: &Chunk) -> Result<(), StoreError> {
        let id = chunk.id()?;
        let mut map = self.chunks.write().expect("lock poisoned");
        map.entry(id).or_insert_with(|| chunk.clone());
        Ok(())
    }
}

#[async_trait::async_trait]
impl PruneStore for MemoryStore {
    async fn remove_chunk(&self, id: ChunkId) -> Result<(), StoreError> {
        let mut map = self.chunks.write().expect("lock poisoned");
        map.remove(&id)
            .map(|_| ())
            .ok_or(StoreError::ChunkMissing(id))
    }

    async fn prune(
        &self,
        live: &HashSet<ChunkId>,
        cancel: &CancellationToken,
    ) -> Result<usize, StoreError> {
        if cancel.is_cancelled() {
            return Err(StoreError::Interrupted);
        }
        let mut map = self.chunks.write().expect("lock poisoned");
        let before = map.len();
        map.retain(|id, _| live.contains(id));
        let removed = before - map.len();
        debug!(removed, kept = map.len(), "pruned in-memory store");
        Ok(removed)
    }
}
