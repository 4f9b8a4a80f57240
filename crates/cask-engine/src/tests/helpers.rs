//! Shared test utilities for cask-engine tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use cask_cas::Chunk;
use cask_store::{Store, StoreError};
use cask_types::ChunkId;

/// Generate deterministic, non-repeating test data.
pub fn test_data(size: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(size);
    let mut state: u32 = 0xDEAD_BEEF;
    for _ in 0..size {
        state = state.wrapping_mul(1103515245).wrapping_add(12345);
        data.push((state >> 16) as u8);
    }
    data
}

/// A store wrapper that counts chunk fetches, for asserting how much
/// work seeds saved.
pub struct CountingStore {
    inner: Arc<dyn Store>,
    gets: AtomicUsize,
}

impl CountingStore {
    pub fn new(inner: Arc<dyn Store>) -> Self {
        Self {
            inner,
            gets: AtomicUsize::new(0),
        }
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Store for CountingStore {
    async fn get_chunk(&self, id: ChunkId) -> Result<Chunk, StoreError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get_chunk(id).await
    }

    async fn has_chunk(&self, id: ChunkId) -> Result<bool, StoreError> {
        self.inner.has_chunk(id).await
    }

    fn location(&self) -> String {
        format!("counting({})", self.inner.location())
    }
}
