//! Capability traits for chunk and index stores.
//!
//! Backends implement the subset of capabilities they support; callers
//! compose them by capability rather than by concrete type. Runtime
//! narrowing ("can this store write?") goes through
//! [`Store::as_write_store`] instead of downcasting.

use std::collections::HashSet;

use bytes::Bytes;
use cask_cas::{Chunk, Index};
use cask_types::ChunkId;
use tokio_util::sync::CancellationToken;

use crate::error::StoreError;

/// Read access to a chunk store.
///
/// All implementations must be `Send + Sync` for use across async
/// tasks.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    /// Fetch a chunk by ID. A chunk that is not present fails with
    /// [`StoreError::ChunkMissing`].
    async fn get_chunk(&self, id: ChunkId) -> Result<Chunk, StoreError>;

    /// Check whether a chunk is present.
    async fn has_chunk(&self, id: ChunkId) -> Result<bool, StoreError>;

    /// Human-readable location of the store, used in logs and errors.
    fn location(&self) -> String;

    /// Narrow to the write capability, if this store has it.
    fn as_write_store(&self) -> Option<&dyn WriteStore> {
        None
    }

    /// Release any resources held by the store.
    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// A store that accepts new chunks.
///
/// Writes are idempotent: storing a chunk that already exists is a
/// no-op thanks to content addressing.
#[async_trait::async_trait]
pub trait WriteStore: Store {
    /// Persist a chunk.
    async fn store_chunk(&self, chunk: &Chunk) -> Result<(), StoreError>;
}

/// A writable store that can also enumerate and delete chunks.
#[async_trait::async_trait]
pub trait PruneStore: WriteStore {
    /// Delete one chunk. Deleting an absent chunk fails with
    /// [`StoreError::ChunkMissing`].
    async fn remove_chunk(&self, id: ChunkId) -> Result<(), StoreError>;

    /// Remove every chunk not contained in `live`. Returns the number
    /// of chunks removed.
    async fn prune(
        &self,
        live: &HashSet<ChunkId>,
        cancel: &CancellationToken,
    ) -> Result<usize, StoreError>;
}

/// Read access to named indexes.
#[async_trait::async_trait]
pub trait IndexStore: Send + Sync {
    /// Fetch the raw bytes of a named index. An absent index fails
    /// with [`StoreError::IndexMissing`].
    async fn get_index_bytes(&self, name: &str) -> Result<Bytes, StoreError>;

    /// Fetch and decode a named index.
    async fn get_index(&self, name: &str) -> Result<Index, StoreError> {
        let data = self.get_index_bytes(name).await?;
        Ok(Index::read_from(&mut data.as_ref())?)
    }

    /// Human-readable location of the store.
    fn location(&self) -> String;
}

/// An index store that accepts new indexes.
#[async_trait::async_trait]
pub trait IndexWriteStore: IndexStore {
    /// Persist a named index. Indexes are written once and immutable
    /// thereafter.
    async fn store_index(&self, name: &str, index: &Index) -> Result<(), StoreError>;
}
