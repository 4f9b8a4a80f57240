//! Error types for chunk store operations.

use cask_types::ChunkId;

/// Errors that can occur during store operations.
///
/// `ChunkMissing` and `Interrupted` are control-flow variants: routers,
/// failover groups, and caches dispatch on them and they are returned
/// unchanged rather than wrapped.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested chunk is not in the store.
    #[error("chunk {0} missing from store")]
    ChunkMissing(ChunkId),

    /// The requested index is not in the store.
    #[error("index {0:?} missing from store")]
    IndexMissing(String),

    /// Chunk-level failure (invalid ID, corrupt data, codec error).
    #[error(transparent)]
    Chunk(#[from] cask_cas::CasError),

    /// The operation was cancelled.
    #[error("interrupted")]
    Interrupted,

    /// An I/O error occurred.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An HTTP transport error, surfaced after retries are exhausted.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// A store location could not be used.
    #[error("invalid store {location}: {reason}")]
    Config {
        /// The offending location string.
        location: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The store does not support the requested operation.
    #[error("store {location} does not support {operation}")]
    NotSupported {
        /// The store's location string.
        location: String,
        /// The unsupported operation.
        operation: &'static str,
    },
}

impl StoreError {
    /// Whether this is the missing-chunk control-flow variant.
    pub fn is_missing(&self) -> bool {
        matches!(self, StoreError::ChunkMissing(_))
    }
}
