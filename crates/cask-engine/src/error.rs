//! Error types for the make/assemble pipelines.

use cask_cas::CasError;
use cask_store::StoreError;

/// Errors that can occur while chunking into or assembling from
/// stores.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A store operation failed.
    #[error("store error: {0}")]
    Store(StoreError),

    /// Chunk-level failure (identity, compression, index codec).
    #[error(transparent)]
    Chunk(#[from] CasError),

    /// The operation was cancelled.
    #[error("interrupted")]
    Interrupted,

    /// An I/O error occurred.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The reassembled output does not have the size the index
    /// promises.
    #[error("output size mismatch: expected {expected}, got {actual}")]
    SizeMismatch {
        /// Size according to the index.
        expected: u64,
        /// Size actually produced.
        actual: u64,
    },
}

// Cancellation is returned unchanged through every layer, never
// wrapped in a store error.
impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Interrupted => EngineError::Interrupted,
            other => EngineError::Store(other),
        }
    }
}

/// Keep the most informative of several worker errors: the first real
/// failure beats the `Interrupted` noise of its siblings, which only
/// stopped because the failing worker tripped the shared abort token.
pub(crate) fn prefer_error(slot: &mut Option<EngineError>, new: EngineError) {
    match slot {
        None => *slot = Some(new),
        Some(EngineError::Interrupted) if !matches!(new, EngineError::Interrupted) => {
            *slot = Some(new)
        }
        _ => {}
    }
}
