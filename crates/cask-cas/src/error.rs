//! Error types for chunking, chunk handling, and the index codec.

use cask_types::ChunkId;

/// Errors that can occur while chunking, materializing chunks, or
/// encoding/decoding indexes.
#[derive(Debug, thiserror::Error)]
pub enum CasError {
    /// A chunk's computed ID does not match the ID it was stored under.
    #[error("chunk id mismatch: expected {expected}, calculated {actual}")]
    Invalid {
        /// The asserted (stored) ID.
        expected: ChunkId,
        /// The ID computed over the uncompressed bytes.
        actual: ChunkId,
    },

    /// Compressed chunk data could not be decompressed.
    #[error("corrupt chunk data: {0}")]
    Corrupt(#[source] std::io::Error),

    /// Chunk data could not be compressed.
    #[error("compression failed: {0}")]
    CompressionFailed(#[source] std::io::Error),

    /// An index file violates the format.
    #[error("malformed index: {0}")]
    MalformedIndex(String),

    /// An index or archive header carries feature flags this
    /// implementation does not understand.
    #[error("unsupported format feature flags: {flags:#018x}")]
    UnsupportedFormat {
        /// The unrecognized flag bits.
        flags: u64,
    },

    /// An I/O error occurred.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
