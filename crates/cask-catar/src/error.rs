//! Error types for the archive codec.

/// Errors that can occur while encoding or decoding archives.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// An I/O error occurred.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The archive stream violates the format.
    #[error("invalid archive: {0}")]
    InvalidArchive(String),

    /// The archive header carries feature flags this implementation
    /// does not understand.
    #[error("unsupported archive feature flags: {flags:#018x}")]
    UnsupportedFormat {
        /// The unrecognized flag bits.
        flags: u64,
    },

    /// A node kind the target filesystem cannot materialize.
    #[error("unsupported node: {0}")]
    UnsupportedNode(String),
}
