//! Content addressing, chunking, and the index codec.
//!
//! This crate provides:
//! - [`Chunker`] — splits a byte stream into content-defined chunks
//!   using a rolling buzhash, so local edits produce local changes in
//!   the chunk sequence.
//! - [`Chunk`] — an immutable chunk with lazily computed identity and
//!   zstd compression, verified against an asserted ID when read back
//!   from a store.
//! - [`Index`] — the binary caibx/caidx index describing a blob as an
//!   ordered chunk sequence.

mod chunk;
mod chunker;
mod error;
pub mod index;
mod table;

pub use chunk::Chunk;
pub use chunker::{CHUNKER_WINDOW_SIZE, Chunker, discriminator_from_avg};
pub use error::CasError;
pub use index::{Index, IndexChunk, IndexSegment};
