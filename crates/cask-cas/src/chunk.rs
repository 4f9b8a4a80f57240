//! The chunk object: identity, compression, verification.

use std::fmt;
use std::sync::Arc;
use std::sync::OnceLock;

use bytes::Bytes;
use cask_types::ChunkId;

use crate::error::CasError;

/// An immutable chunk of data.
///
/// A chunk holds its uncompressed bytes, its zstd-compressed bytes, or
/// both; the missing representation and the content ID are computed on
/// demand and memoized. Clones share the underlying storage, so chunks
/// travel cheaply through channels and worker pools.
#[derive(Clone)]
pub struct Chunk {
    inner: Arc<Inner>,
}

struct Inner {
    id: OnceLock<ChunkId>,
    uncompressed: OnceLock<Bytes>,
    compressed: OnceLock<Bytes>,
}

impl Chunk {
    /// Create a chunk from plain data. The ID is computed lazily.
    pub fn from_data(data: impl Into<Bytes>) -> Self {
        let inner = Inner {
            id: OnceLock::new(),
            uncompressed: OnceLock::new(),
            compressed: OnceLock::new(),
        };
        let _ = inner.uncompressed.set(data.into());
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Reconstitute a chunk read from a store under an asserted ID.
    ///
    /// Either representation (or both) may be provided. Unless
    /// `skip_verify` is set, the ID is recomputed over the
    /// uncompressed bytes — decompressing first if only the compressed
    /// form is present — and a mismatch fails with
    /// [`CasError::Invalid`].
    pub fn with_id(
        id: ChunkId,
        uncompressed: Option<Bytes>,
        compressed: Option<Bytes>,
        skip_verify: bool,
    ) -> Result<Self, CasError> {
        assert!(
            uncompressed.is_some() || compressed.is_some(),
            "chunk needs at least one representation"
        );
        let inner = Inner {
            id: OnceLock::new(),
            uncompressed: OnceLock::new(),
            compressed: OnceLock::new(),
        };
        if let Some(b) = uncompressed {
            let _ = inner.uncompressed.set(b);
        }
        if let Some(b) = compressed {
            let _ = inner.compressed.set(b);
        }
        let chunk = Self {
            inner: Arc::new(inner),
        };

        if skip_verify {
            let _ = chunk.inner.id.set(id);
            return Ok(chunk);
        }

        let actual = chunk.id()?;
        if actual != id {
            return Err(CasError::Invalid {
                expected: id,
                actual,
            });
        }
        Ok(chunk)
    }

    /// The chunk's content ID, computed over the uncompressed bytes.
    pub fn id(&self) -> Result<ChunkId, CasError> {
        if let Some(id) = self.inner.id.get() {
            return Ok(*id);
        }
        let data = self.uncompressed()?;
        Ok(*self.inner.id.get_or_init(|| ChunkId::from_data(&data)))
    }

    /// The uncompressed bytes, decompressing and memoizing on demand.
    pub fn uncompressed(&self) -> Result<Bytes, CasError> {
        if let Some(b) = self.inner.uncompressed.get() {
            return Ok(b.clone());
        }
        let compressed = self
            .inner
            .compressed
            .get()
            .expect("chunk has at least one representation");
        let data = zstd::stream::decode_all(compressed.as_ref()).map_err(CasError::Corrupt)?;
        Ok(self
            .inner
            .uncompressed
            .get_or_init(|| Bytes::from(data))
            .clone())
    }

    /// The zstd-compressed bytes, compressing and memoizing on demand.
    pub fn compressed(&self) -> Result<Bytes, CasError> {
        if let Some(b) = self.inner.compressed.get() {
            return Ok(b.clone());
        }
        let uncompressed = self
            .inner
            .uncompressed
            .get()
            .expect("chunk has at least one representation");
        let data = zstd::stream::encode_all(uncompressed.as_ref(), zstd::DEFAULT_COMPRESSION_LEVEL)
            .map_err(CasError::CompressionFailed)?;
        Ok(self
            .inner
            .compressed
            .get_or_init(|| Bytes::from(data))
            .clone())
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Chunk");
        if let Some(id) = self.inner.id.get() {
            d.field("id", id);
        }
        if let Some(b) = self.inner.uncompressed.get() {
            d.field("uncompressed_len", &b.len());
        }
        if let Some(b) = self.inner.compressed.get() {
            d.field("compressed_len", &b.len());
        }
        d.finish_non_exhaustive()
    }
}
