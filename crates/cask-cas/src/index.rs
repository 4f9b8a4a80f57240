//! The binary index (caibx/caidx) codec.
//!
//! An index describes a blob as an ordered sequence of chunks. On disk
//! it is a little-endian stream of two elements: a fixed-size header
//! carrying feature flags and the chunker size triple, and a table of
//! 40-byte items `{end_offset: u64, id: [u8; 32]}` terminated by a
//! tail marker record. Chunk sizes are implicit in the difference of
//! consecutive end offsets.

use std::io::{Read, Write};

use cask_types::{ChunkId, Digest};

use crate::error::CasError;

/// Magic for the index header element.
pub const INDEX_MAGIC: u64 = 0x9682_4d9c_7b12_9ff9;
/// Magic for the chunk table element.
pub const TABLE_MAGIC: u64 = 0xe75b_9e11_2f17_417d;
/// Marker closing the chunk table.
pub const TABLE_TAIL_MARKER: u64 = 0x4b4f_050e_5549_ecd1;

/// Feature flags carried in index and archive headers.
pub mod flags {
    /// Entries carry 32-bit UIDs/GIDs.
    pub const WITH_32BIT_UIDS: u64 = 0x2;
    /// Modification times have nanosecond granularity.
    pub const WITH_NSEC_TIME: u64 = 0x20;
    /// Full permission bits are recorded.
    pub const WITH_PERMISSIONS: u64 = 0x100;
    /// Symlinks are archived.
    pub const WITH_SYMLINKS: u64 = 0x200;
    /// Block and character devices are archived.
    pub const WITH_DEVICE_NODES: u64 = 0x400;
    /// FIFOs are archived.
    pub const WITH_FIFOS: u64 = 0x800;
    /// Sockets are archived.
    pub const WITH_SOCKETS: u64 = 0x1000;
    /// Extended attributes are archived.
    pub const WITH_XATTRS: u64 = 0x1000_0000;
    /// Exclude rules from `.caexclude` files apply.
    pub const EXCLUDE_FILE: u64 = 0x1000_0000_0000_0000;
    /// Chunk IDs are SHA-512/256 digests (SHA-256 otherwise).
    pub const SHA512_256: u64 = 0x2000_0000_0000_0000;
    /// Files flagged nodump are excluded.
    pub const EXCLUDE_NODUMP: u64 = 0x8000_0000_0000_0000;

    /// Every flag this implementation understands.
    pub const SUPPORTED: u64 = WITH_32BIT_UIDS
        | WITH_NSEC_TIME
        | WITH_PERMISSIONS
        | WITH_SYMLINKS
        | WITH_DEVICE_NODES
        | WITH_FIFOS
        | WITH_SOCKETS
        | WITH_XATTRS
        | EXCLUDE_FILE
        | SHA512_256
        | EXCLUDE_NODUMP;
}

/// The flag advertising the process-wide digest algorithm.
pub fn digest_flag() -> u64 {
    match cask_types::digest() {
        Digest::Sha512_256 => flags::SHA512_256,
        Digest::Sha256 => 0,
    }
}

/// One chunk of a blob: its ID and position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexChunk {
    /// Content address of the chunk.
    pub id: ChunkId,
    /// Byte offset of the chunk in the reconstructed blob.
    pub start: u64,
    /// Uncompressed size of the chunk in bytes.
    pub size: u64,
}

/// An ordered chunk sequence describing a blob, plus the chunker
/// parameters that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Index {
    /// Format feature flags (see [`flags`]).
    pub feature_flags: u64,
    /// Minimum chunk size used when chunking.
    pub chunk_size_min: u64,
    /// Average (target) chunk size used when chunking.
    pub chunk_size_avg: u64,
    /// Maximum chunk size used when chunking.
    pub chunk_size_max: u64,
    /// The chunks, contiguous and in blob order.
    pub chunks: Vec<IndexChunk>,
}

impl Index {
    /// Create an empty index for the given chunker parameters,
    /// advertising the process-wide digest.
    pub fn new(min: u64, avg: u64, max: u64) -> Self {
        Self {
            feature_flags: digest_flag(),
            chunk_size_min: min,
            chunk_size_avg: avg,
            chunk_size_max: max,
            chunks: Vec::new(),
        }
    }

    /// Build an index from `(id, size)` pairs in blob order.
    pub fn from_chunks(
        min: u64,
        avg: u64,
        max: u64,
        chunks: impl IntoIterator<Item = (ChunkId, u64)>,
    ) -> Self {
        let mut index = Self::new(min, avg, max);
        for (id, size) in chunks {
            index.push(id, size);
        }
        index
    }

    /// Append a chunk of `size` bytes at the current end of the blob.
    pub fn push(&mut self, id: ChunkId, size: u64) {
        let start = self.total_size();
        self.chunks.push(IndexChunk { id, start, size });
    }

    /// Total length of the described blob.
    pub fn total_size(&self) -> u64 {
        self.chunks.last().map_or(0, |c| c.start + c.size)
    }

    /// Encode the index.
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<(), CasError> {
        // Header element.
        w.write_all(&48u64.to_le_bytes())?;
        w.write_all(&INDEX_MAGIC.to_le_bytes())?;
        w.write_all(&self.feature_flags.to_le_bytes())?;
        w.write_all(&self.chunk_size_min.to_le_bytes())?;
        w.write_all(&self.chunk_size_avg.to_le_bytes())?;
        w.write_all(&self.chunk_size_max.to_le_bytes())?;

        // Table element. The size is indeterminate while streaming, so
        // the format uses an all-ones size and closes the table with a
        // tail marker instead.
        w.write_all(&u64::MAX.to_le_bytes())?;
        w.write_all(&TABLE_MAGIC.to_le_bytes())?;

        for chunk in &self.chunks {
            w.write_all(&(chunk.start + chunk.size).to_le_bytes())?;
            w.write_all(chunk.id.as_bytes())?;
        }

        // Tail record, same width as an item. The two leading zero
        // words are what distinguishes it from an item, since item
        // offsets are strictly positive.
        let table_size = 16 + 40 * (self.chunks.len() as u64 + 1);
        w.write_all(&0u64.to_le_bytes())?;
        w.write_all(&0u64.to_le_bytes())?;
        w.write_all(&48u64.to_le_bytes())?;
        w.write_all(&table_size.to_le_bytes())?;
        w.write_all(&TABLE_TAIL_MARKER.to_le_bytes())?;
        Ok(())
    }

    /// Decode an index, validating the header and offset monotonicity.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Self, CasError> {
        let size = read_u64(r)?;
        let magic = read_u64(r)?;
        if size != 48 || magic != INDEX_MAGIC {
            return Err(CasError::MalformedIndex(format!(
                "bad index header (size {size}, type {magic:#018x})"
            )));
        }
        let feature_flags = read_u64(r)?;
        let unknown = feature_flags & !flags::SUPPORTED;
        if unknown != 0 {
            return Err(CasError::UnsupportedFormat { flags: unknown });
        }
        let chunk_size_min = read_u64(r)?;
        let chunk_size_avg = read_u64(r)?;
        let chunk_size_max = read_u64(r)?;
        if chunk_size_min == 0
            || chunk_size_min > chunk_size_avg
            || chunk_size_avg > chunk_size_max
        {
            return Err(CasError::MalformedIndex(format!(
                "invalid chunk size triple {chunk_size_min}/{chunk_size_avg}/{chunk_size_max}"
            )));
        }

        let table_size = read_u64(r)?;
        let table_magic = read_u64(r)?;
        if table_size != u64::MAX || table_magic != TABLE_MAGIC {
            return Err(CasError::MalformedIndex(format!(
                "bad table header (size {table_size:#x}, type {table_magic:#018x})"
            )));
        }

        let mut chunks = Vec::new();
        let mut prev_end = 0u64;
        loop {
            let mut item = [0u8; 40];
            r.read_exact(&mut item)?;
            if item[..16].iter().all(|&b| b == 0) {
                let marker = u64::from_le_bytes(item[32..40].try_into().expect("8 bytes"));
                if marker != TABLE_TAIL_MARKER {
                    return Err(CasError::MalformedIndex(format!(
                        "bad table tail marker {marker:#018x}"
                    )));
                }
                break;
            }
            let end = u64::from_le_bytes(item[..8].try_into().expect("8 bytes"));
            if end <= prev_end {
                return Err(CasError::MalformedIndex(format!(
                    "chunk offsets not increasing ({end} after {prev_end})"
                )));
            }
            let mut id = [0u8; 32];
            id.copy_from_slice(&item[8..40]);
            chunks.push(IndexChunk {
                id: ChunkId::from(id),
                start: prev_end,
                size: end - prev_end,
            });
            prev_end = end;
        }

        Ok(Self {
            feature_flags,
            chunk_size_min,
            chunk_size_avg,
            chunk_size_max,
            chunks,
        })
    }
}

fn read_u64<R: Read>(r: &mut R) -> Result<u64, CasError> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// A slice of consecutive index chunks, as scheduled by the assembler.
#[derive(Debug, Clone, Copy)]
pub struct IndexSegment<'a> {
    index: &'a Index,
    first: usize,
    last: usize,
}

impl<'a> IndexSegment<'a> {
    /// Slice `index` from chunk `first` through chunk `last`,
    /// inclusive.
    pub fn new(index: &'a Index, first: usize, last: usize) -> Self {
        debug_assert!(first <= last && last < index.chunks.len());
        Self { index, first, last }
    }

    /// Position of the first chunk in the segment.
    pub fn first(&self) -> usize {
        self.first
    }

    /// Position of the last chunk in the segment.
    pub fn last(&self) -> usize {
        self.last
    }

    /// The covered chunks.
    pub fn chunks(&self) -> &'a [IndexChunk] {
        &self.index.chunks[self.first..=self.last]
    }

    /// Byte offset of the segment in the blob.
    pub fn offset(&self) -> u64 {
        self.index.chunks[self.first].start
    }

    /// Byte length of the segment.
    pub fn length(&self) -> u64 {
        let last = &self.index.chunks[self.last];
        last.start + last.size - self.offset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_index(n: usize) -> Index {
        Index::from_chunks(
            16 * 1024,
            64 * 1024,
            256 * 1024,
            (0..n).map(|i| {
                let id = ChunkId::from_data(&(i as u64).to_le_bytes());
                (id, 1000 + i as u64)
            }),
        )
    }

    #[test]
    fn test_roundtrip() {
        let index = sample_index(25);
        let mut buf = Vec::new();
        index.write_to(&mut buf).unwrap();

        let decoded = Index::read_from(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, index);
    }

    #[test]
    fn test_roundtrip_empty() {
        let index = sample_index(0);
        let mut buf = Vec::new();
        index.write_to(&mut buf).unwrap();

        let decoded = Index::read_from(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded.chunks.len(), 0);
        assert_eq!(decoded.total_size(), 0);
    }

    #[test]
    fn test_chunks_are_contiguous() {
        let index = sample_index(10);
        let mut expected = 0;
        for c in &index.chunks {
            assert_eq!(c.start, expected);
            expected += c.size;
        }
        assert_eq!(index.total_size(), expected);
    }

    #[test]
    fn test_encoded_layout() {
        let index = sample_index(2);
        let mut buf = Vec::new();
        index.write_to(&mut buf).unwrap();

        // Header (48) + table header (16) + 2 items + tail (3 * 40).
        assert_eq!(buf.len(), 48 + 16 + 3 * 40);
        assert_eq!(u64::from_le_bytes(buf[8..16].try_into().unwrap()), INDEX_MAGIC);
        assert_eq!(
            u64::from_le_bytes(buf[56..64].try_into().unwrap()),
            TABLE_MAGIC
        );
        let tail = &buf[buf.len() - 8..];
        assert_eq!(
            u64::from_le_bytes(tail.try_into().unwrap()),
            TABLE_TAIL_MARKER
        );
    }

    #[test]
    fn test_rejects_bad_magic() {
        let index = sample_index(1);
        let mut buf = Vec::new();
        index.write_to(&mut buf).unwrap();
        buf[8] ^= 0xFF;
        assert!(matches!(
            Index::read_from(&mut buf.as_slice()),
            Err(CasError::MalformedIndex(_))
        ));
    }

    #[test]
    fn test_rejects_unknown_feature_flags() {
        let mut index = sample_index(1);
        index.feature_flags |= 0x4; // user names, not supported
        let mut buf = Vec::new();
        index.write_to(&mut buf).unwrap();
        match Index::read_from(&mut buf.as_slice()) {
            Err(CasError::UnsupportedFormat { flags }) => assert_eq!(flags, 0x4),
            other => panic!("expected UnsupportedFormat, got {other:?}"),
        }
    }

    #[test]
    fn test_rejects_non_monotonic_offsets() {
        let index = sample_index(3);
        let mut buf = Vec::new();
        index.write_to(&mut buf).unwrap();
        // Zero the second item's end offset: 48 + 16 + 40 bytes in.
        for b in &mut buf[104..112] {
            *b = 0;
        }
        assert!(Index::read_from(&mut buf.as_slice()).is_err());

        // A merely decreasing offset is also rejected.
        let mut buf2 = Vec::new();
        index.write_to(&mut buf2).unwrap();
        buf2[104..112].copy_from_slice(&1u64.to_le_bytes());
        assert!(matches!(
            Index::read_from(&mut buf2.as_slice()),
            Err(CasError::MalformedIndex(_))
        ));
    }

    #[test]
    fn test_rejects_invalid_size_triple() {
        let mut index = sample_index(1);
        index.chunk_size_min = index.chunk_size_max + 1;
        let mut buf = Vec::new();
        index.write_to(&mut buf).unwrap();
        assert!(matches!(
            Index::read_from(&mut buf.as_slice()),
            Err(CasError::MalformedIndex(_))
        ));
    }

    #[test]
    fn test_truncated_input_is_io_error() {
        let index = sample_index(4);
        let mut buf = Vec::new();
        index.write_to(&mut buf).unwrap();
        buf.truncate(buf.len() - 10);
        assert!(matches!(
            Index::read_from(&mut buf.as_slice()),
            Err(CasError::Io(_))
        ));
    }

    #[test]
    fn test_segment_offset_and_length() {
        let index = sample_index(10);
        let seg = IndexSegment::new(&index, 2, 4);
        assert_eq!(seg.offset(), index.chunks[2].start);
        assert_eq!(
            seg.length(),
            index.chunks[2].size + index.chunks[3].size + index.chunks[4].size
        );
        assert_eq!(seg.chunks().len(), 3);
    }

    #[test]
    fn test_default_flags_advertise_digest() {
        let index = Index::new(1, 2, 3);
        assert_eq!(index.feature_flags & flags::SHA512_256, flags::SHA512_256);
    }
}
