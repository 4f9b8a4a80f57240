//! Seeds: local files whose chunks can be cloned instead of fetched.
//!
//! A seed maps chunk IDs to positions in a previously assembled file.
//! During reassembly the planner asks each seed for the longest run of
//! consecutive index chunks it can serve; matched runs become byte
//! ranges cloned from the seed file (reflinked where the filesystem
//! supports it) instead of store fetches.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use cask_cas::{Index, IndexChunk};
use cask_types::ChunkId;

use crate::fileio::copy_range;

/// A lazy lookup table from chunk IDs to cloneable ranges of a local
/// file.
pub trait Seed: Send + Sync {
    /// The longest run of chunks starting at `chunks[0]` that this
    /// seed can serve, as `(matched_chunk_count, segment)`.
    fn longest_match_with(&self, chunks: &[IndexChunk]) -> Option<(usize, SeedSegment)>;
}

/// A contiguous byte range of a seed file, scheduled to be cloned
/// into the output.
#[derive(Debug, Clone)]
pub struct SeedSegment {
    path: PathBuf,
    offset: u64,
    length: u64,
}

impl SeedSegment {
    pub(crate) fn new(path: PathBuf, offset: u64, length: u64) -> Self {
        Self {
            path,
            offset,
            length,
        }
    }

    /// Byte length of the segment.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Copy (or reflink) the segment into `dst` at `dst_offset`.
    pub(crate) fn copy_into(&self, dst: &mut File, dst_offset: u64) -> std::io::Result<()> {
        let mut src = File::open(&self.path)?;
        copy_range(&mut src, self.offset, dst, dst_offset, self.length)
    }
}

/// A seed built from a prior file and the index that describes it.
/// Seed positions map 1:1 onto the file's chunks.
pub struct FileSeed {
    path: PathBuf,
    index: Index,
    pos: HashMap<ChunkId, Vec<usize>>,
}

impl FileSeed {
    /// Index `path` as a seed using its chunk index.
    pub fn new(path: impl AsRef<Path>, index: Index) -> Self {
        let mut pos: HashMap<ChunkId, Vec<usize>> = HashMap::new();
        for (i, chunk) in index.chunks.iter().enumerate() {
            pos.entry(chunk.id).or_default().push(i);
        }
        Self {
            path: path.as_ref().to_path_buf(),
            index,
            pos,
        }
    }

    /// Length of the match between `chunks` and this seed's chunks
    /// starting at seed position `p`.
    fn match_len_from(&self, chunks: &[IndexChunk], p: usize) -> usize {
        chunks
            .iter()
            .zip(&self.index.chunks[p..])
            .take_while(|(want, have)| want.id == have.id)
            .count()
    }
}

impl Seed for FileSeed {
    fn longest_match_with(&self, chunks: &[IndexChunk]) -> Option<(usize, SeedSegment)> {
        let first = chunks.first()?;
        let positions = self.pos.get(&first.id)?;

        // Every occurrence of the first chunk is a candidate run; pick
        // the longest.
        let (best_pos, best_len) = positions
            .iter()
            .map(|&p| (p, self.match_len_from(chunks, p)))
            .max_by_key(|&(_, len)| len)?;
        if best_len == 0 {
            return None;
        }

        let start = self.index.chunks[best_pos].start;
        let end_chunk = &self.index.chunks[best_pos + best_len - 1];
        let segment = SeedSegment::new(
            self.path.clone(),
            start,
            end_chunk.start + end_chunk.size - start,
        );
        Some((best_len, segment))
    }
}
