//! The self-seed: cloning ranges from the file currently being
//! written.
//!
//! Workers complete writes out of order, but a range of the output is
//! only safe to clone once *everything before it* has been committed
//! as well — otherwise a clone could read unwritten bytes. The
//! self-seed therefore keeps a watermark of the contiguous
//! chunk-prefix confirmed written, parks out-of-order completions in a
//! side map, and only admits chunks below the watermark into its
//! position vocabulary.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use cask_cas::{Index, IndexChunk};
use cask_types::ChunkId;

use crate::seed::{Seed, SeedSegment};

/// Seed over the output file of the assembly in progress.
pub struct SelfSeed {
    path: PathBuf,
    index: Arc<Index>,
    inner: Mutex<Inner>,
}

struct Inner {
    /// Exclusive upper bound of the contiguous chunk-prefix confirmed
    /// written.
    written: usize,
    /// Out-of-order completions: first chunk position → one past the
    /// last. Entries are consumed as the watermark reaches them.
    pending: HashMap<usize, usize>,
    /// Positions of every chunk admitted below the watermark.
    pos: HashMap<ChunkId, Vec<usize>>,
}

impl SelfSeed {
    /// Create a self-seed for the output at `path` described by
    /// `index`.
    pub fn new(path: impl AsRef<Path>, index: Arc<Index>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            index,
            inner: Mutex::new(Inner {
                written: 0,
                pending: HashMap::new(),
                pos: HashMap::new(),
            }),
        }
    }

    /// Record that chunks `first..=last` have been written.
    ///
    /// The range only becomes matchable once the watermark has caught
    /// up to it; until then it waits in the pending map.
    pub fn add(&self, first: usize, last: usize) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.pending.insert(first, last + 1);

        // Advance the watermark over every range that is now
        // contiguous with the committed prefix, admitting its chunks
        // into the position map.
        loop {
            let watermark = inner.written;
            let Some(next) = inner.pending.remove(&watermark) else {
                break;
            };
            for i in watermark..next {
                let id = self.index.chunks[i].id;
                inner.pos.entry(id).or_default().push(i);
            }
            inner.written = next;
        }
    }

    /// The current contiguous-prefix watermark (chunk count).
    pub fn written(&self) -> usize {
        self.inner.lock().expect("lock poisoned").written
    }

    fn match_len_from(&self, inner: &Inner, chunks: &[IndexChunk], p: usize) -> usize {
        let limit = inner.written.saturating_sub(p);
        chunks
            .iter()
            .zip(&self.index.chunks[p..])
            .take(limit)
            .take_while(|(want, have)| want.id == have.id)
            .count()
    }
}

impl Seed for SelfSeed {
    fn longest_match_with(&self, chunks: &[IndexChunk]) -> Option<(usize, SeedSegment)> {
        let first = chunks.first()?;
        let inner = self.inner.lock().expect("lock poisoned");
        let positions = inner.pos.get(&first.id)?;

        let (best_pos, best_len) = positions
            .iter()
            .map(|&p| (p, self.match_len_from(&inner, chunks, p)))
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
