//! Reassemble a blob from an index, a store, and optional seeds.
//!
//! The planner walks the index once, front to back. At each position
//! every seed — including the self-seed over the output file — is
//! asked for its longest match; the best run becomes one clone
//! operation, and unmatched chunks fall back to store fetches. `n`
//! workers execute operations concurrently, each writing a disjoint
//! range of the pre-sized output file, and report completions to the
//! self-seed so later duplicates can be cloned in place.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use cask_cas::{Index, IndexChunk, IndexSegment};
use cask_store::Store;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::EngineError;
use crate::fileio::write_all_at;
use crate::seed::{Seed, SeedSegment};
use crate::self_seed::SelfSeed;

/// What the assembler did, mostly interesting for tuning seeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct AssembleStats {
    /// Chunks fetched from the store.
    pub fetched_chunks: usize,
    /// Chunks served by cloning seed ranges.
    pub cloned_chunks: usize,
    /// Bytes cloned from seeds.
    pub cloned_bytes: u64,
}

impl AssembleStats {
    fn merge(&mut self, other: AssembleStats) {
        self.fetched_chunks += other.fetched_chunks;
        self.cloned_chunks += other.cloned_chunks;
        self.cloned_bytes += other.cloned_bytes;
    }
}

enum Op {
    Fetch {
        pos: usize,
        chunk: IndexChunk,
    },
    Clone {
        first: usize,
        last: usize,
        offset: u64,
        segment: SeedSegment,
    },
}

/// Write the blob described by `index` to `out_path`, fetching chunks
/// from `store` and cloning ranges from `seeds` where possible.
///
/// The output file is created (or truncated) at its final size up
/// front so workers can write disjoint ranges in any order. On
/// cancellation the partially written file is left in place.
pub async fn assemble(
    out_path: &Path,
    index: &Index,
    store: Arc<dyn Store>,
    seeds: Vec<Arc<dyn Seed>>,
    n: usize,
    cancel: &CancellationToken,
) -> Result<AssembleStats, EngineError> {
    let index = Arc::new(index.clone());
    let total_size = index.total_size();

    let file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(out_path)?;
    file.set_len(total_size)?;
    drop(file);

    let self_seed = Arc::new(SelfSeed::new(out_path, index.clone()));
    let mut all_seeds = seeds;
    all_seeds.push(self_seed.clone());

    let abort = cancel.child_token();
    let (tx, rx) = mpsc::channel::<Op>(n.max(1) * 2);
    let rx = Arc::new(tokio::sync::Mutex::new(rx));

    let mut workers = Vec::new();
    for _ in 0..n.max(1) {
        let rx = rx.clone();
        let store = store.clone();
        let abort = abort.clone();
        let self_seed = self_seed.clone();
        let out_path = out_path.to_path_buf();
        workers.push(tokio::spawn(async move {
            let mut stats = AssembleStats::default();
            loop {
                let op = {
                    let mut rx = rx.lock().await;
                    tokio::select! {
                        _ = abort.cancelled() => return Err(EngineError::Interrupted),
                        op = rx.recv() => op,
                    }
                };
                let Some(op) = op else {
                    return Ok(stats);
                };
                if let Err(e) = run_op(&store, &self_seed, &out_path, op, &mut stats).await {
                    abort.cancel();
                    return Err(e);
                }
            }
        }));
    }
    // Only workers may keep the receiver alive: when they bail out
    // early the channel must close so the dispatch below fails fast
    // instead of blocking on a full queue.
    drop(rx);

    // Plan: one pass over the index, coalescing seed runs.
    let chunks = &index.chunks;
    let mut i = 0;
    while i < chunks.len() {
        if abort.is_cancelled() {
            break;
        }
        let best = all_seeds
            .iter()
            .filter_map(|seed| seed.longest_match_with(&chunks[i..]))
            .max_by_key(|&(len, _)| len);
        let op = match best {
            Some((len, segment)) if len > 0 => {
                let span = IndexSegment::new(&index, i, i + len - 1);
                // Matched chunks have identical IDs, hence identical
                // sizes, so the clone covers the span exactly.
                debug_assert_eq!(segment.length(), span.length());
                let op = Op::Clone {
                    first: span.first(),
                    last: span.last(),
                    offset: span.offset(),
                    segment,
                };
                i += len;
                op
            }
            _ => {
                let op = Op::Fetch {
                    pos: i,
                    chunk: chunks[i],
                };
                i += 1;
                op
            }
        };
        if tx.send(op).await.is_err() {
            break;
        }
    }
    drop(tx);

    let mut stats = AssembleStats::default();
    let mut first_err = None;
    for worker in workers {
        match worker.await {
            Ok(Ok(worker_stats)) => stats.merge(worker_stats),
            Ok(Err(e)) => crate::error::prefer_error(&mut first_err, e),
            Err(e) => crate::error::prefer_error(
                &mut first_err,
                EngineError::Io(std::io::Error::other(e)),
            ),
        }
    }
    if let Some(e) = first_err {
        return Err(e);
    }
    if cancel.is_cancelled() {
        return Err(EngineError::Interrupted);
    }

    let actual = std::fs::metadata(out_path)?.len();
    if actual != total_size {
        return Err(EngineError::SizeMismatch {
            expected: total_size,
            actual,
        });
    }
    debug!(
        out = %out_path.display(),
        fetched = stats.fetched_chunks,
        cloned = stats.cloned_chunks,
        "assembled blob"
    );
    Ok(stats)
}

async fn run_op(
    store: &Arc<dyn Store>,
    self_seed: &SelfSeed,
    out_path: &Path,
    op: Op,
    stats: &mut AssembleStats,
) -> Result<(), EngineError> {
    match op {
        Op::Fetch { pos, chunk } => {
            let fetched = store.get_chunk(chunk.id).await?;
            let data = fetched.uncompressed()?;
            if data.len() as u64 != chunk.size {
                return Err(EngineError::SizeMismatch {
                    expected: chunk.size,
                    actual: data.len() as u64,
                });
            }
            let path = out_path.to_path_buf();
            blocking_io(move || {
                let mut out = std::fs::OpenOptions::new().write(true).open(path)?;
                write_all_at(&mut out, &data, chunk.start)
            })
            .await?;
            self_seed.add(pos, pos);
            stats.fetched_chunks += 1;
        }
        Op::Clone {
            first,
            last,
            offset,
            segment,
        } => {
            let length = segment.length();
            let path = out_path.to_path_buf();
            blocking_io(move || {
                let mut out = std::fs::OpenOptions::new().write(true).open(path)?;
                segment.copy_into(&mut out, offset)
            })
            .await?;
            self_seed.add(first, last);
            stats.cloned_chunks += last - first + 1;
            stats.cloned_bytes += length;
        }
    }
    Ok(())
}

async fn blocking_io<T: Send + 'static>(
    f: impl FnOnce() -> std::io::Result<T> + Send + 'static,
) -> Result<T, EngineError> {
    let result = tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| EngineError::Io(std::io::Error::other(e)))?;
    Ok(result?)
}

/// Convenience wrapper used by callers that don't track prior
/// versions: assemble with no seeds.
pub async fn extract(
    out_path: &Path,
    index: &Index,
    store: Arc<dyn Store>,
    n: usize,
    cancel: &CancellationToken,
) -> Result<AssembleStats, EngineError> {
    assemble(out_path, index, store, Vec::new(), n, cancel).await
}

/// Build a [`FileSeed`](crate::FileSeed) list from `(path, index)`
/// pairs of prior files.
pub fn file_seeds(pairs: impl IntoIterator<Item = (PathBuf, Index)>) -> Vec<Arc<dyn Seed>> {
    pairs
        .into_iter()
        .map(|(path, index)| Arc::new(crate::seed::FileSeed::new(path, index)) as Arc<dyn Seed>)
        .collect()
}
