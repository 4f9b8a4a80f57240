//! Chunk a blob into a store and build its index.
//!
//! The chunker is a sequential producer on a blocking thread, feeding
//! a bounded channel; `n` async workers hash, deduplicate, and store
//! the chunks. Chunk store order is not observable (dedup makes
//! writes idempotent), but the index is always emitted in blob order.

use std::io::Read;
use std::path::Path;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use cask_cas::{Chunk, Chunker, Index};
use cask_store::WriteStore;
use cask_types::ChunkId;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::EngineError;

/// Chunker and concurrency parameters for [`make`].
#[derive(Debug, Clone)]
pub struct MakeOptions {
    /// Minimum chunk size.
    pub min: usize,
    /// Average (target) chunk size.
    pub avg: usize,
    /// Maximum chunk size.
    pub max: usize,
    /// Number of concurrent store workers.
    pub n: usize,
}

impl Default for MakeOptions {
    fn default() -> Self {
        Self {
            min: 16 * 1024,
            avg: 64 * 1024,
            max: 256 * 1024,
            n: 10,
        }
    }
}

/// Chunk `input`, store every chunk not already present, and return
/// the resulting index.
///
/// Aborts on the first store error; cancellation is observed between
/// chunks and returns [`EngineError::Interrupted`].
pub async fn make<R: Read + Send + 'static>(
    input: R,
    store: Arc<dyn WriteStore>,
    opts: &MakeOptions,
    cancel: &CancellationToken,
) -> Result<Index, EngineError> {
    // Any worker failure cancels the whole pipeline.
    let abort = cancel.child_token();

    let (tx, rx) = mpsc::channel::<(usize, Bytes)>(opts.n.max(1) * 2);
    let rx = Arc::new(tokio::sync::Mutex::new(rx));

    let producer = {
        let abort = abort.clone();
        let (min, avg, max) = (opts.min, opts.avg, opts.max);
        tokio::task::spawn_blocking(move || -> Result<(), EngineError> {
            let mut chunker = Chunker::new(input, min, avg, max);
            let mut seq = 0;
            while let Some((_, data)) = chunker.next_chunk()? {
                if abort.is_cancelled() {
                    return Err(EngineError::Interrupted);
                }
                // The receiver side is gone when a worker failed; its
                // error is the one to surface.
                if tx.blocking_send((seq, data)).is_err() {
                    return Ok(());
                }
                seq += 1;
            }
            Ok(())
        })
    };

    let results: Arc<Mutex<Vec<(usize, ChunkId, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    let mut workers = Vec::new();
    for _ in 0..opts.n.max(1) {
        let rx = rx.clone();
        let store = store.clone();
        let abort = abort.clone();
        let results = results.clone();
        workers.push(tokio::spawn(async move {
            loop {
                let item = {
                    let mut rx = rx.lock().await;
                    tokio::select! {
                        _ = abort.cancelled() => return Err(EngineError::Interrupted),
                        item = rx.recv() => item,
                    }
                };
                let Some((seq, data)) = item else {
                    return Ok(());
                };

                let size = data.len() as u64;
                let chunk = Chunk::from_data(data);
                let outcome: Result<ChunkId, EngineError> = async {
                    let id = chunk.id()?;
                    if !store.has_chunk(id).await? {
                        store.store_chunk(&chunk).await?;
                    }
                    Ok(id)
                }
                .await;
                match outcome {
                    Ok(id) => results.lock().expect("lock poisoned").push((seq, id, size)),
                    Err(e) => {
                        abort.cancel();
                        return Err(e);
                    }
                }
            }
        }));
    }
    // Only workers may keep the receiver alive: when they bail out
    // early the channel must close so the producer's send fails
    // instead of blocking forever.
    drop(rx);

    let mut first_err = None;
    for worker in workers {
        match worker.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => crate::error::prefer_error(&mut first_err, e),
            Err(e) => crate::error::prefer_error(
                &mut first_err,
                EngineError::Io(std::io::Error::other(e)),
            ),
        }
    }
    let producer_result = producer
        .await
        .map_err(|e| EngineError::Io(std::io::Error::other(e)))?;
    if let Some(e) = first_err {
        return Err(e);
    }
    producer_result?;
    if cancel.is_cancelled() {
        return Err(EngineError::Interrupted);
    }

    let mut entries = std::mem::take(&mut *results.lock().expect("lock poisoned"));
    entries.sort_unstable_by_key(|(seq, _, _)| *seq);

    let index = Index::from_chunks(
        opts.min as u64,
        opts.avg as u64,
        opts.max as u64,
        entries.into_iter().map(|(_, id, size)| (id, size)),
    );
    debug!(
        chunks = index.chunks.len(),
        bytes = index.total_size(),
        "chunked input into store"
    );
    Ok(index)
}

/// [`make`] over a file on disk.
pub async fn make_file(
    path: &Path,
    store: Arc<dyn WriteStore>,
    opts: &MakeOptions,
    cancel: &CancellationToken,
) -> Result<Index, EngineError> {
    let file = std::fs::File::open(path)?;
    make(file, store, opts, cancel).await
}
