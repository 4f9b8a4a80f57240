//! Cross-store chunk replication.

use std::sync::{Arc, Mutex};

use cask_store::{Store, WriteStore};
use cask_types::ChunkId;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::EngineError;

/// Copy `ids` from `src` into `dst`, skipping chunks the destination
/// already holds. Returns the number of chunks actually transferred.
pub async fn copy(
    ids: Vec<ChunkId>,
    src: Arc<dyn Store>,
    dst: Arc<dyn WriteStore>,
    n: usize,
    cancel: &CancellationToken,
) -> Result<usize, EngineError> {
    let abort = cancel.child_token();
    let queue = Arc::new(Mutex::new(ids));

    let mut workers = Vec::new();
    for _ in 0..n.max(1) {
        let queue = queue.clone();
        let src = src.clone();
        let dst = dst.clone();
        let abort = abort.clone();
        workers.push(tokio::spawn(async move {
            let mut copied = 0usize;
            loop {
                if abort.is_cancelled() {
                    return Err(EngineError::Interrupted);
                }
                let Some(id) = queue.lock().expect("lock poisoned").pop() else {
                    return Ok(copied);
                };
                let result: Result<bool, EngineError> = async {
                    if dst.has_chunk(id).await? {
                        return Ok(false);
                    }
                    let chunk = src.get_chunk(id).await?;
                    dst.store_chunk(&chunk).await?;
                    Ok(true)
                }
                .await;
                match result {
                    Ok(true) => copied += 1,
                    Ok(false) => {}
                    Err(e) => {
                        abort.cancel();
                        return Err(e);
                    }
                }
            }
        }));
    }

    let mut copied = 0;
    let mut first_err = None;
    for worker in workers {
        match worker.await {
            Ok(Ok(worker_copied)) => copied += worker_copied,
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
    debug!(copied, src = %src.location(), dst = %dst.location(), "copied chunks");
    Ok(copied)
}
