//! Generic remote chunk store over an object transport.
//!
//! Remote backends (HTTP in-tree; SFTP/SSH/S3/GCS as external
//! implementations) share the same key layout and failure handling:
//! chunks live at `<prefix>/<first-4-hex>/<full-id>.<ext>`, transient
//! transport errors are retried with linear backoff, and "not found"
//! is distinguished from other failures by the transport. Negative
//! lookups are never cached.

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use cask_cas::Chunk;
use cask_types::{ChunkId, StoreOptions};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::StoreError;
use crate::local::{COMPRESSED_CHUNK_EXT, UNCOMPRESSED_CHUNK_EXT};
use crate::traits::{PruneStore, Store, WriteStore};

/// The primitive object operations a remote backend must provide.
///
/// Keys are relative to the backend's configured base location.
/// `get` returns `None` for an absent object so the store layer can
/// map it to [`StoreError::ChunkMissing`]; all other failures are
/// transport errors and subject to retry.
#[async_trait::async_trait]
pub trait ObjectTransport: Send + Sync {
    /// Fetch an object, `None` if it does not exist.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;

    /// Write an object.
    async fn put(&self, key: &str, data: Bytes) -> Result<(), StoreError>;

    /// Check whether an object exists.
    async fn head(&self, key: &str) -> Result<bool, StoreError>;

    /// Delete an object. Deleting an absent object is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Enumerate all object keys under the base location. Transports
    /// without a listing primitive return
    /// [`StoreError::NotSupported`].
    async fn list_keys(&self) -> Result<Vec<String>, StoreError>;

    /// Human-readable base location.
    fn location(&self) -> String;
}

/// Retry `f` on transient errors, up to `error_retry` extra attempts
/// with linear backoff.
pub(crate) async fn with_retry<T, F, Fut>(
    location: &str,
    error_retry: u32,
    mut f: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0u32;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < error_retry && is_transient(&e) => {
                attempt += 1;
                warn!(store = location, error = %e, attempt, "transient store error, retrying");
                tokio::time::sleep(Duration::from_millis(500) * attempt).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn is_transient(e: &StoreError) -> bool {
    matches!(e, StoreError::Http(_) | StoreError::Io(_))
}

/// A chunk store layered over an [`ObjectTransport`].
pub struct RemoteStore<T> {
    transport: T,
    opt: StoreOptions,
}

impl<T: ObjectTransport> RemoteStore<T> {
    /// Wrap a transport with the store-wide options.
    pub fn new(transport: T, opt: StoreOptions) -> Self {
        Self { transport, opt }
    }

    fn ext(&self) -> &'static str {
        if self.opt.uncompressed {
            UNCOMPRESSED_CHUNK_EXT
        } else {
            COMPRESSED_CHUNK_EXT
        }
    }

    /// Relative object key for a chunk.
    fn key_from_id(&self, id: ChunkId) -> String {
        let sid = id.to_string();
        format!("{}/{sid}{}", &sid[0..4], self.ext())
    }

    /// Parse a chunk ID back out of an object key; `None` for keys
    /// that aren't chunks of this store's flavor.
    fn id_from_key(&self, key: &str) -> Option<ChunkId> {
        let stem = key.strip_suffix(self.ext())?;
        let (dir, sid) = stem.split_once('/')?;
        if !sid.starts_with(dir) {
            return None;
        }
        sid.parse().ok()
    }

    fn chunk_from_bytes(&self, id: ChunkId, data: Bytes) -> Result<Chunk, StoreError> {
        let (plain, compressed) = if self.opt.uncompressed {
            (Some(data), None)
        } else {
            (None, Some(data))
        };
        Ok(Chunk::with_id(id, plain, compressed, self.opt.skip_verify)?)
    }
}

#[async_trait::async_trait]
impl<T: ObjectTransport> Store for RemoteStore<T> {
    async fn get_chunk(&self, id: ChunkId) -> Result<Chunk, StoreError> {
        let key = self.key_from_id(id);
        let location = self.location();
        let data = with_retry(&location, self.opt.error_retry, || self.transport.get(&key))
            .await?
            .ok_or(StoreError::ChunkMissing(id))?;
        self.chunk_from_bytes(id, data)
    }

    async fn has_chunk(&self, id: ChunkId) -> Result<bool, StoreError> {
        let key = self.key_from_id(id);
        let location = self.location();
        with_retry(&location, self.opt.error_retry, || self.transport.head(&key)).await
    }

    fn location(&self) -> String {
        self.transport.location()
    }

    fn as_write_store(&self) -> Option<&dyn WriteStore> {
        Some(self)
    }
}

#[async_trait::async_trait]
impl<T: ObjectTransport> WriteStore for RemoteStore<T> {
    async fn store_chunk(&self, chunk: &Chunk) -> Result<(), StoreError> {
        let id = chunk.id()?;
        let key = self.key_from_id(id);
        let data = if self.opt.uncompressed {
            chunk.uncompressed()?
        } else {
            chunk.compressed()?
        };
        let location = self.location();
        with_retry(&location, self.opt.error_retry, || {
            self.transport.put(&key, data.clone())
        })
        .await
    }
}

#[async_trait::async_trait]
impl<T: ObjectTransport> PruneStore for RemoteStore<T> {
    async fn remove_chunk(&self, id: ChunkId) -> Result<(), StoreError> {
        let key = self.key_from_id(id);
        let location = self.location();
        if !with_retry(&location, self.opt.error_retry, || self.transport.head(&key)).await? {
            return Err(StoreError::ChunkMissing(id));
        }
        with_retry(&location, self.opt.error_retry, || self.transport.delete(&key)).await
    }

    async fn prune(
        &self,
        live: &HashSet<ChunkId>,
        cancel: &CancellationToken,
    ) -> Result<usize, StoreError> {
        let location = self.location();
        let keys =
            with_retry(&location, self.opt.error_retry, || self.transport.list_keys()).await?;

        let mut removed = 0;
        for key in keys {
            if cancel.is_cancelled() {
                return Err(StoreError::Interrupted);
            }
            let Some(id) = self.id_from_key(&key) else {
                continue;
            };
            if live.contains(&id) {
                continue;
            }
            match with_retry(&location, self.opt.error_retry, || self.transport.delete(&key))
                .await
            {
                Ok(()) => removed += 1,
                // Already gone, someone else pruned it.
                Err(StoreError::ChunkMissing(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::RwLock;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    /// In-memory object transport for exercising the store layer.
    #[derive(Default)]
    struct MemoryTransport {
        objects: RwLock<HashMap<String, Bytes>>,
        /// Fail this many calls before succeeding.
        failures_left: AtomicU32,
    }

    impl MemoryTransport {
        fn maybe_fail(&self) -> Result<(), StoreError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StoreError::Io(std::io::Error::other("flaky transport")));
            }
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl ObjectTransport for MemoryTransport {
        async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
            self.maybe_fail()?;
            Ok(self.objects.read().expect("lock poisoned").get(key).cloned())
        }

        async fn put(&self, key: &str, data: Bytes) -> Result<(), StoreError> {
            self.maybe_fail()?;
            self.objects
                .write()
                .expect("lock poisoned")
                .insert(key.to_string(), data);
            Ok(())
        }

        async fn head(&self, key: &str) -> Result<bool, StoreError> {
            self.maybe_fail()?;
            Ok(self.objects.read().expect("lock poisoned").contains_key(key))
        }

        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.maybe_fail()?;
            self.objects.write().expect("lock poisoned").remove(key);
            Ok(())
        }

        async fn list_keys(&self) -> Result<Vec<String>, StoreError> {
            self.maybe_fail()?;
            Ok(self.objects.read().expect("lock poisoned").keys().cloned().collect())
        }

        fn location(&self) -> String {
            "mem://test".to_string()
        }
    }

    fn remote(opt: StoreOptions) -> RemoteStore<MemoryTransport> {
        RemoteStore::new(MemoryTransport::default(), opt)
    }

    #[tokio::test]
    async fn test_store_get_roundtrip() {
        let store = remote(StoreOptions::default());
        let chunk = Chunk::from_data(&b"remote chunk"[..]);
        store.store_chunk(&chunk).await.unwrap();

        let got = store.get_chunk(chunk.id().unwrap()).await.unwrap();
        assert_eq!(got.uncompressed().unwrap().as_ref(), b"remote chunk");
    }

    #[tokio::test]
    async fn test_key_layout() {
        let store = remote(StoreOptions::default());
        let chunk = Chunk::from_data(&b"key layout"[..]);
        let id = chunk.id().unwrap();
        store.store_chunk(&chunk).await.unwrap();

        let sid = id.to_string();
        let expected_key = format!("{}/{sid}.cacnk", &sid[0..4]);
        assert!(
            store
                .transport
                .objects
                .read()
                .unwrap()
                .contains_key(&expected_key)
        );
        assert_eq!(store.id_from_key(&expected_key), Some(id));
        assert_eq!(store.id_from_key("junk/file.txt"), None);
        assert_eq!(store.id_from_key(&format!("beef/{sid}.cacnk")), None);
    }

    #[tokio::test]
    async fn test_missing_chunk() {
        let store = remote(StoreOptions::default());
        let id = ChunkId::from_data(b"absent remote");
        assert!(store.get_chunk(id).await.unwrap_err().is_missing());
        assert!(!store.has_chunk(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let opt = StoreOptions {
            error_retry: 3,
            ..StoreOptions::default()
        };
        let store = remote(opt);
        let chunk = Chunk::from_data(&b"flaky"[..]);
        store.store_chunk(&chunk).await.unwrap();

        store.transport.failures_left.store(2, Ordering::SeqCst);
        let got = store.get_chunk(chunk.id().unwrap()).await.unwrap();
        assert_eq!(got.uncompressed().unwrap().as_ref(), b"flaky");
    }

    #[tokio::test]
    async fn test_retries_exhausted_surface_error() {
        let store = remote(StoreOptions::default()); // error_retry = 0
        store.transport.failures_left.store(1, Ordering::SeqCst);
        let id = ChunkId::from_data(b"whatever");
        assert!(matches!(store.get_chunk(id).await, Err(StoreError::Io(_))));
    }

    #[tokio::test]
    async fn test_prune_via_list_and_delete() {
        let store = remote(StoreOptions::default());
        let mut live = HashSet::new();
        for i in 0..10u8 {
            let chunk = Chunk::from_data(vec![i; 32]);
            store.store_chunk(&chunk).await.unwrap();
            if i < 4 {
                live.insert(chunk.id().unwrap());
            }
        }
        // A non-chunk object survives pruning untouched.
        store
            .transport
            .put("some/readme.txt", Bytes::from_static(b"keep"))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let removed = store.prune(&live, &cancel).await.unwrap();
        assert_eq!(removed, 6);
        for id in &live {
            assert!(store.has_chunk(*id).await.unwrap());
        }
        assert!(store.transport.head("some/readme.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_uncompressed_flavor_uses_raw_bytes() {
        let opt = StoreOptions {
            uncompressed: true,
            ..StoreOptions::default()
        };
        let store = remote(opt);
        let chunk = Chunk::from_data(&b"plain remote"[..]);
        let id = chunk.id().unwrap();
        store.store_chunk(&chunk).await.unwrap();

        let sid = id.to_string();
        let key = format!("{}/{sid}.uncacnk", &sid[0..4]);
        let raw = store.transport.objects.read().unwrap().get(&key).cloned();
        assert_eq!(raw.as_deref(), Some(&b"plain remote"[..]));
    }
}
