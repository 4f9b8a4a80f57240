//! On-disk chunk and index store backend.
//!
//! Chunks are stored one file each under a fan-out directory named
//! after the first four hex characters of the chunk ID:
//! `{base}/{hex[0..4]}/{hex}.cacnk` (zstd) or `...uncacnk` (raw),
//! depending on the store-wide `uncompressed` option. The two
//! extensions are never mixed within one store.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use cask_cas::{CasError, Chunk, Index};
use cask_types::{ChunkId, StoreOptions};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::StoreError;
use crate::traits::{IndexStore, IndexWriteStore, PruneStore, Store, WriteStore};

/// File extension for zstd-compressed chunk files.
pub const COMPRESSED_CHUNK_EXT: &str = ".cacnk";
/// File extension for raw chunk files.
pub const UNCOMPRESSED_CHUNK_EXT: &str = ".uncacnk";

/// How often a failed rename into place is retried. File-lock and
/// virus-scanner interference on some platforms clears within this.
const RENAME_RETRIES: u32 = 10;
const RENAME_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Chunk store in a local directory.
#[derive(Clone)]
pub struct LocalStore {
    base: PathBuf,
    opt: StoreOptions,
    /// Bump chunk mtimes on read. Useful when this store is a cache:
    /// stale chunks can then be expired by an external LRU sweep.
    update_times: bool,
}

impl LocalStore {
    /// Open a store rooted at an existing directory.
    pub fn open(dir: impl AsRef<Path>, opt: StoreOptions) -> Result<Self, StoreError> {
        let base = dir.as_ref().to_path_buf();
        let info = std::fs::metadata(&base).map_err(|e| StoreError::Config {
            location: base.display().to_string(),
            reason: e.to_string(),
        })?;
        if !info.is_dir() {
            return Err(StoreError::Config {
                location: base.display().to_string(),
                reason: "not a directory".to_string(),
            });
        }
        Ok(Self {
            base,
            opt,
            update_times: false,
        })
    }

    /// Enable mtime bumping on chunk reads.
    pub fn update_times(mut self, enabled: bool) -> Self {
        self.update_times = enabled;
        self
    }

    fn ext(&self) -> &'static str {
        if self.opt.uncompressed {
            UNCOMPRESSED_CHUNK_EXT
        } else {
            COMPRESSED_CHUNK_EXT
        }
    }

    /// Fan-out directory and full file path for a chunk.
    fn chunk_path(&self, id: ChunkId) -> (PathBuf, PathBuf) {
        let sid = id.to_string();
        let dir = self.base.join(&sid[0..4]);
        let path = dir.join(format!("{sid}{}", self.ext()));
        (dir, path)
    }

    fn id_from_file_name(&self, name: &str) -> Option<ChunkId> {
        name.strip_suffix(self.ext())?.parse().ok()
    }

    /// Read a chunk file and reconstitute it under its asserted ID,
    /// verifying regardless of the store's `skip_verify` option.
    fn validate_chunk_file(path: &Path, id: ChunkId, uncompressed: bool) -> Result<(), StoreError> {
        let data = Bytes::from(std::fs::read(path)?);
        let (plain, compressed) = if uncompressed {
            (Some(data), None)
        } else {
            (None, Some(data))
        };
        Chunk::with_id(id, plain, compressed, false)?;
        Ok(())
    }

    /// Write `data` through a temp file and rename it into place.
    ///
    /// On rename contention the destination is validated: a valid copy
    /// means another writer won and the temp file is discarded; an
    /// invalid copy is removed and the rename retried.
    fn write_chunk_file(
        dir: &Path,
        path: &Path,
        id: ChunkId,
        data: &[u8],
        uncompressed: bool,
    ) -> Result<(), StoreError> {
        std::fs::create_dir_all(dir)?;
        let mut tmp = tempfile::Builder::new()
            .prefix("cacnk")
            .suffix(".tmp")
            .tempfile_in(dir)?;
        tmp.write_all(data)?;

        let mut retries = RENAME_RETRIES;
        loop {
            let persist_err = match tmp.persist(path) {
                Ok(_) => return Ok(()),
                Err(e) => {
                    tmp = e.file;
                    e.error
                }
            };

            if path.exists() {
                match Self::validate_chunk_file(path, id, uncompressed) {
                    // A valid copy is already in place; ours is redundant.
                    Ok(()) => return Ok(()),
                    Err(StoreError::Chunk(CasError::Invalid { .. })) => {
                        debug!(%id, path = %path.display(), "removing invalid chunk blocking rename");
                        if let Err(e) = std::fs::remove_file(path)
                            && e.kind() != std::io::ErrorKind::NotFound
                        {
                            warn!(path = %path.display(), error = %e, "failed to remove invalid chunk");
                        }
                    }
                    Err(other) => return Err(other),
                }
            } else {
                warn!(
                    %id,
                    path = %path.display(),
                    error = %persist_err,
                    "failed to rename chunk into place, retrying"
                );
            }

            if retries == 0 {
                return Err(persist_err.into());
            }
            retries -= 1;
            std::thread::sleep(RENAME_RETRY_DELAY);
        }
    }

    /// Verify every chunk in the store with `n` concurrent workers.
    ///
    /// Invalid chunks are collected in the result (and removed when
    /// `repair` is set); unreadable files are counted but don't stop
    /// the sweep.
    pub async fn verify(
        &self,
        n: usize,
        repair: bool,
        cancel: &CancellationToken,
    ) -> Result<VerifyResults, StoreError> {
        let ids = self.collect_chunk_ids(cancel).await?;
        let queue = Arc::new(Mutex::new(ids));

        let mut workers = Vec::new();
        for _ in 0..n.max(1) {
            let store = self.clone();
            let queue = queue.clone();
            let cancel = cancel.clone();
            workers.push(tokio::spawn(async move {
                let mut results = VerifyResults::default();
                let mut interrupted = false;
                loop {
                    if cancel.is_cancelled() {
                        interrupted = true;
                        break;
                    }
                    let Some(id) = queue.lock().expect("lock poisoned").pop() else {
                        break;
                    };
                    results.scanned += 1;
                    match store.get_chunk(id).await {
                        Ok(_) => {}
                        Err(StoreError::Chunk(CasError::Invalid { expected, actual })) => {
                            warn!(%expected, %actual, "invalid chunk");
                            results.invalid.push(id);
                            if repair {
                                match store.remove_chunk(id).await {
                                    Ok(()) | Err(StoreError::ChunkMissing(_)) => {
                                        results.removed.push(id);
                                    }
                                    Err(e) => {
                                        warn!(%id, error = %e, "failed to remove invalid chunk");
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            warn!(%id, error = %e, "failed to read chunk during verify");
                            results.read_errors += 1;
                        }
                    }
                }
                (results, interrupted)
            }));
        }

        let mut merged = VerifyResults::default();
        let mut interrupted = false;
        for worker in workers {
            let (results, worker_interrupted) =
                worker.await.map_err(|e| StoreError::Io(std::io::Error::other(e)))?;
            merged.merge(results);
            interrupted |= worker_interrupted;
        }
        if interrupted {
            return Err(StoreError::Interrupted);
        }
        Ok(merged)
    }

    /// Walk the fan-out tree and parse chunk IDs from file names,
    /// skipping anything that isn't a chunk of this store's flavor.
    async fn collect_chunk_ids(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<ChunkId>, StoreError> {
        let store = self.clone();
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || {
            let mut ids = Vec::new();
            for entry in WalkDir::new(&store.base) {
                if cancel.is_cancelled() {
                    return Err(StoreError::Interrupted);
                }
                let entry = entry.map_err(|e| StoreError::Io(std::io::Error::other(e)))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                if let Some(name) = entry.file_name().to_str()
                    && let Some(id) = store.id_from_file_name(name)
                {
                    ids.push(id);
                }
            }
            Ok(ids)
        })
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
    }
}

/// Outcome of a [`LocalStore::verify`] sweep.
#[derive(Debug, Default)]
pub struct VerifyResults {
    /// Chunks examined.
    pub scanned: usize,
    /// Chunks whose content did not match their ID.
    pub invalid: Vec<ChunkId>,
    /// Invalid chunks deleted because `repair` was set.
    pub removed: Vec<ChunkId>,
    /// Chunks that could not be read at all.
    pub read_errors: usize,
}

impl VerifyResults {
    fn merge(&mut self, other: VerifyResults) {
        self.scanned += other.scanned;
        self.invalid.extend(other.invalid);
        self.removed.extend(other.removed);
        self.read_errors += other.read_errors;
    }
}

#[async_trait::async_trait]
impl Store for LocalStore {
    async fn get_chunk(&self, id: ChunkId) -> Result<Chunk, StoreError> {
        let (_, path) = self.chunk_path(id);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => Bytes::from(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::ChunkMissing(id));
            }
            Err(e) => return Err(StoreError::Io(e)),
        };

        if self.update_times
            && let Err(e) = bump_mtime(&path)
        {
            debug!(path = %path.display(), error = %e, "failed to bump chunk mtime");
        }

        let (plain, compressed) = if self.opt.uncompressed {
            (Some(data), None)
        } else {
            (None, Some(data))
        };
        Ok(Chunk::with_id(id, plain, compressed, self.opt.skip_verify)?)
    }

    async fn has_chunk(&self, id: ChunkId) -> Result<bool, StoreError> {
        let (_, path) = self.chunk_path(id);
        match tokio::fs::metadata(&path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    fn location(&self) -> String {
        self.base.display().to_string()
    }

    fn as_write_store(&self) -> Option<&dyn WriteStore> {
        Some(self)
    }
}

#[async_trait::async_trait]
impl WriteStore for LocalStore {
    async fn store_chunk(&self, chunk: &Chunk) -> Result<(), StoreError> {
        let id = chunk.id()?;
        let (dir, path) = self.chunk_path(id);

        // Someone beat us to it, no more work to be done.
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(());
        }

        let data = if self.opt.uncompressed {
            chunk.uncompressed()?
        } else {
            chunk.compressed()?
        };

        let uncompressed = self.opt.uncompressed;
        tokio::task::spawn_blocking(move || {
            Self::write_chunk_file(&dir, &path, id, &data, uncompressed)
        })
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
    }
}

#[async_trait::async_trait]
impl PruneStore for LocalStore {
    async fn remove_chunk(&self, id: ChunkId) -> Result<(), StoreError> {
        let (_, path) = self.chunk_path(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::ChunkMissing(id))
            }
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn prune(
        &self,
        live: &HashSet<ChunkId>,
        cancel: &CancellationToken,
    ) -> Result<usize, StoreError> {
        let store = self.clone();
        let live = live.clone();
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || {
            let mut removed = 0;
            for entry in WalkDir::new(&store.base) {
                if cancel.is_cancelled() {
                    return Err(StoreError::Interrupted);
                }
                let entry = entry.map_err(|e| StoreError::Io(std::io::Error::other(e)))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let Some(id) = entry
                    .file_name()
                    .to_str()
                    .and_then(|name| store.id_from_file_name(name))
                else {
                    continue;
                };
                if live.contains(&id) {
                    continue;
                }
                match std::fs::remove_file(entry.path()) {
                    Ok(()) => removed += 1,
                    // Already gone, someone else pruned it.
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(StoreError::Io(e)),
                }
            }
            debug!(removed, store = %store.base.display(), "pruned local store");
            Ok(removed)
        })
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
    }
}

/// Best-effort mtime refresh for cache LRU sweeps.
fn bump_mtime(path: &Path) -> std::io::Result<()> {
    let file = std::fs::File::options().write(true).open(path)?;
    file.set_times(std::fs::FileTimes::new().set_modified(std::time::SystemTime::now()))
}

// ---------------------------------------------------------------------------
// Index files in a local directory
// ---------------------------------------------------------------------------

/// Index store reading and writing plain index files in a directory.
pub struct LocalIndexStore {
    dir: PathBuf,
}

impl LocalIndexStore {
    /// Open an index store rooted at an existing directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        let info = std::fs::metadata(&dir).map_err(|e| StoreError::Config {
            location: dir.display().to_string(),
            reason: e.to_string(),
        })?;
        if !info.is_dir() {
            return Err(StoreError::Config {
                location: dir.display().to_string(),
                reason: "not a directory".to_string(),
            });
        }
        Ok(Self { dir })
    }
}

#[async_trait::async_trait]
impl IndexStore for LocalIndexStore {
    async fn get_index_bytes(&self, name: &str) -> Result<Bytes, StoreError> {
        match tokio::fs::read(self.dir.join(name)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::IndexMissing(name.to_string()))
            }
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    fn location(&self) -> String {
        self.dir.display().to_string()
    }
}

#[async_trait::async_trait]
impl IndexWriteStore for LocalIndexStore {
    async fn store_index(&self, name: &str, index: &Index) -> Result<(), StoreError> {
        let mut data = Vec::new();
        index.write_to(&mut data)?;
        let path = self.dir.join(name);
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let mut tmp = tempfile::Builder::new().suffix(".tmp").tempfile_in(&dir)?;
            tmp.write_all(&data)?;
            tmp.persist(&path).map_err(|e| StoreError::Io(e.error))?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn compressed_store() -> (LocalStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(dir.path(), StoreOptions::default()).unwrap();
        (store, dir)
    }

    fn uncompressed_store() -> (LocalStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let opt = StoreOptions {
            uncompressed: true,
            ..StoreOptions::default()
        };
        let store = LocalStore::open(dir.path(), opt).unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_store_get_roundtrip() {
        let (store, _dir) = compressed_store();
        let chunk = Chunk::from_data(&b"local chunk data"[..]);
        let id = chunk.id().unwrap();

        store.store_chunk(&chunk).await.unwrap();
        let got = store.get_chunk(id).await.unwrap();
        assert_eq!(got.uncompressed().unwrap().as_ref(), b"local chunk data");
    }

    #[tokio::test]
    async fn test_missing_chunk() {
        let (store, _dir) = compressed_store();
        let id = ChunkId::from_data(b"absent");
        assert!(store.get_chunk(id).await.unwrap_err().is_missing());
        assert!(!store.has_chunk(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_fanout_layout_and_extension() {
        let (store, dir) = compressed_store();
        let chunk = Chunk::from_data(&b"layout"[..]);
        let id = chunk.id().unwrap();
        store.store_chunk(&chunk).await.unwrap();

        let sid = id.to_string();
        let path = dir.path().join(&sid[0..4]).join(format!("{sid}.cacnk"));
        assert!(path.exists(), "expected {}", path.display());

        // The file holds the zstd form.
        let on_disk = std::fs::read(&path).unwrap();
        assert_eq!(on_disk, chunk.compressed().unwrap().as_ref());
    }

    #[tokio::test]
    async fn test_uncompressed_store_uses_other_extension() {
        let (store, dir) = uncompressed_store();
        let chunk = Chunk::from_data(&b"raw bytes"[..]);
        let id = chunk.id().unwrap();
        store.store_chunk(&chunk).await.unwrap();

        let sid = id.to_string();
        let path = dir.path().join(&sid[0..4]).join(format!("{sid}.uncacnk"));
        assert_eq!(std::fs::read(&path).unwrap(), b"raw bytes");

        // A compressed-flavor store rooted at the same directory does
        // not see raw chunk files.
        let other = LocalStore::open(dir.path(), StoreOptions::default()).unwrap();
        assert!(!other.has_chunk(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_open_rejects_missing_dir() {
        let dir = TempDir::new().unwrap();
        let bogus = dir.path().join("nope");
        assert!(matches!(
            LocalStore::open(&bogus, StoreOptions::default()),
            Err(StoreError::Config { .. })
        ));
    }

    #[tokio::test]
    async fn test_get_detects_corruption() {
        let (store, dir) = compressed_store();
        let chunk = Chunk::from_data(&b"will corrupt"[..]);
        let id = chunk.id().unwrap();
        store.store_chunk(&chunk).await.unwrap();

        // Swap the chunk file for a valid zstd frame of other data.
        let sid = id.to_string();
        let path = dir.path().join(&sid[0..4]).join(format!("{sid}.cacnk"));
        let other = Chunk::from_data(&b"other data"[..]);
        std::fs::write(&path, other.compressed().unwrap()).unwrap();

        match store.get_chunk(id).await {
            Err(StoreError::Chunk(CasError::Invalid { expected, .. })) => {
                assert_eq!(expected, id)
            }
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_skip_verify_returns_corrupt_chunk() {
        let dir = TempDir::new().unwrap();
        let opt = StoreOptions {
            skip_verify: true,
            ..StoreOptions::default()
        };
        let store = LocalStore::open(dir.path(), opt).unwrap();
        let chunk = Chunk::from_data(&b"trusted"[..]);
        let id = chunk.id().unwrap();
        store.store_chunk(&chunk).await.unwrap();

        let sid = id.to_string();
        let path = dir.path().join(&sid[0..4]).join(format!("{sid}.cacnk"));
        let other = Chunk::from_data(&b"imposter"[..]);
        std::fs::write(&path, other.compressed().unwrap()).unwrap();

        // With skip_verify the store hands back whatever is on disk.
        let got = store.get_chunk(id).await.unwrap();
        assert_eq!(got.uncompressed().unwrap().as_ref(), b"imposter");
    }

    #[tokio::test]
    async fn test_concurrent_store_same_chunk() {
        let (store, dir) = compressed_store();
        let chunk = Chunk::from_data(&b"contended chunk"[..]);
        let id = chunk.id().unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let chunk = chunk.clone();
            handles.push(tokio::spawn(async move { store.store_chunk(&chunk).await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        // Exactly one chunk file, correct content, no temp files left.
        let files: Vec<_> = WalkDir::new(dir.path())
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .collect();
        assert_eq!(files.len(), 1);
        assert!(files[0].file_name().to_str().unwrap().ends_with(".cacnk"));
        let got = store.get_chunk(id).await.unwrap();
        assert_eq!(got.uncompressed().unwrap().as_ref(), b"contended chunk");
    }

    #[tokio::test]
    async fn test_remove_chunk() {
        let (store, _dir) = compressed_store();
        let chunk = Chunk::from_data(&b"removable"[..]);
        let id = chunk.id().unwrap();
        store.store_chunk(&chunk).await.unwrap();

        store.remove_chunk(id).await.unwrap();
        assert!(!store.has_chunk(id).await.unwrap());
        assert!(store.remove_chunk(id).await.unwrap_err().is_missing());
    }

    #[tokio::test]
    async fn test_prune_removes_dead_chunks() {
        let (store, _dir) = compressed_store();
        let mut live = HashSet::new();
        let mut all = Vec::new();
        for i in 0..20u8 {
            let chunk = Chunk::from_data(vec![i; 64]);
            let id = chunk.id().unwrap();
            store.store_chunk(&chunk).await.unwrap();
            if i % 4 == 0 {
                live.insert(id);
            }
            all.push(id);
        }

        let cancel = CancellationToken::new();
        let removed = store.prune(&live, &cancel).await.unwrap();
        assert_eq!(removed, 15);
        for id in &all {
            assert_eq!(store.has_chunk(*id).await.unwrap(), live.contains(id));
        }

        // Idempotent.
        assert_eq!(store.prune(&live, &cancel).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_prune_cancelled() {
        let (store, _dir) = compressed_store();
        let chunk = Chunk::from_data(&b"x"[..]);
        store.store_chunk(&chunk).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            store.prune(&HashSet::new(), &cancel).await,
            Err(StoreError::Interrupted)
        ));
        // Nothing was deleted.
        assert!(store.has_chunk(chunk.id().unwrap()).await.unwrap());
    }

    #[tokio::test]
    async fn test_verify_reports_and_repairs() {
        let (store, dir) = compressed_store();
        let mut good = Vec::new();
        for i in 0..10u8 {
            let chunk = Chunk::from_data(vec![i; 128]);
            store.store_chunk(&chunk).await.unwrap();
            good.push(chunk.id().unwrap());
        }

        // Corrupt one chunk on disk.
        let victim = good[3];
        let sid = victim.to_string();
        let path = dir.path().join(&sid[0..4]).join(format!("{sid}.cacnk"));
        let imposter = Chunk::from_data(&b"imposter"[..]);
        std::fs::write(&path, imposter.compressed().unwrap()).unwrap();

        let cancel = CancellationToken::new();
        let results = store.verify(4, false, &cancel).await.unwrap();
        assert_eq!(results.scanned, 10);
        assert_eq!(results.invalid, vec![victim]);
        assert!(results.removed.is_empty());
        assert!(store.has_chunk(victim).await.unwrap());

        let results = store.verify(4, true, &cancel).await.unwrap();
        assert_eq!(results.invalid, vec![victim]);
        assert_eq!(results.removed, vec![victim]);
        assert!(!store.has_chunk(victim).await.unwrap());

        // The rest of the store still verifies clean.
        let results = store.verify(4, false, &cancel).await.unwrap();
        assert_eq!(results.scanned, 9);
        assert!(results.invalid.is_empty());
    }

    #[tokio::test]
    async fn test_index_store_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = LocalIndexStore::open(dir.path()).unwrap();

        let index = Index::from_chunks(
            16,
            64,
            256,
            [(ChunkId::from_data(b"c0"), 100), (ChunkId::from_data(b"c1"), 200)],
        );
        store.store_index("blob.caibx", &index).await.unwrap();

        let loaded = store.get_index("blob.caibx").await.unwrap();
        assert_eq!(loaded, index);

        assert!(matches!(
            store.get_index("nope.caibx").await,
            Err(StoreError::IndexMissing(_))
        ));
    }
}
