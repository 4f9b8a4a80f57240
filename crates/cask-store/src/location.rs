//! Store-location parsing and composition.
//!
//! Locations are URLs (`http(s)://`, plus externally provided
//! schemes) or bare filesystem paths. Multiple locations compose into
//! a [`StoreRouter`]; `|`-separated members of a single location form
//! a [`FailoverGroup`]; a writable store can be attached as a
//! read-through [`Cache`] in front of the whole arrangement.

use std::path::Path;
use std::sync::Arc;

use cask_cas::Index;
use cask_types::{Config, StoreOptions};
use serde::Deserialize;
use url::Url;

use crate::cache::Cache;
use crate::error::StoreError;
use crate::failover::FailoverGroup;
use crate::http::{HttpIndexStore, new_http_store};
use crate::local::{LocalIndexStore, LocalStore};
use crate::router::StoreRouter;
use crate::traits::{IndexStore, IndexWriteStore, Store, WriteStore};

/// Schemes whose transports live outside this workspace.
const EXTERNAL_SCHEMES: &[&str] = &["ssh", "sftp", "s3+http", "s3+https", "gs"];

fn parse_url(location: &str) -> Option<Url> {
    // Bare paths (including Windows drive letters) are not URLs.
    location.contains("://").then(|| Url::parse(location).ok())?
}

/// Store options for a location: config-file options plus the legacy
/// top-level HTTP fallbacks.
fn options_for(location: &str, is_http: bool, cfg: &Config) -> StoreOptions {
    let mut opt = cfg.store_options_for(location);
    if is_http {
        if opt.timeout.is_none() {
            opt.timeout = cfg.http_timeout;
        }
        if opt.error_retry == 0 {
            opt.error_retry = cfg.http_error_retry;
        }
    }
    opt
}

/// Open the store at a single location.
pub fn store_from_location(location: &str, cfg: &Config) -> Result<Arc<dyn Store>, StoreError> {
    Ok(writable(location, cfg, false)?.0)
}

/// Open a single location for writing, e.g. as a make target or a
/// cache.
pub fn writable_store_from_location(
    location: &str,
    cfg: &Config,
) -> Result<Arc<dyn WriteStore>, StoreError> {
    writable(location, cfg, false)?.1.ok_or_else(|| StoreError::NotSupported {
        location: location.to_string(),
        operation: "writing",
    })
}

/// Open a location, returning it both as a plain store and (when it
/// has the capability) as a write store. `as_cache` enables
/// cache-specific behavior on local stores.
fn writable(
    location: &str,
    cfg: &Config,
    as_cache: bool,
) -> Result<(Arc<dyn Store>, Option<Arc<dyn WriteStore>>), StoreError> {
    match parse_url(location) {
        Some(url) => match url.scheme() {
            "http" | "https" => {
                let opt = options_for(location, true, cfg);
                let store = Arc::new(new_http_store(&url, opt)?);
                Ok((store.clone(), Some(store)))
            }
            scheme if EXTERNAL_SCHEMES.contains(&scheme) => Err(StoreError::Config {
                location: location.to_string(),
                reason: format!("scheme {scheme:?} requires an external transport"),
            }),
            scheme => Err(StoreError::Config {
                location: location.to_string(),
                reason: format!("unknown scheme {scheme:?}"),
            }),
        },
        None => {
            let opt = options_for(location, false, cfg);
            let store = Arc::new(LocalStore::open(location, opt)?.update_times(as_cache));
            Ok((store.clone(), Some(store)))
        }
    }
}

/// Open one location string, expanding `|`-separated members into a
/// failover group.
fn store_group(location: &str, cfg: &Config) -> Result<Arc<dyn Store>, StoreError> {
    if !location.contains('|') {
        return store_from_location(location, cfg);
    }
    let members = location
        .split('|')
        .map(|member| store_from_location(member, cfg))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Arc::new(FailoverGroup::new(members)))
}

/// Compose several store locations into a router, querying them in
/// the order given.
pub fn multi_store_with_router(
    locations: &[impl AsRef<str>],
    cfg: &Config,
) -> Result<Arc<dyn Store>, StoreError> {
    let stores = locations
        .iter()
        .map(|location| store_group(location.as_ref(), cfg))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Arc::new(StoreRouter::new(stores)))
}

/// Compose store locations into a router and optionally attach a
/// writable cache in front.
pub fn multi_store_with_cache(
    locations: &[impl AsRef<str>],
    cache_location: Option<&str>,
    cfg: &Config,
) -> Result<Arc<dyn Store>, StoreError> {
    let router = multi_store_with_router(locations, cfg)?;
    match cache_location {
        None => Ok(router),
        Some(location) => {
            let (_, write) = writable(location, cfg, true)?;
            let cache = write.ok_or_else(|| StoreError::NotSupported {
                location: location.to_string(),
                operation: "writing",
            })?;
            Ok(Arc::new(Cache::new(router, cache)))
        }
    }
}

/// A JSON file standing in for repeated store flags, so long-running
/// callers can swap store sets without re-invocation.
#[derive(Debug, Deserialize)]
struct StoreFile {
    stores: Vec<String>,
    #[serde(default)]
    cache: String,
}

/// Read a store file, returning the store locations and the optional
/// cache location.
pub fn read_store_file(path: &Path) -> Result<(Vec<String>, Option<String>), StoreError> {
    let data = std::fs::read(path)?;
    let parsed: StoreFile =
        serde_json::from_slice(&data).map_err(|e| StoreError::Config {
            location: path.display().to_string(),
            reason: e.to_string(),
        })?;
    let cache = (!parsed.cache.is_empty()).then_some(parsed.cache);
    Ok((parsed.stores, cache))
}

/// Split an index location into its store base and the index name.
fn split_index_location(location: &str) -> (String, String) {
    match parse_url(location) {
        Some(url) => {
            let name = url
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .unwrap_or_default()
                .to_string();
            let mut base = url.clone();
            {
                let mut segments = base.path_segments_mut().expect("http urls have paths");
                segments.pop();
                segments.push("");
            }
            (base.to_string(), name)
        }
        None => {
            let path = Path::new(location);
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map_or_else(|| ".".to_string(), |p| p.display().to_string());
            (dir, name)
        }
    }
}

/// Open the index store containing `location`, returning the store
/// and the index name within it.
pub fn index_store_from_location(
    location: &str,
    cfg: &Config,
) -> Result<(Arc<dyn IndexStore>, String), StoreError> {
    let (store, _, name) = index_stores(location, cfg)?;
    Ok((store, name))
}

/// Open an index location for writing.
pub fn writable_index_store_from_location(
    location: &str,
    cfg: &Config,
) -> Result<(Arc<dyn IndexWriteStore>, String), StoreError> {
    let (_, write, name) = index_stores(location, cfg)?;
    let store = write.ok_or_else(|| StoreError::NotSupported {
        location: location.to_string(),
        operation: "index writing",
    })?;
    Ok((store, name))
}

#[allow(clippy::type_complexity)]
fn index_stores(
    location: &str,
    cfg: &Config,
) -> Result<(Arc<dyn IndexStore>, Option<Arc<dyn IndexWriteStore>>, String), StoreError> {
    let (base, name) = split_index_location(location);
    if name.is_empty() {
        return Err(StoreError::Config {
            location: location.to_string(),
            reason: "missing index file name".to_string(),
        });
    }
    match parse_url(&base) {
        Some(url) => match url.scheme() {
            "http" | "https" => {
                let opt = options_for(&base, true, cfg);
                let store = Arc::new(HttpIndexStore::new(&url, opt)?);
                Ok((store.clone(), Some(store), name))
            }
            scheme if EXTERNAL_SCHEMES.contains(&scheme) => Err(StoreError::Config {
                location: location.to_string(),
                reason: format!("scheme {scheme:?} requires an external transport"),
            }),
            scheme => Err(StoreError::Config {
                location: location.to_string(),
                reason: format!("unknown scheme {scheme:?}"),
            }),
        },
        None => {
            let store = Arc::new(LocalIndexStore::open(&base)?);
            Ok((store.clone(), Some(store), name))
        }
    }
}

/// Fetch and decode the index at `location`.
pub async fn read_index_file(location: &str, cfg: &Config) -> Result<Index, StoreError> {
    let (store, name) = index_store_from_location(location, cfg)?;
    store.get_index(&name).await
}

/// Encode and store `index` at `location`.
pub async fn store_index_file(
    index: &Index,
    location: &str,
    cfg: &Config,
) -> Result<(), StoreError> {
    let (store, name) = writable_index_store_from_location(location, cfg)?;
    store.store_index(&name, index).await
}

#[cfg(test)]
mod tests {
    use cask_cas::Chunk;
    use cask_types::ChunkId;
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_bare_path_is_local_store() {
        let dir = TempDir::new().unwrap();
        let store =
            store_from_location(dir.path().to_str().unwrap(), &Config::default()).unwrap();
        assert_eq!(store.location(), dir.path().display().to_string());
    }

    #[test]
    fn test_external_scheme_is_config_error() {
        for location in [
            "ssh://host/store",
            "sftp://host/store",
            "s3+https://host/bucket",
            "gs://bucket/prefix",
        ] {
            match store_from_location(location, &Config::default()) {
                Err(StoreError::Config { reason, .. }) => {
                    assert!(reason.contains("external transport"), "{location}: {reason}")
                }
                Ok(s) => panic!(
                    "{location}: expected Config error, got Ok(store at {})",
                    s.location()
                ),
                Err(e) => panic!("{location}: expected Config error, got {e:?}"),
            }
        }
    }

    #[test]
    fn test_unknown_scheme_rejected() {
        assert!(matches!(
            store_from_location("ftp://host/store", &Config::default()),
            Err(StoreError::Config { .. })
        ));
    }

    #[tokio::test]
    async fn test_router_queries_in_order() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let store_b =
            LocalStore::open(dir_b.path(), StoreOptions::default()).unwrap();
        let chunk = Chunk::from_data(&b"routed"[..]);
        crate::traits::WriteStore::store_chunk(&store_b, &chunk)
            .await
            .unwrap();

        let locations = [
            dir_a.path().to_str().unwrap().to_string(),
            dir_b.path().to_str().unwrap().to_string(),
        ];
        let router = multi_store_with_router(&locations, &Config::default()).unwrap();
        let got = router.get_chunk(chunk.id().unwrap()).await.unwrap();
        assert_eq!(got.uncompressed().unwrap().as_ref(), b"routed");
    }

    #[tokio::test]
    async fn test_failover_members_from_pipe_location() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let store_b = LocalStore::open(dir_b.path(), StoreOptions::default()).unwrap();
        let chunk = Chunk::from_data(&b"redundant"[..]);
        crate::traits::WriteStore::store_chunk(&store_b, &chunk)
            .await
            .unwrap();

        let location = format!(
            "{}|{}",
            dir_a.path().display(),
            dir_b.path().display()
        );
        let group = multi_store_with_router(&[location], &Config::default()).unwrap();
        group.get_chunk(chunk.id().unwrap()).await.unwrap();
    }

    #[tokio::test]
    async fn test_cache_attachment_populates_cache() {
        let primary_dir = TempDir::new().unwrap();
        let cache_dir = TempDir::new().unwrap();
        let primary = LocalStore::open(primary_dir.path(), StoreOptions::default()).unwrap();
        let chunk = Chunk::from_data(&b"read through"[..]);
        crate::traits::WriteStore::store_chunk(&primary, &chunk)
            .await
            .unwrap();

        let store = multi_store_with_cache(
            &[primary_dir.path().to_str().unwrap()],
            Some(cache_dir.path().to_str().unwrap()),
            &Config::default(),
        )
        .unwrap();
        store.get_chunk(chunk.id().unwrap()).await.unwrap();

        let cache = LocalStore::open(cache_dir.path(), StoreOptions::default()).unwrap();
        assert!(cache.has_chunk(chunk.id().unwrap()).await.unwrap());
    }

    #[test]
    fn test_split_index_location_paths() {
        let (dir, name) = split_index_location("/srv/indexes/blob.caibx");
        assert_eq!(dir, "/srv/indexes");
        assert_eq!(name, "blob.caibx");

        let (dir, name) = split_index_location("blob.caibx");
        assert_eq!(dir, ".");
        assert_eq!(name, "blob.caibx");
    }

    #[test]
    fn test_split_index_location_urls() {
        let (base, name) = split_index_location("https://idx.example.com/pub/blob.caibx");
        assert_eq!(base, "https://idx.example.com/pub/");
        assert_eq!(name, "blob.caibx");
    }

    #[tokio::test]
    async fn test_index_file_roundtrip() {
        let dir = TempDir::new().unwrap();
        let location = dir.path().join("blob.caibx");
        let location = location.to_str().unwrap();

        let index = Index::from_chunks(16, 64, 256, [(ChunkId::from_data(b"c"), 42)]);
        store_index_file(&index, location, &Config::default())
            .await
            .unwrap();
        let loaded = read_index_file(location, &Config::default()).await.unwrap();
        assert_eq!(loaded, index);
    }

    #[test]
    fn test_read_store_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stores.json");
        std::fs::write(
            &path,
            r#"{"stores": ["/srv/store1", "https://x/store"], "cache": "/var/cache/chunks"}"#,
        )
        .unwrap();

        let (stores, cache) = read_store_file(&path).unwrap();
        assert_eq!(stores, vec!["/srv/store1", "https://x/store"]);
        assert_eq!(cache.as_deref(), Some("/var/cache/chunks"));
    }

    #[test]
    fn test_store_file_without_cache() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stores.json");
        std::fs::write(&path, r#"{"stores": ["/srv/store1"]}"#).unwrap();
        let (stores, cache) = read_store_file(&path).unwrap();
        assert_eq!(stores.len(), 1);
        assert_eq!(cache, None);
    }
}
