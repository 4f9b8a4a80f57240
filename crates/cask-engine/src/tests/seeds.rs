//! Seeded reassembly and cross-store copy.

use std::io::Cursor;
use std::sync::Arc;

use cask_store::{MemoryStore, Store};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::make::{MakeOptions, make};
use crate::seed::{FileSeed, Seed};
use crate::{assemble, copy, extract};

use super::helpers::{CountingStore, test_data};

#[tokio::test]
async fn test_seeded_extract_fetches_only_changed_chunks() {
    let size = 2 * 1024 * 1024;
    let v1 = test_data(size);
    let mut v2 = v1.clone();
    for b in &mut v2[size / 2..size / 2 + 4096] {
        *b = b.wrapping_add(1);
    }

    let opts = MakeOptions::default();
    let cancel = CancellationToken::new();
    let store = Arc::new(MemoryStore::new());
    let i1 = make(Cursor::new(v1.clone()), store.clone(), &opts, &cancel)
        .await
        .unwrap();
    let i2 = make(Cursor::new(v2.clone()), store.clone(), &opts, &cancel)
        .await
        .unwrap();

    // Materialize the prior version to act as the seed file.
    let dir = TempDir::new().unwrap();
    let prior = dir.path().join("v1");
    extract(&prior, &i1, store.clone(), 8, &cancel).await.unwrap();
    assert_eq!(std::fs::read(&prior).unwrap(), v1);

    let counting = Arc::new(CountingStore::new(store.clone()));
    let seeds: Vec<Arc<dyn Seed>> = vec![Arc::new(FileSeed::new(&prior, i1))];
    let out = dir.path().join("v2");
    let stats = assemble(&out, &i2, counting.clone(), seeds, 8, &cancel)
        .await
        .unwrap();

    assert_eq!(std::fs::read(&out).unwrap(), v2);
    assert!(
        counting.gets() <= 8,
        "seeded run should only fetch the chunks near the edit, fetched {}",
        counting.gets()
    );
    assert_eq!(stats.fetched_chunks, counting.gets());
    assert_eq!(
        stats.fetched_chunks + stats.cloned_chunks,
        i2.chunks.len(),
        "every chunk is either fetched or cloned"
    );
}

#[tokio::test]
async fn test_seeded_and_unseeded_outputs_identical() {
    let data = test_data(1024 * 1024 + 313);
    let opts = MakeOptions::default();
    let cancel = CancellationToken::new();
    let store = Arc::new(MemoryStore::new());
    let index = make(Cursor::new(data.clone()), store.clone(), &opts, &cancel)
        .await
        .unwrap();

    let dir = TempDir::new().unwrap();
    let plain = dir.path().join("plain");
    extract(&plain, &index, store.clone(), 8, &cancel).await.unwrap();

    let seeds: Vec<Arc<dyn Seed>> = vec![Arc::new(FileSeed::new(&plain, index.clone()))];
    let seeded = dir.path().join("seeded");
    assemble(&seeded, &index, store, seeds, 8, &cancel)
        .await
        .unwrap();

    assert_eq!(std::fs::read(&plain).unwrap(), data);
    assert_eq!(std::fs::read(&seeded).unwrap(), data);
}

#[tokio::test]
async fn test_fully_seeded_extract_needs_no_store() {
    let data = test_data(1024 * 1024);
    let opts = MakeOptions::default();
    let cancel = CancellationToken::new();
    let store = Arc::new(MemoryStore::new());
    let index = make(Cursor::new(data.clone()), store.clone(), &opts, &cancel)
        .await
        .unwrap();

    let dir = TempDir::new().unwrap();
    let prior = dir.path().join("prior");
    extract(&prior, &index, store, 8, &cancel).await.unwrap();

    // An identical prior version means the store never gets asked.
    let empty = Arc::new(MemoryStore::new());
    let counting = Arc::new(CountingStore::new(empty));
    let seeds: Vec<Arc<dyn Seed>> = vec![Arc::new(FileSeed::new(&prior, index.clone()))];
    let out = dir.path().join("out");
    assemble(&out, &index, counting.clone(), seeds, 8, &cancel)
        .await
        .unwrap();

    assert_eq!(std::fs::read(&out).unwrap(), data);
    assert_eq!(counting.gets(), 0);
}

#[tokio::test]
async fn test_repeated_content_assembles_correctly() {
    // The same block repeated: the self-seed may clone any suffix of
    // these chunks, and the result must be identical either way.
    let block = test_data(256 * 1024);
    let mut data = Vec::new();
    for _ in 0..8 {
        data.extend_from_slice(&block);
    }

    let opts = MakeOptions::default();
    let cancel = CancellationToken::new();
    let store = Arc::new(MemoryStore::new());
    let index = make(Cursor::new(data.clone()), store.clone(), &opts, &cancel)
        .await
        .unwrap();

    let dir = TempDir::new().unwrap();
    for n in [1usize, 4] {
        let out = dir.path().join(format!("out-{n}"));
        extract(&out, &index, store.clone(), n, &cancel).await.unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), data, "with {n} workers");
    }
}

#[tokio::test]
async fn test_copy_between_stores() {
    let data = test_data(512 * 1024);
    let opts = MakeOptions::default();
    let cancel = CancellationToken::new();
    let src = Arc::new(MemoryStore::new());
    let index = make(Cursor::new(data.clone()), src.clone(), &opts, &cancel)
        .await
        .unwrap();

    let ids: Vec<_> = index.chunks.iter().map(|c| c.id).collect();
    let dst = Arc::new(MemoryStore::new());
    let copied = copy(ids.clone(), src.clone(), dst.clone(), 4, &cancel)
        .await
        .unwrap();
    assert_eq!(copied, dst.len());
    for id in &ids {
        assert!(dst.has_chunk(*id).await.unwrap());
    }

    // Copying again moves nothing.
    let copied = copy(ids, src, dst.clone(), 4, &cancel).await.unwrap();
    assert_eq!(copied, 0);

    // The copy is complete enough to extract from.
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("from-copy");
    extract(&out, &index, dst, 4, &cancel).await.unwrap();
    assert_eq!(std::fs::read(&out).unwrap(), data);
}
