//! Chunked archives: tree → catar → store → catar → tree.

use std::io::Cursor;
use std::sync::Arc;

use cask_catar::{LocalFs, UntarOptions, tar, untar};
use cask_store::MemoryStore;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::make::{MakeOptions, make};
use crate::extract;

#[tokio::test]
async fn test_tree_through_chunk_store_roundtrip() {
    let src = TempDir::new().unwrap();
    std::fs::create_dir(src.path().join("docs")).unwrap();
    std::fs::write(src.path().join("docs/readme"), b"chunked tree").unwrap();
    std::fs::write(src.path().join("data"), vec![7u8; 300_000]).unwrap();

    // Archive the tree and chunk the archive like any other blob.
    let mut archive = Vec::new();
    tar(&mut archive, src.path()).unwrap();

    let store = Arc::new(MemoryStore::new());
    let cancel = CancellationToken::new();
    let index = make(
        Cursor::new(archive.clone()),
        store.clone(),
        &MakeOptions::default(),
        &cancel,
    )
    .await
    .unwrap();
    assert_eq!(index.total_size(), archive.len() as u64);

    // Reassemble the archive from chunks and unpack it.
    let dir = TempDir::new().unwrap();
    let restored_archive = dir.path().join("tree.catar");
    extract(&restored_archive, &index, store, 4, &cancel)
        .await
        .unwrap();
    assert_eq!(std::fs::read(&restored_archive).unwrap(), archive);

    let dst = TempDir::new().unwrap();
    let mut fs = LocalFs;
    untar(
        std::fs::File::open(&restored_archive).unwrap(),
        dst.path(),
        &mut fs,
        &UntarOptions {
            no_same_owner: true,
            no_same_permissions: false,
        },
    )
    .unwrap();

    assert_eq!(
        std::fs::read(dst.path().join("docs/readme")).unwrap(),
        b"chunked tree"
    );
    assert_eq!(
        std::fs::read(dst.path().join("data")).unwrap(),
        vec![7u8; 300_000]
    );
}
