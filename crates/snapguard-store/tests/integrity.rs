//! Tamper and corruption handling: verification, blocked restores, quarantine.

mod common;

use chrono::Utc;
use common::{read_tree, TestStore};
use snapguard_store::fingerprint::blake3_hash;
use snapguard_store::{ChunkBackend, ChunkingMode, StoreError};
use tempfile::TempDir;

fn manifest_path(store: &TestStore, id: &str) -> std::path::PathBuf {
    store.root().join("manifests").join(format!("{id}.json"))
}

#[tokio::test]
async fn test_tampered_manifest_blocks_restore() {
    let store = TestStore::new();
    let id = store
        .snapshot(&[("secret.txt", b"original"), ("other", b"data")], Utc::now())
        .await;

    let path = manifest_path(&store, &id);
    let mut raw = std::fs::read(&path).unwrap();
    let at = raw.len() / 3;
    raw[at] ^= 0x01;
    std::fs::write(&path, &raw).unwrap();

    assert!(matches!(
        store.engine.verify_snapshot(&id).await,
        Err(StoreError::TamperedManifest { .. })
    ));
    let target = TempDir::new().unwrap();
    assert!(matches!(
        store.engine.restore_snapshot(&id, target.path(), None).await,
        Err(StoreError::TamperedManifest { .. })
    ));
    assert!(read_tree(target.path()).is_empty());
}

#[tokio::test]
async fn test_corrupt_chunk_reported_and_restore_is_all_or_nothing() {
    let store = TestStore::with_config(|c| c.chunking.mode = ChunkingMode::File);
    let id = store
        .snapshot(&[("good.txt", b"fine content"), ("bad.txt", b"doomed content")], Utc::now())
        .await;

    let bad = blake3_hash(b"doomed content");
    assert!(store.backend.corrupt(&bad, |record| {
        let last = record.len() - 1;
        record[last] ^= 0xff;
    }));

    let report = store.engine.verify_snapshot(&id).await.unwrap();
    assert!(!report.is_ok());
    assert_eq!(report.chunks_checked, 2);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].hash, bad);

    let target = TempDir::new().unwrap();
    let err = store
        .engine
        .restore_snapshot(&id, target.path(), None)
        .await
        .unwrap_err();
    assert!(err.is_corruption(), "{err}");
    assert!(read_tree(target.path()).is_empty(), "partial restore left files behind");

    // The intact file can still be restored on its own.
    store
        .engine
        .restore_snapshot(&id, target.path(), Some("good.txt"))
        .await
        .unwrap();
    assert_eq!(std::fs::read(target.path().join("good.txt")).unwrap(), b"fine content");
}

#[tokio::test]
async fn test_missing_chunk_is_reported() {
    let store = TestStore::with_config(|c| c.chunking.mode = ChunkingMode::File);
    let id = store.snapshot(&[("f", b"vanishing")], Utc::now()).await;
    let hash = blake3_hash(b"vanishing");
    assert!(store.backend.delete(&hash).unwrap());

    let report = store.engine.verify_snapshot(&id).await.unwrap();
    assert_eq!(report.failures.len(), 1);
    let target = TempDir::new().unwrap();
    assert!(matches!(
        store.engine.restore_snapshot(&id, target.path(), None).await,
        Err(StoreError::ChunkMissing { .. })
    ));
}

#[tokio::test]
async fn test_unreadable_manifest_is_quarantined_on_open() {
    let store = TestStore::new();
    let keep = store.snapshot(&[("f", b"kept")], Utc::now()).await;
    let broken = store.snapshot(&[("g", b"broken")], Utc::now()).await;
    std::fs::write(manifest_path(&store, &broken), b"{ not json").unwrap();

    let store = store.reopen();
    assert_eq!(store.engine.quarantined(), vec![broken.clone()]);
    let listed: Vec<String> = store.engine.list_snapshots().into_iter().map(|s| s.id).collect();
    assert_eq!(listed, vec![keep]);

    // Its chunks may still be needed, so nothing is swept.
    assert!(store.engine.gc_sweep(Utc::now()).await.is_err());
    let report = store.engine.prune(None).await.unwrap();
    assert!(report.sweep.is_none());
    assert!(report.deleted.is_empty());
}
