//! Retention, garbage collection and key lifecycle through the engine.

mod common;

use chrono::{Duration, Utc};
use common::{day, TestStore};
use snapguard_store::fingerprint::blake3_hash;
use snapguard_store::{
    AuditFilter, AuditOperation, ChunkingMode, KeyRole, KeyStatus, RetentionClass,
    RetentionPolicy, SnapshotState, StoreError,
};
use tempfile::TempDir;

fn policy(daily: u32, weekly: u32, monthly: u32) -> RetentionPolicy {
    RetentionPolicy { daily, weekly, monthly }
}

#[tokio::test]
async fn test_forty_daily_snapshots_pruned_to_two_one_one() {
    let store = TestStore::with_config(|c| c.chunking.mode = ChunkingMode::File);
    let mut ids = Vec::new();
    for i in 0..40 {
        let content = format!("day {i}");
        let id = store
            .snapshot(&[("log", content.as_bytes()), ("static", b"unchanged")], day(i))
            .await;
        ids.push(id);
    }
    let now = Utc::now();
    let report = store.engine.prune_at(Some(&policy(2, 1, 1)), now).await.unwrap();

    assert_eq!(report.deleted.len(), 36);
    assert_eq!(report.kept.len(), 4);
    assert!(report.failed.is_empty());
    assert!(report.kept.values().all(|classes| classes.len() == 1));
    let classes: Vec<RetentionClass> = report.kept.values().flatten().copied().collect();
    for class in [RetentionClass::Daily, RetentionClass::Weekly, RetentionClass::Monthly] {
        let expected = if class == RetentionClass::Daily { 2 } else { 1 };
        assert_eq!(classes.iter().filter(|c| **c == class).count(), expected, "{class:?}");
    }
    assert!(report.kept.contains_key(&ids[0]));
    assert!(report.kept.contains_key(&ids[1]));

    let listed: Vec<String> = store.engine.list_snapshots().into_iter().map(|s| s.id).collect();
    assert_eq!(listed.len(), 4);
    for id in &report.deleted {
        assert_eq!(store.engine.snapshot_state(id), Some(SnapshotState::Deleted));
        assert!(!listed.contains(id));
    }

    // Dropped per-day chunks go once the grace period is over; shared ones stay.
    let sweep = store.engine.gc_sweep(now + Duration::hours(2)).await.unwrap();
    assert_eq!(sweep.purged.len(), 36);
    assert_eq!(store.engine.content().refcount(&blake3_hash(b"unchanged")), Some(4));
    for id in &listed {
        assert!(store.engine.verify_snapshot(id).await.unwrap().is_ok());
    }

    let deletes = store.engine.audit().query(&AuditFilter {
        operation: Some(AuditOperation::ManifestDelete),
        ..AuditFilter::default()
    });
    assert_eq!(deletes.len(), 36);
}

#[tokio::test]
async fn test_prune_inside_window_deletes_nothing() {
    let store = TestStore::new();
    for i in 0..3 {
        store.snapshot(&[("f", format!("v{i}").as_bytes())], day(i)).await;
    }
    let chunks = store.stored_chunks();
    let report = store.engine.prune(None).await.unwrap();
    assert!(report.deleted.is_empty());
    assert_eq!(report.kept.len(), 3);
    let sweep = report.sweep.unwrap();
    assert!(sweep.purged.is_empty());
    assert_eq!(sweep.bytes_reclaimed, 0);
    assert_eq!(store.stored_chunks(), chunks);
}

#[tokio::test]
async fn test_invalid_policy_rejected() {
    let store = TestStore::new();
    assert!(matches!(
        store.engine.prune(Some(&policy(0, 0, 0))).await,
        Err(StoreError::RetentionPolicy(_))
    ));
}

#[tokio::test]
async fn test_referenced_chunk_survives_every_sweep() {
    let store = TestStore::with_config(|c| c.chunking.mode = ChunkingMode::File);
    let common_hash = blake3_hash(b"common");
    let only_a = blake3_hash(b"only in a");
    let _a = store
        .snapshot(&[("shared", b"common"), ("mine", b"only in a")], day(1))
        .await;
    let b = store.snapshot(&[("shared", b"common")], day(0)).await;
    assert_eq!(store.engine.content().refcount(&common_hash), Some(2));

    let t0 = Utc::now();
    let report = store.engine.prune_at(Some(&policy(1, 0, 0)), t0).await.unwrap();
    assert_eq!(report.refs_released, 2);
    assert_eq!(store.engine.content().refcount(&common_hash), Some(1));
    // Released just now: still inside the grace period.
    assert!(store.engine.content().contains(&only_a));

    for hours in 2..7 {
        store.engine.gc_sweep(t0 + Duration::hours(hours)).await.unwrap();
        assert!(store.engine.content().contains(&common_hash));
    }
    assert!(!store.engine.content().contains(&only_a));

    // A newer snapshot pushes B out; only then may "common" go.
    let _c = store.snapshot(&[("new", b"newest")], Utc::now()).await;
    let t1 = Utc::now();
    let report = store.engine.prune_at(Some(&policy(1, 0, 0)), t1).await.unwrap();
    assert_eq!(report.deleted, vec![b.clone()]);
    assert_eq!(store.engine.content().refcount(&common_hash), Some(0));

    let early = store.engine.gc_sweep(t1 + Duration::minutes(30)).await.unwrap();
    assert!(early.purged.is_empty());
    assert!(store.engine.content().contains(&common_hash));

    let late = store.engine.gc_sweep(t1 + Duration::hours(2)).await.unwrap();
    assert_eq!(late.purged, vec![common_hash]);
}

#[tokio::test]
async fn test_pinned_snapshot_is_never_pruned() {
    let store = TestStore::new();
    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(store.snapshot(&[("f", format!("{i}").as_bytes())], day(i)).await);
    }
    let oldest = ids[4].clone();
    assert!(store.engine.pin_snapshot(&oldest).unwrap());
    assert!(!store.engine.pin_snapshot(&oldest).unwrap());

    let report = store.engine.prune(Some(&policy(1, 0, 0))).await.unwrap();
    assert_eq!(report.deleted.len(), 3);
    assert_eq!(report.kept.get(&oldest), Some(&vec![RetentionClass::Pinned]));
    assert!(store.engine.snapshot(&oldest).unwrap().pinned);

    assert!(store.engine.unpin_snapshot(&oldest).unwrap());
    let report = store.engine.prune(Some(&policy(1, 0, 0))).await.unwrap();
    assert_eq!(report.deleted, vec![oldest]);

    let pins = store.engine.audit().query(&AuditFilter {
        operation: Some(AuditOperation::SnapshotPin),
        ..AuditFilter::default()
    });
    assert_eq!(pins.len(), 2);
}

#[tokio::test]
async fn test_rotation_keeps_old_chunks_readable() {
    let store = TestStore::with_config(|c| c.chunking.mode = ChunkingMode::File);
    let before = store.snapshot(&[("f", b"before rotation")], day(1)).await;
    let old_key = store
        .engine
        .keys()
        .get_active_key(KeyRole::Encryption)
        .unwrap()
        .id()
        .clone();

    let new_key = store.engine.rotate_key(KeyRole::Encryption).unwrap();
    assert_ne!(new_key, old_key);
    let after = store.snapshot(&[("f", b"after rotation")], day(0)).await;

    let content = store.engine.content();
    assert_eq!(content.chunk_key(&blake3_hash(b"before rotation")), Some(old_key.clone()));
    assert_eq!(content.chunk_key(&blake3_hash(b"after rotation")), Some(new_key.clone()));
    assert_eq!(store.engine.keys().record(&old_key).unwrap().status, KeyStatus::Retired);

    for (id, expected) in [(&before, &b"before rotation"[..]), (&after, &b"after rotation"[..])] {
        let target = TempDir::new().unwrap();
        store.engine.restore_snapshot(id, target.path(), None).await.unwrap();
        assert_eq!(std::fs::read(target.path().join("f")).unwrap(), expected);
    }
}

#[tokio::test]
async fn test_retired_key_purged_only_when_unreferenced() {
    let store = TestStore::with_config(|c| c.chunking.mode = ChunkingMode::File);
    let _old = store.snapshot(&[("f", b"sealed with the old key")], day(1)).await;
    let old_key = store
        .engine
        .keys()
        .get_active_key(KeyRole::Encryption)
        .unwrap()
        .id()
        .clone();
    let new_key = store.engine.rotate_key(KeyRole::Encryption).unwrap();
    let _new = store.snapshot(&[("f", b"sealed with the new key")], day(0)).await;

    assert!(matches!(
        store.engine.purge_key(&old_key),
        Err(StoreError::KeyInUse { references: 1, .. })
    ));
    assert!(matches!(
        store.engine.purge_key(&new_key),
        Err(StoreError::KeyInUse { .. })
    ));

    let t0 = Utc::now();
    store.engine.prune_at(Some(&policy(1, 0, 0)), t0).await.unwrap();
    // Zero-ref chunks in their grace period still pin the key.
    assert!(store.engine.purge_key(&old_key).is_err());

    store.engine.gc_sweep(t0 + Duration::hours(2)).await.unwrap();
    assert_eq!(store.engine.purge_unreferenced_keys().unwrap(), vec![old_key.clone()]);
    assert_eq!(store.engine.keys().record(&old_key).unwrap().status, KeyStatus::Purged);
    store.engine.purge_key(&old_key).unwrap();
}

#[tokio::test]
async fn test_prune_purges_keys_when_configured() {
    let store = TestStore::with_config(|c| {
        c.chunking.mode = ChunkingMode::File;
        c.gc.grace_period_secs = 0;
        c.gc.purge_unreferenced_keys = true;
    });
    store.snapshot(&[("f", b"old")], day(1)).await;
    let new_key = store.engine.rotate_key(KeyRole::Encryption).unwrap();
    let old_key = store
        .engine
        .keys()
        .list_keys()
        .into_iter()
        .find(|k| k.role == KeyRole::Encryption && k.id != new_key)
        .unwrap()
        .id;
    store.snapshot(&[("f", b"new")], day(0)).await;

    let report = store.engine.prune(Some(&policy(1, 0, 0))).await.unwrap();
    assert_eq!(report.deleted.len(), 1);
    assert_eq!(report.sweep.unwrap().purged, vec![blake3_hash(b"old")]);
    assert_eq!(report.purged_keys, vec![old_key]);
}

#[tokio::test]
async fn test_rotate_due_keys() {
    let store = TestStore::new();
    assert!(store.engine.rotate_due_keys().unwrap().is_empty());
    let rotated = store
        .engine
        .rotate_due_keys_at(Utc::now() + Duration::days(91))
        .unwrap();
    assert_eq!(rotated.len(), 2);
    let rotations = store.engine.audit().query(&AuditFilter {
        operation: Some(AuditOperation::KeyRotate),
        ..AuditFilter::default()
    });
    assert_eq!(rotations.len(), 2);
}

#[tokio::test]
async fn test_cancelled_snapshot_leaves_nothing_behind() {
    let store = TestStore::new();
    let token = store.engine.cancellation_token();
    token.cancel();
    let result = store
        .engine
        .create_snapshot_cancellable("home", vec![], common::entries(&[("f", b"x")]), Utc::now(), token)
        .await;
    assert!(matches!(result, Err(StoreError::Cancelled)));
    assert!(store.engine.list_snapshots().is_empty());
    assert_eq!(store.engine.content_stats().references, 0);
    assert!(store.root().join("manifests").read_dir().unwrap().next().is_none());
}
