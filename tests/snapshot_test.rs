//! Snapshot Recovery Integration Tests
//!
//! Snapshots taken from a live primary and restored into a fresh copy.

use bytes::Bytes;
use shard_recovery::recovery::RecoveryState;
use shard_recovery::shard::{
    AllocationId, IndexShard, Operation, RecoverySource, RoutingTable, ShardId, ShardRouting,
    ShardState,
};
use parking_lot::Mutex;
use shard_recovery::snapshot::{
    BlobStoreRepository, InMemoryObjectStore, LocalFsObjectStore, ObjectFuture, ObjectMeta, ObjectStore,
};
use shard_recovery::store::{is_index_file, Store};
use shard_recovery::{ShardConfig, ShardError, SimulatedCluster};
use std::collections::BTreeSet;
use std::sync::Arc;

fn shard_id() -> ShardId {
    ShardId::new("idx", 0)
}

async fn cluster_with_docs(count: usize) -> SimulatedCluster {
    let cluster = SimulatedCluster::new(shard_id(), ShardConfig::test());
    cluster.start_primary("node-p").unwrap();
    for i in 0..count {
        cluster
            .write(Operation::index(format!("doc-{}", i), Bytes::from(format!("v{}", i))))
            .await
            .unwrap();
    }
    cluster
}

/// A new primary allocation that restores from `snapshot`, left in RECOVERING
fn restoring_shard(repository: &str, snapshot: &str) -> IndexShard {
    let routing = ShardRouting::initializing(
        shard_id(),
        AllocationId::new("restored"),
        "node-r",
        true,
        RecoverySource::Snapshot {
            repository: repository.to_string(),
            snapshot: snapshot.to_string(),
        },
    );
    let shard = IndexShard::new(routing.clone(), Store::new(), ShardConfig::test());
    let in_sync: BTreeSet<AllocationId> = [routing.allocation_id.clone()].into_iter().collect();
    shard
        .update_shard_state(
            routing.clone(),
            1,
            None,
            1,
            &in_sync,
            &RoutingTable::new(shard_id()).with(routing.clone()),
        )
        .unwrap();
    shard
        .mark_as_recovering("restore", RecoveryState::new(&routing, None))
        .unwrap();
    shard
}

fn start(shard: &IndexShard) {
    let started = shard.routing_entry().moved_to_started();
    let in_sync: BTreeSet<AllocationId> = [started.allocation_id.clone()].into_iter().collect();
    shard
        .update_shard_state(
            started.clone(),
            1,
            None,
            2,
            &in_sync,
            &RoutingTable::new(shard_id()).with(started),
        )
        .unwrap();
}

async fn restore_and_compare<S: ObjectStore>(repository: &BlobStoreRepository<S>) {
    let cluster = cluster_with_docs(12).await;
    let primary = cluster.primary().unwrap();
    primary.snapshot_to(repository, "snap-1").await.unwrap();

    let restored = restoring_shard(repository.name(), "snap-1");
    restored.recover_from_snapshot(repository, "snap-1").await.unwrap();
    assert_eq!(restored.state(), ShardState::PostRecovery);
    start(&restored);
    assert_eq!(restored.state(), ShardState::Started);
    assert_eq!(restored.doc_ids(), primary.doc_ids());
    assert_eq!(restored.get("doc-3"), Some(Bytes::from_static(b"v3")));
    assert_eq!(restored.local_checkpoint(), 11);
    assert!(restored.store().temp_files().is_empty());

    let recovery = restored.recovery_state().unwrap();
    assert!(recovery.files.total_files > 0);
    assert_eq!(recovery.files.recovered_files, recovery.files.total_files);

    // The restored copy can lead its own group
    restored
        .apply_operation_on_primary(Operation::index("new", Bytes::from_static(b"n")), 1)
        .unwrap();
    assert_eq!(restored.local_checkpoint(), 12);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_snapshot_restore_in_memory() {
    let repository = BlobStoreRepository::new("mem", InMemoryObjectStore::new());
    restore_and_compare(&repository).await;
}

#[tokio::test]
async fn test_snapshot_restore_local_fs() {
    let dir = tempfile::tempdir().unwrap();
    let repository = BlobStoreRepository::new("fs", LocalFsObjectStore::new(dir.path()));
    restore_and_compare(&repository).await;
}

#[tokio::test]
async fn test_later_snapshot_reuses_blobs() {
    let repository = BlobStoreRepository::new("mem", InMemoryObjectStore::new());
    let cluster = cluster_with_docs(5).await;
    let primary = cluster.primary().unwrap();
    primary.snapshot_to(&repository, "s1").await.unwrap();
    for i in 5..8 {
        cluster
            .write(Operation::index(format!("doc-{}", i), Bytes::from_static(b"x")))
            .await
            .unwrap();
    }
    primary.snapshot_to(&repository, "s2").await.unwrap();

    let first = repository.read_manifest(&shard_id(), "s1").await.unwrap();
    let second = repository.read_manifest(&shard_id(), "s2").await.unwrap();
    assert!(second.incremental_file_count < second.files.len());
    assert!(second.files.len() > first.files.len());
    assert_eq!(repository.list_snapshots(&shard_id()).await.unwrap(), vec!["s1", "s2"]);

    // The older snapshot still restores to its own point in time
    let restored = restoring_shard("mem", "s1");
    restored.recover_from_snapshot(&repository, "s1").await.unwrap();
    assert_eq!(restored.doc_count(), 5);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_corrupted_snapshot_fails_restore() {
    let objects = InMemoryObjectStore::new();
    let repository = BlobStoreRepository::new("mem", objects.clone());
    let cluster = cluster_with_docs(6).await;
    cluster
        .primary()
        .unwrap()
        .snapshot_to(&repository, "snap")
        .await
        .unwrap();
    let manifest = repository.read_manifest(&shard_id(), "snap").await.unwrap();
    for file in &manifest.files {
        objects.corrupt(&format!("indices/idx/0/{}", file.blob));
    }

    let restored = restoring_shard("mem", "snap");
    let err = restored
        .recover_from_snapshot(&repository, "snap")
        .await
        .unwrap_err();
    assert!(matches!(err, ShardError::Recovery(_)));
    assert_eq!(restored.state(), ShardState::Closed);
    assert!(restored.store().temp_files().is_empty());
    assert_eq!(restored.store().latest_commit_generation(), None);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_missing_snapshot_fails_restore() {
    let repository = BlobStoreRepository::new("mem", InMemoryObjectStore::new());
    let restored = restoring_shard("mem", "never-taken");
    assert!(restored
        .recover_from_snapshot(&repository, "never-taken")
        .await
        .is_err());
    assert_eq!(restored.state(), ShardState::Closed);
}

#[tokio::test]
async fn test_snapshot_requires_started_copy() {
    let repository = BlobStoreRepository::new("mem", InMemoryObjectStore::new());
    let restoring = restoring_shard("mem", "x");
    let err = restoring.snapshot_to(&repository, "x").await.unwrap_err();
    assert!(matches!(
        err,
        ShardError::IllegalState {
            state: ShardState::Recovering,
            ..
        }
    ));
}

/// Closes the restoring shard as soon as the first blob is fetched
struct CloseOnFirstBlob {
    inner: InMemoryObjectStore,
    shard: Mutex<Option<Arc<IndexShard>>>,
}

impl ObjectStore for CloseOnFirstBlob {
    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> ObjectFuture<'a, ()> {
        self.inner.put(key, data)
    }

    fn get<'a>(&'a self, key: &'a str) -> ObjectFuture<'a, Vec<u8>> {
        if !key.contains("snap-") {
            if let Some(shard) = self.shard.lock().take() {
                shard.close("allocation cancelled");
            }
        }
        self.inner.get(key)
    }

    fn exists<'a>(&'a self, key: &'a str) -> ObjectFuture<'a, bool> {
        self.inner.exists(key)
    }

    fn delete<'a>(&'a self, key: &'a str) -> ObjectFuture<'a, ()> {
        self.inner.delete(key)
    }

    fn list<'a>(&'a self, prefix: &'a str) -> ObjectFuture<'a, Vec<ObjectMeta>> {
        self.inner.list(prefix)
    }

    fn rename<'a>(&'a self, from: &'a str, to: &'a str) -> ObjectFuture<'a, ()> {
        self.inner.rename(from, to)
    }
}

#[tokio::test]
async fn test_close_during_restore_leaves_no_commit() {
    let objects = InMemoryObjectStore::new();
    let cluster = cluster_with_docs(6).await;
    cluster
        .primary()
        .unwrap()
        .snapshot_to(&BlobStoreRepository::new("mem", objects.clone()), "snap")
        .await
        .unwrap();

    let restored = Arc::new(restoring_shard("mem", "snap"));
    let repository = BlobStoreRepository::new(
        "mem",
        CloseOnFirstBlob {
            inner: objects,
            shard: Mutex::new(Some(Arc::clone(&restored))),
        },
    );
    let err = restored
        .recover_from_snapshot(&repository, "snap")
        .await
        .unwrap_err();

    assert!(matches!(err, ShardError::Recovery(_)));
    assert_eq!(restored.state(), ShardState::Closed);
    assert!(restored.store().temp_files().is_empty());
    assert!(restored.store().list_matching(is_index_file).is_empty());
    assert_eq!(restored.store().latest_commit_generation(), None);
    cluster.shutdown().await;
}
