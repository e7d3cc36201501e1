//! Peer Recovery Integration Tests
//!
//! A replica joins a live primary, either by copying files or by replaying
//! only the operations it missed, and can be cancelled half way through.

use bytes::Bytes;
use shard_recovery::shard::{
    AllocationId, Operation, RecoverySource, RoutingTable, ShardId, ShardRouting, ShardState,
};
use shard_recovery::transport::{LocalPeerRecoverySource, PeerRecoverySource, SimulatedPeerRecoverySource};
use shard_recovery::{ShardConfig, SimulatedCluster};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn cluster() -> SimulatedCluster {
    SimulatedCluster::new(ShardId::new("idx", 0), ShardConfig::test())
}

async fn write_docs(cluster: &SimulatedCluster, range: std::ops::Range<usize>) {
    for i in range {
        cluster
            .write(Operation::index(format!("doc-{}", i), Bytes::from(format!("v{}", i))))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_replica_joins_and_becomes_in_sync() {
    let cluster = cluster();
    cluster.start_primary("node-a").unwrap();
    cluster
        .write(Operation::index("x", Bytes::from_static(b"1")))
        .await
        .unwrap();
    cluster
        .write(Operation::index("y", Bytes::from_static(b"2")))
        .await
        .unwrap();

    let replica_id = cluster.add_replica("node-b").unwrap();
    let response = cluster.recover_replica(&replica_id).await.unwrap();
    assert!(!response.ops_based);
    assert!(!response.phase1_file_names.is_empty());
    cluster.mark_started(&replica_id).unwrap();

    let replica = cluster.copy(&replica_id).unwrap();
    let primary = cluster.primary().unwrap();
    assert_eq!(replica.state(), ShardState::Started);
    assert_eq!(replica.local_checkpoint(), 1);
    assert!(primary.in_sync_allocation_ids().contains(&replica_id));
    assert!(cluster.in_sync().contains(&replica_id));
    assert_eq!(replica.get("x"), Some(Bytes::from_static(b"1")));
    assert_eq!(replica.get("y"), Some(Bytes::from_static(b"2")));
    assert!(replica.store().temp_files().is_empty());

    // Live writes now reach the replica
    cluster
        .write(Operation::index("z", Bytes::from_static(b"3")))
        .await
        .unwrap();
    assert_eq!(replica.local_checkpoint(), 2);
    assert_eq!(primary.global_checkpoint(), 2);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_recovery_cancelled_by_superseding_routing() {
    let cluster = cluster();
    cluster.start_primary("node-a").unwrap();
    write_docs(&cluster, 0..40).await;

    let replica_id = cluster.add_replica("node-b").unwrap();
    let replica = cluster.copy(&replica_id).unwrap();
    let routing = replica.routing_entry();

    // After the first chunk the allocator moves the copy elsewhere
    let superseding = ShardRouting::initializing(
        ShardId::new("idx", 0),
        AllocationId::new("moved"),
        "node-b",
        false,
        RecoverySource::Peer,
    );
    let version = cluster.version() + 1;
    let table = RoutingTable::new(ShardId::new("idx", 0)).with(superseding.clone());
    let term = cluster.primary_term();
    let target = Arc::clone(&replica);
    let fired = Arc::new(AtomicBool::new(false));
    let fired_in_hook = Arc::clone(&fired);

    let local: Arc<dyn PeerRecoverySource> =
        Arc::new(LocalPeerRecoverySource::new(cluster.primary().unwrap()));
    let source = SimulatedPeerRecoverySource::new(local, 1, Duration::from_millis(1))
        .with_chunk_hook(move |sent| {
            if sent == 1 && !fired_in_hook.swap(true, Ordering::SeqCst) {
                let _ = target.update_shard_state(
                    superseding.clone(),
                    term,
                    None,
                    version,
                    &BTreeSet::new(),
                    &table,
                );
            }
        });

    let err = cluster.recover_replica_from(&replica_id, &source).await;
    assert!(err.is_err());
    assert!(fired.load(Ordering::SeqCst));
    assert_eq!(replica.state(), ShardState::Closed);
    assert!(replica.store().temp_files().is_empty());
    assert_eq!(replica.store().latest_commit_generation(), None);
    assert!(cluster.copy(&replica_id).is_none());

    let primary = cluster.primary().unwrap();
    assert!(primary.checkpoint_state(&routing.allocation_id).is_none());
    assert!(!primary.in_sync_allocation_ids().contains(&replica_id));

    // The primary keeps serving writes and can still grow a replica
    write_docs(&cluster, 40..45).await;
    let again = cluster.add_started_replica("node-c").await.unwrap();
    assert_eq!(cluster.copy(&again).unwrap().doc_count(), primary.doc_count());
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_restarted_replica_recovers_from_operations() {
    let cluster = cluster();
    let primary_id = cluster.start_primary("node-a").unwrap();
    let replica_id = cluster.add_started_replica("node-b").await.unwrap();
    write_docs(&cluster, 0..10).await;

    // Checkpoint sync, then a safe commit on the replica
    let primary = cluster.copy(&primary_id).unwrap();
    let replica = cluster.copy(&replica_id).unwrap();
    replica.update_global_checkpoint_on_replica(primary.global_checkpoint());
    let commit = replica.flush().unwrap();
    assert!(commit.is_safe());

    let store = replica.store().clone();
    cluster.fail_copy(&replica_id, "node restarted");
    store.simulate_crash();
    write_docs(&cluster, 10..15).await;

    let rejoined = cluster.add_replica_with_store("node-b", store).unwrap();
    let response = cluster.recover_replica(&rejoined).await.unwrap();
    assert!(response.ops_based);
    assert!(response.phase1_file_names.is_empty());
    assert_eq!(response.translog_ops, 5);
    cluster.mark_started(&rejoined).unwrap();

    let copy = cluster.copy(&rejoined).unwrap();
    assert_eq!(copy.local_checkpoint(), primary.local_checkpoint());
    assert_eq!(copy.doc_ids(), primary.doc_ids());
    assert!(cluster.in_sync().contains(&rejoined));
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_recovery_from_closed_primary_fails_cleanly() {
    let cluster = cluster();
    cluster.start_primary("node-a").unwrap();
    write_docs(&cluster, 0..5).await;
    let primary = cluster.primary().unwrap();
    let replica_id = cluster.add_replica("node-b").unwrap();
    let replica = cluster.copy(&replica_id).unwrap();

    primary.close("node lost");
    let err = cluster.recover_replica(&replica_id).await;
    assert!(err.is_err());
    assert_eq!(replica.state(), ShardState::Closed);
    assert!(replica.store().temp_files().is_empty());
    cluster.shutdown().await;
}
