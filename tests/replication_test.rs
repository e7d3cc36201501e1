//! Replication Group Integration Tests
//!
//! Global checkpoint movement across a three-copy group and fencing of a
//! primary that has been superseded.

use bytes::Bytes;
use shard_recovery::shard::{PrimaryOutcome, ReplicaOutcome, ShardId};
use shard_recovery::simulator::ClusterError;
use shard_recovery::transport::ReplicaRequest;
use shard_recovery::{IndexShard, Operation, ShardConfig, ShardError, ShardState, SimulatedCluster};

fn index(id: &str) -> Operation {
    Operation::index(id, Bytes::from_static(b"{}"))
}

/// Apply on the primary only, as if replication to every copy stalled
fn apply_on_primary_only(primary: &IndexShard, op: Operation) -> (Operation, i64) {
    match primary
        .apply_operation_on_primary(op, primary.primary_term())
        .unwrap()
    {
        PrimaryOutcome::Applied {
            operation,
            max_seq_no_of_updates_or_deletes,
            ..
        } => (operation, max_seq_no_of_updates_or_deletes),
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[tokio::test]
async fn test_global_checkpoint_follows_slowest_in_sync_copy() {
    let cluster = SimulatedCluster::new(ShardId::new("idx", 0), ShardConfig::test());
    cluster.start_primary("node-p").unwrap();
    let a = cluster.add_started_replica("node-a").await.unwrap();
    let b = cluster.add_started_replica("node-b").await.unwrap();

    for i in 0..3 {
        let result = cluster.write(index(&format!("doc-{}", i))).await.unwrap();
        assert_eq!(result.total_replicas, 2);
        assert_eq!(result.successful_replicas, 2);
    }
    let primary = cluster.primary().unwrap();
    assert_eq!(primary.global_checkpoint(), 2);

    // Ops 3..=5 reach B but not A
    let replica_b = cluster.copy(&b).unwrap();
    for i in 3..6 {
        let (op, msu) = apply_on_primary_only(&primary, index(&format!("doc-{}", i)));
        replica_b
            .apply_operation_on_replica(op, primary.primary_term(), msu)
            .unwrap();
    }
    primary
        .update_local_checkpoint_for_shard(&b, replica_b.local_checkpoint())
        .unwrap();
    assert_eq!(primary.local_checkpoint(), 5);
    assert_eq!(replica_b.local_checkpoint(), 5);
    assert_eq!(primary.global_checkpoint(), 2);

    // Dropping the laggard lets the checkpoint catch up
    assert!(cluster.fail_copy(&a, "lagging"));
    assert_eq!(primary.global_checkpoint(), 5);
    assert!(!primary.in_sync_allocation_ids().contains(&a));
    assert!(primary.in_sync_allocation_ids().contains(&b));
    assert!(primary.checkpoint_state(&a).is_none());

    // Removal is idempotent
    assert!(!cluster.fail_copy(&a, "lagging"));
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_global_checkpoint_never_moves_backwards_on_replicas() {
    let cluster = SimulatedCluster::new(ShardId::new("idx", 0), ShardConfig::test());
    cluster.start_primary("node-p").unwrap();
    let r = cluster.add_started_replica("node-r").await.unwrap();
    for i in 0..5 {
        cluster.write(index(&format!("doc-{}", i))).await.unwrap();
    }
    let replica = cluster.copy(&r).unwrap();
    let before = replica.global_checkpoint();
    assert!(before >= 3);
    replica.update_global_checkpoint_on_replica(0);
    assert_eq!(replica.global_checkpoint(), before);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_stale_primary_is_fenced_by_replica() {
    let cluster = SimulatedCluster::new(ShardId::new("idx", 0), ShardConfig::test());
    let p = cluster.start_primary("node-p").unwrap();
    let r = cluster.add_started_replica("node-r").await.unwrap();
    cluster.write(index("before")).await.unwrap();

    // A newer primary announced term 2 to the replica
    let old_primary = cluster.copy(&p).unwrap();
    let replica = cluster.copy(&r).unwrap();
    replica
        .apply_replica_request(&ReplicaRequest {
            shard_id: ShardId::new("idx", 0),
            primary_term: 2,
            operations: vec![],
            global_checkpoint: 0,
            max_seq_no_of_updates_or_deletes: 0,
        })
        .unwrap();
    assert_eq!(replica.primary_term(), 2);

    let err = cluster.write(index("after")).await.unwrap_err();
    assert!(matches!(
        err,
        ClusterError::Shard(ShardError::Fenced {
            held_term: 1,
            observed_term: 2
        })
    ));
    assert_eq!(old_primary.state(), ShardState::Closed);
    assert!(replica.get("after").is_none());
    assert!(matches!(cluster.primary(), Err(ClusterError::NoPrimary)));
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_redelivered_and_stale_replica_ops_leave_documents_alone() {
    let cluster = SimulatedCluster::new(ShardId::new("idx", 0), ShardConfig::test());
    cluster.start_primary("node-p").unwrap();
    let r = cluster.add_started_replica("node-r").await.unwrap();
    let primary = cluster.primary().unwrap();
    let replica = cluster.copy(&r).unwrap();

    let (v1, _) = apply_on_primary_only(&primary, Operation::index("x", Bytes::from_static(b"v1")));
    let (v2, msu) = apply_on_primary_only(&primary, Operation::index("x", Bytes::from_static(b"v2")));
    assert_eq!(msu, 1);

    // The update overtakes the original index
    assert_eq!(
        replica.apply_operation_on_replica(v2.clone(), 1, msu).unwrap(),
        ReplicaOutcome::Applied
    );
    assert_eq!(
        replica.apply_operation_on_replica(v2, 1, msu).unwrap(),
        ReplicaOutcome::Duplicate
    );
    assert_eq!(replica.local_checkpoint(), -1);
    assert_eq!(
        replica.apply_operation_on_replica(v1.clone(), 1, msu).unwrap(),
        ReplicaOutcome::Superseded
    );
    assert_eq!(replica.get("x"), Some(Bytes::from_static(b"v2")));
    assert_eq!(replica.local_checkpoint(), 1);
    assert_eq!(
        replica.apply_operation_on_replica(v1, 1, msu).unwrap(),
        ReplicaOutcome::Duplicate
    );
    assert_eq!(replica.get("x"), Some(Bytes::from_static(b"v2")));

    // A late index must not resurrect a deleted document
    let (created, _) = apply_on_primary_only(&primary, index("y"));
    let (deleted, msu) = apply_on_primary_only(&primary, Operation::delete("y"));
    assert_eq!(msu, 3);
    assert_eq!(
        replica.apply_operation_on_replica(deleted, 1, msu).unwrap(),
        ReplicaOutcome::Applied
    );
    assert_eq!(
        replica.apply_operation_on_replica(created, 1, msu).unwrap(),
        ReplicaOutcome::Superseded
    );
    assert!(replica.get("y").is_none());
    assert_eq!(replica.local_checkpoint(), 3);
    assert_eq!(replica.doc_ids(), primary.doc_ids());
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_replica_behind_on_mapping_asks_for_retry() {
    let cluster = SimulatedCluster::new(ShardId::new("idx", 0), ShardConfig::test());
    cluster.start_primary("node-p").unwrap();
    let r = cluster.add_started_replica("node-r").await.unwrap();
    cluster.write(index("a")).await.unwrap();
    let primary = cluster.primary().unwrap();
    let replica = cluster.copy(&r).unwrap();

    // Only the primary has the new mapping so far
    primary.update_mapping(1).unwrap();
    let (op, msu) = apply_on_primary_only(&primary, index("b").with_mapping_version(1));

    let err = replica
        .apply_operation_on_replica(op.clone(), 1, msu)
        .unwrap_err();
    assert_eq!(err, ShardError::RetryOnReplica { required: 1, current: 0 });
    assert!(err.is_retryable());
    assert!(!err.is_shard_failure());
    assert_eq!(replica.state(), ShardState::Started);
    assert_eq!(replica.local_checkpoint(), 0);
    assert_eq!(replica.max_seq_no(), 0);
    assert!(replica.get("b").is_none());

    replica.update_mapping(1).unwrap();
    assert_eq!(
        replica.apply_operation_on_replica(op, 1, msu).unwrap(),
        ReplicaOutcome::Applied
    );
    assert_eq!(replica.local_checkpoint(), 1);
    assert!(replica.get("b").is_some());
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_replica_rejects_seq_no_far_beyond_its_history() {
    let cluster = SimulatedCluster::new(ShardId::new("idx", 0), ShardConfig::test());
    cluster.start_primary("node-p").unwrap();
    let r = cluster.add_started_replica("node-r").await.unwrap();
    cluster.write(index("a")).await.unwrap();
    let replica = cluster.copy(&r).unwrap();

    let bogus = index("z").stamped(i64::MAX, 1);
    let err = replica
        .apply_operation_on_replica(bogus.clone(), 1, -1)
        .unwrap_err();
    assert!(matches!(err, ShardError::InvalidSequenceNumber(_)));
    assert!(!err.is_shard_failure());
    let err = replica
        .apply_replica_request(&ReplicaRequest {
            shard_id: ShardId::new("idx", 0),
            primary_term: 1,
            operations: vec![bogus],
            global_checkpoint: 0,
            max_seq_no_of_updates_or_deletes: -1,
        })
        .unwrap_err();
    assert!(matches!(err, ShardError::InvalidSequenceNumber(_)));

    assert_eq!(replica.state(), ShardState::Started);
    assert_eq!(replica.max_seq_no(), 0);
    assert_eq!(replica.local_checkpoint(), 0);
    assert!(replica.get("z").is_none());
    cluster.shutdown().await;
}
