//! Checkpoint hot path benchmarks.
//!
//! Run with: `cargo bench --bench checkpoint_tracker`
//! Compare baselines: `cargo bench --bench checkpoint_tracker -- --baseline main`
//!
//! Every write passes through seqNo completion on each copy and through
//! the primary's global checkpoint computation, so these two dominate the
//! per-operation bookkeeping cost.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use shard_recovery::replication::ReplicationTracker;
use shard_recovery::seqno::LocalCheckpointTracker;
use shard_recovery::shard::{AllocationId, RecoverySource, RoutingTable, ShardId, ShardRouting};
use std::collections::BTreeSet;

/// In-order completion: the checkpoint advances on every call
fn bench_complete_in_order(c: &mut Criterion) {
    let mut group = c.benchmark_group("complete_in_order");
    group.throughput(Throughput::Elements(1_000));
    group.bench_function("1k_ops", |b| {
        b.iter(|| {
            let mut tracker = LocalCheckpointTracker::new();
            for _ in 0..1_000 {
                let seq_no = tracker.generate_seq_no();
                tracker.mark_seq_no_as_completed(black_box(seq_no)).ok();
            }
            black_box(tracker.local_checkpoint())
        })
    });
    group.finish();
}

/// Out-of-order completion with windows of various widths
fn bench_complete_out_of_order(c: &mut Criterion) {
    let mut group = c.benchmark_group("complete_out_of_order");
    group.throughput(Throughput::Elements(1_000));
    for window in [2i64, 16, 128] {
        group.bench_function(format!("window_{}", window), |b| {
            b.iter(|| {
                let mut tracker = LocalCheckpointTracker::new();
                let mut base = 0;
                while base < 1_000 {
                    // Complete each window back to front
                    for seq_no in (base..base + window).rev() {
                        tracker.advance_max_seq_no(seq_no);
                        tracker.mark_seq_no_as_completed(black_box(seq_no)).ok();
                    }
                    base += window;
                }
                black_box(tracker.local_checkpoint())
            })
        });
    }
    group.finish();
}

/// Global checkpoint recomputation with growing replica counts
fn bench_global_checkpoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("global_checkpoint");
    group.throughput(Throughput::Elements(1));
    let shard_id = ShardId::new("bench", 0);

    for replicas in [1usize, 4, 16] {
        let ids: Vec<AllocationId> = (0..=replicas)
            .map(|i| AllocationId::new(format!("copy-{}", i)))
            .collect();
        let mut table = RoutingTable::new(shard_id.clone());
        for (i, id) in ids.iter().enumerate() {
            table = table.with(
                ShardRouting::initializing(shard_id.clone(), id.clone(), format!("node-{}", i), i == 0, RecoverySource::Peer)
                    .moved_to_started(),
            );
        }
        let in_sync: BTreeSet<AllocationId> = ids.iter().cloned().collect();
        let mut tracker = ReplicationTracker::new(ids[0].clone(), -1);
        tracker.update_from_cluster_state(1, &in_sync, &table);
        tracker.activate_primary_mode(-1);

        group.bench_function(format!("replicas_{}", replicas), |b| {
            let mut checkpoint = 0;
            b.iter(|| {
                for id in &ids {
                    tracker.update_local_checkpoint(id, checkpoint).ok();
                }
                checkpoint += 1;
                black_box(tracker.global_checkpoint())
            })
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_complete_in_order,
    bench_complete_out_of_order,
    bench_global_checkpoint
);
criterion_main!(benches);
