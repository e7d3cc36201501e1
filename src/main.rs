use bytes::Bytes;
use shard_recovery::config::ShardConfig;
use shard_recovery::observability::{init_tracing, LoggingConfig};
use shard_recovery::recovery::dst::{
    run_recovery_dst_batch, summarize_recovery_dst_batch, RecoveryDSTConfig,
};
use shard_recovery::recovery::RecoveryState;
use shard_recovery::shard::{
    AllocationId, IndexShard, Operation, RecoverySource, RoutingTable, ShardId, ShardRouting,
};
use shard_recovery::snapshot::{BlobStoreRepository, InMemoryObjectStore};
use shard_recovery::store::Store;
use shard_recovery::SimulatedCluster;
use std::collections::BTreeSet;
use std::error::Error;
use std::path::PathBuf;

struct Args {
    config: Option<PathBuf>,
    dst_seeds: Option<u64>,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        config: None,
        dst_seeds: None,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                let path = iter.next().ok_or("--config needs a path")?;
                args.config = Some(PathBuf::from(path));
            }
            "--dst" => {
                let seeds = iter.next().ok_or("--dst needs a seed count")?;
                args.dst_seeds = Some(
                    seeds
                        .parse()
                        .map_err(|_| format!("invalid seed count: {}", seeds))?,
                );
            }
            other => return Err(format!("unknown argument: {}", other)),
        }
    }
    Ok(args)
}

fn main() -> Result<(), Box<dyn Error>> {
    init_tracing(&LoggingConfig::from_env());
    let args = parse_args()?;
    let config = match &args.config {
        Some(path) => ShardConfig::load(path)?,
        None => ShardConfig::from_env()?,
    };

    println!("=== Shard Replication Simulator ===\n");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(replication_walkthrough(config.clone()))?;
    runtime.block_on(snapshot_walkthrough(config.clone()))?;
    drop(runtime);

    if let Some(seeds) = args.dst_seeds {
        println!("--- Recovery DST ---");
        let dst_config = RecoveryDSTConfig {
            shard_config: config,
            ..RecoveryDSTConfig::default()
        };
        let results = run_recovery_dst_batch(0..seeds, dst_config);
        println!("{}", summarize_recovery_dst_batch(&results));
        if results.iter().any(|r| !r.passed) {
            return Err("recovery DST found failures".into());
        }
    }

    println!("\n=== Done ===");
    Ok(())
}

async fn replication_walkthrough(config: ShardConfig) -> Result<(), Box<dyn Error>> {
    println!("--- Replication and promotion ---");
    let cluster = SimulatedCluster::new(ShardId::new("demo", 0), config);

    cluster.start_primary("node-1")?;
    for i in 0..10 {
        let source = format!("{{\"n\":{}}}", i);
        cluster
            .write(Operation::index(format!("doc-{}", i), Bytes::from(source)))
            .await?;
    }

    let replica = cluster.add_started_replica("node-2").await?;
    cluster.write(Operation::delete("doc-0")).await?;
    let primary = cluster.primary()?;
    println!("primary  {:?}", primary.seq_no_stats());
    if let Some(copy) = cluster.copy(&replica) {
        println!("replica  {:?}", copy.seq_no_stats());
    }
    println!("in-sync  {:?}", cluster.in_sync());

    let report = cluster.promote(&replica).await?;
    println!(
        "promoted {} at term {} (gaps filled: {}, resynced: {})",
        report.new_primary,
        report.primary_term,
        report.gaps_filled,
        report.resync.map(|r| r.total_operations).unwrap_or(0)
    );
    cluster.write(Operation::index("after-promotion", Bytes::from_static(b"{}"))).await?;
    println!("primary  {:?}\n", cluster.primary()?.seq_no_stats());
    cluster.shutdown().await;
    Ok(())
}

async fn snapshot_walkthrough(config: ShardConfig) -> Result<(), Box<dyn Error>> {
    println!("--- Snapshot and restore ---");
    let cluster = SimulatedCluster::new(ShardId::new("demo", 1), config.clone());
    cluster.start_primary("node-1")?;
    for i in 0..5 {
        cluster
            .write(Operation::index(format!("doc-{}", i), Bytes::from_static(b"{}")))
            .await?;
    }
    let repository = BlobStoreRepository::new("demo-repo", InMemoryObjectStore::new());
    let generation = cluster.primary()?.snapshot_to(&repository, "snap-1").await?;
    println!("snapshot generation {}", generation);
    cluster.shutdown().await;

    let shard_id = ShardId::new("demo", 1);
    let routing = ShardRouting::initializing(
        shard_id.clone(),
        AllocationId::new("restored"),
        "node-3",
        true,
        RecoverySource::Snapshot {
            repository: repository.name().to_string(),
            snapshot: "snap-1".to_string(),
        },
    );
    let restored = IndexShard::new(routing.clone(), Store::new(), config);
    let in_sync: BTreeSet<AllocationId> = [routing.allocation_id.clone()].into_iter().collect();
    restored.update_shard_state(
        routing.clone(),
        1,
        None,
        1,
        &in_sync,
        &RoutingTable::new(shard_id.clone()).with(routing.clone()),
    )?;
    restored.mark_as_recovering("restore from snapshot", RecoveryState::new(&routing, None))?;
    restored.recover_from_snapshot(&repository, "snap-1").await?;
    let started = routing.moved_to_started();
    restored.update_shard_state(
        started.clone(),
        1,
        None,
        2,
        &in_sync,
        &RoutingTable::new(shard_id).with(started),
    )?;
    println!("restored {:?} {:?}\n", restored.state(), restored.seq_no_stats());
    Ok(())
}
