//! Recovery Deterministic Simulation Testing Harness
//!
//! Drives one shard's replication group through writes, replica joins,
//! node restarts and promotion while the transport drops requests, loses
//! responses, corrupts file chunks and stalls recovery calls.
//!
//! ## Invariants checked
//!
//! - **No acknowledged write lost**: the primary holds exactly the
//!   documents of every acknowledged write, before and after promotion
//! - **In-sync copies are identical**: every in-sync replica has the
//!   primary's documents and local checkpoint once writes quiesce
//! - **Checkpoint order**: the global checkpoint never exceeds the local
//!   checkpoint of any in-sync copy
//! - **No recovery debris**: no copy keeps recovery temp files
//!
//! ## DST Methodology
//!
//! 1. Start a primary and write a seeded workload, flushing now and then
//! 2. Add replicas by peer recovery while writes continue; a failed
//!    recovery drops the copy and the allocator tries again
//! 3. Restart replicas over their crashed stores (store.crash fault)
//! 4. Quiesce with faults off, verify, then optionally promote and verify again

use crate::buggify::{faults, FaultConfig};
use crate::config::ShardConfig;
use crate::shard::{AllocationId, IndexShard, Operation, ShardId, ShardState};
use crate::simulator::{ClusterError, DeterministicRng, SimulatedCluster};
use crate::store::Store;
use crate::transport::RecoveryResponse;
use crate::{buggify, suppress_buggify};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Distinct document ids the workload touches
const KEY_SPACE: u64 = 32;

/// Result of a single DST run
#[derive(Debug)]
pub struct RecoveryDSTResult {
    pub seed: u64,
    pub total_writes: usize,
    pub acknowledged_writes: usize,
    pub failed_writes: usize,
    pub recoveries_started: usize,
    pub recoveries_failed: usize,
    pub ops_based_recoveries: usize,
    pub restarts: usize,
    pub in_sync_copies: usize,
    pub promoted: bool,
    pub faults_triggered: u64,
    pub passed: bool,
    pub error_message: Option<String>,
}

/// Configuration for the recovery DST harness
#[derive(Debug, Clone)]
pub struct RecoveryDSTConfig {
    /// Writes before the first replica joins
    pub initial_writes: usize,
    /// Writes issued while each recovery runs
    pub concurrent_writes: usize,
    /// Steady-state steps after the replicas joined
    pub steady_writes: usize,
    pub num_replicas: usize,
    /// Allocation attempts per replica
    pub max_recovery_attempts: usize,
    /// Probability of a primary flush after a write
    pub flush_probability: f64,
    pub faults: FaultConfig,
    /// Promote a replica at the end and keep writing
    pub promote: bool,
    pub shard_config: ShardConfig,
}

impl Default for RecoveryDSTConfig {
    fn default() -> Self {
        RecoveryDSTConfig {
            initial_writes: 60,
            concurrent_writes: 20,
            steady_writes: 40,
            num_replicas: 2,
            max_recovery_attempts: 8,
            flush_probability: 0.05,
            faults: FaultConfig::moderate(),
            promote: true,
            shard_config: ShardConfig::test(),
        }
    }
}

impl RecoveryDSTConfig {
    /// No faults: baseline correctness
    pub fn baseline() -> Self {
        RecoveryDSTConfig {
            faults: FaultConfig::disabled(),
            ..Default::default()
        }
    }

    /// Replica restarts only, clean network
    pub fn restarts_only() -> Self {
        RecoveryDSTConfig {
            faults: FaultConfig::new().with(faults::store::CRASH, 0.05),
            ..Default::default()
        }
    }

    /// High fault rates everywhere
    pub fn chaos() -> Self {
        RecoveryDSTConfig {
            faults: FaultConfig::chaos(),
            max_recovery_attempts: 20,
            ..Default::default()
        }
    }
}

/// Counters collected while a scenario runs
#[derive(Debug, Default)]
struct RunStats {
    total_writes: usize,
    acknowledged_writes: usize,
    failed_writes: usize,
    recoveries_started: usize,
    recoveries_failed: usize,
    ops_based_recoveries: usize,
    restarts: usize,
    in_sync_copies: usize,
    promoted: bool,
}

/// Acknowledged state: last acknowledged value per document, None if deleted
type Shadow = BTreeMap<String, Option<Bytes>>;

/// Recovery DST harness
pub struct RecoveryDSTHarness {
    seed: u64,
    rng: DeterministicRng,
    config: RecoveryDSTConfig,
}

impl RecoveryDSTHarness {
    pub fn new(seed: u64, config: RecoveryDSTConfig) -> Self {
        RecoveryDSTHarness {
            seed,
            rng: DeterministicRng::new(seed),
            config,
        }
    }

    /// Run a single DST scenario
    pub fn run(&mut self) -> RecoveryDSTResult {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                return self.result(
                    RunStats::default(),
                    0,
                    Err(format!("failed to build runtime: {}", e)),
                )
            }
        };

        // Faults are configured per thread and the runtime stays on this one
        buggify::set_config(self.config.faults.clone());
        buggify::reset_stats();
        let mut stats = RunStats::default();
        let outcome = runtime.block_on(self.scenario(&mut stats));
        let faults_triggered = buggify::stats().total_triggers();
        buggify::set_config(FaultConfig::disabled());

        self.result(stats, faults_triggered, outcome)
    }

    fn result(
        &self,
        stats: RunStats,
        faults_triggered: u64,
        outcome: Result<(), String>,
    ) -> RecoveryDSTResult {
        RecoveryDSTResult {
            seed: self.seed,
            total_writes: stats.total_writes,
            acknowledged_writes: stats.acknowledged_writes,
            failed_writes: stats.failed_writes,
            recoveries_started: stats.recoveries_started,
            recoveries_failed: stats.recoveries_failed,
            ops_based_recoveries: stats.ops_based_recoveries,
            restarts: stats.restarts,
            in_sync_copies: stats.in_sync_copies,
            promoted: stats.promoted,
            faults_triggered,
            passed: outcome.is_ok(),
            error_message: outcome.err(),
        }
    }

    async fn scenario(&mut self, stats: &mut RunStats) -> Result<(), String> {
        let cluster = SimulatedCluster::simulated(
            ShardId::new("dst", 0),
            self.config.shard_config.clone(),
            self.rng.next_u64(),
        );
        let outcome = self.drive(&cluster, stats).await;
        cluster.shutdown().await;
        outcome
    }

    async fn drive(&mut self, cluster: &SimulatedCluster, stats: &mut RunStats) -> Result<(), String> {
        let mut shadow = Shadow::new();
        let mut workload = Workload::new(self.rng.fork(), self.config.flush_probability);

        // Phase 1: primary alone
        cluster
            .start_primary("node-0")
            .map_err(|e| format!("primary failed to start: {}", e))?;
        workload
            .write_many(cluster, &mut shadow, stats, self.config.initial_writes)
            .await?;

        // Phase 2: replicas join while writes continue
        for n in 0..self.config.num_replicas {
            let node = format!("node-{}", n + 1);
            self.join_replica(cluster, &node, None, &mut workload, &mut shadow, stats)
                .await?;
        }

        // Phase 3: steady state with node restarts
        for _ in 0..self.config.steady_writes {
            workload.write_many(cluster, &mut shadow, stats, 1).await?;
            if buggify!(&mut self.rng, faults::store::CRASH) {
                self.restart_replica(cluster, &mut workload, &mut shadow, stats)
                    .await?;
            }
        }

        // Phase 4: quiesce and verify
        let _quiet = suppress_buggify!();
        quiesce(cluster, &mut workload, &mut shadow, stats).await?;
        stats.in_sync_copies = verify(cluster, &shadow)?;
        drop(_quiet);

        if !self.config.promote {
            return Ok(());
        }

        // Phase 5: promotion under faults, then verify again
        let primary = cluster.primary().map_err(|e| e.to_string())?;
        let mut candidates: Vec<AllocationId> = primary
            .in_sync_allocation_ids()
            .into_iter()
            .filter(|id| id != primary.allocation_id())
            .collect();
        candidates.sort();
        let Some(candidate) = self.rng.choose(&candidates).cloned() else {
            return Ok(());
        };
        let term_before = cluster.primary_term();
        let report = cluster
            .promote(&candidate)
            .await
            .map_err(|e| format!("promotion of {} failed: {}", candidate, e))?;
        if report.primary_term != term_before + 1 {
            return Err(format!(
                "INVARIANT VIOLATION: promotion moved term {} to {}",
                term_before, report.primary_term
            ));
        }
        stats.promoted = true;
        let promoted = cluster.primary().map_err(|e| e.to_string())?;
        check_documents(&promoted, &shadow, "promoted primary")?;

        workload
            .write_many(cluster, &mut shadow, stats, self.config.concurrent_writes)
            .await?;
        let _quiet = suppress_buggify!();
        quiesce(cluster, &mut workload, &mut shadow, stats).await?;
        stats.in_sync_copies = verify(cluster, &shadow)?;
        Ok(())
    }

    /// Allocate a replica and recover it, retrying with fresh allocations
    async fn join_replica(
        &mut self,
        cluster: &SimulatedCluster,
        node: &str,
        mut store: Option<Store>,
        workload: &mut Workload,
        shadow: &mut Shadow,
        stats: &mut RunStats,
    ) -> Result<Option<AllocationId>, String> {
        for _ in 0..self.config.max_recovery_attempts {
            let allocated = match store.take() {
                Some(store) => cluster.add_replica_with_store(node, store),
                None => cluster.add_replica(node),
            };
            let id = allocated.map_err(|e| format!("allocation on {} failed: {}", node, e))?;
            stats.recoveries_started += 1;

            let (recovered, written) = tokio::join!(
                cluster.recover_replica(&id),
                workload.write_many(cluster, shadow, stats, self.config.concurrent_writes),
            );
            written?;
            match recovered {
                Ok(response) => {
                    record_recovery(&response, stats);
                    match cluster.mark_started(&id) {
                        Ok(()) => return Ok(Some(id)),
                        // Failed by a concurrent write after recovery finished
                        Err(ClusterError::UnknownCopy(_)) => stats.recoveries_failed += 1,
                        Err(e) => return Err(format!("failed to start {}: {}", id, e)),
                    }
                }
                Err(e) => {
                    tracing::debug!(seed = self.seed, allocation_id = %id, error = %e, "recovery attempt failed");
                    stats.recoveries_failed += 1;
                }
            }
        }
        Ok(None)
    }

    /// Crash a started replica's node and recover the copy over its old store
    async fn restart_replica(
        &mut self,
        cluster: &SimulatedCluster,
        workload: &mut Workload,
        shadow: &mut Shadow,
        stats: &mut RunStats,
    ) -> Result<(), String> {
        let primary = cluster.primary().map_err(|e| e.to_string())?;
        let mut replicas: Vec<Arc<IndexShard>> = cluster
            .copies()
            .into_iter()
            .filter(|c| c.allocation_id() != primary.allocation_id() && c.state() == ShardState::Started)
            .collect();
        replicas.sort_by(|a, b| a.allocation_id().cmp(b.allocation_id()));
        let Some(victim) = self.rng.choose(&replicas).cloned() else {
            return Ok(());
        };

        let node = victim.routing_entry().node_id;
        let store = victim.store().clone();
        cluster.fail_copy(victim.allocation_id(), "node restarted");
        store.simulate_crash();
        stats.restarts += 1;

        self.join_replica(cluster, &node, Some(store), workload, shadow, stats)
            .await?;
        Ok(())
    }
}

fn record_recovery(response: &RecoveryResponse, stats: &mut RunStats) {
    if response.ops_based {
        stats.ops_based_recoveries += 1;
    }
}

/// Seeded write generator
struct Workload {
    rng: DeterministicRng,
    flush_probability: f64,
    mapping_version: u64,
    counter: u64,
}

impl Workload {
    fn new(rng: DeterministicRng, flush_probability: f64) -> Self {
        Workload {
            rng,
            flush_probability,
            mapping_version: 0,
            counter: 0,
        }
    }

    fn next_operation(&mut self) -> Operation {
        self.counter += 1;
        let key = format!("doc-{}", self.rng.gen_range(0, KEY_SPACE));
        if self.rng.gen_bool(0.02) {
            self.mapping_version += 1;
        }
        let op = if self.rng.gen_bool(0.2) {
            Operation::delete(key)
        } else {
            Operation::index(key, Bytes::from(format!("value-{}", self.counter)))
        };
        op.with_mapping_version(self.mapping_version)
    }

    async fn write_many(
        &mut self,
        cluster: &SimulatedCluster,
        shadow: &mut Shadow,
        stats: &mut RunStats,
        count: usize,
    ) -> Result<(), String> {
        for _ in 0..count {
            let op = self.next_operation();
            stats.total_writes += 1;
            match cluster.write(op.clone()).await {
                Ok(_) => {
                    stats.acknowledged_writes += 1;
                    apply_to_shadow(shadow, &op);
                }
                Err(ClusterError::Shard(e)) if !e.is_shard_failure() => {
                    stats.failed_writes += 1;
                }
                Err(e) => return Err(format!("primary failed: {}", e)),
            }
            if self.rng.gen_bool(self.flush_probability) {
                if let Ok(primary) = cluster.primary() {
                    primary
                        .flush()
                        .map_err(|e| format!("primary flush failed: {}", e))?;
                }
            }
            // Let in-flight recoveries make progress between writes
            tokio::task::yield_now().await;
        }
        Ok(())
    }
}

fn apply_to_shadow(shadow: &mut Shadow, op: &Operation) {
    use crate::shard::OperationKind;
    match &op.kind {
        OperationKind::Index { id, source } => {
            shadow.insert(id.clone(), Some(source.clone()));
        }
        OperationKind::Delete { id } => {
            shadow.insert(id.clone(), None);
        }
        OperationKind::NoOp { .. } => {}
    }
}

/// One fault-free write so every in-sync copy reports its checkpoint
async fn quiesce(
    cluster: &SimulatedCluster,
    workload: &mut Workload,
    shadow: &mut Shadow,
    stats: &mut RunStats,
) -> Result<(), String> {
    workload.write_many(cluster, shadow, stats, 1).await
}

fn check_documents(shard: &IndexShard, shadow: &Shadow, role: &str) -> Result<(), String> {
    let mut missing = Vec::new();
    for (id, expected) in shadow {
        if &shard.get(id) != expected {
            missing.push(id.clone());
        }
    }
    if !missing.is_empty() {
        missing.truncate(10);
        return Err(format!(
            "INVARIANT VIOLATION: {} {} disagrees with acknowledged writes on {:?}",
            role,
            shard.allocation_id(),
            missing
        ));
    }
    Ok(())
}

/// Check every invariant on a quiet cluster. Returns the in-sync copy count.
fn verify(cluster: &SimulatedCluster, shadow: &Shadow) -> Result<usize, String> {
    let primary = cluster.primary().map_err(|e| e.to_string())?;
    check_documents(&primary, shadow, "primary")?;

    let in_sync = primary.in_sync_allocation_ids();
    let global_checkpoint = primary.global_checkpoint();
    if global_checkpoint > primary.local_checkpoint() {
        return Err(format!(
            "INVARIANT VIOLATION: global checkpoint {} above primary local checkpoint {}",
            global_checkpoint,
            primary.local_checkpoint()
        ));
    }

    for copy in cluster.copies() {
        if !copy.store().temp_files().is_empty() {
            return Err(format!(
                "INVARIANT VIOLATION: {} kept recovery temp files {:?}",
                copy.allocation_id(),
                copy.store().temp_files()
            ));
        }
        if copy.allocation_id() == primary.allocation_id() {
            continue;
        }
        if copy.state() != ShardState::Started {
            return Err(format!(
                "copy {} left in state {}",
                copy.allocation_id(),
                copy.state()
            ));
        }
        if !in_sync.contains(copy.allocation_id()) {
            continue;
        }
        check_documents(&copy, shadow, "replica")?;
        if copy.local_checkpoint() != primary.max_seq_no() {
            return Err(format!(
                "INVARIANT VIOLATION: in-sync {} at local checkpoint {}, primary max seqNo {}",
                copy.allocation_id(),
                copy.local_checkpoint(),
                primary.max_seq_no()
            ));
        }
        if global_checkpoint > copy.local_checkpoint() {
            return Err(format!(
                "INVARIANT VIOLATION: global checkpoint {} above {} local checkpoint {}",
                global_checkpoint,
                copy.allocation_id(),
                copy.local_checkpoint()
            ));
        }
        if copy.global_checkpoint() > global_checkpoint {
            return Err(format!(
                "INVARIANT VIOLATION: {} knows global checkpoint {} ahead of primary {}",
                copy.allocation_id(),
                copy.global_checkpoint(),
                global_checkpoint
            ));
        }
    }
    Ok(in_sync.len())
}

/// Run a batch of DST runs across multiple seeds
pub fn run_recovery_dst_batch(
    seeds: std::ops::Range<u64>,
    config: RecoveryDSTConfig,
) -> Vec<RecoveryDSTResult> {
    seeds
        .map(|seed| {
            let mut harness = RecoveryDSTHarness::new(seed, config.clone());
            harness.run()
        })
        .collect()
}

/// Summarize batch results
pub fn summarize_recovery_dst_batch(results: &[RecoveryDSTResult]) -> String {
    let total = results.len();
    let passed = results.iter().filter(|r| r.passed).count();
    let failed = total - passed;

    let acked: usize = results.iter().map(|r| r.acknowledged_writes).sum();
    let recoveries: usize = results.iter().map(|r| r.recoveries_started).sum();
    let failed_recoveries: usize = results.iter().map(|r| r.recoveries_failed).sum();
    let ops_based: usize = results.iter().map(|r| r.ops_based_recoveries).sum();
    let restarts: usize = results.iter().map(|r| r.restarts).sum();
    let promoted = results.iter().filter(|r| r.promoted).count();
    let faults: u64 = results.iter().map(|r| r.faults_triggered).sum();

    let mut summary = format!(
        "Recovery DST Batch: {}/{} passed ({} failed)\n\
         Acknowledged writes: {}, Recoveries: {} ({} failed, {} ops-based), \
         Restarts: {}, Promotions: {}, Faults: {}",
        passed, total, failed, acked, recoveries, failed_recoveries, ops_based, restarts, promoted, faults
    );

    if failed > 0 {
        summary.push_str("\n\nFailed seeds:");
        for r in results.iter().filter(|r| !r.passed) {
            summary.push_str(&format!(
                "\n  Seed {}: {}",
                r.seed,
                r.error_message.as_deref().unwrap_or("unknown error")
            ));
        }
    }

    summary
}
