//! SimulatedCluster - one shard's copies plus a minimal allocator, in process
//!
//! Plays the allocator's part: assigns allocation ids, keeps the routing
//! table, in-sync set, primary term and cluster state version, and
//! publishes every change to all live copies. Copies talk to each other
//! through [`LocalReplicaClient`], optionally behind the fault-injecting
//! simulated transport.
//!
//! ```text
//!            ┌────────────── publish(version, term, table, in-sync) ─────────┐
//!            ▼                              ▼                                ▼
//!      ┌───────────┐  ReplicaRequest  ┌───────────┐   peer recovery   ┌───────────┐
//!      │  primary  │ ───────────────► │ replica-1 │                   │ replica-2 │
//!      │           │ ◄──────────────────────────────────────────────► │(recovering)│
//!      └───────────┘                  └───────────┘                   └───────────┘
//! ```
//!
//! The cluster lock is never held across an `.await`.

use crate::config::ShardConfig;
use crate::engine::{in_memory_engine_factory, EngineFactory};
use crate::promotion::{spawn_resync_actor, ResyncHandle, ResyncResponse};
use crate::recovery::RecoveryState;
use crate::replication::{ReplicationOperation, ReplicationOutcome, ReplicationResult};
use crate::shard::{
    AllocationId, IndexShard, Operation, RecoverySource, RoutingTable, ShardError, ShardId,
    ShardRouting, StateUpdateOutcome,
};
use crate::store::Store;
use crate::transport::{
    LocalPeerRecoverySource, LocalReplicaClient, PeerRecoverySource, RecoveryResponse,
    ReplicaClient, SimulatedPeerRecoverySource, SimulatedReplicaClient,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// How long a stalled recovery call hangs under fault injection
const RECOVERY_STALL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    NoPrimary,
    UnknownCopy(AllocationId),
    /// The primary still asks for a newer mapping after it was installed
    MappingNotApplied { required: u64 },
    Shard(ShardError),
}

impl std::fmt::Display for ClusterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterError::NoPrimary => write!(f, "no active primary"),
            ClusterError::UnknownCopy(id) => write!(f, "unknown copy {}", id),
            ClusterError::MappingNotApplied { required } => {
                write!(f, "mapping version {} still missing after update", required)
            }
            ClusterError::Shard(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ClusterError {}

impl From<ShardError> for ClusterError {
    fn from(e: ShardError) -> Self {
        ClusterError::Shard(e)
    }
}

/// Result of promoting a replica
#[derive(Debug)]
pub struct PromotionReport {
    pub new_primary: AllocationId,
    pub primary_term: u64,
    pub gaps_filled: usize,
    pub resync: Option<ResyncResponse>,
}

struct ClusterState {
    version: u64,
    primary_term: u64,
    table: RoutingTable,
    in_sync: BTreeSet<AllocationId>,
    copies: BTreeMap<AllocationId, Arc<IndexShard>>,
    next_copy: u64,
}

/// One shard's replication group with an in-process allocator
pub struct SimulatedCluster {
    shard_id: ShardId,
    config: ShardConfig,
    local: Arc<LocalReplicaClient>,
    client: Arc<dyn ReplicaClient>,
    /// Seed of the simulated recovery transport; None for a clean network
    recovery_seed: Option<u64>,
    resync: ResyncHandle,
    resync_task: Mutex<Option<JoinHandle<()>>>,
    /// Engine every new copy opens
    engine_factory: EngineFactory,
    state: Mutex<ClusterState>,
}

impl SimulatedCluster {
    /// Cluster over a clean in-process network. Must run inside a runtime.
    pub fn new(shard_id: ShardId, config: ShardConfig) -> Self {
        let local = Arc::new(LocalReplicaClient::new());
        Self::build(shard_id, config, Arc::clone(&local), local, None)
    }

    /// Cluster whose replication and recovery traffic goes through the
    /// fault-injecting transport, seeded by `seed`
    pub fn simulated(shard_id: ShardId, config: ShardConfig, seed: u64) -> Self {
        let local = Arc::new(LocalReplicaClient::new());
        let client = Arc::new(SimulatedReplicaClient::new(
            Arc::clone(&local) as Arc<dyn ReplicaClient>,
            seed,
        ));
        Self::build(shard_id, config, local, client, Some(seed.rotate_left(17)))
    }

    fn build(
        shard_id: ShardId,
        config: ShardConfig,
        local: Arc<LocalReplicaClient>,
        client: Arc<dyn ReplicaClient>,
        recovery_seed: Option<u64>,
    ) -> Self {
        let (resync, resync_task) =
            spawn_resync_actor(Arc::clone(&client), config.recovery.translog_ops_batch_size);
        SimulatedCluster {
            state: Mutex::new(ClusterState {
                version: 0,
                primary_term: 0,
                table: RoutingTable::new(shard_id.clone()),
                in_sync: BTreeSet::new(),
                copies: BTreeMap::new(),
                next_copy: 0,
            }),
            shard_id,
            config,
            local,
            client,
            recovery_seed,
            resync,
            resync_task: Mutex::new(Some(resync_task)),
            engine_factory: in_memory_engine_factory(),
        }
    }

    /// Open new copies with `engine_factory` instead of the in-memory engine
    pub fn with_engine_factory(mut self, engine_factory: EngineFactory) -> Self {
        self.engine_factory = engine_factory;
        self
    }

    fn new_copy(&self, routing: &ShardRouting, store: Store) -> Arc<IndexShard> {
        Arc::new(IndexShard::with_engine_factory(
            routing.clone(),
            store,
            self.config.clone(),
            Arc::clone(&self.engine_factory),
        ))
    }

    // ------------------------------------------------------------------
    // Views
    // ------------------------------------------------------------------

    pub fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    pub fn version(&self) -> u64 {
        self.state.lock().version
    }

    pub fn primary_term(&self) -> u64 {
        self.state.lock().primary_term
    }

    pub fn routing_table(&self) -> RoutingTable {
        self.state.lock().table.clone()
    }

    /// In-sync set as last published by the allocator
    pub fn in_sync(&self) -> BTreeSet<AllocationId> {
        self.state.lock().in_sync.clone()
    }

    pub fn copy(&self, id: &AllocationId) -> Option<Arc<IndexShard>> {
        self.state.lock().copies.get(id).cloned()
    }

    /// Live copies, primary included
    pub fn copies(&self) -> Vec<Arc<IndexShard>> {
        self.state.lock().copies.values().cloned().collect()
    }

    pub fn primary(&self) -> Result<Arc<IndexShard>, ClusterError> {
        let state = self.state.lock();
        let id = &state.table.primary().ok_or(ClusterError::NoPrimary)?.allocation_id;
        state.copies.get(id).cloned().ok_or(ClusterError::NoPrimary)
    }

    pub fn replica_client(&self) -> Arc<dyn ReplicaClient> {
        Arc::clone(&self.client)
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Allocate a primary on an empty store, recover it and start it
    pub fn start_primary(&self, node: &str) -> Result<AllocationId, ClusterError> {
        self.start_primary_on(node, Store::new(), RecoverySource::EmptyStore)
    }

    /// Allocate a primary over an existing store (restart after a crash)
    pub fn restart_primary(&self, node: &str, store: Store) -> Result<AllocationId, ClusterError> {
        self.start_primary_on(node, store, RecoverySource::ExistingStore)
    }

    fn start_primary_on(
        &self,
        node: &str,
        store: Store,
        source: RecoverySource,
    ) -> Result<AllocationId, ClusterError> {
        let (shard, routing) = {
            let mut state = self.state.lock();
            let id = Self::next_allocation_id(&mut state);
            let routing =
                ShardRouting::initializing(self.shard_id.clone(), id.clone(), node, true, source);
            let shard = self.new_copy(&routing, store);
            state.table = state.table.clone().with(routing.clone());
            state.in_sync = [id.clone()].into_iter().collect();
            state.primary_term += 1;
            state.copies.insert(id.clone(), Arc::clone(&shard));
            self.publish_locked(&mut state);
            (shard, routing)
        };
        shard.mark_as_recovering("primary allocated", RecoveryState::new(&routing, None))?;
        shard.recover_from_store()?;
        self.local.register(Arc::clone(&shard));
        self.mark_started(&routing.allocation_id)?;
        Ok(routing.allocation_id)
    }

    /// Allocate a replica on `node` with an empty store. It still has to
    /// recover before it can be started.
    pub fn add_replica(&self, node: &str) -> Result<AllocationId, ClusterError> {
        self.add_replica_with_store(node, Store::new())
    }

    /// Allocate a replica over a store that may already hold data
    pub fn add_replica_with_store(&self, node: &str, store: Store) -> Result<AllocationId, ClusterError> {
        let mut state = self.state.lock();
        let primary_node = state
            .table
            .primary()
            .map(|p| p.node_id.clone())
            .ok_or(ClusterError::NoPrimary)?;
        let id = Self::next_allocation_id(&mut state);
        let routing =
            ShardRouting::initializing(self.shard_id.clone(), id.clone(), node, false, RecoverySource::Peer);
        let shard = self.new_copy(&routing, store);
        state.table = state.table.clone().with(routing.clone());
        state.copies.insert(id.clone(), Arc::clone(&shard));
        self.publish_locked(&mut state);
        drop(state);

        shard.mark_as_recovering(
            "replica allocated",
            RecoveryState::new(&routing, Some(primary_node)),
        )?;
        self.local.register(shard);
        Ok(id)
    }

    /// Run peer recovery for `id` from the current primary
    pub async fn recover_replica(&self, id: &AllocationId) -> Result<RecoveryResponse, ClusterError> {
        let primary = self.primary()?;
        let local: Arc<dyn PeerRecoverySource> = Arc::new(LocalPeerRecoverySource::new(primary));
        match self.recovery_seed {
            Some(seed) => {
                let source = SimulatedPeerRecoverySource::new(local, seed, RECOVERY_STALL);
                self.recover_replica_from(id, &source).await
            }
            None => self.recover_replica_from(id, local.as_ref()).await,
        }
    }

    /// Run peer recovery for `id` against an explicit source
    pub async fn recover_replica_from(
        &self,
        id: &AllocationId,
        source: &dyn PeerRecoverySource,
    ) -> Result<RecoveryResponse, ClusterError> {
        let shard = self.copy(id).ok_or_else(|| ClusterError::UnknownCopy(id.clone()))?;
        match shard.recover_from_peer(source).await {
            Ok(response) => Ok(response),
            Err(e) => {
                // The copy closed itself; the allocator drops it
                self.fail_copy(id, &format!("peer recovery failed: {}", e));
                Err(e.into())
            }
        }
    }

    /// Report a recovered copy as started and pick up the primary's in-sync set
    pub fn mark_started(&self, id: &AllocationId) -> Result<(), ClusterError> {
        let mut state = self.state.lock();
        let routing = state
            .table
            .get(id)
            .cloned()
            .ok_or_else(|| ClusterError::UnknownCopy(id.clone()))?;
        state.table = state.table.clone().with(routing.moved_to_started());
        let primary_in_sync = state
            .table
            .primary()
            .and_then(|p| state.copies.get(&p.allocation_id))
            .map(|p| p.in_sync_allocation_ids());
        if let Some(in_sync) = primary_in_sync {
            state.in_sync.extend(in_sync);
        }
        self.publish_locked(&mut state);
        Ok(())
    }

    /// Add a replica, recover it and start it
    pub async fn add_started_replica(&self, node: &str) -> Result<AllocationId, ClusterError> {
        let id = self.add_replica(node)?;
        self.recover_replica(&id).await?;
        self.mark_started(&id)?;
        Ok(id)
    }

    /// Drop a copy from the group: close it and tell everyone else.
    /// Returns false if the copy was not allocated.
    pub fn fail_copy(&self, id: &AllocationId, reason: &str) -> bool {
        let mut state = self.state.lock();
        let Some(shard) = state.copies.remove(id) else {
            return false;
        };
        tracing::info!(shard = %self.shard_id, allocation_id = %id, reason, "failing copy");
        self.local.unregister(id);
        shard.close(reason);

        state.table = state.table.clone().without(id);
        state.in_sync.remove(id);
        state.version += 1;
        let version = state.version;
        if let Some(primary) = state
            .table
            .primary()
            .and_then(|p| state.copies.get(&p.allocation_id))
        {
            primary.remove_from_routing(version, id);
        }
        self.apply_locked(&state);
        true
    }

    /// Promote replica `id` to primary under a new term and resync the
    /// remaining replicas. The old primary, if still allocated, is failed.
    ///
    /// On rejection nothing changes: same term, same routing.
    pub async fn promote(&self, id: &AllocationId) -> Result<PromotionReport, ClusterError> {
        let (outcome, term) = {
            let mut state = self.state.lock();
            let candidate = state
                .copies
                .get(id)
                .cloned()
                .ok_or_else(|| ClusterError::UnknownCopy(id.clone()))?;
            let routing = state
                .table
                .get(id)
                .cloned()
                .ok_or_else(|| ClusterError::UnknownCopy(id.clone()))?;
            let old_primary = state.table.primary().map(|p| p.allocation_id.clone());

            let mut table = state.table.clone();
            let mut in_sync = state.in_sync.clone();
            if let Some(old) = &old_primary {
                table = table.without(old);
                in_sync.remove(old);
            }
            let promoted = routing.promoted_to_primary();
            table = table.with(promoted.clone());
            let term = state.primary_term + 1;
            let version = state.version + 1;

            let outcome = candidate.update_shard_state(
                promoted,
                term,
                Some(&self.resync),
                version,
                &in_sync,
                &table,
            )?;

            if let Some(old) = old_primary {
                if let Some(shard) = state.copies.remove(&old) {
                    self.local.unregister(&old);
                    shard.close("demoted: replica promoted");
                }
            }
            state.table = table;
            state.in_sync = in_sync;
            state.primary_term = term;
            state.version = version;
            self.apply_locked(&state);
            (outcome, term)
        };

        let (gaps_filled, receipt) = match outcome {
            StateUpdateOutcome::Promoted {
                gaps_filled,
                receipt,
                ..
            } => (gaps_filled, receipt),
            other => {
                tracing::warn!(shard = %self.shard_id, allocation_id = %id, ?other, "promotion did not activate primary mode");
                (0, None)
            }
        };
        let resync = match receipt {
            Some(receipt) => receipt.await.ok(),
            None => None,
        };
        if let Some(response) = &resync {
            for (failed, error) in &response.failed {
                self.fail_copy(failed, &format!("resync failed: {}", error));
            }
        }
        Ok(PromotionReport {
            new_primary: id.clone(),
            primary_term: term,
            gaps_filled,
            resync,
        })
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Index through the current primary. A missing mapping is installed
    /// on every copy and the write retried once. Copies that failed the
    /// write are removed from the group.
    pub async fn write(&self, op: Operation) -> Result<ReplicationResult, ClusterError> {
        let primary = self.primary()?;
        let mut outcome = self.replicate(&primary, op.clone()).await?;
        if let ReplicationOutcome::MappingUpdateRequired { required, .. } = outcome {
            self.put_mapping(required)?;
            outcome = self.replicate(&primary, op).await?;
        }
        match outcome {
            ReplicationOutcome::Replicated(result) => {
                for (failed, error) in &result.failed_replicas {
                    self.fail_copy(failed, &format!("failed to replicate: {}", error));
                }
                Ok(result)
            }
            ReplicationOutcome::MappingUpdateRequired { required, .. } => {
                Err(ClusterError::MappingNotApplied { required })
            }
        }
    }

    async fn replicate(
        &self,
        primary: &IndexShard,
        op: Operation,
    ) -> Result<ReplicationOutcome, ClusterError> {
        match ReplicationOperation::new(primary, self.client.as_ref())
            .execute(op)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                if e.is_shard_failure() {
                    self.fail_copy(primary.allocation_id(), &e.to_string());
                }
                Err(e.into())
            }
        }
    }

    /// Install `mapping_version` on every live copy that has an engine
    pub fn put_mapping(&self, mapping_version: u64) -> Result<(), ClusterError> {
        let primary = self.primary()?;
        primary.update_mapping(mapping_version)?;
        for copy in self.copies() {
            if copy.allocation_id() == primary.allocation_id() {
                continue;
            }
            if let Err(e) = copy.update_mapping(mapping_version) {
                // Recovering copies pick the mapping up from the primary
                tracing::debug!(allocation_id = %copy.allocation_id(), error = %e, "mapping not installed");
            }
        }
        Ok(())
    }

    /// Stop the resync actor
    pub async fn shutdown(&self) {
        self.resync.shutdown().await;
        let task = self.resync_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    // ------------------------------------------------------------------
    // Publication
    // ------------------------------------------------------------------

    fn next_allocation_id(state: &mut ClusterState) -> AllocationId {
        state.next_copy += 1;
        AllocationId::new(format!("copy-{}", state.next_copy))
    }

    fn publish_locked(&self, state: &mut ClusterState) {
        state.version += 1;
        self.apply_locked(state);
    }

    /// Send the current cluster state to every live copy
    fn apply_locked(&self, state: &ClusterState) {
        for (id, shard) in &state.copies {
            let Some(routing) = state.table.get(id) else {
                continue;
            };
            match shard.update_shard_state(
                routing.clone(),
                state.primary_term,
                Some(&self.resync),
                state.version,
                &state.in_sync,
                &state.table,
            ) {
                Ok(StateUpdateOutcome::Superseded) => {
                    tracing::warn!(allocation_id = %id, "copy superseded by cluster state")
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(
                    shard = %self.shard_id,
                    allocation_id = %id,
                    version = state.version,
                    error = %e,
                    "failed to apply cluster state"
                ),
            }
        }
    }
}
