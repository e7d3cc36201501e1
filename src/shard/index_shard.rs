//! IndexShard - lifecycle, fencing, write paths and recovery entry points
//!
//! ## Write paths
//!
//! ```text
//! primary:  check role/state/term ─► mapping check ─► assign seqNo
//!           ─► mark MSU (update/delete) ─► engine ─► mark completed
//!
//! replica:  check state/term ─► duplicate? ─► mapping check
//!           ─► advance MSU ─► superseded? ─► engine ─► mark completed
//! ```
//!
//! Every step of a path runs under the shard lock, so seqNo assignment,
//! engine append and checkpoint advance are atomic with respect to each
//! other and to cluster state application.

use super::operation::{Operation, OperationKind, PrimaryOutcome, ReplicaOutcome};
use super::routing::{AllocationId, RecoverySource, RoutingState, RoutingTable, ShardId, ShardRouting};
use super::state::{Lifecycle, ShardState};
use super::ShardError;
use crate::config::ShardConfig;
use crate::engine::{in_memory_engine_factory, AppendMode, CommitPoint, Engine, EngineFactory};
use crate::promotion::{ResyncHandle, ResyncReceipt, ResyncTask};
use crate::recovery::{RecoveryCause, RecoveryFailure, RecoveryStage, RecoveryState, RecoveryTarget};
use crate::replication::{CheckpointState, ReplicationTracker};
use crate::seqno::{LocalCheckpointTracker, SeqNo, SeqNoStats, UNASSIGNED_SEQ_NO};
use crate::snapshot::{BlobStoreRepository, ObjectStore};
use crate::store::{is_index_file, MetadataSnapshot, Store, StoreFileMetadata};
use crate::transport::{
    PeerRecoverySource, RecoveryResponse, ReplicaRequest, ReplicaResponse, StartRecoveryRequest,
    TranslogBatch,
};
use crate::translog::Translog;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Result of applying a cluster state update
#[derive(Debug)]
pub enum StateUpdateOutcome {
    /// Version already applied; nothing changed
    Ignored,
    Applied,
    /// This copy became primary
    Promoted {
        resync_from: SeqNo,
        resync_to: SeqNo,
        gaps_filled: usize,
        /// Completion of the resync, when a syncer was provided
        receipt: Option<ResyncReceipt>,
    },
    /// The routing names a different copy; this one was closed and any
    /// recovery in flight cancelled
    Superseded,
}

/// Commit files pinned for a peer recovery
#[derive(Debug, Clone)]
pub(crate) struct RecoveryCommit {
    pub commit: CommitPoint,
    pub metadata: MetadataSnapshot,
    pub files: BTreeMap<String, Bytes>,
    /// First seqNo replayed after the files: the target must hold history
    /// above the global checkpoint even for operations already in the commit
    pub history_from: SeqNo,
}

/// Operations a recovery target still needs
#[derive(Debug, Clone)]
pub(crate) struct RecoveryHistory {
    pub operations: Vec<Operation>,
    pub end_seq_no: SeqNo,
    pub max_seq_no_of_updates_or_deletes: SeqNo,
    pub mapping_version: u64,
    pub primary_term: u64,
}

struct ShardInner {
    routing: ShardRouting,
    lifecycle: Lifecycle,
    primary_term: u64,
    seq_no: LocalCheckpointTracker,
    replication: ReplicationTracker,
    engine: Option<Box<dyn Engine>>,
    recovery_state: Option<RecoveryState>,
    active_recovery: Option<CancellationToken>,
    /// Per-recovery lowest seqNo that must stay in the translog
    history_retention: BTreeMap<u64, SeqNo>,
}

/// One copy of a shard
pub struct IndexShard {
    shard_id: ShardId,
    allocation_id: AllocationId,
    config: ShardConfig,
    store: Store,
    engine_factory: EngineFactory,
    inner: Mutex<ShardInner>,
}

impl std::fmt::Debug for IndexShard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexShard")
            .field("shard_id", &self.shard_id)
            .field("allocation_id", &self.allocation_id)
            .field("state", &self.state())
            .finish()
    }
}

impl IndexShard {
    pub fn new(routing: ShardRouting, store: Store, config: ShardConfig) -> Self {
        Self::with_engine_factory(routing, store, config, in_memory_engine_factory())
    }

    pub fn with_engine_factory(
        routing: ShardRouting,
        store: Store,
        config: ShardConfig,
        engine_factory: EngineFactory,
    ) -> Self {
        let shard_id = routing.shard_id.clone();
        let allocation_id = routing.allocation_id.clone();
        IndexShard {
            inner: Mutex::new(ShardInner {
                replication: ReplicationTracker::new(allocation_id.clone(), UNASSIGNED_SEQ_NO),
                routing,
                lifecycle: Lifecycle::new(),
                primary_term: crate::seqno::UNASSIGNED_PRIMARY_TERM,
                seq_no: LocalCheckpointTracker::new(),
                engine: None,
                recovery_state: None,
                active_recovery: None,
                history_retention: BTreeMap::new(),
            }),
            shard_id,
            allocation_id,
            config,
            store,
            engine_factory,
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    pub fn allocation_id(&self) -> &AllocationId {
        &self.allocation_id
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &ShardConfig {
        &self.config
    }

    pub fn routing_entry(&self) -> ShardRouting {
        self.inner.lock().routing.clone()
    }

    pub fn state(&self) -> ShardState {
        self.inner.lock().lifecycle.state()
    }

    /// Reason given for the last lifecycle change
    pub fn state_reason(&self) -> String {
        self.inner.lock().lifecycle.reason().to_string()
    }

    pub fn primary_term(&self) -> u64 {
        self.inner.lock().primary_term
    }

    /// Active primary (primary mode on, writes accepted once started)
    pub fn is_primary(&self) -> bool {
        let inner = self.inner.lock();
        inner.routing.primary && inner.replication.is_primary_mode()
    }

    pub fn seq_no_stats(&self) -> SeqNoStats {
        let inner = self.inner.lock();
        inner.seq_no.stats(inner.replication.global_checkpoint())
    }

    pub fn local_checkpoint(&self) -> SeqNo {
        self.inner.lock().seq_no.local_checkpoint()
    }

    pub fn global_checkpoint(&self) -> SeqNo {
        self.inner.lock().replication.global_checkpoint()
    }

    pub fn max_seq_no(&self) -> SeqNo {
        self.inner.lock().seq_no.max_seq_no()
    }

    pub fn in_sync_allocation_ids(&self) -> BTreeSet<AllocationId> {
        self.inner.lock().replication.in_sync_allocation_ids()
    }

    pub fn replication_targets(&self) -> Vec<AllocationId> {
        self.inner.lock().replication.replication_targets()
    }

    pub fn checkpoint_state(&self, allocation_id: &AllocationId) -> Option<CheckpointState> {
        self.inner
            .lock()
            .replication
            .checkpoint_state(allocation_id)
            .copied()
    }

    pub fn recovery_state(&self) -> Option<RecoveryState> {
        self.inner.lock().recovery_state.clone()
    }

    pub fn mapping_version(&self) -> u64 {
        self.inner
            .lock()
            .engine
            .as_ref()
            .map(|e| e.mapping_version())
            .unwrap_or(0)
    }

    pub fn get(&self, id: &str) -> Option<Bytes> {
        self.inner.lock().engine.as_ref().and_then(|e| e.get(id))
    }

    pub fn doc_ids(&self) -> Vec<String> {
        self.inner
            .lock()
            .engine
            .as_ref()
            .map(|e| e.doc_ids())
            .unwrap_or_default()
    }

    pub fn doc_count(&self) -> usize {
        self.inner
            .lock()
            .engine
            .as_ref()
            .map(|e| e.doc_count())
            .unwrap_or(0)
    }

    pub fn last_commit(&self) -> Option<CommitPoint> {
        self.inner
            .lock()
            .engine
            .as_ref()
            .and_then(|e| e.last_commit().cloned())
    }

    // ------------------------------------------------------------------
    // Lifecycle and cluster state
    // ------------------------------------------------------------------

    /// CREATED -> RECOVERING
    pub fn mark_as_recovering(
        &self,
        reason: &str,
        recovery_state: RecoveryState,
    ) -> Result<(), ShardError> {
        let mut inner = self.inner.lock();
        let state = inner.lifecycle.state();
        if state != ShardState::Created {
            return Err(ShardError::IllegalState {
                state,
                operation: "mark as recovering",
            });
        }
        inner
            .lifecycle
            .transition(ShardState::Recovering, reason)
            .map_err(|(state, _)| ShardError::IllegalState {
                state,
                operation: "mark as recovering",
            })?;
        tracing::info!(
            shard = %self.shard_id,
            allocation_id = %self.allocation_id,
            recovery_id = recovery_state.recovery_id,
            source = ?recovery_state.source,
            reason,
            "shard recovering"
        );
        inner.recovery_state = Some(recovery_state);
        Ok(())
    }

    /// Apply a cluster state update from the allocator.
    ///
    /// Idempotent by version. Handles start, term adoption, promotion,
    /// fencing of a demoted or outdated primary, and routing supersession.
    pub fn update_shard_state(
        &self,
        routing: ShardRouting,
        primary_term: u64,
        resync: Option<&ResyncHandle>,
        cluster_state_version: u64,
        in_sync_ids: &BTreeSet<AllocationId>,
        routing_table: &RoutingTable,
    ) -> Result<StateUpdateOutcome, ShardError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if inner.replication.is_stale(cluster_state_version) {
            tracing::debug!(
                shard = %self.shard_id,
                version = cluster_state_version,
                applied = inner.replication.applied_cluster_state_version(),
                "ignoring stale cluster state"
            );
            return Ok(StateUpdateOutcome::Ignored);
        }

        let state = inner.lifecycle.state();
        if state.is_terminal() {
            return Err(ShardError::IllegalState {
                state,
                operation: "apply cluster state",
            });
        }

        if !routing.is_same_allocation(&inner.routing) {
            tracing::warn!(
                shard = %self.shard_id,
                allocation_id = %self.allocation_id,
                new_allocation_id = %routing.allocation_id,
                "routing superseded"
            );
            self.fail_locked(inner, format!("routing superseded by {}", routing.allocation_id));
            return Ok(StateUpdateOutcome::Superseded);
        }

        let held = inner.primary_term;
        if inner.replication.is_primary_mode() && (primary_term > held || !routing.primary) {
            return Err(self.fence_locked(inner, primary_term));
        }
        if primary_term < held {
            return Err(ShardError::StalePrimaryTerm {
                held,
                request: primary_term,
            });
        }

        let promoting = !inner.routing.primary && routing.primary;
        if promoting {
            if !in_sync_ids.contains(&self.allocation_id) {
                return Err(ShardError::PromotionNotInSync(self.allocation_id.clone()));
            }
            if primary_term <= held {
                return Err(ShardError::StalePrimaryTerm {
                    held,
                    request: primary_term,
                });
            }
            if !matches!(state, ShardState::PostRecovery | ShardState::Started) {
                return Err(ShardError::IllegalState {
                    state,
                    operation: "promote to primary",
                });
            }
        }

        if primary_term > held {
            tracing::info!(
                shard = %self.shard_id,
                from = held,
                to = primary_term,
                promoting,
                "primary term advanced"
            );
        }

        let previous_global_checkpoint = inner.replication.global_checkpoint();
        inner.primary_term = primary_term;
        inner.routing = routing.clone();
        inner
            .replication
            .update_from_cluster_state(cluster_state_version, in_sync_ids, routing_table);

        if routing.state == RoutingState::Started && inner.lifecycle.state() == ShardState::PostRecovery {
            let _ = inner.lifecycle.transition(ShardState::Started, "started by allocator");
            tracing::info!(shard = %self.shard_id, allocation_id = %self.allocation_id, "shard started");
        }

        let can_lead = matches!(
            inner.lifecycle.state(),
            ShardState::PostRecovery | ShardState::Started
        );
        if !(routing.primary && !inner.replication.is_primary_mode() && can_lead) {
            return Ok(StateUpdateOutcome::Applied);
        }

        let gaps_filled = if promoting {
            self.fill_gaps_locked(inner)?
        } else {
            0
        };
        let local_checkpoint = inner.seq_no.local_checkpoint();
        inner.replication.activate_primary_mode(local_checkpoint);

        if !promoting {
            return Ok(StateUpdateOutcome::Applied);
        }
        self.start_resync_locked(inner, previous_global_checkpoint, gaps_filled, resync)
    }

    /// Replace missing seqNos with no-ops so the new primary's history is contiguous
    fn fill_gaps_locked(&self, inner: &mut ShardInner) -> Result<usize, ShardError> {
        let gaps = inner.seq_no.gaps();
        let term = inner.primary_term;
        let engine = inner.engine.as_mut().ok_or(ShardError::EngineClosed)?;
        for seq_no in &gaps {
            let no_op = Operation::no_op(*seq_no, term, "filling gaps on promotion");
            engine.append_operation(&no_op, AppendMode::Apply)?;
            inner.seq_no.mark_seq_no_as_completed(*seq_no)?;
        }
        if !gaps.is_empty() {
            tracing::info!(shard = %self.shard_id, gaps = gaps.len(), "filled gaps with no-ops");
        }
        debug_assert!(
            inner.seq_no.gaps().is_empty(),
            "Postcondition: promoted primary has no gaps"
        );
        Ok(gaps.len())
    }

    fn start_resync_locked(
        &self,
        inner: &mut ShardInner,
        previous_global_checkpoint: SeqNo,
        gaps_filled: usize,
        resync: Option<&ResyncHandle>,
    ) -> Result<StateUpdateOutcome, ShardError> {
        let from = (previous_global_checkpoint + 1).max(0);
        let to = inner.seq_no.max_seq_no();
        let engine = inner.engine.as_ref().ok_or(ShardError::EngineClosed)?;
        let operations: Vec<Operation> = engine
            .read_operations_since(from)?
            .into_iter()
            .filter(|op| op.seq_no <= to)
            .collect();

        let task = ResyncTask {
            shard_id: self.shard_id.clone(),
            primary_term: inner.primary_term,
            from_seq_no: from,
            to_seq_no: to,
            operations,
            targets: inner.replication.replication_targets(),
            global_checkpoint: inner.replication.global_checkpoint(),
            max_seq_no_of_updates_or_deletes: inner.seq_no.max_seq_no_of_updates_or_deletes(),
        };
        tracing::info!(
            shard = %self.shard_id,
            term = inner.primary_term,
            from,
            to,
            operations = task.operations.len(),
            targets = task.targets.len(),
            "promoted to primary, resyncing replicas"
        );

        let receipt = match resync {
            Some(handle) => match handle.enqueue(task) {
                Ok(receipt) => Some(receipt),
                Err(e) => {
                    tracing::warn!(shard = %self.shard_id, error = %e, "resync not enqueued");
                    None
                }
            },
            None => None,
        };

        Ok(StateUpdateOutcome::Promoted {
            resync_from: from,
            resync_to: to,
            gaps_filled,
            receipt,
        })
    }

    /// A newer primary term was seen somewhere (e.g. in a replica's
    /// rejection). An active primary fences itself.
    pub fn observe_primary_term(&self, observed_term: u64) -> Result<(), ShardError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if observed_term > inner.primary_term && inner.replication.is_primary_mode() {
            return Err(self.fence_locked(inner, observed_term));
        }
        Ok(())
    }

    fn fence_locked(&self, inner: &mut ShardInner, observed_term: u64) -> ShardError {
        let held_term = inner.primary_term;
        tracing::warn!(
            shard = %self.shard_id,
            allocation_id = %self.allocation_id,
            held_term,
            observed_term,
            "primary fenced"
        );
        self.fail_locked(
            inner,
            format!("primary term {} fenced by {}", held_term, observed_term),
        );
        ShardError::Fenced {
            held_term,
            observed_term,
        }
    }

    /// Close, cancel any recovery, release the engine and recovery temp files
    fn fail_locked(&self, inner: &mut ShardInner, reason: String) {
        if let Some(token) = inner.active_recovery.take() {
            token.cancel();
        }
        if let Some(recovery) = &inner.recovery_state {
            if let Err(e) = self.store.delete_temp_files(recovery.recovery_id) {
                tracing::warn!(shard = %self.shard_id, error = %e, "failed to delete recovery temp files");
            }
        }
        inner.engine = None;
        inner.history_retention.clear();
        if inner.lifecycle.close(reason.clone()) {
            tracing::info!(shard = %self.shard_id, allocation_id = %self.allocation_id, reason = %reason, "shard closed");
        }
    }

    pub fn close(&self, reason: &str) {
        let mut guard = self.inner.lock();
        self.fail_locked(&mut guard, reason.to_string());
    }

    /// STARTED -> RELOCATED once a relocation target has taken over
    pub fn relocated(&self, reason: &str) -> Result<(), ShardError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner
            .lifecycle
            .transition(ShardState::Relocated, reason)
            .map_err(|(state, _)| ShardError::IllegalState {
                state,
                operation: "hand off relocation",
            })?;
        inner.engine = None;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Write paths
    // ------------------------------------------------------------------

    /// Assign a seqNo to `op` and apply it locally.
    ///
    /// A `MappingUpdateRequired` outcome consumes no seqNo; the caller
    /// installs the mapping and retries.
    pub fn apply_operation_on_primary(
        &self,
        op: Operation,
        request_term: u64,
    ) -> Result<PrimaryOutcome, ShardError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if !inner.routing.primary || !inner.replication.is_primary_mode() {
            return Err(ShardError::NotPrimary);
        }
        let state = inner.lifecycle.state();
        if !state.allows_primary_writes() {
            return Err(ShardError::IllegalState {
                state,
                operation: "write on primary",
            });
        }
        let held = inner.primary_term;
        if request_term < held {
            return Err(ShardError::StalePrimaryTerm {
                held,
                request: request_term,
            });
        }
        if request_term > held {
            return Err(self.fence_locked(inner, request_term));
        }
        inner.seq_no.check_unassigned(op.seq_no)?;

        let engine = inner.engine.as_mut().ok_or(ShardError::EngineClosed)?;
        let current_mapping = engine.mapping_version();
        if op.mapping_version > current_mapping {
            return Ok(PrimaryOutcome::MappingUpdateRequired {
                required: op.mapping_version,
                current: current_mapping,
            });
        }

        let live = op
            .doc_id()
            .and_then(|id| engine.doc_version(id))
            .map(|v| !v.deleted)
            .unwrap_or(false);
        let (is_update_or_delete, created) = match op.kind {
            OperationKind::Index { .. } => (live, !live),
            OperationKind::Delete { .. } => (true, false),
            OperationKind::NoOp { .. } => (false, false),
        };

        let seq_no = inner.seq_no.generate_seq_no();
        let stamped = op.stamped(seq_no, held);
        if is_update_or_delete {
            inner.seq_no.mark_seq_no_of_update_or_delete(seq_no);
        }
        if let Err(e) = engine.append_operation(&stamped, AppendMode::Apply) {
            tracing::error!(shard = %self.shard_id, seq_no, error = %e, "engine failed on primary");
            self.fail_locked(inner, format!("engine failure: {}", e));
            return Err(e.into());
        }
        inner.seq_no.mark_seq_no_as_completed(seq_no)?;

        let local_checkpoint = inner.seq_no.local_checkpoint();
        let global_checkpoint = inner
            .replication
            .update_local_checkpoint(&self.allocation_id, local_checkpoint)?;
        self.maybe_flush_locked(inner)?;

        tracing::trace!(shard = %self.shard_id, op = %stamped, "applied on primary");
        Ok(PrimaryOutcome::Applied {
            operation: stamped,
            created,
            global_checkpoint,
            max_seq_no_of_updates_or_deletes: inner.seq_no.max_seq_no_of_updates_or_deletes(),
        })
    }

    /// Apply a primary-stamped operation on this replica
    pub fn apply_operation_on_replica(
        &self,
        op: Operation,
        primary_term: u64,
        max_seq_no_of_updates_or_deletes: SeqNo,
    ) -> Result<ReplicaOutcome, ShardError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if inner.replication.is_primary_mode() {
            return Err(ShardError::NotReplica);
        }
        let state = inner.lifecycle.state();
        if !state.allows_replica_writes() {
            return Err(ShardError::IllegalState {
                state,
                operation: "write on replica",
            });
        }
        inner.seq_no.check_replicated(op.seq_no)?;
        self.check_replica_term_locked(inner, primary_term)?;

        let outcome =
            Self::apply_replica_op_locked(inner, &op, max_seq_no_of_updates_or_deletes, AppendMode::Apply)?;
        self.maybe_flush_locked(inner)?;
        tracing::trace!(shard = %self.shard_id, op = %op, ?outcome, "applied on replica");
        Ok(outcome)
    }

    /// Apply a replicated batch (live write or resync) and learn the
    /// primary's global checkpoint. An empty batch only carries the term.
    pub fn apply_replica_request(&self, request: &ReplicaRequest) -> Result<ReplicaResponse, ShardError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if inner.replication.is_primary_mode() {
            return Err(ShardError::NotReplica);
        }
        let state = inner.lifecycle.state();
        if !state.allows_replica_writes() {
            return Err(ShardError::IllegalState {
                state,
                operation: "write on replica",
            });
        }
        self.check_replica_term_locked(inner, request.primary_term)?;
        for op in &request.operations {
            inner.seq_no.check_replicated(op.seq_no)?;
            Self::apply_replica_op_locked(
                inner,
                op,
                request.max_seq_no_of_updates_or_deletes,
                AppendMode::Apply,
            )?;
        }
        inner
            .replication
            .update_global_checkpoint_on_replica(request.global_checkpoint);
        self.maybe_flush_locked(inner)?;
        Ok(ReplicaResponse {
            local_checkpoint: inner.seq_no.local_checkpoint(),
            global_checkpoint: inner.replication.global_checkpoint(),
        })
    }

    fn check_replica_term_locked(&self, inner: &mut ShardInner, term: u64) -> Result<(), ShardError> {
        let held = inner.primary_term;
        if term < held {
            return Err(ShardError::StalePrimaryTerm {
                held,
                request: term,
            });
        }
        if term > held {
            tracing::info!(shard = %self.shard_id, from = held, to = term, "replica adopting primary term");
            inner.primary_term = term;
        }
        Ok(())
    }

    /// Shared by the replica write path, peer recovery and local translog replay
    fn apply_replica_op_locked(
        inner: &mut ShardInner,
        op: &Operation,
        max_seq_no_of_updates_or_deletes: SeqNo,
        mode: AppendMode,
    ) -> Result<ReplicaOutcome, ShardError> {
        if inner.seq_no.has_processed(op.seq_no) {
            return Ok(ReplicaOutcome::Duplicate);
        }
        let engine = inner.engine.as_mut().ok_or(ShardError::EngineClosed)?;
        let current_mapping = engine.mapping_version();
        if op.mapping_version > current_mapping {
            return Err(ShardError::RetryOnReplica {
                required: op.mapping_version,
                current: current_mapping,
            });
        }

        inner
            .seq_no
            .mark_seq_no_of_update_or_delete(max_seq_no_of_updates_or_deletes);
        let needs_lookup = mode == AppendMode::Replay
            || op.seq_no <= inner.seq_no.max_seq_no_of_updates_or_deletes();
        let superseded = needs_lookup
            && op
                .doc_id()
                .and_then(|id| engine.doc_version(id))
                .map(|v| v.seq_no >= op.seq_no)
                .unwrap_or(false);

        match (superseded, mode) {
            (true, AppendMode::Replay) => {}
            (true, _) => engine.append_operation(op, AppendMode::HistoryOnly)?,
            (false, mode) => engine.append_operation(op, mode)?,
        }
        if matches!(op.kind, OperationKind::Delete { .. }) {
            inner.seq_no.mark_seq_no_of_update_or_delete(op.seq_no);
        }
        inner.seq_no.mark_seq_no_as_completed(op.seq_no)?;

        Ok(if superseded {
            ReplicaOutcome::Superseded
        } else {
            ReplicaOutcome::Applied
        })
    }

    // ------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------

    /// Primary: record a copy's local checkpoint. Returns the global checkpoint.
    pub fn update_local_checkpoint_for_shard(
        &self,
        allocation_id: &AllocationId,
        local_checkpoint: SeqNo,
    ) -> Result<SeqNo, ShardError> {
        let mut inner = self.inner.lock();
        Ok(inner
            .replication
            .update_local_checkpoint(allocation_id, local_checkpoint)?)
    }

    /// Primary: record the global checkpoint a copy acknowledged
    pub fn update_global_checkpoint_for_shard(&self, allocation_id: &AllocationId, global_checkpoint: SeqNo) {
        self.inner
            .lock()
            .replication
            .update_global_checkpoint_for_copy(allocation_id, global_checkpoint);
    }

    /// Replica: adopt the primary's global checkpoint
    pub fn update_global_checkpoint_on_replica(&self, global_checkpoint: SeqNo) {
        let mut inner = self.inner.lock();
        let local_checkpoint = inner.seq_no.local_checkpoint();
        if global_checkpoint > local_checkpoint {
            // The primary can be ahead of a copy that is still catching up
            tracing::trace!(
                shard = %self.shard_id,
                global_checkpoint,
                local_checkpoint,
                "global checkpoint above local checkpoint"
            );
        }
        inner
            .replication
            .update_global_checkpoint_on_replica(global_checkpoint);
    }

    /// Primary: start sending live writes to a recovering copy
    pub fn initiate_tracking(&self, allocation_id: &AllocationId) -> Result<(), ShardError> {
        let mut inner = self.inner.lock();
        Ok(inner.replication.initiate_tracking(allocation_id)?)
    }

    /// Primary: admit a caught-up copy into the in-sync set
    pub fn mark_allocation_in_sync(
        &self,
        allocation_id: &AllocationId,
        local_checkpoint: SeqNo,
    ) -> Result<(), ShardError> {
        let mut inner = self.inner.lock();
        Ok(inner
            .replication
            .mark_in_sync(allocation_id, local_checkpoint)?)
    }

    /// Primary: drop a copy from the replication group
    pub fn remove_from_routing(
        &self,
        cluster_state_version: u64,
        allocation_id: &AllocationId,
    ) -> bool {
        self.inner
            .lock()
            .replication
            .remove_from_routing(cluster_state_version, allocation_id)
    }

    // ------------------------------------------------------------------
    // Mapping and flush
    // ------------------------------------------------------------------

    pub fn update_mapping(&self, mapping_version: u64) -> Result<(), ShardError> {
        let mut inner = self.inner.lock();
        let engine = inner.engine.as_mut().ok_or(ShardError::EngineClosed)?;
        if mapping_version > engine.mapping_version() {
            tracing::debug!(shard = %self.shard_id, mapping_version, "mapping updated");
            engine.update_mapping(mapping_version);
        }
        Ok(())
    }

    /// Commit the engine and trim history no copy or recovery still needs
    pub fn flush(&self) -> Result<CommitPoint, ShardError> {
        let mut guard = self.inner.lock();
        let state = guard.lifecycle.state();
        if state.is_terminal() {
            return Err(ShardError::IllegalState {
                state,
                operation: "flush",
            });
        }
        self.flush_locked(&mut guard)
    }

    fn flush_locked(&self, inner: &mut ShardInner) -> Result<CommitPoint, ShardError> {
        let global_checkpoint = inner.replication.global_checkpoint();
        let stats = inner.seq_no.stats(global_checkpoint);
        let mut retain_above = stats.local_checkpoint.min(global_checkpoint);
        if let Some(pinned) = inner.history_retention.values().min() {
            retain_above = retain_above.min(pinned - 1);
        }
        let engine = inner.engine.as_mut().ok_or(ShardError::EngineClosed)?;
        let commit = engine.commit(stats, retain_above)?;
        tracing::debug!(
            shard = %self.shard_id,
            generation = commit.generation,
            local_checkpoint = stats.local_checkpoint,
            global_checkpoint,
            "flushed"
        );
        Ok(commit)
    }

    fn maybe_flush_locked(&self, inner: &mut ShardInner) -> Result<(), ShardError> {
        let due = inner
            .engine
            .as_ref()
            .map(|e| e.uncommitted_operations() >= self.config.translog.flush_threshold_ops)
            .unwrap_or(false);
        if due {
            self.flush_locked(inner)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Store recovery
    // ------------------------------------------------------------------

    /// Open the engine over the local store and replay its translog
    pub fn recover_from_store(&self) -> Result<(), ShardError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let state = inner.lifecycle.state();
        let source = inner.routing.recovery_source.clone();
        if state != ShardState::Recovering
            || !inner.routing.primary
            || !matches!(
                source,
                Some(RecoverySource::EmptyStore) | Some(RecoverySource::ExistingStore)
            )
        {
            return Err(ShardError::IllegalState {
                state,
                operation: "recover from store",
            });
        }

        if source == Some(RecoverySource::EmptyStore) {
            if let Err(cause) = self.wipe_store_locked() {
                return Err(self.fail_recovery_locked(inner, RecoveryStage::Init, cause));
            }
        }
        self.finish_local_recovery_locked(inner)
    }

    fn wipe_store_locked(&self) -> Result<(), RecoveryCause> {
        for name in self.store.list_matching(is_index_file) {
            self.store.delete(&name)?;
        }
        Translog::wipe(&self.store).map_err(|e| RecoveryCause::Engine(e.into()))?;
        Ok(())
    }

    /// Open the engine on whatever commit the store holds, replay the
    /// translog above it and move to POST_RECOVERY
    fn finish_local_recovery_locked(&self, inner: &mut ShardInner) -> Result<(), ShardError> {
        let mut stage = RecoveryStage::Index;
        let result = (|| -> Result<usize, RecoveryCause> {
            self.set_stage_locked(inner, stage);
            let engine = (self.engine_factory)(self.store.clone(), &self.config.translog)?;
            let stats = engine
                .last_commit()
                .map(|c| c.seq_no_stats)
                .unwrap_or_else(SeqNoStats::empty);
            let mut tracker = LocalCheckpointTracker::restore(stats.max_seq_no, stats.local_checkpoint)
                .map_err(ShardError::from)?;
            tracker.mark_seq_no_of_update_or_delete(stats.max_seq_no_of_updates_or_deletes);
            inner.seq_no = tracker;
            inner
                .replication
                .update_global_checkpoint_on_replica(stats.global_checkpoint);
            let pending = engine.read_operations_since(stats.local_checkpoint + 1)?;
            inner.engine = Some(engine);

            stage = RecoveryStage::Translog;
            self.set_stage_locked(inner, stage);
            let msu = inner.seq_no.max_seq_no_of_updates_or_deletes();
            let mut replayed = 0;
            for op in &pending {
                if Self::apply_replica_op_locked(inner, op, msu, AppendMode::Replay)?
                    != ReplicaOutcome::Duplicate
                {
                    replayed += 1;
                }
            }

            stage = RecoveryStage::Finalize;
            self.set_stage_locked(inner, stage);
            self.flush_locked(inner)?;
            Ok(replayed)
        })();

        match result {
            Ok(replayed) => {
                if let Some(recovery) = inner.recovery_state.as_mut() {
                    recovery.translog_ops_recovered = replayed;
                    recovery.set_stage(RecoveryStage::Done);
                }
                inner
                    .lifecycle
                    .transition(ShardState::PostRecovery, "local recovery done")
                    .map_err(|(state, _)| ShardError::IllegalState {
                        state,
                        operation: "finish local recovery",
                    })?;
                tracing::info!(
                    shard = %self.shard_id,
                    replayed,
                    local_checkpoint = inner.seq_no.local_checkpoint(),
                    max_seq_no = inner.seq_no.max_seq_no(),
                    "local recovery done"
                );
                Ok(())
            }
            Err(cause) => Err(self.fail_recovery_locked(inner, stage, cause)),
        }
    }

    fn set_stage_locked(&self, inner: &mut ShardInner, stage: RecoveryStage) {
        if let Some(recovery) = inner.recovery_state.as_mut() {
            recovery.set_stage(stage);
        }
    }

    fn fail_recovery_locked(
        &self,
        inner: &mut ShardInner,
        stage: RecoveryStage,
        cause: RecoveryCause,
    ) -> ShardError {
        let failure = RecoveryFailure::new(self.shard_id.clone(), stage, cause);
        tracing::warn!(shard = %self.shard_id, allocation_id = %self.allocation_id, error = %failure, "recovery failed");
        self.fail_locked(inner, failure.to_string());
        failure.into()
    }

    // ------------------------------------------------------------------
    // Snapshot recovery and snapshots
    // ------------------------------------------------------------------

    /// Restore the files of `snapshot` from `repository`, then finish like a
    /// store recovery
    pub async fn recover_from_snapshot<S: ObjectStore>(
        &self,
        repository: &BlobStoreRepository<S>,
        snapshot: &str,
    ) -> Result<(), ShardError> {
        let (recovery_id, token) = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let state = inner.lifecycle.state();
            if state != ShardState::Recovering
                || !matches!(inner.routing.recovery_source, Some(RecoverySource::Snapshot { .. }))
            {
                return Err(ShardError::IllegalState {
                    state,
                    operation: "recover from snapshot",
                });
            }
            if let Err(cause) = self.wipe_store_locked() {
                return Err(self.fail_recovery_locked(inner, RecoveryStage::Init, cause));
            }
            self.set_stage_locked(inner, RecoveryStage::Index);
            let token = CancellationToken::new();
            inner.active_recovery = Some(token.clone());
            let recovery_id = inner
                .recovery_state
                .as_ref()
                .map(|r| r.recovery_id)
                .unwrap_or(0);
            (recovery_id, token)
        };

        let restored = repository
            .restore_shard(&self.shard_id, snapshot, &self.store, recovery_id, &token)
            .await;

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.active_recovery = None;
        let state = inner.lifecycle.state();
        if state != ShardState::Recovering {
            // Closed underneath the restore: nothing it wrote may look like a commit
            let cleanup = self
                .store
                .delete_temp_files(recovery_id)
                .map_err(RecoveryCause::from)
                .and_then(|_| self.wipe_store_locked());
            if let Err(e) = cleanup {
                tracing::warn!(shard = %self.shard_id, error = %e, "failed to clean up cancelled restore");
            }
            return Err(RecoveryFailure::new(
                self.shard_id.clone(),
                RecoveryStage::Index,
                RecoveryCause::Cancelled(format!("shard is {} after restore", state)),
            )
            .into());
        }
        match restored {
            Ok(stats) => {
                if let Some(recovery) = inner.recovery_state.as_mut() {
                    recovery.files.total_files = stats.files;
                    recovery.files.recovered_files = stats.files;
                    recovery.files.total_bytes = stats.bytes;
                    recovery.files.recovered_bytes = stats.bytes;
                    recovery.set_stage(RecoveryStage::VerifyIndex);
                }
                self.finish_local_recovery_locked(inner)
            }
            Err(e) => Err(self.fail_recovery_locked(inner, RecoveryStage::Index, e.into())),
        }
    }

    /// Flush and copy the resulting commit into `repository`.
    /// Returns the shard generation id written.
    pub async fn snapshot_to<S: ObjectStore>(
        &self,
        repository: &BlobStoreRepository<S>,
        snapshot: &str,
    ) -> Result<String, ShardError> {
        let (commit, files) = {
            let mut guard = self.inner.lock();
            let state = guard.lifecycle.state();
            if !matches!(state, ShardState::Started | ShardState::PostRecovery) {
                return Err(ShardError::IllegalState {
                    state,
                    operation: "snapshot",
                });
            }
            let commit = self.flush_locked(&mut guard)?;
            let files = self
                .store
                .snapshot_files(&commit.files())
                .map_err(|e| ShardError::Engine(e.into()))?;
            (commit, files)
        };
        let generation = repository
            .snapshot_shard(&self.shard_id, snapshot, &commit, &files)
            .await?;
        tracing::info!(shard = %self.shard_id, snapshot, generation = %generation, "shard snapshot written");
        Ok(generation)
    }

    // ------------------------------------------------------------------
    // Peer recovery, target side
    // ------------------------------------------------------------------

    /// Recover this replica from the primary behind `source`
    pub async fn recover_from_peer(
        self: &Arc<Self>,
        source: &dyn PeerRecoverySource,
    ) -> Result<RecoveryResponse, ShardError> {
        let (request, token) = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let state = inner.lifecycle.state();
            if state != ShardState::Recovering
                || inner.routing.recovery_source != Some(RecoverySource::Peer)
            {
                return Err(ShardError::IllegalState {
                    state,
                    operation: "recover from peer",
                });
            }
            let starting_seq_no = match self.prepare_peer_recovery_locked(inner) {
                Ok(seq_no) => seq_no,
                Err(cause) => {
                    return Err(self.fail_recovery_locked(inner, RecoveryStage::Init, cause))
                }
            };
            let recovery_id = match inner.recovery_state.as_mut() {
                Some(recovery) => {
                    recovery.starting_seq_no = starting_seq_no;
                    recovery.recovery_id
                }
                None => {
                    let mut recovery = RecoveryState::new(&inner.routing, None);
                    recovery.starting_seq_no = starting_seq_no;
                    let id = recovery.recovery_id;
                    inner.recovery_state = Some(recovery);
                    id
                }
            };
            let token = CancellationToken::new();
            inner.active_recovery = Some(token.clone());
            let request = StartRecoveryRequest {
                recovery_id,
                shard_id: self.shard_id.clone(),
                target_allocation_id: self.allocation_id.clone(),
                target_node: inner.routing.node_id.clone(),
                starting_seq_no,
                primary_term: inner.primary_term,
            };
            (request, token)
        };

        tracing::info!(
            shard = %self.shard_id,
            allocation_id = %self.allocation_id,
            recovery_id = request.recovery_id,
            starting_seq_no = request.starting_seq_no,
            "starting peer recovery"
        );
        let target = Arc::new(RecoveryTarget::new(
            Arc::clone(self),
            request.recovery_id,
            token.clone(),
        ));
        let result = tokio::select! {
            result = source.start_recovery(request, target.clone()) => result,
            _ = token.cancelled() => Err(RecoveryFailure::new(
                self.shard_id.clone(),
                self.recovery_stage(),
                RecoveryCause::Cancelled("recovery cancelled on target".into()),
            )),
        };

        match result {
            Ok(response) => {
                let mut guard = self.inner.lock();
                guard.active_recovery = None;
                if let Some(recovery) = guard.recovery_state.as_mut() {
                    recovery.ops_based = response.ops_based;
                }
                let state = guard.lifecycle.state();
                if state != ShardState::PostRecovery {
                    return Err(ShardError::IllegalState {
                        state,
                        operation: "complete peer recovery",
                    });
                }
                tracing::info!(
                    shard = %self.shard_id,
                    allocation_id = %self.allocation_id,
                    ops_based = response.ops_based,
                    files = response.phase1_file_names.len(),
                    translog_ops = response.translog_ops,
                    took_ms = response.took.as_millis() as u64,
                    "peer recovery done"
                );
                Ok(response)
            }
            Err(failure) => {
                target.cleanup();
                let mut guard = self.inner.lock();
                tracing::warn!(shard = %self.shard_id, allocation_id = %self.allocation_id, error = %failure, "peer recovery failed");
                self.fail_locked(&mut guard, failure.to_string());
                Err(failure.into())
            }
        }
    }

    fn recovery_stage(&self) -> RecoveryStage {
        self.inner
            .lock()
            .recovery_state
            .as_ref()
            .map(|r| r.stage())
            .unwrap_or(RecoveryStage::Init)
    }

    /// Decide where this copy's history can resume.
    ///
    /// A safe local commit (nothing above the global checkpoint) lets the
    /// source skip file copy and send operations from `lc + 1`. Otherwise
    /// the target needs files and starts from UNASSIGNED.
    fn prepare_peer_recovery_locked(&self, inner: &mut ShardInner) -> Result<SeqNo, RecoveryCause> {
        if self.store.latest_commit_generation().is_none() {
            return Ok(UNASSIGNED_SEQ_NO);
        }
        Translog::wipe(&self.store).map_err(|e| RecoveryCause::Engine(e.into()))?;
        let engine = (self.engine_factory)(self.store.clone(), &self.config.translog)?;
        let commit = match engine.last_commit() {
            Some(commit) if commit.is_safe() => commit.clone(),
            _ => return Ok(UNASSIGNED_SEQ_NO),
        };
        let stats = commit.seq_no_stats;
        let mut tracker = LocalCheckpointTracker::restore(stats.max_seq_no, stats.local_checkpoint)
            .map_err(ShardError::from)?;
        tracker.mark_seq_no_of_update_or_delete(stats.max_seq_no_of_updates_or_deletes);
        inner.seq_no = tracker;
        inner
            .replication
            .update_global_checkpoint_on_replica(stats.global_checkpoint);
        inner.engine = Some(engine);
        Ok(stats.local_checkpoint + 1)
    }

    /// Fail unless this copy is still recovering under `token`
    pub(crate) fn ensure_recovering(&self, token: &CancellationToken) -> Result<(), RecoveryCause> {
        if token.is_cancelled() {
            return Err(RecoveryCause::Cancelled("recovery cancelled".into()));
        }
        let state = self.inner.lock().lifecycle.state();
        if state != ShardState::Recovering {
            return Err(RecoveryCause::Cancelled(format!("shard is {}", state)));
        }
        Ok(())
    }

    pub(crate) fn update_recovery_state(&self, f: impl FnOnce(&mut RecoveryState)) {
        if let Some(recovery) = self.inner.lock().recovery_state.as_mut() {
            f(recovery);
        }
    }

    /// Drop the engine before files are replaced
    pub(crate) fn close_engine_for_file_copy(&self) {
        let mut inner = self.inner.lock();
        inner.engine = None;
        inner.seq_no = LocalCheckpointTracker::new();
        if let Some(recovery) = inner.recovery_state.as_mut() {
            recovery.set_stage(RecoveryStage::Index);
        }
    }

    /// Open the engine on the transferred (or local) commit
    pub(crate) fn open_engine_for_translog(&self) -> Result<(), RecoveryCause> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.engine.is_none() {
            Translog::wipe(&self.store).map_err(|e| RecoveryCause::Engine(e.into()))?;
            let engine = (self.engine_factory)(self.store.clone(), &self.config.translog)?;
            let stats = engine
                .last_commit()
                .map(|c| c.seq_no_stats)
                .unwrap_or_else(SeqNoStats::empty);
            let mut tracker =
                LocalCheckpointTracker::restore(stats.max_seq_no, stats.local_checkpoint)
                    .map_err(ShardError::from)?;
            tracker.mark_seq_no_of_update_or_delete(stats.max_seq_no_of_updates_or_deletes);
            inner.seq_no = tracker;
            inner
                .replication
                .update_global_checkpoint_on_replica(stats.global_checkpoint);
            inner.engine = Some(engine);
        }
        if let Some(recovery) = inner.recovery_state.as_mut() {
            recovery.set_stage(RecoveryStage::Translog);
        }
        Ok(())
    }

    /// Apply one phase-2 batch. Returns the local checkpoint afterwards.
    pub(crate) fn apply_recovery_batch(&self, batch: &TranslogBatch) -> Result<SeqNo, ShardError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let state = inner.lifecycle.state();
        if state != ShardState::Recovering {
            return Err(ShardError::IllegalState {
                state,
                operation: "apply recovery operations",
            });
        }
        self.check_replica_term_locked(inner, batch.primary_term)?;
        inner
            .engine
            .as_mut()
            .ok_or(ShardError::EngineClosed)?
            .update_mapping(batch.mapping_version);

        let mut applied = 0;
        for op in &batch.operations {
            if inner.seq_no.has_processed(op.seq_no) {
                // Already in the copied commit; keep it as history for a later resync
                let engine = inner.engine.as_mut().ok_or(ShardError::EngineClosed)?;
                if !engine.has_complete_history(op.seq_no, op.seq_no)? {
                    engine.append_operation(op, AppendMode::HistoryOnly)?;
                }
            } else {
                Self::apply_replica_op_locked(
                    inner,
                    op,
                    batch.max_seq_no_of_updates_or_deletes,
                    AppendMode::Apply,
                )?;
            }
            applied += 1;
        }
        inner
            .replication
            .update_global_checkpoint_on_replica(batch.global_checkpoint);
        if let Some(recovery) = inner.recovery_state.as_mut() {
            recovery.translog_ops_recovered += applied;
        }
        Ok(inner.seq_no.local_checkpoint())
    }

    /// RECOVERING -> POST_RECOVERY after the source admitted this copy
    pub(crate) fn finalize_peer_recovery(&self, global_checkpoint: SeqNo) -> Result<(), ShardError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner
            .replication
            .update_global_checkpoint_on_replica(global_checkpoint);
        if let Some(recovery) = inner.recovery_state.as_mut() {
            recovery.set_stage(RecoveryStage::Finalize);
        }
        inner
            .lifecycle
            .transition(ShardState::PostRecovery, "peer recovery done")
            .map_err(|(state, _)| ShardError::IllegalState {
                state,
                operation: "finalize recovery",
            })?;
        if let Some(recovery) = inner.recovery_state.as_mut() {
            recovery.set_stage(RecoveryStage::Done);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Peer recovery, source side
    // ------------------------------------------------------------------

    /// Check that this copy can serve as a recovery source
    pub(crate) fn validate_recovery_source(&self, request: &StartRecoveryRequest) -> Result<(), ShardError> {
        let inner = self.inner.lock();
        if !inner.routing.primary || !inner.replication.is_primary_mode() {
            return Err(ShardError::NotPrimary);
        }
        let state = inner.lifecycle.state();
        if state != ShardState::Started {
            return Err(ShardError::IllegalState {
                state,
                operation: "serve peer recovery",
            });
        }
        if request.primary_term > inner.primary_term {
            return Err(ShardError::StalePrimaryTerm {
                held: inner.primary_term,
                request: request.primary_term,
            });
        }
        if inner
            .replication
            .checkpoint_state(&request.target_allocation_id)
            .is_none()
        {
            return Err(crate::replication::ReplicationError::UnknownAllocation(
                request.target_allocation_id.clone(),
            )
            .into());
        }
        Ok(())
    }

    /// Keep operations from `from` on in the translog until released.
    /// Returns whether the history from there to max seqNo is complete.
    pub(crate) fn retain_history(&self, recovery_id: u64, from: SeqNo) -> Result<bool, ShardError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.history_retention.insert(recovery_id, from.max(0));
        let to = inner.seq_no.max_seq_no();
        let engine = inner.engine.as_ref().ok_or(ShardError::EngineClosed)?;
        Ok(engine.has_complete_history(from.max(0), to)?)
    }

    pub(crate) fn release_history(&self, recovery_id: u64) {
        self.inner.lock().history_retention.remove(&recovery_id);
    }

    /// Flush, pin the commit's files and retain history from the commit's
    /// global checkpoint on, or from its local checkpoint when the older
    /// operations are already gone
    pub(crate) fn acquire_recovery_commit(&self, recovery_id: u64) -> Result<RecoveryCommit, ShardError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let commit = self.flush_locked(inner)?;
        let stats = commit.seq_no_stats;
        let above_commit = stats.local_checkpoint + 1;
        let above_global = (stats.local_checkpoint.min(stats.global_checkpoint) + 1).max(0);
        let engine = inner.engine.as_ref().ok_or(ShardError::EngineClosed)?;
        let history_from = if engine.has_complete_history(above_global, stats.local_checkpoint)? {
            above_global
        } else {
            above_commit
        };
        inner.history_retention.insert(recovery_id, history_from);
        let files = self
            .store
            .snapshot_files(&commit.files())
            .map_err(|e| ShardError::Engine(e.into()))?;
        let metadata = MetadataSnapshot {
            files: files
                .iter()
                .map(|(name, data)| (name.clone(), StoreFileMetadata::of(name.clone(), data)))
                .collect(),
            commit_generation: Some(commit.generation),
        };
        Ok(RecoveryCommit {
            commit,
            metadata,
            files,
            history_from,
        })
    }

    /// Everything from `from` up to the current max seqNo
    pub(crate) fn recovery_history(&self, from: SeqNo) -> Result<RecoveryHistory, RecoveryCause> {
        let inner = self.inner.lock();
        let end_seq_no = inner.seq_no.max_seq_no();
        let engine = inner.engine.as_ref().ok_or(ShardError::EngineClosed)?;
        let from = from.max(0);
        let operations: Vec<Operation> = engine
            .read_operations_since(from)?
            .into_iter()
            .take_while(|op| op.seq_no <= end_seq_no)
            .collect();
        let contiguous = operations
            .iter()
            .enumerate()
            .all(|(i, op)| op.seq_no == from + i as SeqNo);
        if !contiguous || (from <= end_seq_no && operations.len() as SeqNo != end_seq_no - from + 1) {
            return Err(RecoveryCause::MissingHistory {
                from,
                to: end_seq_no,
            });
        }
        Ok(RecoveryHistory {
            operations,
            end_seq_no,
            max_seq_no_of_updates_or_deletes: inner.seq_no.max_seq_no_of_updates_or_deletes(),
            mapping_version: engine.mapping_version(),
            primary_term: inner.primary_term,
        })
    }
}
