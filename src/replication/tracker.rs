//! ReplicationTracker - the primary's view of its replication group
//!
//! ```text
//!              routing table (allocator)
//!  ┌──────────────────────────────────────────────┐
//!  │  tracked (receive live writes)               │
//!  │  ┌───────────────────────────────┐           │
//!  │  │ in-sync (bound the global cp) │           │
//!  │  │  primary   replica-a          │ replica-b │ replica-c
//!  │  └───────────────────────────────┘ (recovering) (unassigned)
//!  └──────────────────────────────────────────────┘
//! ```
//!
//! Invariants:
//! - in-sync ⊆ routing table
//! - global checkpoint ≤ min local checkpoint over in-sync copies
//! - global checkpoint never decreases
//! - a copy joins in-sync only with local checkpoint ≥ global checkpoint
//!
//! Cluster state updates carry a version; anything not newer than the last
//! applied version is ignored, so a delayed update can never resurrect a
//! removed copy.

use crate::seqno::{SeqNo, NO_OPS_PERFORMED, UNASSIGNED_SEQ_NO};
use crate::shard::{AllocationId, RoutingTable};
use std::collections::{BTreeMap, BTreeSet};

/// Error type for replication group changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationError {
    /// The copy is not part of the routing table
    UnknownAllocation(AllocationId),
    /// The copy is behind the global checkpoint and cannot join in-sync
    NotCaughtUp {
        allocation_id: AllocationId,
        local_checkpoint: SeqNo,
        global_checkpoint: SeqNo,
    },
    /// Operation only valid on a primary
    NotPrimaryMode,
}

impl std::fmt::Display for ReplicationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicationError::UnknownAllocation(id) => {
                write!(f, "allocation {} is not in the routing table", id)
            }
            ReplicationError::NotCaughtUp {
                allocation_id,
                local_checkpoint,
                global_checkpoint,
            } => write!(
                f,
                "allocation {} has local checkpoint {} below global checkpoint {}",
                allocation_id, local_checkpoint, global_checkpoint
            ),
            ReplicationError::NotPrimaryMode => write!(f, "tracker is not in primary mode"),
        }
    }
}

impl std::error::Error for ReplicationError {}

/// What the primary knows about one copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointState {
    pub local_checkpoint: SeqNo,
    pub global_checkpoint: SeqNo,
    pub in_sync: bool,
    /// Receives live writes
    pub tracked: bool,
}

impl CheckpointState {
    fn unknown() -> Self {
        CheckpointState {
            local_checkpoint: UNASSIGNED_SEQ_NO,
            global_checkpoint: UNASSIGNED_SEQ_NO,
            in_sync: false,
            tracked: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReplicationTracker {
    shard_allocation_id: AllocationId,
    primary_mode: bool,
    /// Last applied cluster state version (0 = none yet)
    applied_cluster_state_version: u64,
    checkpoints: BTreeMap<AllocationId, CheckpointState>,
    global_checkpoint: SeqNo,
}

impl ReplicationTracker {
    pub fn new(shard_allocation_id: AllocationId, global_checkpoint: SeqNo) -> Self {
        let mut checkpoints = BTreeMap::new();
        checkpoints.insert(shard_allocation_id.clone(), CheckpointState::unknown());
        ReplicationTracker {
            shard_allocation_id,
            primary_mode: false,
            applied_cluster_state_version: 0,
            checkpoints,
            global_checkpoint,
        }
    }

    pub fn is_primary_mode(&self) -> bool {
        self.primary_mode
    }

    pub fn applied_cluster_state_version(&self) -> u64 {
        self.applied_cluster_state_version
    }

    /// True if `version` has already been applied (or superseded)
    pub fn is_stale(&self, version: u64) -> bool {
        version <= self.applied_cluster_state_version
    }

    /// Apply the allocator's routing table and in-sync set.
    ///
    /// Returns false (and changes nothing) for a stale version.
    pub fn update_from_cluster_state(
        &mut self,
        version: u64,
        in_sync_ids: &BTreeSet<AllocationId>,
        routing_table: &RoutingTable,
    ) -> bool {
        if self.is_stale(version) {
            tracing::debug!(
                version,
                applied = self.applied_cluster_state_version,
                "ignoring stale cluster state"
            );
            return false;
        }

        let mut next = BTreeMap::new();
        for id in routing_table.allocation_ids() {
            let previous = self.checkpoints.get(id).copied();
            let mut state = previous.unwrap_or_else(CheckpointState::unknown);
            let locally_in_sync = self.primary_mode && previous.map(|p| p.in_sync).unwrap_or(false);
            state.in_sync = in_sync_ids.contains(id) || locally_in_sync;
            if self.primary_mode && state.in_sync {
                state.tracked = true;
            }
            next.insert(id.clone(), state);
        }
        if self.primary_mode {
            if let Some(own) = next.get_mut(&self.shard_allocation_id) {
                own.in_sync = true;
                own.tracked = true;
            }
        }

        for removed in self.checkpoints.keys().filter(|id| !next.contains_key(*id)) {
            tracing::info!(allocation_id = %removed, "copy removed from replication group");
        }

        self.checkpoints = next;
        self.applied_cluster_state_version = version;
        if self.primary_mode {
            self.compute_global_checkpoint();
        }
        self.check_invariants();
        true
    }

    /// Switch to primary mode with this copy's current local checkpoint
    pub fn activate_primary_mode(&mut self, local_checkpoint: SeqNo) {
        debug_assert!(
            local_checkpoint >= NO_OPS_PERFORMED,
            "Precondition: primary must know its own local checkpoint"
        );
        self.primary_mode = true;
        let own = self
            .checkpoints
            .entry(self.shard_allocation_id.clone())
            .or_insert_with(CheckpointState::unknown);
        own.local_checkpoint = own.local_checkpoint.max(local_checkpoint);
        own.in_sync = true;
        own.tracked = true;
        for state in self.checkpoints.values_mut() {
            if state.in_sync {
                state.tracked = true;
            }
        }
        self.compute_global_checkpoint();
        self.check_invariants();
    }

    /// Record a copy's reported local checkpoint. Returns the global checkpoint.
    pub fn update_local_checkpoint(
        &mut self,
        allocation_id: &AllocationId,
        local_checkpoint: SeqNo,
    ) -> Result<SeqNo, ReplicationError> {
        if !self.primary_mode {
            return Err(ReplicationError::NotPrimaryMode);
        }
        let state = self
            .checkpoints
            .get_mut(allocation_id)
            .ok_or_else(|| ReplicationError::UnknownAllocation(allocation_id.clone()))?;
        if local_checkpoint > state.local_checkpoint {
            state.local_checkpoint = local_checkpoint;
        }
        Ok(self.compute_global_checkpoint())
    }

    /// Record the global checkpoint a copy has acknowledged
    pub fn update_global_checkpoint_for_copy(
        &mut self,
        allocation_id: &AllocationId,
        global_checkpoint: SeqNo,
    ) {
        if let Some(state) = self.checkpoints.get_mut(allocation_id) {
            state.global_checkpoint = state.global_checkpoint.max(global_checkpoint);
        }
    }

    /// Start sending live writes to a recovering copy
    pub fn initiate_tracking(&mut self, allocation_id: &AllocationId) -> Result<(), ReplicationError> {
        if !self.primary_mode {
            return Err(ReplicationError::NotPrimaryMode);
        }
        let state = self
            .checkpoints
            .get_mut(allocation_id)
            .ok_or_else(|| ReplicationError::UnknownAllocation(allocation_id.clone()))?;
        state.tracked = true;
        tracing::debug!(allocation_id = %allocation_id, "tracking copy");
        Ok(())
    }

    /// Admit a caught-up copy to the in-sync set
    pub fn mark_in_sync(
        &mut self,
        allocation_id: &AllocationId,
        local_checkpoint: SeqNo,
    ) -> Result<(), ReplicationError> {
        if !self.primary_mode {
            return Err(ReplicationError::NotPrimaryMode);
        }
        let global_checkpoint = self.global_checkpoint;
        let state = self
            .checkpoints
            .get_mut(allocation_id)
            .ok_or_else(|| ReplicationError::UnknownAllocation(allocation_id.clone()))?;
        if local_checkpoint > state.local_checkpoint {
            state.local_checkpoint = local_checkpoint;
        }
        if state.local_checkpoint < global_checkpoint {
            return Err(ReplicationError::NotCaughtUp {
                allocation_id: allocation_id.clone(),
                local_checkpoint: state.local_checkpoint,
                global_checkpoint,
            });
        }
        state.in_sync = true;
        state.tracked = true;
        tracing::info!(
            allocation_id = %allocation_id,
            local_checkpoint = state.local_checkpoint,
            "copy marked in-sync"
        );
        self.compute_global_checkpoint();
        self.check_invariants();
        Ok(())
    }

    /// Drop a copy from the group. Returns false for a stale version and
    /// for this copy's own allocation, which is never removed.
    pub fn remove_from_routing(&mut self, version: u64, allocation_id: &AllocationId) -> bool {
        if self.is_stale(version) {
            return false;
        }
        if allocation_id == &self.shard_allocation_id {
            tracing::warn!(allocation_id = %allocation_id, version, "refusing to remove own copy from replication group");
            return false;
        }
        if self.checkpoints.remove(allocation_id).is_some() {
            tracing::info!(allocation_id = %allocation_id, version, "copy removed from replication group");
        }
        self.applied_cluster_state_version = version;
        if self.primary_mode {
            self.compute_global_checkpoint();
        }
        true
    }

    /// Recompute the global checkpoint from in-sync local checkpoints.
    ///
    /// Holds still while any in-sync copy has not reported yet.
    pub fn compute_global_checkpoint(&mut self) -> SeqNo {
        let mut min_local = None::<SeqNo>;
        for state in self.checkpoints.values().filter(|s| s.in_sync) {
            if state.local_checkpoint == UNASSIGNED_SEQ_NO {
                return self.global_checkpoint;
            }
            let lc = state.local_checkpoint;
            min_local = Some(min_local.map_or(lc, |m| m.min(lc)));
        }
        if let Some(candidate) = min_local {
            if candidate > self.global_checkpoint {
                tracing::trace!(
                    from = self.global_checkpoint,
                    to = candidate,
                    "global checkpoint advanced"
                );
                self.global_checkpoint = candidate;
            }
        }
        self.global_checkpoint
    }

    /// Replica path: adopt the primary's global checkpoint (never regresses)
    pub fn update_global_checkpoint_on_replica(&mut self, global_checkpoint: SeqNo) {
        if global_checkpoint > self.global_checkpoint {
            self.global_checkpoint = global_checkpoint;
        }
    }

    pub fn global_checkpoint(&self) -> SeqNo {
        self.global_checkpoint
    }

    pub fn checkpoint_state(&self, allocation_id: &AllocationId) -> Option<&CheckpointState> {
        self.checkpoints.get(allocation_id)
    }

    pub fn in_sync_allocation_ids(&self) -> BTreeSet<AllocationId> {
        self.checkpoints
            .iter()
            .filter(|(_, s)| s.in_sync)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn is_in_sync(&self, allocation_id: &AllocationId) -> bool {
        self.checkpoints
            .get(allocation_id)
            .map(|s| s.in_sync)
            .unwrap_or(false)
    }

    /// Copies other than this one that receive live writes
    pub fn replication_targets(&self) -> Vec<AllocationId> {
        self.checkpoints
            .iter()
            .filter(|(id, s)| s.tracked && **id != self.shard_allocation_id)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Minimum global checkpoint acknowledged by in-sync copies
    pub fn min_acknowledged_global_checkpoint(&self) -> SeqNo {
        self.checkpoints
            .iter()
            .filter(|(id, s)| s.in_sync && **id != self.shard_allocation_id)
            .map(|(_, s)| s.global_checkpoint)
            .min()
            .unwrap_or(self.global_checkpoint)
    }

    fn check_invariants(&self) {
        if self.primary_mode {
            debug_assert!(
                self.is_in_sync(&self.shard_allocation_id),
                "Invariant: primary is always in-sync"
            );
        }
        debug_assert!(
            self.checkpoints
                .values()
                .filter(|s| s.in_sync && s.local_checkpoint != UNASSIGNED_SEQ_NO)
                .all(|s| !self.primary_mode || s.local_checkpoint >= self.global_checkpoint),
            "Invariant: in-sync copies never sit below the global checkpoint"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::{RecoverySource, ShardId, ShardRouting};

    fn alloc(id: &str) -> AllocationId {
        AllocationId::new(id)
    }

    fn table(ids: &[&str]) -> RoutingTable {
        let shard_id = ShardId::new("idx", 0);
        ids.iter().enumerate().fold(RoutingTable::new(shard_id.clone()), |t, (i, id)| {
            t.with(
                ShardRouting::initializing(
                    shard_id.clone(),
                    alloc(id),
                    format!("node-{}", i),
                    i == 0,
                    RecoverySource::Peer,
                )
                .moved_to_started(),
            )
        })
    }

    fn ids(list: &[&str]) -> BTreeSet<AllocationId> {
        list.iter().map(|id| alloc(id)).collect()
    }

    fn primary_tracker(copies: &[&str], in_sync: &[&str]) -> ReplicationTracker {
        let mut tracker = ReplicationTracker::new(alloc(copies[0]), UNASSIGNED_SEQ_NO);
        tracker.update_from_cluster_state(1, &ids(in_sync), &table(copies));
        tracker.activate_primary_mode(NO_OPS_PERFORMED);
        tracker
    }

    #[test]
    fn test_global_checkpoint_is_min_of_in_sync() {
        let mut tracker = primary_tracker(&["p", "r1", "r2"], &["p", "r1", "r2"]);
        tracker.update_local_checkpoint(&alloc("p"), 10).unwrap();
        tracker.update_local_checkpoint(&alloc("r1"), 7).unwrap();
        // r2 has not reported yet
        assert_eq!(tracker.global_checkpoint(), UNASSIGNED_SEQ_NO);
        tracker.update_local_checkpoint(&alloc("r2"), 9).unwrap();
        assert_eq!(tracker.global_checkpoint(), 7);
        tracker.update_local_checkpoint(&alloc("r1"), 12).unwrap();
        assert_eq!(tracker.global_checkpoint(), 9);
    }

    #[test]
    fn test_global_checkpoint_never_regresses() {
        let mut tracker = primary_tracker(&["p", "r1"], &["p", "r1"]);
        tracker.update_local_checkpoint(&alloc("p"), 5).unwrap();
        tracker.update_local_checkpoint(&alloc("r1"), 5).unwrap();
        assert_eq!(tracker.global_checkpoint(), 5);
        tracker.update_local_checkpoint(&alloc("r1"), 3).unwrap();
        assert_eq!(tracker.global_checkpoint(), 5);
    }

    #[test]
    fn test_tracking_copy_does_not_hold_back_global_checkpoint() {
        let mut tracker = primary_tracker(&["p", "r1"], &["p"]);
        tracker.initiate_tracking(&alloc("r1")).unwrap();
        tracker.update_local_checkpoint(&alloc("p"), 4).unwrap();
        assert_eq!(tracker.global_checkpoint(), 4);
        assert_eq!(tracker.replication_targets(), vec![alloc("r1")]);
        assert!(!tracker.is_in_sync(&alloc("r1")));
    }

    #[test]
    fn test_mark_in_sync_requires_catch_up() {
        let mut tracker = primary_tracker(&["p", "r1"], &["p"]);
        tracker.update_local_checkpoint(&alloc("p"), 4).unwrap();
        tracker.initiate_tracking(&alloc("r1")).unwrap();

        let err = tracker.mark_in_sync(&alloc("r1"), 2).unwrap_err();
        assert!(matches!(err, ReplicationError::NotCaughtUp { .. }));
        assert!(!tracker.is_in_sync(&alloc("r1")));

        tracker.mark_in_sync(&alloc("r1"), 4).unwrap();
        assert!(tracker.is_in_sync(&alloc("r1")));
        assert_eq!(tracker.global_checkpoint(), 4);
    }

    #[test]
    fn test_unknown_allocation_rejected() {
        let mut tracker = primary_tracker(&["p"], &["p"]);
        assert_eq!(
            tracker.initiate_tracking(&alloc("ghost")),
            Err(ReplicationError::UnknownAllocation(alloc("ghost")))
        );
        assert!(tracker.update_local_checkpoint(&alloc("ghost"), 1).is_err());
    }

    #[test]
    fn test_removing_lagging_copy_unblocks_global_checkpoint() {
        let mut tracker = primary_tracker(&["p", "r1", "r2"], &["p", "r1", "r2"]);
        tracker.update_local_checkpoint(&alloc("p"), 8).unwrap();
        tracker.update_local_checkpoint(&alloc("r1"), 8).unwrap();
        tracker.update_local_checkpoint(&alloc("r2"), 2).unwrap();
        assert_eq!(tracker.global_checkpoint(), 2);

        assert!(tracker.remove_from_routing(2, &alloc("r2")));
        assert_eq!(tracker.global_checkpoint(), 8);
        assert!(tracker.checkpoint_state(&alloc("r2")).is_none());
    }

    #[test]
    fn test_stale_cluster_state_is_ignored() {
        let mut tracker = primary_tracker(&["p", "r1"], &["p", "r1"]);
        assert!(tracker.remove_from_routing(5, &alloc("r1")));
        // Delayed update from before the removal must not resurrect r1
        assert!(!tracker.update_from_cluster_state(4, &ids(&["p", "r1"]), &table(&["p", "r1"])));
        assert!(tracker.checkpoint_state(&alloc("r1")).is_none());
        assert!(!tracker.remove_from_routing(5, &alloc("p")));
    }

    #[test]
    fn test_own_copy_is_never_removed() {
        let mut tracker = primary_tracker(&["p", "r1"], &["p", "r1"]);
        tracker.update_local_checkpoint(&alloc("p"), 3).unwrap();
        tracker.update_local_checkpoint(&alloc("r1"), 3).unwrap();

        assert!(!tracker.remove_from_routing(2, &alloc("p")));
        assert_eq!(tracker.checkpoint_state(&alloc("p")).map(|s| s.local_checkpoint), Some(3));
        assert_eq!(tracker.applied_cluster_state_version(), 1);
        assert_eq!(tracker.global_checkpoint(), 3);
        // The version was not consumed by the refused removal
        assert!(tracker.remove_from_routing(2, &alloc("r1")));
    }

    #[test]
    fn test_in_sync_is_subset_of_routing() {
        let mut tracker = primary_tracker(&["p", "r1"], &["p", "r1"]);
        tracker.update_from_cluster_state(2, &ids(&["p", "r1", "ghost"]), &table(&["p", "r1"]));
        assert_eq!(tracker.in_sync_allocation_ids(), ids(&["p", "r1"]));
    }

    #[test]
    fn test_replica_mode_adopts_global_checkpoint() {
        let mut tracker = ReplicationTracker::new(alloc("r1"), UNASSIGNED_SEQ_NO);
        tracker.update_global_checkpoint_on_replica(6);
        tracker.update_global_checkpoint_on_replica(3);
        assert_eq!(tracker.global_checkpoint(), 6);
        assert_eq!(
            tracker.update_local_checkpoint(&alloc("r1"), 6),
            Err(ReplicationError::NotPrimaryMode)
        );
    }
}
