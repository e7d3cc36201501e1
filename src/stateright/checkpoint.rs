//! Stateright Model for Checkpoint Tracking
//!
//! Exhaustively explores a primary and its replicas receiving operations
//! out of order, reporting local checkpoints late and being removed from
//! the group, and verifies:
//! - The global checkpoint never exceeds the local checkpoint of any
//!   in-sync copy
//! - The global checkpoint never goes backward
//! - Every seqNo at or below a copy's local checkpoint was processed there

use stateright::{Model, Property};
use std::collections::{BTreeMap, BTreeSet};

pub type CopyId = u8;

/// The primary is always copy 0
pub const PRIMARY: CopyId = 0;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CopyState {
    pub processed: BTreeSet<i64>,
    pub in_sync: bool,
}

impl CopyState {
    fn new() -> Self {
        CopyState {
            processed: BTreeSet::new(),
            in_sync: true,
        }
    }

    /// Highest seqNo below which nothing is missing
    pub fn local_checkpoint(&self) -> i64 {
        let mut checkpoint = -1;
        while self.processed.contains(&(checkpoint + 1)) {
            checkpoint += 1;
        }
        checkpoint
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CheckpointState {
    pub next_seq_no: i64,
    pub copies: BTreeMap<CopyId, CopyState>,
    /// Local checkpoints as last reported to the primary
    pub reported: BTreeMap<CopyId, i64>,
    pub global_checkpoint: i64,
    /// Global checkpoint before the last step
    pub previous_global_checkpoint: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum CheckpointAction {
    /// Primary assigns the next seqNo and applies it
    Index,
    /// A replica applies one operation it has not seen yet
    Deliver { copy: CopyId, seq_no: i64 },
    /// A replica reports its local checkpoint
    Report { copy: CopyId },
    /// The allocator drops a replica from the group
    Remove { copy: CopyId },
}

pub struct CheckpointModel {
    pub replicas: u8,
    pub max_ops: i64,
}

impl CheckpointModel {
    pub fn new(replicas: u8, max_ops: i64) -> Self {
        CheckpointModel { replicas, max_ops }
    }

    fn compute_global_checkpoint(state: &CheckpointState) -> i64 {
        let min = state
            .copies
            .iter()
            .filter(|(_, c)| c.in_sync)
            .map(|(id, _)| state.reported.get(id).copied().unwrap_or(-1))
            .min()
            .unwrap_or(-1);
        min.max(state.global_checkpoint)
    }
}

impl Model for CheckpointModel {
    type State = CheckpointState;
    type Action = CheckpointAction;

    fn init_states(&self) -> Vec<Self::State> {
        let copies = (0..=self.replicas).map(|id| (id, CopyState::new())).collect();
        vec![CheckpointState {
            next_seq_no: 0,
            copies,
            reported: BTreeMap::new(),
            global_checkpoint: -1,
            previous_global_checkpoint: -1,
        }]
    }

    fn actions(&self, state: &Self::State, actions: &mut Vec<Self::Action>) {
        if state.next_seq_no < self.max_ops {
            actions.push(CheckpointAction::Index);
        }
        for (&copy, copy_state) in &state.copies {
            if copy == PRIMARY {
                continue;
            }
            for seq_no in 0..state.next_seq_no {
                if !copy_state.processed.contains(&seq_no) {
                    actions.push(CheckpointAction::Deliver { copy, seq_no });
                }
            }
            if state.reported.get(&copy).copied() != Some(copy_state.local_checkpoint()) {
                actions.push(CheckpointAction::Report { copy });
            }
            if copy_state.in_sync {
                actions.push(CheckpointAction::Remove { copy });
            }
        }
    }

    fn next_state(&self, state: &Self::State, action: Self::Action) -> Option<Self::State> {
        let mut next = state.clone();
        next.previous_global_checkpoint = state.global_checkpoint;
        match action {
            CheckpointAction::Index => {
                let seq_no = next.next_seq_no;
                next.next_seq_no += 1;
                let primary = next.copies.get_mut(&PRIMARY)?;
                primary.processed.insert(seq_no);
                let checkpoint = primary.local_checkpoint();
                next.reported.insert(PRIMARY, checkpoint);
            }
            CheckpointAction::Deliver { copy, seq_no } => {
                next.copies.get_mut(&copy)?.processed.insert(seq_no);
            }
            CheckpointAction::Report { copy } => {
                let checkpoint = next.copies.get(&copy)?.local_checkpoint();
                let known = next.reported.entry(copy).or_insert(-1);
                *known = (*known).max(checkpoint);
            }
            CheckpointAction::Remove { copy } => {
                next.copies.get_mut(&copy)?.in_sync = false;
                next.reported.remove(&copy);
            }
        }
        next.global_checkpoint = Self::compute_global_checkpoint(&next);
        Some(next)
    }

    fn properties(&self) -> Vec<Property<Self>> {
        vec![
            Property::always("global_checkpoint_below_in_sync_local_checkpoints", |_, state: &CheckpointState| {
                state
                    .copies
                    .values()
                    .filter(|c| c.in_sync)
                    .all(|c| state.global_checkpoint <= c.local_checkpoint())
            }),
            Property::always("global_checkpoint_monotonic", |_, state: &CheckpointState| {
                state.global_checkpoint >= state.previous_global_checkpoint
            }),
            Property::always("local_checkpoint_contiguous", |_, state: &CheckpointState| {
                state
                    .copies
                    .values()
                    .all(|c| (0..=c.local_checkpoint()).all(|s| c.processed.contains(&s)))
            }),
            Property::sometimes("global_checkpoint_reaches_max", |model: &CheckpointModel, state: &CheckpointState| {
                state.global_checkpoint == model.max_ops - 1
            }),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::ReplicationTracker;
    use crate::shard::{AllocationId, RecoverySource, RoutingTable, ShardId, ShardRouting};
    use stateright::Checker;

    #[test]
    fn test_laggard_removal_advances_global_checkpoint() {
        let model = CheckpointModel::new(2, 2);
        let mut state = model.init_states().remove(0);
        for action in [
            CheckpointAction::Index,
            CheckpointAction::Index,
            CheckpointAction::Deliver { copy: 1, seq_no: 0 },
            CheckpointAction::Deliver { copy: 1, seq_no: 1 },
            CheckpointAction::Report { copy: 1 },
        ] {
            state = model.next_state(&state, action).unwrap();
        }
        assert_eq!(state.global_checkpoint, -1);
        state = model
            .next_state(&state, CheckpointAction::Remove { copy: 2 })
            .unwrap();
        assert_eq!(state.global_checkpoint, 1);
    }

    #[test]
    fn test_model_agrees_with_replication_tracker() {
        let shard_id = ShardId::new("model", 0);
        let routing = |id: &str, primary| {
            ShardRouting::initializing(shard_id.clone(), AllocationId::new(id), id, primary, RecoverySource::Peer)
                .moved_to_started()
        };
        let table = RoutingTable::new(shard_id.clone())
            .with(routing("c0", true))
            .with(routing("c1", false))
            .with(routing("c2", false));
        let in_sync: BTreeSet<AllocationId> = table.allocation_ids().cloned().collect();
        let mut tracker = ReplicationTracker::new(AllocationId::new("c0"), -1);
        tracker.update_from_cluster_state(1, &in_sync, &table);
        tracker.activate_primary_mode(1);

        let model = CheckpointModel::new(2, 2);
        let mut state = model.init_states().remove(0);
        for action in [
            CheckpointAction::Index,
            CheckpointAction::Index,
            CheckpointAction::Deliver { copy: 1, seq_no: 1 },
            CheckpointAction::Report { copy: 1 },
            CheckpointAction::Deliver { copy: 2, seq_no: 0 },
            CheckpointAction::Report { copy: 2 },
        ] {
            state = model.next_state(&state, action).unwrap();
        }
        tracker
            .update_local_checkpoint(&AllocationId::new("c1"), state.reported[&1])
            .unwrap();
        let gc = tracker
            .update_local_checkpoint(&AllocationId::new("c2"), state.reported[&2])
            .unwrap();
        assert_eq!(gc, state.global_checkpoint);
    }

    #[test]
    #[ignore] // Run with: cargo test stateright_checkpoint -- --ignored --nocapture
    fn stateright_checkpoint_model_check() {
        let checker = CheckpointModel::new(2, 3).checker().spawn_bfs().join();
        println!("States explored: {}", checker.unique_state_count());
        checker.assert_properties();
    }

    #[test]
    fn stateright_checkpoint_small_model_check() {
        let checker = CheckpointModel::new(1, 2).checker().spawn_bfs().join();
        checker.assert_properties();
    }
}
