//! Recovery progress reporting

use crate::seqno::{SeqNo, UNASSIGNED_SEQ_NO};
use crate::shard::{RecoverySource, ShardId, ShardRouting};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

static NEXT_RECOVERY_ID: AtomicU64 = AtomicU64::new(1);

/// Stages of a recovery. Only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RecoveryStage {
    Init,
    /// Copying index files
    Index,
    /// Checking copied files against the source's checksums
    VerifyIndex,
    /// Replaying operations
    Translog,
    Finalize,
    Done,
}

impl std::fmt::Display for RecoveryStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RecoveryStage::Init => "INIT",
            RecoveryStage::Index => "INDEX",
            RecoveryStage::VerifyIndex => "VERIFY_INDEX",
            RecoveryStage::Translog => "TRANSLOG",
            RecoveryStage::Finalize => "FINALIZE",
            RecoveryStage::Done => "DONE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecoveryStats {
    pub total_files: usize,
    pub reused_files: usize,
    pub recovered_files: usize,
    pub total_bytes: u64,
    pub reused_bytes: u64,
    pub recovered_bytes: u64,
}

/// Progress of one recovery of one copy
#[derive(Debug, Clone)]
pub struct RecoveryState {
    pub recovery_id: u64,
    pub shard_id: ShardId,
    pub source: RecoverySource,
    pub source_node: Option<String>,
    pub target_node: String,
    stage: RecoveryStage,
    pub starting_seq_no: SeqNo,
    /// Phase 1 was skipped; history came from operations only
    pub ops_based: bool,
    pub files: FileRecoveryStats,
    pub translog_ops_recovered: usize,
    started_at: Instant,
    took: Option<Duration>,
}

impl RecoveryState {
    /// Fresh state for the copy described by `routing`
    pub fn new(routing: &ShardRouting, source_node: Option<String>) -> Self {
        debug_assert!(
            routing.recovery_source.is_some(),
            "Precondition: only initializing copies recover"
        );
        RecoveryState {
            recovery_id: NEXT_RECOVERY_ID.fetch_add(1, Ordering::Relaxed),
            shard_id: routing.shard_id.clone(),
            source: routing
                .recovery_source
                .clone()
                .unwrap_or(RecoverySource::ExistingStore),
            source_node,
            target_node: routing.node_id.clone(),
            stage: RecoveryStage::Init,
            starting_seq_no: UNASSIGNED_SEQ_NO,
            ops_based: false,
            files: FileRecoveryStats::default(),
            translog_ops_recovered: 0,
            started_at: Instant::now(),
            took: None,
        }
    }

    pub fn stage(&self) -> RecoveryStage {
        self.stage
    }

    /// Move to `next`. Returns false (and stays put) for a backward move.
    pub fn set_stage(&mut self, next: RecoveryStage) -> bool {
        if next < self.stage {
            tracing::warn!(from = %self.stage, to = %next, "ignoring backward recovery stage");
            return false;
        }
        self.stage = next;
        if next == RecoveryStage::Done {
            self.took = Some(self.started_at.elapsed());
        }
        true
    }

    /// Wall time so far, or total once done
    pub fn elapsed(&self) -> Duration {
        self.took.unwrap_or_else(|| self.started_at.elapsed())
    }

    pub fn is_done(&self) -> bool {
        self.stage == RecoveryStage::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::AllocationId;

    fn routing() -> ShardRouting {
        ShardRouting::initializing(
            ShardId::new("idx", 0),
            AllocationId::new("r1"),
            "node-b",
            false,
            RecoverySource::Peer,
        )
    }

    #[test]
    fn test_stages_only_move_forward() {
        let mut state = RecoveryState::new(&routing(), Some("node-a".into()));
        assert_eq!(state.stage(), RecoveryStage::Init);
        assert!(state.set_stage(RecoveryStage::Index));
        assert!(state.set_stage(RecoveryStage::Translog));
        assert!(!state.set_stage(RecoveryStage::Index));
        assert_eq!(state.stage(), RecoveryStage::Translog);
        assert!(state.set_stage(RecoveryStage::Done));
        assert!(state.is_done());
    }

    #[test]
    fn test_recovery_ids_are_unique() {
        let a = RecoveryState::new(&routing(), None);
        let b = RecoveryState::new(&routing(), None);
        assert_ne!(a.recovery_id, b.recovery_id);
        assert_eq!(a.source, RecoverySource::Peer);
        assert_eq!(a.target_node, "node-b");
    }
}
