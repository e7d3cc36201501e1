use super::{SeqNo, NO_OPS_PERFORMED, UNASSIGNED_SEQ_NO};
use serde::{Deserialize, Serialize};

/// Snapshot of a copy's sequence number state.
///
/// Persisted with every commit point so it survives a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeqNoStats {
    pub max_seq_no: SeqNo,
    pub local_checkpoint: SeqNo,
    pub global_checkpoint: SeqNo,
    pub max_seq_no_of_updates_or_deletes: SeqNo,
}

impl SeqNoStats {
    /// State of a brand new, empty copy
    pub fn empty() -> Self {
        SeqNoStats {
            max_seq_no: NO_OPS_PERFORMED,
            local_checkpoint: NO_OPS_PERFORMED,
            global_checkpoint: UNASSIGNED_SEQ_NO,
            max_seq_no_of_updates_or_deletes: UNASSIGNED_SEQ_NO,
        }
    }

    /// Check the invariants that must hold for any persisted state
    pub fn is_consistent(&self) -> bool {
        self.local_checkpoint <= self.max_seq_no && self.local_checkpoint >= NO_OPS_PERFORMED
    }
}

impl Default for SeqNoStats {
    fn default() -> Self {
        Self::empty()
    }
}

impl std::fmt::Display for SeqNoStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "max_seq_no={} local_checkpoint={} global_checkpoint={} msu={}",
            self.max_seq_no,
            self.local_checkpoint,
            self.global_checkpoint,
            self.max_seq_no_of_updates_or_deletes
        )
    }
}
