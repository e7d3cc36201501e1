//! LocalCheckpointTracker - per-copy sequence number bookkeeping
//!
//! Pure data structure, no I/O. Callers serialize access through the shard's
//! single-writer lock.

use super::{SeqNo, SeqNoStats, MAX_SEQ_NO_AHEAD, NO_OPS_PERFORMED, UNASSIGNED_SEQ_NO};
use std::collections::BTreeSet;

/// Error type for sequence number bookkeeping
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeqNoError {
    /// Sequence number outside the valid range, or already used
    InvalidSequenceNumber { seq_no: SeqNo, reason: &'static str },
    /// Restored state violates `local_checkpoint <= max_seq_no`
    InconsistentState { max_seq_no: SeqNo, local_checkpoint: SeqNo },
}

impl std::fmt::Display for SeqNoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SeqNoError::InvalidSequenceNumber { seq_no, reason } => {
                write!(f, "invalid sequence number {}: {}", seq_no, reason)
            }
            SeqNoError::InconsistentState {
                max_seq_no,
                local_checkpoint,
            } => write!(
                f,
                "local checkpoint {} is above max seq_no {}",
                local_checkpoint, max_seq_no
            ),
        }
    }
}

impl std::error::Error for SeqNoError {}

/// Tracks assigned and completed sequence numbers for one shard copy.
///
/// Operations may complete out of order. A seqNo completed above a gap is
/// buffered in `pending` until the gap closes, at which point the local
/// checkpoint jumps over every contiguous buffered entry.
#[derive(Debug, Clone)]
pub struct LocalCheckpointTracker {
    /// Next seqNo handed out by `generate_seq_no` (primary only)
    next_seq_no: SeqNo,
    /// Highest seqNo assigned or observed
    max_seq_no: SeqNo,
    /// Highest contiguous completed seqNo
    checkpoint: SeqNo,
    /// Completed seqNos strictly above `checkpoint + 1`
    pending: BTreeSet<SeqNo>,
    max_seq_no_of_updates_or_deletes: SeqNo,
}

impl LocalCheckpointTracker {
    /// Tracker for a copy with no history
    pub fn new() -> Self {
        LocalCheckpointTracker {
            next_seq_no: 0,
            max_seq_no: NO_OPS_PERFORMED,
            checkpoint: NO_OPS_PERFORMED,
            pending: BTreeSet::new(),
            max_seq_no_of_updates_or_deletes: UNASSIGNED_SEQ_NO,
        }
    }

    /// Tracker restored from a commit point
    pub fn restore(max_seq_no: SeqNo, local_checkpoint: SeqNo) -> Result<Self, SeqNoError> {
        if local_checkpoint > max_seq_no || local_checkpoint < NO_OPS_PERFORMED {
            return Err(SeqNoError::InconsistentState {
                max_seq_no,
                local_checkpoint,
            });
        }
        Ok(LocalCheckpointTracker {
            next_seq_no: max_seq_no + 1,
            max_seq_no,
            checkpoint: local_checkpoint,
            pending: BTreeSet::new(),
            max_seq_no_of_updates_or_deletes: UNASSIGNED_SEQ_NO,
        })
    }

    /// Assign the next unused sequence number.
    ///
    /// Only the primary calls this; the shard checks role and lifecycle first.
    pub fn generate_seq_no(&mut self) -> SeqNo {
        let seq_no = self.next_seq_no;
        self.next_seq_no += 1;
        if seq_no > self.max_seq_no {
            self.max_seq_no = seq_no;
        }
        debug_assert!(
            self.next_seq_no > self.max_seq_no,
            "Postcondition: next seq_no must be above max seq_no"
        );
        seq_no
    }

    /// Validate a seqNo presented to the primary for assignment.
    ///
    /// The primary only accepts operations that carry no seqNo yet.
    pub fn check_unassigned(&self, presented: SeqNo) -> Result<(), SeqNoError> {
        if presented == UNASSIGNED_SEQ_NO {
            return Ok(());
        }
        if presented < 0 {
            return Err(SeqNoError::InvalidSequenceNumber {
                seq_no: presented,
                reason: "negative sequence number",
            });
        }
        Err(SeqNoError::InvalidSequenceNumber {
            seq_no: presented,
            reason: if presented < self.next_seq_no {
                "sequence number already used"
            } else {
                "primary assigns sequence numbers itself"
            },
        })
    }

    /// Validate a seqNo stamped by the primary before a replica applies it
    pub fn check_replicated(&self, seq_no: SeqNo) -> Result<(), SeqNoError> {
        if seq_no < 0 {
            return Err(SeqNoError::InvalidSequenceNumber {
                seq_no,
                reason: "replica operations must carry a sequence number",
            });
        }
        if seq_no > self.checkpoint.saturating_add(MAX_SEQ_NO_AHEAD) {
            return Err(SeqNoError::InvalidSequenceNumber {
                seq_no,
                reason: "too far ahead of the local checkpoint",
            });
        }
        Ok(())
    }

    /// Record that a seqNo exists (replica path: seqNos come from the primary).
    pub fn advance_max_seq_no(&mut self, seq_no: SeqNo) {
        if seq_no > self.max_seq_no {
            self.max_seq_no = seq_no;
        }
        if seq_no >= self.next_seq_no {
            self.next_seq_no = seq_no.saturating_add(1);
        }
    }

    /// Mark an operation as fully processed.
    ///
    /// Returns `Ok(false)` when the seqNo was already completed.
    pub fn mark_seq_no_as_completed(&mut self, seq_no: SeqNo) -> Result<bool, SeqNoError> {
        if seq_no < 0 {
            return Err(SeqNoError::InvalidSequenceNumber {
                seq_no,
                reason: "negative sequence number",
            });
        }
        self.advance_max_seq_no(seq_no);

        if seq_no <= self.checkpoint || !self.pending.insert(seq_no) {
            return Ok(false);
        }

        while self.pending.remove(&(self.checkpoint + 1)) {
            self.checkpoint += 1;
        }

        debug_assert!(
            self.checkpoint <= self.max_seq_no,
            "Postcondition: local checkpoint must not exceed max seq_no"
        );
        debug_assert!(
            !self.pending.contains(&(self.checkpoint + 1)),
            "Postcondition: checkpoint must stop at the first gap"
        );
        Ok(true)
    }

    /// Advance the max seqNo of update/delete operations (never regresses)
    pub fn mark_seq_no_of_update_or_delete(&mut self, seq_no: SeqNo) {
        if seq_no > self.max_seq_no_of_updates_or_deletes {
            self.max_seq_no_of_updates_or_deletes = seq_no;
        }
    }

    /// Whether `seq_no` has been completed on this copy
    pub fn has_processed(&self, seq_no: SeqNo) -> bool {
        seq_no <= self.checkpoint || self.pending.contains(&seq_no)
    }

    /// SeqNos in `(checkpoint, max_seq_no]` that were never completed
    pub fn gaps(&self) -> Vec<SeqNo> {
        ((self.checkpoint + 1)..=self.max_seq_no)
            .filter(|s| !self.pending.contains(s))
            .collect()
    }

    pub fn local_checkpoint(&self) -> SeqNo {
        self.checkpoint
    }

    pub fn max_seq_no(&self) -> SeqNo {
        self.max_seq_no
    }

    pub fn max_seq_no_of_updates_or_deletes(&self) -> SeqNo {
        self.max_seq_no_of_updates_or_deletes
    }

    /// Stats with the given global checkpoint (owned by the replication tracker)
    pub fn stats(&self, global_checkpoint: SeqNo) -> SeqNoStats {
        SeqNoStats {
            max_seq_no: self.max_seq_no,
            local_checkpoint: self.checkpoint,
            global_checkpoint,
            max_seq_no_of_updates_or_deletes: self.max_seq_no_of_updates_or_deletes,
        }
    }
}

impl Default for LocalCheckpointTracker {
    fn default() -> Self {
        Self::new()
    }
}
