//! Sequence Numbers and Checkpoints
//!
//! Every write on a shard is identified by a sequence number assigned by the
//! primary. Copies track which sequence numbers they have processed; the
//! highest seqNo below which nothing is missing is the local checkpoint.
//!
//! ```text
//! completed:  0 1 2 . 4 5 . 7
//!                 ^           ^
//!         local checkpoint    max seqNo
//! ```
//!
//! The global checkpoint is owned by the replication tracker and is only
//! mirrored here in [`SeqNoStats`].

mod stats;
mod tracker;

pub use stats::SeqNoStats;
pub use tracker::{LocalCheckpointTracker, SeqNoError};

/// Sequence number type (signed so that sentinels stay below zero)
pub type SeqNo = i64;

/// A sequence number that has not been assigned yet
pub const UNASSIGNED_SEQ_NO: SeqNo = -2;

/// The checkpoint of a copy that has not processed any operation
pub const NO_OPS_PERFORMED: SeqNo = -1;

/// Primary term before any primary has been elected
pub const UNASSIGNED_PRIMARY_TERM: u64 = 0;

/// Furthest a replicated seqNo may run ahead of the local checkpoint
pub const MAX_SEQ_NO_AHEAD: SeqNo = 1 << 20;
