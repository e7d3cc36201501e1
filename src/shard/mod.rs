//! Shard - one copy of one partition
//!
//! ## Lifecycle
//!
//! ```text
//! CREATED ──► RECOVERING ──► POST_RECOVERY ──► STARTED ──► RELOCATED
//!    │             │               │              │
//!    └─────────────┴───────────────┴──────────────┴──────► CLOSED
//! ```
//!
//! All mutable per-copy state (lifecycle, role, term, seqNo tracker,
//! replication tracker, engine) sits behind one lock inside
//! [`IndexShard`]. The lock is never held across an `.await`.

mod error;
mod index_shard;
mod operation;
mod routing;
mod state;

pub use error::ShardError;
pub use index_shard::{IndexShard, StateUpdateOutcome};
pub use operation::{Operation, OperationKind, PrimaryOutcome, ReplicaOutcome};
pub use routing::{AllocationId, RecoverySource, RoutingState, RoutingTable, ShardId, ShardRouting};
pub use state::{Lifecycle, ShardState};
