//! Replication - the primary's replication group and write fan-out

pub mod operation;
pub mod tracker;

pub use operation::{ReplicationOperation, ReplicationOutcome, ReplicationResult};
pub use tracker::{CheckpointState, ReplicationError, ReplicationTracker};
