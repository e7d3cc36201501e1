pub mod buggify;
pub mod config;
pub mod engine;
pub mod observability;
pub mod promotion;
pub mod recovery;
pub mod replication;
pub mod seqno;
pub mod shard;
pub mod simulator;
pub mod snapshot;
pub mod store;
pub mod translog;
pub mod transport;

#[cfg(test)]
mod stateright;

pub use config::ShardConfig;
pub use replication::{ReplicationOperation, ReplicationTracker};
pub use seqno::{LocalCheckpointTracker, SeqNo, SeqNoStats};
pub use shard::{IndexShard, Operation, ShardError, ShardState};
pub use simulator::SimulatedCluster;
