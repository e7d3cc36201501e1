//! Shard error type

use super::{AllocationId, ShardState};
use crate::engine::EngineError;
use crate::recovery::RecoveryFailure;
use crate::replication::ReplicationError;
use crate::seqno::SeqNoError;
use crate::snapshot::RepositoryError;

/// Error type for shard operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardError {
    /// Operation not allowed in the current lifecycle state
    IllegalState {
        state: ShardState,
        operation: &'static str,
    },
    /// Primary-only operation on a replica
    NotPrimary,
    /// Replica-only operation on a primary
    NotReplica,
    /// This primary observed a newer term and was closed
    Fenced { held_term: u64, observed_term: u64 },
    /// Request carries an older term than this copy holds
    StalePrimaryTerm { held: u64, request: u64 },
    InvalidSequenceNumber(SeqNoError),
    /// Replica is missing the mapping the operation needs; the primary
    /// should resend once the mapping has propagated
    RetryOnReplica { required: u64, current: u64 },
    /// Promotion of a copy that is not in the in-sync set
    PromotionNotInSync(AllocationId),
    /// No engine is open (shard not recovered yet, or closed)
    EngineClosed,
    Engine(EngineError),
    Replication(ReplicationError),
    Repository(RepositoryError),
    Recovery(Box<RecoveryFailure>),
}

impl ShardError {
    /// Errors after which the copy is unusable and must be failed
    pub fn is_shard_failure(&self) -> bool {
        matches!(self, ShardError::Fenced { .. } | ShardError::Recovery(_))
    }

    /// Errors the sender should retry
    pub fn is_retryable(&self) -> bool {
        matches!(self, ShardError::RetryOnReplica { .. })
    }
}

impl std::fmt::Display for ShardError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShardError::IllegalState { state, operation } => {
                write!(f, "cannot {} while shard is {}", operation, state)
            }
            ShardError::NotPrimary => write!(f, "shard is not a primary"),
            ShardError::NotReplica => write!(f, "shard is not a replica"),
            ShardError::Fenced {
                held_term,
                observed_term,
            } => write!(
                f,
                "primary with term {} fenced by term {}",
                held_term, observed_term
            ),
            ShardError::StalePrimaryTerm { held, request } => write!(
                f,
                "operation primary term {} is older than current term {}",
                request, held
            ),
            ShardError::InvalidSequenceNumber(e) => write!(f, "{}", e),
            ShardError::RetryOnReplica { required, current } => write!(
                f,
                "mapping version {} required, replica has {}",
                required, current
            ),
            ShardError::PromotionNotInSync(id) => {
                write!(f, "cannot promote {}: not in the in-sync set", id)
            }
            ShardError::EngineClosed => write!(f, "engine is closed"),
            ShardError::Engine(e) => write!(f, "{}", e),
            ShardError::Replication(e) => write!(f, "{}", e),
            ShardError::Repository(e) => write!(f, "{}", e),
            ShardError::Recovery(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ShardError {}

impl From<SeqNoError> for ShardError {
    fn from(e: SeqNoError) -> Self {
        ShardError::InvalidSequenceNumber(e)
    }
}

impl From<EngineError> for ShardError {
    fn from(e: EngineError) -> Self {
        ShardError::Engine(e)
    }
}

impl From<ReplicationError> for ShardError {
    fn from(e: ReplicationError) -> Self {
        ShardError::Replication(e)
    }
}

impl From<RepositoryError> for ShardError {
    fn from(e: RepositoryError) -> Self {
        ShardError::Repository(e)
    }
}

impl From<RecoveryFailure> for ShardError {
    fn from(e: RecoveryFailure) -> Self {
        ShardError::Recovery(Box::new(e))
    }
}
