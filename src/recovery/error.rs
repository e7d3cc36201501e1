//! Recovery failure type

use super::RecoveryStage;
use crate::engine::EngineError;
use crate::replication::ReplicationError;
use crate::seqno::SeqNo;
use crate::shard::{ShardError, ShardId};
use crate::snapshot::RepositoryError;
use crate::store::StoreError;
use crate::transport::TransportError;
use std::time::Duration;

/// Why a recovery failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryCause {
    Store(StoreError),
    Engine(EngineError),
    Transport(TransportError),
    Repository(RepositoryError),
    Replication(ReplicationError),
    Shard(Box<ShardError>),
    /// A single action exceeded the internal action timeout
    Timeout { action: &'static str, after: Duration },
    /// The recovery was superseded or the shard closed underneath it
    Cancelled(String),
    /// The source no longer has the operations the target needs
    MissingHistory { from: SeqNo, to: SeqNo },
    IllegalState(String),
}

impl std::fmt::Display for RecoveryCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoveryCause::Store(e) => write!(f, "{}", e),
            RecoveryCause::Engine(e) => write!(f, "{}", e),
            RecoveryCause::Transport(e) => write!(f, "{}", e),
            RecoveryCause::Repository(e) => write!(f, "{}", e),
            RecoveryCause::Replication(e) => write!(f, "{}", e),
            RecoveryCause::Shard(e) => write!(f, "{}", e),
            RecoveryCause::Timeout { action, after } => {
                write!(f, "{} timed out after {:?}", action, after)
            }
            RecoveryCause::Cancelled(reason) => write!(f, "cancelled: {}", reason),
            RecoveryCause::MissingHistory { from, to } => {
                write!(f, "operations [{}..={}] are no longer retained", from, to)
            }
            RecoveryCause::IllegalState(msg) => write!(f, "{}", msg),
        }
    }
}

/// A recovery that did not complete
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryFailure {
    pub shard_id: ShardId,
    /// Stage the recovery was in when it failed
    pub stage: RecoveryStage,
    pub cause: RecoveryCause,
}

impl RecoveryFailure {
    pub fn new(shard_id: ShardId, stage: RecoveryStage, cause: RecoveryCause) -> Self {
        RecoveryFailure {
            shard_id,
            stage,
            cause,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self.cause,
            RecoveryCause::Cancelled(_) | RecoveryCause::Transport(TransportError::Cancelled)
        )
    }
}

impl std::fmt::Display for RecoveryFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "recovery of {} failed in {}: {}",
            self.shard_id, self.stage, self.cause
        )
    }
}

impl std::error::Error for RecoveryFailure {}

impl From<StoreError> for RecoveryCause {
    fn from(e: StoreError) -> Self {
        RecoveryCause::Store(e)
    }
}

impl From<EngineError> for RecoveryCause {
    fn from(e: EngineError) -> Self {
        RecoveryCause::Engine(e)
    }
}

impl From<TransportError> for RecoveryCause {
    fn from(e: TransportError) -> Self {
        RecoveryCause::Transport(e)
    }
}

impl From<RepositoryError> for RecoveryCause {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::Cancelled => RecoveryCause::Cancelled("restore cancelled".into()),
            e => RecoveryCause::Repository(e),
        }
    }
}

impl From<ReplicationError> for RecoveryCause {
    fn from(e: ReplicationError) -> Self {
        RecoveryCause::Replication(e)
    }
}

impl From<ShardError> for RecoveryCause {
    fn from(e: ShardError) -> Self {
        RecoveryCause::Shard(Box::new(e))
    }
}
