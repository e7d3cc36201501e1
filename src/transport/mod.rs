//! Transport - messages and the seams between copies
//!
//! Every cross-copy interaction goes through one of three traits so the
//! same replication and recovery code runs in-process, over a simulated
//! lossy network, or over a real wire.
//!
//! ```text
//!   primary                                  replica / recovery target
//!  ┌──────────────────────┐   ReplicaClient    ┌─────────────────────────┐
//!  │ ReplicationOperation ├───────────────────►│ apply_operation_on_     │
//!  │ PrimaryReplicaSyncer │                    │ replica                 │
//!  │                      │ RecoveryTarget-    │                         │
//!  │ RecoverySourceHandler├───Handler─────────►│ RecoveryTarget          │
//!  │                      │◄──PeerRecovery-────┤ IndexShard::recover_    │
//!  └──────────────────────┘   Source           │ from_peer               │
//!                                              └─────────────────────────┘
//! ```

mod local;
mod simulated;

pub use local::{LocalPeerRecoverySource, LocalReplicaClient};
pub use simulated::{SimulatedPeerRecoverySource, SimulatedRecoveryTarget, SimulatedReplicaClient};

use crate::recovery::RecoveryFailure;
use crate::seqno::SeqNo;
use crate::shard::{AllocationId, Operation, ShardError, ShardId};
use crate::store::{MetadataSnapshot, StoreFileMetadata};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Error type for cross-copy requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The peer could not be reached or the connection dropped
    Disconnected(String),
    /// The peer handled the request and rejected it
    Remote {
        reason: String,
        retryable: bool,
        shard_failure: bool,
        /// Primary term the remote copy holds, when the rejection was about terms
        remote_term: Option<u64>,
    },
    /// The receiving side's recovery was cancelled
    Cancelled,
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Remote { retryable, .. } => *retryable,
            TransportError::Disconnected(_) => true,
            TransportError::Cancelled => false,
        }
    }

    pub fn remote_term(&self) -> Option<u64> {
        match self {
            TransportError::Remote { remote_term, .. } => *remote_term,
            _ => None,
        }
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Disconnected(reason) => write!(f, "disconnected: {}", reason),
            TransportError::Remote { reason, .. } => write!(f, "remote error: {}", reason),
            TransportError::Cancelled => write!(f, "recovery cancelled on target"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<ShardError> for TransportError {
    fn from(e: ShardError) -> Self {
        let remote_term = match &e {
            ShardError::StalePrimaryTerm { held, .. } => Some(*held),
            ShardError::Fenced { observed_term, .. } => Some(*observed_term),
            _ => None,
        };
        TransportError::Remote {
            reason: e.to_string(),
            retryable: e.is_retryable(),
            shard_failure: e.is_shard_failure(),
            remote_term,
        }
    }
}

/// Boxed future returned by transport calls
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// Operations forwarded from the primary to one copy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaRequest {
    pub shard_id: ShardId,
    pub primary_term: u64,
    pub operations: Vec<Operation>,
    pub global_checkpoint: SeqNo,
    pub max_seq_no_of_updates_or_deletes: SeqNo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaResponse {
    pub local_checkpoint: SeqNo,
    pub global_checkpoint: SeqNo,
}

/// Sends primary operations to copies
pub trait ReplicaClient: Send + Sync {
    fn perform_on_replica<'a>(
        &'a self,
        target: &'a AllocationId,
        request: ReplicaRequest,
    ) -> TransportFuture<'a, ReplicaResponse>;
}

/// Sent by a recovering copy to the primary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartRecoveryRequest {
    pub recovery_id: u64,
    pub shard_id: ShardId,
    pub target_allocation_id: AllocationId,
    pub target_node: String,
    /// First seqNo the target is missing, or UNASSIGNED when it must copy files
    pub starting_seq_no: SeqNo,
    pub primary_term: u64,
}

/// Summary returned to the target when a recovery completes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryResponse {
    pub phase1_file_names: Vec<String>,
    pub phase1_reused_file_names: Vec<String>,
    pub phase1_bytes: u64,
    pub phase1_reused_bytes: u64,
    pub ops_based: bool,
    pub translog_ops: usize,
    pub target_local_checkpoint: SeqNo,
    pub took: Duration,
}

/// Files the source is about to send
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesInfo {
    pub files_to_recover: Vec<StoreFileMetadata>,
    pub reused_files: Vec<StoreFileMetadata>,
}

/// One bounded piece of one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunk {
    pub file: StoreFileMetadata,
    pub position: u64,
    pub data: Bytes,
    pub last_chunk: bool,
}

/// A batch of operations replayed during phase 2
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslogBatch {
    pub operations: Vec<Operation>,
    pub primary_term: u64,
    pub max_seq_no_of_updates_or_deletes: SeqNo,
    pub global_checkpoint: SeqNo,
    pub mapping_version: u64,
}

/// Target side of a peer recovery, driven by the source
pub trait RecoveryTargetHandler: Send + Sync {
    /// Index files the target already has
    fn request_file_list(&self) -> TransportFuture<'_, MetadataSnapshot>;

    fn receive_file_info(&self, info: FilesInfo) -> TransportFuture<'_, ()>;

    /// Chunks may arrive in any order
    fn send_file_chunk(&self, chunk: FileChunk) -> TransportFuture<'_, ()>;

    /// Make the transferred files the target's index and drop everything else
    fn clean_files(&self, source_metadata: MetadataSnapshot) -> TransportFuture<'_, ()>;

    /// Open the engine so operations can be applied
    fn prepare_for_translog(&self) -> TransportFuture<'_, ()>;

    /// Returns the target's local checkpoint after applying the batch
    fn send_translog_ops(&self, batch: TranslogBatch) -> TransportFuture<'_, SeqNo>;

    fn finalize_recovery(&self, global_checkpoint: SeqNo) -> TransportFuture<'_, ()>;
}

/// Boxed future returned by `PeerRecoverySource::start_recovery`
pub type RecoveryFuture<'a> =
    Pin<Box<dyn Future<Output = Result<RecoveryResponse, RecoveryFailure>> + Send + 'a>>;

/// The primary's side of peer recovery
pub trait PeerRecoverySource: Send + Sync {
    fn start_recovery(
        &self,
        request: StartRecoveryRequest,
        target: Arc<dyn RecoveryTargetHandler>,
    ) -> RecoveryFuture<'_>;
}
