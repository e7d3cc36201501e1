//! ReplicationOperation - one write from the primary to every tracked copy
//!
//! ```text
//!   apply_operation_on_primary ──► seqNo assigned, applied locally
//!            │
//!            ├──► replica-a ──┐
//!            ├──► replica-b ──┼──► fold local checkpoints into tracker
//!            └──► replica-c ──┘    fence if any copy holds a newer term
//! ```
//!
//! Replica failures do not fail the write. They are reported back so the
//! caller can ask the allocator to drop the failed copies.

use crate::seqno::SeqNo;
use crate::shard::{AllocationId, IndexShard, Operation, PrimaryOutcome, ShardError};
use crate::transport::{ReplicaClient, ReplicaRequest, ReplicaResponse, TransportError};
use futures::future::join_all;
use tracing::{debug, warn};

/// Attempts per copy when it asks for a resend (mapping not there yet)
const MAX_REPLICA_ATTEMPTS: usize = 3;

/// A write acknowledged by the primary and fanned out to its copies
#[derive(Debug, Clone)]
pub struct ReplicationResult {
    pub operation: Operation,
    pub created: bool,
    /// Copies the operation was sent to, primary excluded
    pub total_replicas: usize,
    pub successful_replicas: usize,
    pub failed_replicas: Vec<(AllocationId, TransportError)>,
    /// Global checkpoint after folding in the replicas' responses
    pub global_checkpoint: SeqNo,
}

#[derive(Debug, Clone)]
pub enum ReplicationOutcome {
    Replicated(ReplicationResult),
    /// Nothing was applied; install the mapping and retry
    MappingUpdateRequired { required: u64, current: u64 },
}

/// Drives one primary write through the replication group
pub struct ReplicationOperation<'a> {
    primary: &'a IndexShard,
    client: &'a dyn ReplicaClient,
}

impl<'a> ReplicationOperation<'a> {
    pub fn new(primary: &'a IndexShard, client: &'a dyn ReplicaClient) -> Self {
        ReplicationOperation { primary, client }
    }

    pub async fn execute(&self, op: Operation) -> Result<ReplicationOutcome, ShardError> {
        let term = self.primary.primary_term();
        let (operation, created, max_seq_no_of_updates_or_deletes) =
            match self.primary.apply_operation_on_primary(op, term)? {
                PrimaryOutcome::Applied {
                    operation,
                    created,
                    max_seq_no_of_updates_or_deletes,
                    ..
                } => (operation, created, max_seq_no_of_updates_or_deletes),
                PrimaryOutcome::MappingUpdateRequired { required, current } => {
                    return Ok(ReplicationOutcome::MappingUpdateRequired { required, current })
                }
            };

        // Targets are read after the local apply: a copy that starts being
        // tracked later receives this operation through recovery instead
        let targets = self.primary.replication_targets();
        let request = ReplicaRequest {
            shard_id: self.primary.shard_id().clone(),
            primary_term: operation.primary_term,
            operations: vec![operation.clone()],
            global_checkpoint: self.primary.global_checkpoint(),
            max_seq_no_of_updates_or_deletes,
        };

        let responses = join_all(
            targets
                .iter()
                .map(|target| self.perform_on_replica(target, request.clone())),
        )
        .await;

        let mut successful_replicas = 0;
        let mut failed_replicas = Vec::new();
        for (target, response) in targets.iter().zip(responses) {
            match response {
                Ok(response) => {
                    successful_replicas += 1;
                    self.fold_response(target, response);
                }
                Err(e) => {
                    if let Some(remote_term) = e.remote_term() {
                        // Returns Fenced if the copy knows a newer primary
                        self.primary.observe_primary_term(remote_term)?;
                    }
                    warn!(
                        shard = %self.primary.shard_id(),
                        target = %target,
                        seq_no = operation.seq_no,
                        error = %e,
                        "replica failed to apply operation"
                    );
                    failed_replicas.push((target.clone(), e));
                }
            }
        }

        Ok(ReplicationOutcome::Replicated(ReplicationResult {
            operation,
            created,
            total_replicas: targets.len(),
            successful_replicas,
            failed_replicas,
            global_checkpoint: self.primary.global_checkpoint(),
        }))
    }

    async fn perform_on_replica(
        &self,
        target: &AllocationId,
        request: ReplicaRequest,
    ) -> Result<ReplicaResponse, TransportError> {
        let mut attempt = 1;
        loop {
            match self.client.perform_on_replica(target, request.clone()).await {
                Err(e) if e.is_retryable() && attempt < MAX_REPLICA_ATTEMPTS => {
                    debug!(shard = %self.primary.shard_id(), target = %target, attempt, error = %e, "retrying replica request");
                    attempt += 1;
                    tokio::task::yield_now().await;
                }
                result => return result,
            }
        }
    }

    fn fold_response(&self, target: &AllocationId, response: ReplicaResponse) {
        self.primary
            .update_global_checkpoint_for_shard(target, response.global_checkpoint);
        if let Err(e) = self
            .primary
            .update_local_checkpoint_for_shard(target, response.local_checkpoint)
        {
            // Copy removed from the group while the request was in flight
            debug!(shard = %self.primary.shard_id(), target = %target, error = %e, "dropping checkpoint report");
        }
    }
}
