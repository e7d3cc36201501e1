//! PrimaryReplicaSyncer - actor that replays history to replicas after promotion
//!
//! One actor per node. Tasks are processed in arrival order; within a task
//! all targets are synced concurrently, each receiving its batches in
//! seqNo order.

use crate::seqno::SeqNo;
use crate::shard::{AllocationId, Operation, ShardId};
use crate::transport::{ReplicaClient, ReplicaRequest, TransportError};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Attempts per batch when a replica answers with a retryable error
const MAX_ATTEMPTS: usize = 3;

/// Operations a newly promoted primary must re-broadcast
#[derive(Debug, Clone)]
pub struct ResyncTask {
    pub shard_id: ShardId,
    pub primary_term: u64,
    pub from_seq_no: SeqNo,
    pub to_seq_no: SeqNo,
    pub operations: Vec<Operation>,
    pub targets: Vec<AllocationId>,
    pub global_checkpoint: SeqNo,
    pub max_seq_no_of_updates_or_deletes: SeqNo,
}

/// Outcome of one resync task
#[derive(Debug, Clone, Default)]
pub struct ResyncResponse {
    pub total_operations: usize,
    /// Local checkpoint each successfully synced target reported last
    pub synced: BTreeMap<AllocationId, SeqNo>,
    pub failed: Vec<(AllocationId, TransportError)>,
    /// A replica holds a newer term: this primary is stale
    pub higher_term: Option<u64>,
}

impl ResyncResponse {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.higher_term.is_none()
    }
}

/// Completion signal of an enqueued task
pub type ResyncReceipt = oneshot::Receiver<ResyncResponse>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResyncError {
    /// The actor has shut down
    ActorUnavailable,
}

impl std::fmt::Display for ResyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResyncError::ActorUnavailable => write!(f, "resync actor unavailable"),
        }
    }
}

impl std::error::Error for ResyncError {}

enum ResyncMessage {
    Resync {
        task: Box<ResyncTask>,
        response_tx: oneshot::Sender<ResyncResponse>,
    },
    Shutdown {
        response_tx: oneshot::Sender<()>,
    },
}

/// Owns the replica client and processes resync tasks
pub struct PrimaryReplicaSyncer {
    client: Arc<dyn ReplicaClient>,
    batch_size: usize,
    rx: mpsc::UnboundedReceiver<ResyncMessage>,
}

impl PrimaryReplicaSyncer {
    pub async fn run(mut self) {
        while let Some(msg) = self.rx.recv().await {
            match msg {
                ResyncMessage::Resync { task, response_tx } => {
                    let response = self.resync(&task).await;
                    let _ = response_tx.send(response);
                }
                ResyncMessage::Shutdown { response_tx } => {
                    info!("resync actor shutting down");
                    let _ = response_tx.send(());
                    break;
                }
            }
        }
    }

    async fn resync(&self, task: &ResyncTask) -> ResyncResponse {
        debug_assert!(self.batch_size > 0, "Precondition: batch size must be positive");
        debug_assert!(
            task.operations
                .windows(2)
                .all(|w| w[0].seq_no < w[1].seq_no),
            "Precondition: resync operations are sorted by seqNo"
        );

        // An empty history still goes out once so replicas learn the new term
        let batches: Vec<&[Operation]> = if task.operations.is_empty() {
            vec![&task.operations[..]]
        } else {
            task.operations.chunks(self.batch_size).collect()
        };

        let results = join_all(
            task.targets
                .iter()
                .map(|target| self.sync_target(task, target, &batches)),
        )
        .await;

        let mut response = ResyncResponse {
            total_operations: task.operations.len(),
            ..ResyncResponse::default()
        };
        for (target, result) in task.targets.iter().zip(results) {
            match result {
                Ok(local_checkpoint) => {
                    response.synced.insert(target.clone(), local_checkpoint);
                }
                Err(e) => {
                    if let Some(term) = e.remote_term().filter(|t| *t > task.primary_term) {
                        response.higher_term = Some(response.higher_term.unwrap_or(0).max(term));
                    }
                    response.failed.push((target.clone(), e));
                }
            }
        }

        info!(
            shard = %task.shard_id,
            term = task.primary_term,
            from = task.from_seq_no,
            to = task.to_seq_no,
            operations = response.total_operations,
            synced = response.synced.len(),
            failed = response.failed.len(),
            "resync finished"
        );
        response
    }

    async fn sync_target(
        &self,
        task: &ResyncTask,
        target: &AllocationId,
        batches: &[&[Operation]],
    ) -> Result<SeqNo, TransportError> {
        let mut local_checkpoint = crate::seqno::UNASSIGNED_SEQ_NO;
        for batch in batches {
            let request = ReplicaRequest {
                shard_id: task.shard_id.clone(),
                primary_term: task.primary_term,
                operations: batch.to_vec(),
                global_checkpoint: task.global_checkpoint,
                max_seq_no_of_updates_or_deletes: task.max_seq_no_of_updates_or_deletes,
            };
            let mut attempt = 1;
            let response = loop {
                match self.client.perform_on_replica(target, request.clone()).await {
                    Ok(response) => break response,
                    Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => {
                        debug!(shard = %task.shard_id, target = %target, attempt, error = %e, "retrying resync batch");
                        attempt += 1;
                    }
                    Err(e) => {
                        warn!(shard = %task.shard_id, target = %target, error = %e, "resync of replica failed");
                        return Err(e);
                    }
                }
            };
            local_checkpoint = response.local_checkpoint;
        }
        if local_checkpoint < task.to_seq_no {
            // The replayed history did not cover this replica's holes
            warn!(
                shard = %task.shard_id,
                target = %target,
                local_checkpoint,
                to = task.to_seq_no,
                "replica still behind after resync"
            );
            return Err(TransportError::Remote {
                reason: format!(
                    "local checkpoint {} below resynced max seqNo {}",
                    local_checkpoint, task.to_seq_no
                ),
                retryable: false,
                shard_failure: true,
                remote_term: None,
            });
        }
        Ok(local_checkpoint)
    }
}

/// Handle for submitting tasks to the syncer
#[derive(Clone)]
pub struct ResyncHandle {
    tx: mpsc::UnboundedSender<ResyncMessage>,
}

impl ResyncHandle {
    /// Queue a task. The receipt resolves when every target was handled.
    pub fn enqueue(&self, task: ResyncTask) -> Result<ResyncReceipt, ResyncError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(ResyncMessage::Resync {
                task: Box::new(task),
                response_tx,
            })
            .map_err(|_| ResyncError::ActorUnavailable)?;
        Ok(response_rx)
    }

    /// Graceful shutdown once queued tasks are done
    pub async fn shutdown(&self) {
        let (response_tx, response_rx) = oneshot::channel();
        if self.tx.send(ResyncMessage::Shutdown { response_tx }).is_ok() {
            let _ = response_rx.await;
        }
    }
}

/// Spawn a syncer and return its handle + join handle
pub fn spawn_resync_actor(
    client: Arc<dyn ReplicaClient>,
    batch_size: usize,
) -> (ResyncHandle, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let actor = PrimaryReplicaSyncer {
        client,
        batch_size: batch_size.max(1),
        rx,
    };
    let task = tokio::spawn(actor.run());
    (ResyncHandle { tx }, task)
}
