//! RecoverySourceHandler - the primary's side of one peer recovery
//!
//! ## Phases
//!
//! ```text
//!  starting seqNo covered by retained history?
//!       │ yes                          │ no
//!       │                              ▼
//!       │              phase 1: flush, pin commit, diff file lists,
//!       │                       stream missing files in chunks,
//!       │                       target swaps in the new files
//!       ▼                              │
//!  prepare_for_translog ◄──────────────┘
//!       │
//!  initiate tracking (live writes now reach the target)
//!       │
//!  phase 2: replay retained operations in batches
//!       │
//!  finalize: mark in-sync, hand over the global checkpoint
//! ```
//!
//! History needed by the target stays pinned from the moment the starting
//! point is chosen until the handler finishes or is dropped.

use super::{RecoveryCause, RecoveryFailure, RecoveryStage};
use crate::config::RecoveryConfig;
use crate::seqno::SeqNo;
use crate::shard::IndexShard;
use crate::store::StoreFileMetadata;
use crate::transport::{
    FileChunk, FilesInfo, RecoveryResponse, RecoveryTargetHandler, StartRecoveryRequest,
    TranslogBatch, TransportFuture,
};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Instant;

/// Releases the history pinned for one recovery
struct RetentionGuard {
    shard: Arc<IndexShard>,
    recovery_id: u64,
}

impl Drop for RetentionGuard {
    fn drop(&mut self) {
        self.shard.release_history(self.recovery_id);
    }
}

#[derive(Debug, Default)]
struct Phase1Result {
    file_names: Vec<String>,
    reused_file_names: Vec<String>,
    bytes: u64,
    reused_bytes: u64,
}

pub struct RecoverySourceHandler {
    shard: Arc<IndexShard>,
    request: StartRecoveryRequest,
    target: Arc<dyn RecoveryTargetHandler>,
    config: RecoveryConfig,
}

impl RecoverySourceHandler {
    pub fn new(
        shard: Arc<IndexShard>,
        request: StartRecoveryRequest,
        target: Arc<dyn RecoveryTargetHandler>,
        config: RecoveryConfig,
    ) -> Self {
        RecoverySourceHandler {
            shard,
            request,
            target,
            config,
        }
    }

    pub async fn recover_to_target(&self) -> Result<RecoveryResponse, RecoveryFailure> {
        let mut stage = RecoveryStage::Init;
        let result = self.run(&mut stage).await;
        result.map_err(|cause| {
            let failure = RecoveryFailure::new(self.request.shard_id.clone(), stage, cause);
            tracing::warn!(
                shard = %self.request.shard_id,
                target = %self.request.target_allocation_id,
                recovery_id = self.request.recovery_id,
                error = %failure,
                "recovery source failed"
            );
            failure
        })
    }

    async fn run(&self, stage: &mut RecoveryStage) -> Result<RecoveryResponse, RecoveryCause> {
        let started = Instant::now();
        let recovery_id = self.request.recovery_id;
        self.shard.validate_recovery_source(&self.request)?;

        let _retention = RetentionGuard {
            shard: Arc::clone(&self.shard),
            recovery_id,
        };

        let requested = self.request.starting_seq_no;
        let ops_based = requested >= 0 && self.shard.retain_history(recovery_id, requested)?;
        let (starting_seq_no, phase1) = if ops_based {
            tracing::debug!(
                shard = %self.request.shard_id,
                recovery_id,
                starting_seq_no = requested,
                "history retained, skipping file phase"
            );
            (requested, Phase1Result::default())
        } else {
            *stage = RecoveryStage::Index;
            self.phase1().await?
        };

        *stage = RecoveryStage::Translog;
        self.call("prepare_for_translog", self.target.prepare_for_translog())
            .await?;
        self.shard
            .initiate_tracking(&self.request.target_allocation_id)?;
        let (translog_ops, target_local_checkpoint) = self.phase2(starting_seq_no).await?;

        *stage = RecoveryStage::Finalize;
        self.shard
            .mark_allocation_in_sync(&self.request.target_allocation_id, target_local_checkpoint)?;
        let global_checkpoint = self.shard.global_checkpoint();
        self.call(
            "finalize_recovery",
            self.target.finalize_recovery(global_checkpoint),
        )
        .await?;

        let took = started.elapsed();
        tracing::info!(
            shard = %self.request.shard_id,
            target = %self.request.target_allocation_id,
            recovery_id,
            ops_based,
            files = phase1.file_names.len(),
            reused = phase1.reused_file_names.len(),
            translog_ops,
            took_ms = took.as_millis() as u64,
            "recovery source done"
        );
        Ok(RecoveryResponse {
            phase1_file_names: phase1.file_names,
            phase1_reused_file_names: phase1.reused_file_names,
            phase1_bytes: phase1.bytes,
            phase1_reused_bytes: phase1.reused_bytes,
            ops_based,
            translog_ops,
            target_local_checkpoint,
            took,
        })
    }

    /// Copy the files of a fresh commit. Returns where phase 2 starts.
    async fn phase1(&self) -> Result<(SeqNo, Phase1Result), RecoveryCause> {
        let commit = self
            .shard
            .acquire_recovery_commit(self.request.recovery_id)?;
        let target_metadata = self
            .call("request_file_list", self.target.request_file_list())
            .await?;
        let diff = commit.metadata.recovery_diff(&target_metadata);

        let files_to_recover: Vec<StoreFileMetadata> = diff.to_transfer().cloned().collect();
        let info = FilesInfo {
            files_to_recover: files_to_recover.clone(),
            reused_files: diff.identical.clone(),
        };
        self.call("receive_file_info", self.target.receive_file_info(info))
            .await?;

        let chunks = self.chunks(&files_to_recover, &commit.files)?;
        let chunk_count = chunks.len();
        let mut sends = stream::iter(chunks)
            .map(|chunk| self.call("send_file_chunk", self.target.send_file_chunk(chunk)))
            .buffer_unordered(self.config.max_concurrent_file_chunks.max(1));
        while let Some(sent) = sends.next().await {
            sent?;
        }
        drop(sends);

        self.call("clean_files", self.target.clean_files(commit.metadata.clone()))
            .await?;

        tracing::debug!(
            shard = %self.request.shard_id,
            recovery_id = self.request.recovery_id,
            files = files_to_recover.len(),
            chunks = chunk_count,
            bytes = diff.bytes_to_transfer(),
            reused_bytes = diff.bytes_reused(),
            "file phase done"
        );
        let result = Phase1Result {
            file_names: files_to_recover.iter().map(|f| f.name.clone()).collect(),
            reused_file_names: diff.identical.iter().map(|f| f.name.clone()).collect(),
            bytes: diff.bytes_to_transfer(),
            reused_bytes: diff.bytes_reused(),
        };
        Ok((commit.history_from, result))
    }

    /// Split files into bounded chunks. Empty files still produce one chunk.
    fn chunks(
        &self,
        files: &[StoreFileMetadata],
        contents: &std::collections::BTreeMap<String, Bytes>,
    ) -> Result<Vec<FileChunk>, RecoveryCause> {
        let chunk_size = self.config.chunk_size_bytes.max(1);
        let mut chunks = Vec::new();
        for file in files {
            let data = contents.get(&file.name).ok_or_else(|| {
                RecoveryCause::IllegalState(format!("{} missing from pinned commit", file.name))
            })?;
            let mut position = 0;
            loop {
                let end = (position + chunk_size).min(data.len());
                chunks.push(FileChunk {
                    file: file.clone(),
                    position: position as u64,
                    data: data.slice(position..end),
                    last_chunk: end == data.len(),
                });
                if end == data.len() {
                    break;
                }
                position = end;
            }
        }
        Ok(chunks)
    }

    /// Replay operations from `starting_seq_no` to the current max seqNo.
    /// Returns the number of operations sent and the target's local checkpoint.
    async fn phase2(&self, starting_seq_no: SeqNo) -> Result<(usize, SeqNo), RecoveryCause> {
        let history = self.shard.recovery_history(starting_seq_no)?;
        let batch_size = self.config.translog_ops_batch_size.max(1);

        let mut target_local_checkpoint = crate::seqno::UNASSIGNED_SEQ_NO;
        let mut sent = 0;
        // One batch even when empty: it carries the term and global checkpoint
        let batches: Vec<_> = if history.operations.is_empty() {
            vec![Vec::new()]
        } else {
            history
                .operations
                .chunks(batch_size)
                .map(<[_]>::to_vec)
                .collect()
        };
        for operations in batches {
            let count = operations.len();
            let batch = TranslogBatch {
                operations,
                primary_term: history.primary_term,
                max_seq_no_of_updates_or_deletes: history.max_seq_no_of_updates_or_deletes,
                global_checkpoint: self.shard.global_checkpoint(),
                mapping_version: history.mapping_version,
            };
            target_local_checkpoint = self
                .call("send_translog_ops", self.target.send_translog_ops(batch))
                .await?;
            sent += count;
        }

        if target_local_checkpoint < history.end_seq_no {
            return Err(RecoveryCause::IllegalState(format!(
                "target local checkpoint {} below end of history {}",
                target_local_checkpoint, history.end_seq_no
            )));
        }
        Ok((sent, target_local_checkpoint))
    }

    /// One target call under the internal action timeout
    async fn call<T>(&self, action: &'static str, future: TransportFuture<'_, T>) -> Result<T, RecoveryCause> {
        let after = self.config.internal_action_timeout;
        match tokio::time::timeout(after, future).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(RecoveryCause::Timeout { action, after }),
        }
    }
}
