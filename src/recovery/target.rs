//! RecoveryTarget - the recovering copy's side of one peer recovery
//!
//! Files arrive under `recovery.<id>.<name>` temp names and only replace
//! the copy's index files in `clean_files`, after every one of them was
//! checked against the source's checksum. A cancelled or failed recovery
//! therefore never leaves a partial commit behind: the temp files are
//! deleted and the previous files are either intact or already gone.

use super::{RecoveryCause, RecoveryStage};
use crate::seqno::SeqNo;
use crate::shard::IndexShard;
use crate::store::{is_index_file, temp_file_name, MetadataSnapshot};
use crate::transport::{
    FileChunk, FilesInfo, RecoveryTargetHandler, TranslogBatch, TransportError, TransportFuture,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct RecoveryTarget {
    shard: Arc<IndexShard>,
    recovery_id: u64,
    token: CancellationToken,
    /// Bytes received so far per file
    received: Mutex<BTreeMap<String, u64>>,
}

impl RecoveryTarget {
    pub fn new(shard: Arc<IndexShard>, recovery_id: u64, token: CancellationToken) -> Self {
        RecoveryTarget {
            shard,
            recovery_id,
            token,
            received: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn recovery_id(&self) -> u64 {
        self.recovery_id
    }

    /// Delete everything this recovery wrote under temp names
    pub fn cleanup(&self) {
        match self.shard.store().delete_temp_files(self.recovery_id) {
            Ok(0) => {}
            Ok(deleted) => tracing::debug!(
                shard = %self.shard.shard_id(),
                recovery_id = self.recovery_id,
                deleted,
                "deleted recovery temp files"
            ),
            Err(e) => tracing::warn!(
                shard = %self.shard.shard_id(),
                recovery_id = self.recovery_id,
                error = %e,
                "failed to delete recovery temp files"
            ),
        }
    }

    fn ensure_recovering(&self) -> Result<(), TransportError> {
        self.shard
            .ensure_recovering(&self.token)
            .map_err(|_| TransportError::Cancelled)
    }

    fn write_chunk(&self, chunk: &FileChunk) -> Result<(), RecoveryCause> {
        let store = self.shard.store();
        let temp = temp_file_name(self.recovery_id, &chunk.file.name);
        store.write_at(&temp, chunk.position, &chunk.data)?;

        let complete = {
            let mut received = self.received.lock();
            let total = received.entry(chunk.file.name.clone()).or_insert(0);
            *total += chunk.data.len() as u64;
            *total >= chunk.file.length
        };
        let length = chunk.data.len() as u64;
        self.shard.update_recovery_state(|state| {
            state.files.recovered_bytes += length;
            if complete {
                state.files.recovered_files += 1;
            }
        });
        if complete {
            store.sync(&temp)?;
            store.verify(&temp, &chunk.file)?;
        }
        Ok(())
    }

    /// Move verified temp files into place and drop index files the source
    /// does not have
    fn swap_in_files(&self, source_metadata: &MetadataSnapshot) -> Result<(), RecoveryCause> {
        let store = self.shard.store();
        self.shard
            .update_recovery_state(|state| {
                state.set_stage(RecoveryStage::VerifyIndex);
            });

        for (name, meta) in &source_metadata.files {
            let temp = temp_file_name(self.recovery_id, name);
            if store.exists(&temp) {
                store.verify(&temp, meta)?;
            } else {
                // Reused: must already match locally
                store.verify(name, meta)?;
            }
        }
        for name in source_metadata.files.keys() {
            let temp = temp_file_name(self.recovery_id, name);
            if store.exists(&temp) {
                store.rename(&temp, name)?;
            }
        }
        for name in store.list_matching(is_index_file) {
            if !source_metadata.files.contains_key(&name) {
                store.delete(&name)?;
            }
        }
        Ok(())
    }
}

fn remote(cause: RecoveryCause) -> TransportError {
    match cause {
        RecoveryCause::Cancelled(_) => TransportError::Cancelled,
        RecoveryCause::Shard(e) => TransportError::from(*e),
        other => TransportError::Remote {
            reason: other.to_string(),
            retryable: false,
            shard_failure: true,
            remote_term: None,
        },
    }
}

impl RecoveryTargetHandler for RecoveryTarget {
    fn request_file_list(&self) -> TransportFuture<'_, MetadataSnapshot> {
        Box::pin(async move {
            self.ensure_recovering()?;
            Ok(self.shard.store().metadata_snapshot())
        })
    }

    fn receive_file_info(&self, info: FilesInfo) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.ensure_recovering()?;
            self.shard.close_engine_for_file_copy();
            self.received.lock().clear();
            self.shard.update_recovery_state(|state| {
                state.files.total_files = info.files_to_recover.len() + info.reused_files.len();
                state.files.reused_files = info.reused_files.len();
                state.files.reused_bytes = info.reused_files.iter().map(|f| f.length).sum();
                state.files.total_bytes = state.files.reused_bytes
                    + info.files_to_recover.iter().map(|f| f.length).sum::<u64>();
            });
            Ok(())
        })
    }

    fn send_file_chunk(&self, chunk: FileChunk) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.ensure_recovering()?;
            self.write_chunk(&chunk).map_err(remote)
        })
    }

    fn clean_files(&self, source_metadata: MetadataSnapshot) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.ensure_recovering()?;
            self.swap_in_files(&source_metadata).map_err(remote)
        })
    }

    fn prepare_for_translog(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.ensure_recovering()?;
            self.shard.open_engine_for_translog().map_err(remote)
        })
    }

    fn send_translog_ops(&self, batch: TranslogBatch) -> TransportFuture<'_, SeqNo> {
        Box::pin(async move {
            self.ensure_recovering()?;
            Ok(self.shard.apply_recovery_batch(&batch)?)
        })
    }

    fn finalize_recovery(&self, global_checkpoint: SeqNo) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.ensure_recovering()?;
            Ok(self.shard.finalize_peer_recovery(global_checkpoint)?)
        })
    }
}
