//! In-process transport: copies in one process call each other directly

use super::{
    PeerRecoverySource, RecoveryFuture, RecoveryTargetHandler, ReplicaClient, ReplicaRequest,
    ReplicaResponse, StartRecoveryRequest, TransportError, TransportFuture,
};
use crate::recovery::RecoverySourceHandler;
use crate::shard::{AllocationId, IndexShard};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Routes replica requests to registered shards by allocation id
#[derive(Default)]
pub struct LocalReplicaClient {
    shards: RwLock<BTreeMap<AllocationId, Arc<IndexShard>>>,
}

impl LocalReplicaClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, shard: Arc<IndexShard>) {
        self.shards
            .write()
            .insert(shard.allocation_id().clone(), shard);
    }

    /// Requests to `allocation_id` fail as disconnected from now on
    pub fn unregister(&self, allocation_id: &AllocationId) -> Option<Arc<IndexShard>> {
        self.shards.write().remove(allocation_id)
    }
}

impl ReplicaClient for LocalReplicaClient {
    fn perform_on_replica<'a>(
        &'a self,
        target: &'a AllocationId,
        request: ReplicaRequest,
    ) -> TransportFuture<'a, ReplicaResponse> {
        Box::pin(async move {
            let shard = self
                .shards
                .read()
                .get(target)
                .cloned()
                .ok_or_else(|| TransportError::Disconnected(format!("no copy {}", target)))?;
            Ok(shard.apply_replica_request(&request)?)
        })
    }
}

/// Serves peer recoveries from a primary in the same process
pub struct LocalPeerRecoverySource {
    primary: Arc<IndexShard>,
}

impl LocalPeerRecoverySource {
    pub fn new(primary: Arc<IndexShard>) -> Self {
        LocalPeerRecoverySource { primary }
    }
}

impl PeerRecoverySource for LocalPeerRecoverySource {
    fn start_recovery(
        &self,
        request: StartRecoveryRequest,
        target: Arc<dyn RecoveryTargetHandler>,
    ) -> RecoveryFuture<'_> {
        Box::pin(async move {
            let handler = RecoverySourceHandler::new(
                Arc::clone(&self.primary),
                request,
                target,
                self.primary.config().recovery.clone(),
            );
            handler.recover_to_target().await
        })
    }
}
