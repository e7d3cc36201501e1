//! Simulated transport: wraps a real client or target and injects faults
//!
//! Fault decisions come from BUGGIFY points drawn from a seeded RNG, so a
//! run is reproducible from its seed.

use super::{
    FileChunk, FilesInfo, PeerRecoverySource, RecoveryFuture, RecoveryTargetHandler,
    ReplicaClient, ReplicaRequest, ReplicaResponse, StartRecoveryRequest, TranslogBatch,
    TransportError, TransportFuture,
};
use crate::buggify;
use crate::buggify::faults;
use crate::seqno::SeqNo;
use crate::shard::AllocationId;
use crate::simulator::DeterministicRng;
use crate::store::MetadataSnapshot;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Replica client that loses requests and responses
pub struct SimulatedReplicaClient {
    inner: Arc<dyn ReplicaClient>,
    rng: Mutex<DeterministicRng>,
}

impl SimulatedReplicaClient {
    pub fn new(inner: Arc<dyn ReplicaClient>, seed: u64) -> Self {
        SimulatedReplicaClient {
            inner,
            rng: Mutex::new(DeterministicRng::new(seed)),
        }
    }
}

impl ReplicaClient for SimulatedReplicaClient {
    fn perform_on_replica<'a>(
        &'a self,
        target: &'a AllocationId,
        request: ReplicaRequest,
    ) -> TransportFuture<'a, ReplicaResponse> {
        Box::pin(async move {
            if buggify!(&mut *self.rng.lock(), faults::transport::REPLICA_DISCONNECT) {
                return Err(TransportError::Disconnected(format!(
                    "request to {} dropped",
                    target
                )));
            }
            let response = self.inner.perform_on_replica(target, request).await?;
            if buggify!(&mut *self.rng.lock(), faults::transport::REPLICA_RESPONSE_LOST) {
                return Err(TransportError::Disconnected(format!(
                    "response from {} lost",
                    target
                )));
            }
            Ok(response)
        })
    }
}

type ChunkHook = Arc<dyn Fn(usize) + Send + Sync>;

/// Recovery target that disconnects, corrupts chunks and stalls
pub struct SimulatedRecoveryTarget {
    inner: Arc<dyn RecoveryTargetHandler>,
    rng: Mutex<DeterministicRng>,
    /// How long a stalled call hangs
    stall: Duration,
    chunks_sent: AtomicUsize,
    chunk_hook: Option<ChunkHook>,
}

impl SimulatedRecoveryTarget {
    pub fn new(inner: Arc<dyn RecoveryTargetHandler>, seed: u64, stall: Duration) -> Self {
        SimulatedRecoveryTarget {
            inner,
            rng: Mutex::new(DeterministicRng::new(seed)),
            stall,
            chunks_sent: AtomicUsize::new(0),
            chunk_hook: None,
        }
    }

    /// Run `hook` with the chunk count before each chunk is forwarded
    pub fn with_chunk_hook(mut self, hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.chunk_hook = Some(Arc::new(hook));
        self
    }

    pub fn chunks_sent(&self) -> usize {
        self.chunks_sent.load(Ordering::SeqCst)
    }

    /// Faults common to every call
    async fn before_call(&self, action: &str) -> Result<(), TransportError> {
        let (disconnect, stall) = {
            let mut rng = self.rng.lock();
            (
                buggify!(&mut *rng, faults::transport::RECOVERY_DISCONNECT),
                buggify!(&mut *rng, faults::transport::RECOVERY_STALL),
            )
        };
        if disconnect {
            return Err(TransportError::Disconnected(format!("{} dropped", action)));
        }
        if stall {
            tokio::time::sleep(self.stall).await;
        }
        Ok(())
    }

    fn maybe_corrupt(&self, chunk: FileChunk) -> FileChunk {
        let corrupt = !chunk.data.is_empty()
            && buggify!(&mut *self.rng.lock(), faults::transport::CHUNK_CORRUPT);
        if !corrupt {
            return chunk;
        }
        let mut data = BytesMut::from(&chunk.data[..]);
        let last = data.len() - 1;
        data[last] ^= 0x5A;
        FileChunk {
            data: Bytes::from(data),
            ..chunk
        }
    }
}

impl RecoveryTargetHandler for SimulatedRecoveryTarget {
    fn request_file_list(&self) -> TransportFuture<'_, MetadataSnapshot> {
        Box::pin(async move {
            self.before_call("request_file_list").await?;
            self.inner.request_file_list().await
        })
    }

    fn receive_file_info(&self, info: FilesInfo) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.before_call("receive_file_info").await?;
            self.inner.receive_file_info(info).await
        })
    }

    fn send_file_chunk(&self, chunk: FileChunk) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            let sent = self.chunks_sent.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(hook) = &self.chunk_hook {
                hook(sent);
            }
            self.before_call("send_file_chunk").await?;
            let chunk = self.maybe_corrupt(chunk);
            self.inner.send_file_chunk(chunk).await
        })
    }

    fn clean_files(&self, source_metadata: MetadataSnapshot) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.before_call("clean_files").await?;
            self.inner.clean_files(source_metadata).await
        })
    }

    fn prepare_for_translog(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.before_call("prepare_for_translog").await?;
            self.inner.prepare_for_translog().await
        })
    }

    fn send_translog_ops(&self, batch: TranslogBatch) -> TransportFuture<'_, SeqNo> {
        Box::pin(async move {
            self.before_call("send_translog_ops").await?;
            self.inner.send_translog_ops(batch).await
        })
    }

    fn finalize_recovery(&self, global_checkpoint: SeqNo) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.before_call("finalize_recovery").await?;
            self.inner.finalize_recovery(global_checkpoint).await
        })
    }
}

/// Peer recovery source whose every recovery talks to a faulty target
pub struct SimulatedPeerRecoverySource {
    inner: Arc<dyn PeerRecoverySource>,
    seed: u64,
    stall: Duration,
    recoveries: AtomicU64,
    chunk_hook: Option<ChunkHook>,
}

impl SimulatedPeerRecoverySource {
    pub fn new(inner: Arc<dyn PeerRecoverySource>, seed: u64, stall: Duration) -> Self {
        SimulatedPeerRecoverySource {
            inner,
            seed,
            stall,
            recoveries: AtomicU64::new(0),
            chunk_hook: None,
        }
    }

    /// See [`SimulatedRecoveryTarget::with_chunk_hook`]
    pub fn with_chunk_hook(mut self, hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.chunk_hook = Some(Arc::new(hook));
        self
    }
}

impl PeerRecoverySource for SimulatedPeerRecoverySource {
    fn start_recovery(
        &self,
        request: StartRecoveryRequest,
        target: Arc<dyn RecoveryTargetHandler>,
    ) -> RecoveryFuture<'_> {
        // Each attempt gets its own fault stream
        let attempt = self.recoveries.fetch_add(1, Ordering::SeqCst);
        let mut faulty = SimulatedRecoveryTarget::new(
            target,
            self.seed.wrapping_add(attempt),
            self.stall,
        );
        faulty.chunk_hook = self.chunk_hook.clone();
        self.inner.start_recovery(request, Arc::new(faulty))
    }
}
