//! Storage Engine Interface
//!
//! The shard drives an engine through this trait and never looks at its
//! files. Sequence number bookkeeping stays in the shard; the engine only
//! stores documents, the translog and commit points.
//!
//! ```text
//! IndexShard ──append_operation──► Engine ──► docs (in memory)
//!            ──commit(stats)─────►        └─► translog generations
//!                                         └─► segments_N + _N.seg
//! ```

mod memory;

pub use memory::{CommitPoint, InMemoryEngine};

use crate::config::TranslogConfig;
use crate::seqno::{SeqNo, SeqNoStats};
use crate::shard::Operation;
use crate::store::{Store, StoreError};
use crate::translog::TranslogError;
use bytes::Bytes;
use std::sync::Arc;

/// Error type for engine operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    Store(StoreError),
    Translog(TranslogError),
    /// A commit point or segment could not be decoded
    Corruption(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Store(e) => write!(f, "engine store error: {}", e),
            EngineError::Translog(e) => write!(f, "engine translog error: {}", e),
            EngineError::Corruption(msg) => write!(f, "engine corruption: {}", msg),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        EngineError::Store(e)
    }
}

impl From<TranslogError> for EngineError {
    fn from(e: TranslogError) -> Self {
        EngineError::Translog(e)
    }
}

/// How an operation reaches the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendMode {
    /// Apply to documents and record in the translog
    Apply,
    /// Record in the translog only (operation superseded by a newer one)
    HistoryOnly,
    /// Apply to documents only (replaying the engine's own translog)
    Replay,
}

/// Current version of a document, including deletes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocVersion {
    pub seq_no: SeqNo,
    pub primary_term: u64,
    pub deleted: bool,
}

/// Storage engine of one shard copy
pub trait Engine: Send {
    fn append_operation(&mut self, op: &Operation, mode: AppendMode) -> Result<(), EngineError>;

    /// Durably commit everything applied so far, then drop translog
    /// generations holding only operations `<= retain_above`
    fn commit(&mut self, stats: SeqNoStats, retain_above: SeqNo) -> Result<CommitPoint, EngineError>;

    fn last_commit(&self) -> Option<&CommitPoint>;

    /// Highest seqNo this engine has seen, committed or not
    fn current_max_seq_no(&self) -> SeqNo;

    /// Retained history with `seq_no >= from`, in seqNo order
    fn read_operations_since(&self, from: SeqNo) -> Result<Vec<Operation>, EngineError>;

    /// Whether every seqNo in `from..=to` is still retained
    fn has_complete_history(&self, from: SeqNo, to: SeqNo) -> Result<bool, EngineError>;

    fn doc_version(&self, id: &str) -> Option<DocVersion>;

    fn get(&self, id: &str) -> Option<Bytes>;

    /// Live document ids in sorted order
    fn doc_ids(&self) -> Vec<String>;

    fn doc_count(&self) -> usize;

    fn mapping_version(&self) -> u64;

    /// Install a newer mapping. Older versions are ignored.
    fn update_mapping(&mut self, version: u64);

    fn sync_translog(&mut self) -> Result<(), EngineError>;

    /// Operations appended since the last commit
    fn uncommitted_operations(&self) -> usize;
}

/// Opens an engine over a store
pub type EngineFactory =
    Arc<dyn Fn(Store, &TranslogConfig) -> Result<Box<dyn Engine>, EngineError> + Send + Sync>;

pub fn in_memory_engine_factory() -> EngineFactory {
    Arc::new(|store, config| {
        let engine = InMemoryEngine::open(store, config)?;
        Ok(Box::new(engine) as Box<dyn Engine>)
    })
}
