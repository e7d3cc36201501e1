//! InMemoryEngine - documents in memory, commits and translog in the Store
//!
//! A commit writes one segment holding every document touched since the
//! previous commit, then a JSON commit point listing all live segments.
//! Opening replays the segments of the newest commit in order; later
//! segments overwrite earlier ones.

use super::{AppendMode, DocVersion, Engine, EngineError};
use crate::config::TranslogConfig;
use crate::seqno::{SeqNo, SeqNoStats, NO_OPS_PERFORMED};
use crate::shard::{Operation, OperationKind};
use crate::store::{commit_file_name, is_index_file, segment_file_name, Store};
use crate::translog::Translog;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Durable description of one commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitPoint {
    pub generation: u64,
    pub seq_no_stats: SeqNoStats,
    /// Segment files in apply order
    pub segments: Vec<String>,
    pub mapping_version: u64,
    pub translog_generation: u64,
}

impl CommitPoint {
    pub fn file_name(&self) -> String {
        commit_file_name(self.generation)
    }

    /// Every index file this commit needs
    pub fn files(&self) -> Vec<String> {
        let mut files = self.segments.clone();
        files.push(self.file_name());
        files
    }

    /// The commit holds every operation up to the global checkpoint and
    /// nothing the cluster could still roll back.
    pub fn is_safe(&self) -> bool {
        self.seq_no_stats.local_checkpoint <= self.seq_no_stats.global_checkpoint
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SegmentDoc {
    id: String,
    seq_no: SeqNo,
    primary_term: u64,
    /// None marks a delete
    source: Option<Bytes>,
}

#[derive(Debug, Clone)]
struct DocEntry {
    seq_no: SeqNo,
    primary_term: u64,
    source: Option<Bytes>,
}

/// Engine keeping live documents in memory
#[derive(Debug)]
pub struct InMemoryEngine {
    store: Store,
    docs: BTreeMap<String, DocEntry>,
    dirty: BTreeSet<String>,
    translog: Translog,
    last_commit: Option<CommitPoint>,
    mapping_version: u64,
    max_seq_no: SeqNo,
}

impl InMemoryEngine {
    /// Open over `store`, loading the newest commit if there is one
    pub fn open(store: Store, config: &TranslogConfig) -> Result<Self, EngineError> {
        let mut docs = BTreeMap::new();
        let mut last_commit = None;
        let mut mapping_version = 0;

        if let Some(generation) = store.latest_commit_generation() {
            let raw = store.read_file(&commit_file_name(generation))?;
            let commit: CommitPoint = serde_json::from_slice(&raw)
                .map_err(|e| EngineError::Corruption(format!("commit point: {}", e)))?;

            for segment in &commit.segments {
                let raw = store.read_file(segment)?;
                let segment_docs: Vec<SegmentDoc> = bincode::deserialize(&raw)
                    .map_err(|e| EngineError::Corruption(format!("{}: {}", segment, e)))?;
                for doc in segment_docs {
                    docs.insert(
                        doc.id,
                        DocEntry {
                            seq_no: doc.seq_no,
                            primary_term: doc.primary_term,
                            source: doc.source,
                        },
                    );
                }
            }

            let referenced: BTreeSet<String> = commit.files().into_iter().collect();
            for name in store.list_matching(is_index_file) {
                if !referenced.contains(&name) {
                    store.delete(&name)?;
                }
            }

            mapping_version = commit.mapping_version;
            last_commit = Some(commit);
        }

        let translog = Translog::open(store.clone(), config.durability)?;
        let max_seq_no = last_commit
            .as_ref()
            .map(|c| c.seq_no_stats.max_seq_no)
            .unwrap_or(NO_OPS_PERFORMED)
            .max(translog.max_seq_no());
        tracing::debug!(
            commit = ?last_commit.as_ref().map(|c| c.generation),
            docs = docs.len(),
            translog_generation = translog.current_generation(),
            "engine opened"
        );

        Ok(InMemoryEngine {
            store,
            docs,
            dirty: BTreeSet::new(),
            translog,
            last_commit,
            mapping_version,
            max_seq_no,
        })
    }

    fn apply_to_docs(&mut self, op: &Operation) {
        let (id, source) = match &op.kind {
            OperationKind::Index { id, source } => (id, Some(source.clone())),
            OperationKind::Delete { id } => (id, None),
            OperationKind::NoOp { .. } => return,
        };
        self.docs.insert(
            id.clone(),
            DocEntry {
                seq_no: op.seq_no,
                primary_term: op.primary_term,
                source,
            },
        );
        self.dirty.insert(id.clone());
    }
}

impl Engine for InMemoryEngine {
    fn append_operation(&mut self, op: &Operation, mode: AppendMode) -> Result<(), EngineError> {
        debug_assert!(op.seq_no >= 0, "Precondition: engine only sees stamped operations");
        self.max_seq_no = self.max_seq_no.max(op.seq_no);
        match mode {
            AppendMode::Apply => {
                self.translog.add(op)?;
                self.apply_to_docs(op);
            }
            AppendMode::HistoryOnly => self.translog.add(op)?,
            AppendMode::Replay => self.apply_to_docs(op),
        }
        Ok(())
    }

    fn commit(&mut self, stats: SeqNoStats, retain_above: SeqNo) -> Result<CommitPoint, EngineError> {
        debug_assert!(stats.is_consistent(), "Precondition: committed stats must be consistent");

        let generation = self
            .last_commit
            .as_ref()
            .map(|c| c.generation)
            .or_else(|| self.store.latest_commit_generation())
            .unwrap_or(0)
            + 1;
        let translog_generation = self.translog.roll_generation()?;

        let mut segments = self
            .last_commit
            .as_ref()
            .map(|c| c.segments.clone())
            .unwrap_or_default();
        if !self.dirty.is_empty() {
            let segment_docs: Vec<SegmentDoc> = self
                .dirty
                .iter()
                .filter_map(|id| {
                    self.docs.get(id).map(|d| SegmentDoc {
                        id: id.clone(),
                        seq_no: d.seq_no,
                        primary_term: d.primary_term,
                        source: d.source.clone(),
                    })
                })
                .collect();
            let data = bincode::serialize(&segment_docs)
                .map_err(|e| EngineError::Corruption(format!("serialize segment: {}", e)))?;
            let name = segment_file_name(generation);
            self.store.write_file(&name, &data)?;
            segments.push(name);
        }

        let commit = CommitPoint {
            generation,
            seq_no_stats: stats,
            segments,
            mapping_version: self.mapping_version,
            translog_generation,
        };
        let json = serde_json::to_vec(&commit)
            .map_err(|e| EngineError::Corruption(format!("serialize commit: {}", e)))?;
        self.store.write_file(&commit.file_name(), &json)?;
        if let Some(previous) = &self.last_commit {
            self.store.delete(&previous.file_name())?;
        }

        debug_assert!(
            retain_above <= stats.local_checkpoint,
            "Precondition: uncommitted operations must stay in the translog"
        );
        let trimmed = self.translog.trim_below(retain_above)?;
        tracing::debug!(
            generation,
            local_checkpoint = stats.local_checkpoint,
            global_checkpoint = stats.global_checkpoint,
            trimmed_generations = trimmed,
            "engine committed"
        );

        self.dirty.clear();
        self.last_commit = Some(commit.clone());
        Ok(commit)
    }

    fn last_commit(&self) -> Option<&CommitPoint> {
        self.last_commit.as_ref()
    }

    fn current_max_seq_no(&self) -> SeqNo {
        self.max_seq_no
    }

    fn read_operations_since(&self, from: SeqNo) -> Result<Vec<Operation>, EngineError> {
        Ok(self.translog.read_operations(from)?)
    }

    fn has_complete_history(&self, from: SeqNo, to: SeqNo) -> Result<bool, EngineError> {
        Ok(self.translog.has_complete_history(from, to)?)
    }

    fn doc_version(&self, id: &str) -> Option<DocVersion> {
        self.docs.get(id).map(|d| DocVersion {
            seq_no: d.seq_no,
            primary_term: d.primary_term,
            deleted: d.source.is_none(),
        })
    }

    fn get(&self, id: &str) -> Option<Bytes> {
        self.docs.get(id).and_then(|d| d.source.clone())
    }

    fn doc_ids(&self) -> Vec<String> {
        self.docs
            .iter()
            .filter(|(_, d)| d.source.is_some())
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn doc_count(&self) -> usize {
        self.docs.values().filter(|d| d.source.is_some()).count()
    }

    fn mapping_version(&self) -> u64 {
        self.mapping_version
    }

    fn update_mapping(&mut self, version: u64) {
        self.mapping_version = self.mapping_version.max(version);
    }

    fn sync_translog(&mut self) -> Result<(), EngineError> {
        Ok(self.translog.sync()?)
    }

    fn uncommitted_operations(&self) -> usize {
        self.translog.uncommitted_operations()
    }
}
