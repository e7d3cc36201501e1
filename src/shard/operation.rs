//! Write operations and their outcomes

use crate::seqno::{SeqNo, UNASSIGNED_PRIMARY_TERM, UNASSIGNED_SEQ_NO};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// What a write does to a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    Index { id: String, source: Bytes },
    Delete { id: String },
    /// Fills a sequence number that carries no document change
    NoOp { reason: String },
}

/// A replicated write.
///
/// Built by the client without a seqNo; the primary stamps `seq_no` and
/// `primary_term` and the stamped copy is what replicas and translogs see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub seq_no: SeqNo,
    pub primary_term: u64,
    /// Mapping version the document requires
    pub mapping_version: u64,
    pub kind: OperationKind,
}

impl Operation {
    pub fn index(id: impl Into<String>, source: impl Into<Bytes>) -> Self {
        Operation {
            seq_no: UNASSIGNED_SEQ_NO,
            primary_term: UNASSIGNED_PRIMARY_TERM,
            mapping_version: 0,
            kind: OperationKind::Index {
                id: id.into(),
                source: source.into(),
            },
        }
    }

    pub fn delete(id: impl Into<String>) -> Self {
        Operation {
            seq_no: UNASSIGNED_SEQ_NO,
            primary_term: UNASSIGNED_PRIMARY_TERM,
            mapping_version: 0,
            kind: OperationKind::Delete { id: id.into() },
        }
    }

    pub fn no_op(seq_no: SeqNo, primary_term: u64, reason: impl Into<String>) -> Self {
        Operation {
            seq_no,
            primary_term,
            mapping_version: 0,
            kind: OperationKind::NoOp {
                reason: reason.into(),
            },
        }
    }

    pub fn with_mapping_version(mut self, mapping_version: u64) -> Self {
        self.mapping_version = mapping_version;
        self
    }

    /// Copy stamped by the primary
    pub fn stamped(&self, seq_no: SeqNo, primary_term: u64) -> Self {
        debug_assert!(seq_no >= 0, "Precondition: stamped seq_no must be assigned");
        Operation {
            seq_no,
            primary_term,
            ..self.clone()
        }
    }

    pub fn doc_id(&self) -> Option<&str> {
        match &self.kind {
            OperationKind::Index { id, .. } | OperationKind::Delete { id } => Some(id),
            OperationKind::NoOp { .. } => None,
        }
    }

    pub fn is_no_op(&self) -> bool {
        matches!(self.kind, OperationKind::NoOp { .. })
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            OperationKind::Index { id, source } => write!(
                f,
                "index[{}] seq_no={} term={} ({} bytes)",
                id,
                self.seq_no,
                self.primary_term,
                source.len()
            ),
            OperationKind::Delete { id } => write!(
                f,
                "delete[{}] seq_no={} term={}",
                id, self.seq_no, self.primary_term
            ),
            OperationKind::NoOp { reason } => write!(
                f,
                "noop seq_no={} term={} ({})",
                self.seq_no, self.primary_term, reason
            ),
        }
    }
}

/// Result of executing a write on the primary
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrimaryOutcome {
    /// Assigned a seqNo and applied locally; `operation` is the stamped copy
    Applied {
        operation: Operation,
        created: bool,
        global_checkpoint: SeqNo,
        max_seq_no_of_updates_or_deletes: SeqNo,
    },
    /// The document needs a newer mapping. No seqNo was consumed.
    MappingUpdateRequired { required: u64, current: u64 },
}

/// Result of applying a primary-stamped write on a replica
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaOutcome {
    Applied,
    /// The copy already holds a newer version of the document
    Superseded,
    /// The seqNo was already processed on this copy
    Duplicate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_operations_are_unassigned() {
        let op = Operation::index("doc-1", &b"{}"[..]);
        assert_eq!(op.seq_no, UNASSIGNED_SEQ_NO);
        assert_eq!(op.primary_term, UNASSIGNED_PRIMARY_TERM);
        assert_eq!(op.doc_id(), Some("doc-1"));
    }

    #[test]
    fn test_stamped_keeps_payload() {
        let op = Operation::delete("doc-2").with_mapping_version(3);
        let stamped = op.stamped(9, 2);
        assert_eq!(stamped.seq_no, 9);
        assert_eq!(stamped.primary_term, 2);
        assert_eq!(stamped.mapping_version, 3);
        assert_eq!(stamped.kind, op.kind);
    }

    #[test]
    fn test_no_op_has_no_doc() {
        let op = Operation::no_op(4, 1, "filling gap");
        assert!(op.is_no_op());
        assert_eq!(op.doc_id(), None);
    }
}
