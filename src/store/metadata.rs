//! File metadata and recovery diffs

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Name, length and CRC32 of one index file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreFileMetadata {
    pub name: String,
    pub length: u64,
    pub checksum: u32,
}

impl StoreFileMetadata {
    pub fn of(name: impl Into<String>, data: &[u8]) -> Self {
        StoreFileMetadata {
            name: name.into(),
            length: data.len() as u64,
            checksum: crc32fast::hash(data),
        }
    }

    /// Same length and checksum. Names are compared by the caller.
    pub fn is_same(&self, other: &StoreFileMetadata) -> bool {
        self.length == other.length && self.checksum == other.checksum
    }
}

/// Index files of one commit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataSnapshot {
    pub files: BTreeMap<String, StoreFileMetadata>,
    /// Generation of the commit point these files belong to
    pub commit_generation: Option<u64>,
}

/// How a source's files relate to a target's
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryDiff {
    /// Present on both sides with the same length and checksum
    pub identical: Vec<StoreFileMetadata>,
    /// Present on both sides but with different content
    pub different: Vec<StoreFileMetadata>,
    /// Only on the source
    pub missing: Vec<StoreFileMetadata>,
}

impl RecoveryDiff {
    /// Files the target needs to receive
    pub fn to_transfer(&self) -> impl Iterator<Item = &StoreFileMetadata> {
        self.different.iter().chain(self.missing.iter())
    }

    pub fn bytes_to_transfer(&self) -> u64 {
        self.to_transfer().map(|f| f.length).sum()
    }

    pub fn bytes_reused(&self) -> u64 {
        self.identical.iter().map(|f| f.length).sum()
    }
}

impl MetadataSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&StoreFileMetadata> {
        self.files.get(name)
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.values().map(|f| f.length).sum()
    }

    /// Compare this (source) snapshot against a target's.
    ///
    /// Target-only files are not listed; the target drops them when the
    /// transfer is complete.
    pub fn recovery_diff(&self, target: &MetadataSnapshot) -> RecoveryDiff {
        let mut diff = RecoveryDiff::default();
        for (name, meta) in &self.files {
            match target.files.get(name) {
                Some(theirs) if theirs.is_same(meta) => diff.identical.push(meta.clone()),
                Some(_) => diff.different.push(meta.clone()),
                None => diff.missing.push(meta.clone()),
            }
        }

        debug_assert_eq!(
            diff.identical.len() + diff.different.len() + diff.missing.len(),
            self.files.len(),
            "Postcondition: every source file is classified exactly once"
        );
        diff
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(files: &[(&str, &[u8])]) -> MetadataSnapshot {
        MetadataSnapshot {
            files: files
                .iter()
                .map(|(name, data)| (name.to_string(), StoreFileMetadata::of(*name, data)))
                .collect(),
            commit_generation: Some(1),
        }
    }

    #[test]
    fn test_diff_classifies_files() {
        let source = snapshot(&[("_1.seg", b"aaa"), ("_2.seg", b"bbb"), ("segments_2", b"c2")]);
        let target = snapshot(&[("_1.seg", b"aaa"), ("_2.seg", b"xxx"), ("_9.seg", b"old")]);

        let diff = source.recovery_diff(&target);
        assert_eq!(diff.identical.len(), 1);
        assert_eq!(diff.identical[0].name, "_1.seg");
        assert_eq!(diff.different.len(), 1);
        assert_eq!(diff.different[0].name, "_2.seg");
        assert_eq!(diff.missing.len(), 1);
        assert_eq!(diff.missing[0].name, "segments_2");
        assert_eq!(diff.bytes_reused(), 3);
        assert_eq!(diff.bytes_to_transfer(), 5);
    }

    #[test]
    fn test_diff_against_empty_target_transfers_everything() {
        let source = snapshot(&[("_1.seg", b"aaa"), ("segments_1", b"c")]);
        let diff = source.recovery_diff(&MetadataSnapshot::empty());
        assert!(diff.identical.is_empty());
        assert_eq!(diff.to_transfer().count(), 2);
    }
}
