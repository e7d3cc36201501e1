//! Shard Store - the file namespace of one shard copy
//!
//! Holds the engine's index files, translog generations and in-flight
//! recovery temp files. Cheap to clone (shared `Arc`), so an engine, a
//! recovery target and a restarted shard can all address the same files.
//!
//! ## File naming
//!
//! ```text
//! segments_<gen>           commit point (JSON)
//! _<gen>.seg               segment written by commit <gen> (bincode)
//! translog-<gen>.tlog      translog generation
//! recovery.<id>.<name>     temp file of an in-flight recovery
//! ```
//!
//! Crash model: every file tracks how many bytes were synced.
//! `simulate_crash` truncates every file to its synced length, the same
//! way the translog's in-memory store does.

mod metadata;

pub use metadata::{MetadataSnapshot, RecoveryDiff, StoreFileMetadata};

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const COMMIT_PREFIX: &str = "segments_";
pub const SEGMENT_SUFFIX: &str = ".seg";
pub const TRANSLOG_PREFIX: &str = "translog-";
pub const TRANSLOG_SUFFIX: &str = ".tlog";
pub const TEMP_PREFIX: &str = "recovery.";

/// Error type for store operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    NotFound(String),
    /// Read past the end of a file
    OutOfBounds { name: String, offset: u64, len: u64 },
    /// Content does not match the expected checksum
    Corruption {
        name: String,
        expected: u32,
        actual: u32,
    },
    /// Writes are rejected (simulated disk failure)
    ReadOnly,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(name) => write!(f, "file not found: {}", name),
            StoreError::OutOfBounds { name, offset, len } => {
                write!(f, "read of {} bytes at {} is past the end of {}", len, offset, name)
            }
            StoreError::Corruption {
                name,
                expected,
                actual,
            } => write!(
                f,
                "checksum mismatch in {}: expected {:08x}, got {:08x}",
                name, expected, actual
            ),
            StoreError::ReadOnly => write!(f, "store is read-only"),
        }
    }
}

impl std::error::Error for StoreError {}

#[derive(Debug, Default)]
struct StoredFile {
    data: Vec<u8>,
    synced_len: usize,
}

#[derive(Debug, Default)]
struct StoreInner {
    files: BTreeMap<String, StoredFile>,
    read_only: bool,
}

/// In-memory shard store
#[derive(Debug, Clone, Default)]
pub struct Store {
    inner: Arc<RwLock<StoreInner>>,
}

/// Whether a file belongs to the engine's committed index
pub fn is_index_file(name: &str) -> bool {
    name.starts_with(COMMIT_PREFIX) || (name.starts_with('_') && name.ends_with(SEGMENT_SUFFIX))
}

pub fn is_translog_file(name: &str) -> bool {
    name.starts_with(TRANSLOG_PREFIX) && name.ends_with(TRANSLOG_SUFFIX)
}

pub fn commit_file_name(generation: u64) -> String {
    format!("{}{}", COMMIT_PREFIX, generation)
}

pub fn segment_file_name(generation: u64) -> String {
    format!("_{}{}", generation, SEGMENT_SUFFIX)
}

pub fn temp_file_name(recovery_id: u64, name: &str) -> String {
    format!("{}{}.{}", TEMP_PREFIX, recovery_id, name)
}

/// Parse `segments_<gen>`
pub fn parse_commit_generation(name: &str) -> Option<u64> {
    name.strip_prefix(COMMIT_PREFIX)?.parse().ok()
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a whole file and sync it. Replaces any existing content.
    pub fn write_file(&self, name: &str, data: &[u8]) -> Result<(), StoreError> {
        debug_assert!(!name.is_empty(), "Precondition: name must not be empty");
        let mut inner = self.inner.write();
        if inner.read_only {
            return Err(StoreError::ReadOnly);
        }
        inner.files.insert(
            name.to_string(),
            StoredFile {
                data: data.to_vec(),
                synced_len: data.len(),
            },
        );
        Ok(())
    }

    /// Write `data` at `position`, growing the file as needed. Not synced.
    pub fn write_at(&self, name: &str, position: u64, data: &[u8]) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if inner.read_only {
            return Err(StoreError::ReadOnly);
        }
        let file = inner.files.entry(name.to_string()).or_default();
        let start = position as usize;
        let end = start + data.len();
        if file.data.len() < end {
            file.data.resize(end, 0);
        }
        file.data[start..end].copy_from_slice(data);
        Ok(())
    }

    /// Append to a file, creating it if missing. Returns the new length.
    pub fn append(&self, name: &str, data: &[u8]) -> Result<u64, StoreError> {
        let mut inner = self.inner.write();
        if inner.read_only {
            return Err(StoreError::ReadOnly);
        }
        let file = inner.files.entry(name.to_string()).or_default();
        file.data.extend_from_slice(data);
        Ok(file.data.len() as u64)
    }

    /// Make everything written to `name` so far survive a crash
    pub fn sync(&self, name: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if inner.read_only {
            return Err(StoreError::ReadOnly);
        }
        let file = inner
            .files
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        file.synced_len = file.data.len();
        Ok(())
    }

    pub fn read_file(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        let inner = self.inner.read();
        inner
            .files
            .get(name)
            .map(|f| f.data.clone())
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    pub fn read_range(&self, name: &str, offset: u64, len: u64) -> Result<Vec<u8>, StoreError> {
        let inner = self.inner.read();
        let file = inner
            .files
            .get(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        let end = offset.checked_add(len).unwrap_or(u64::MAX);
        if end > file.data.len() as u64 {
            return Err(StoreError::OutOfBounds {
                name: name.to_string(),
                offset,
                len,
            });
        }
        Ok(file.data[offset as usize..end as usize].to_vec())
    }

    pub fn file_length(&self, name: &str) -> Result<u64, StoreError> {
        let inner = self.inner.read();
        inner
            .files
            .get(name)
            .map(|f| f.data.len() as u64)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.inner.read().files.contains_key(name)
    }

    pub fn delete(&self, name: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if inner.read_only {
            return Err(StoreError::ReadOnly);
        }
        inner.files.remove(name);
        Ok(())
    }

    /// Rename and sync, replacing `to` if it exists
    pub fn rename(&self, from: &str, to: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if inner.read_only {
            return Err(StoreError::ReadOnly);
        }
        let mut file = inner
            .files
            .remove(from)
            .ok_or_else(|| StoreError::NotFound(from.to_string()))?;
        file.synced_len = file.data.len();
        inner.files.insert(to.to_string(), file);
        Ok(())
    }

    pub fn list(&self) -> Vec<String> {
        self.inner.read().files.keys().cloned().collect()
    }

    pub fn list_matching(&self, predicate: impl Fn(&str) -> bool) -> Vec<String> {
        self.inner
            .read()
            .files
            .keys()
            .filter(|name| predicate(name))
            .cloned()
            .collect()
    }

    /// Temp files left by recoveries
    pub fn temp_files(&self) -> Vec<String> {
        self.list_matching(|name| name.starts_with(TEMP_PREFIX))
    }

    /// Delete all temp files of one recovery
    pub fn delete_temp_files(&self, recovery_id: u64) -> Result<usize, StoreError> {
        let prefix = format!("{}{}.", TEMP_PREFIX, recovery_id);
        let names = self.list_matching(|name| name.starts_with(&prefix));
        for name in &names {
            self.delete(name)?;
        }
        Ok(names.len())
    }

    /// Latest commit generation present in the store
    pub fn latest_commit_generation(&self) -> Option<u64> {
        self.inner
            .read()
            .files
            .keys()
            .filter_map(|name| parse_commit_generation(name))
            .max()
    }

    /// Metadata of the committed index files
    pub fn metadata_snapshot(&self) -> MetadataSnapshot {
        let inner = self.inner.read();
        let files = inner
            .files
            .iter()
            .filter(|(name, _)| is_index_file(name))
            .map(|(name, f)| (name.clone(), StoreFileMetadata::of(name.clone(), &f.data)))
            .collect();
        let commit_generation = inner
            .files
            .keys()
            .filter_map(|name| parse_commit_generation(name))
            .max();
        MetadataSnapshot {
            files,
            commit_generation,
        }
    }

    /// Immutable copies of the named files, unaffected by later deletes
    pub fn snapshot_files(&self, names: &[String]) -> Result<BTreeMap<String, Bytes>, StoreError> {
        let inner = self.inner.read();
        names
            .iter()
            .map(|name| {
                inner
                    .files
                    .get(name)
                    .map(|f| (name.clone(), Bytes::from(f.data.clone())))
                    .ok_or_else(|| StoreError::NotFound(name.clone()))
            })
            .collect()
    }

    /// Verify a file against expected metadata
    pub fn verify(&self, name: &str, expected: &StoreFileMetadata) -> Result<(), StoreError> {
        let inner = self.inner.read();
        let file = inner
            .files
            .get(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        let actual = crc32fast::hash(&file.data);
        if file.data.len() as u64 != expected.length || actual != expected.checksum {
            return Err(StoreError::Corruption {
                name: expected.name.clone(),
                expected: expected.checksum,
                actual,
            });
        }
        Ok(())
    }

    /// Reject all further writes (simulated disk failure)
    pub fn set_read_only(&self, read_only: bool) {
        self.inner.write().read_only = read_only;
    }

    /// Drop everything that was not synced
    pub fn simulate_crash(&self) {
        let mut inner = self.inner.write();
        for file in inner.files.values_mut() {
            file.data.truncate(file.synced_len);
        }
    }
}
