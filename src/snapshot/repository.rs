//! BlobStoreRepository - incremental shard snapshots over an object store
//!
//! ## Layout
//!
//! ```text
//! indices/<index>/<shard>/
//!   __<crc32>-<len>          one blob per distinct file content
//!   snap-<snapshot>.json     shard manifest (written last, via rename)
//! ```
//!
//! Blobs are addressed by content, so a file already uploaded by an
//! earlier snapshot of the same shard is never uploaded again. A snapshot
//! exists once its manifest exists; a crash before that leaves only
//! unreferenced blobs.

use crate::engine::CommitPoint;
use crate::seqno::SeqNoStats;
use crate::shard::ShardId;
use crate::store::{temp_file_name, Store, StoreError, StoreFileMetadata};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

use super::ObjectStore;

/// Error type for repository operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    /// No such snapshot for this shard
    SnapshotMissing { shard: String, snapshot: String },
    SnapshotExists { shard: String, snapshot: String },
    /// Object store failure (kind and message of the I/O error)
    Io { kind: String, message: String },
    /// Blob content does not match the manifest
    Corruption {
        blob: String,
        expected: u32,
        actual: u32,
    },
    Manifest(String),
    Store(StoreError),
    /// The restoring copy gave up on the restore
    Cancelled,
}

impl std::fmt::Display for RepositoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RepositoryError::SnapshotMissing { shard, snapshot } => {
                write!(f, "snapshot {} of {} not found", snapshot, shard)
            }
            RepositoryError::SnapshotExists { shard, snapshot } => {
                write!(f, "snapshot {} of {} already exists", snapshot, shard)
            }
            RepositoryError::Io { kind, message } => {
                write!(f, "repository I/O error ({}): {}", kind, message)
            }
            RepositoryError::Corruption {
                blob,
                expected,
                actual,
            } => write!(
                f,
                "blob {} corrupted: expected crc {:08x}, got {:08x}",
                blob, expected, actual
            ),
            RepositoryError::Manifest(msg) => write!(f, "invalid snapshot manifest: {}", msg),
            RepositoryError::Store(e) => write!(f, "{}", e),
            RepositoryError::Cancelled => write!(f, "restore cancelled"),
        }
    }
}

impl std::error::Error for RepositoryError {}

impl From<std::io::Error> for RepositoryError {
    fn from(e: std::io::Error) -> Self {
        RepositoryError::Io {
            kind: format!("{:?}", e.kind()),
            message: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(e: serde_json::Error) -> Self {
        RepositoryError::Manifest(e.to_string())
    }
}

impl From<StoreError> for RepositoryError {
    fn from(e: StoreError) -> Self {
        RepositoryError::Store(e)
    }
}

/// One file of a shard snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub name: String,
    pub length: u64,
    pub checksum: u32,
    /// Blob key relative to the shard directory
    pub blob: String,
}

/// Manifest of one shard snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardSnapshotManifest {
    pub snapshot: String,
    pub shard_id: ShardId,
    /// Shard generation id, unique per snapshot of this shard
    pub generation: String,
    pub commit_generation: u64,
    pub seq_no_stats: SeqNoStats,
    pub mapping_version: u64,
    pub files: Vec<SnapshotFile>,
    pub total_size: u64,
    /// Files (and their bytes) uploaded by this snapshot rather than reused
    pub incremental_file_count: usize,
    pub incremental_size: u64,
}

/// What a restore wrote into the target store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreStats {
    pub files: usize,
    pub bytes: u64,
    pub seq_no_stats: SeqNoStats,
}

/// Snapshot repository backed by an object store
#[derive(Debug, Clone)]
pub struct BlobStoreRepository<S: ObjectStore> {
    name: String,
    store: S,
}

impl<S: ObjectStore> BlobStoreRepository<S> {
    pub fn new(name: impl Into<String>, store: S) -> Self {
        BlobStoreRepository {
            name: name.into(),
            store,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn object_store(&self) -> &S {
        &self.store
    }

    fn shard_path(shard_id: &ShardId) -> String {
        format!("indices/{}/{}/", shard_id.index, shard_id.shard)
    }

    fn manifest_key(shard_id: &ShardId, snapshot: &str) -> String {
        format!("{}snap-{}.json", Self::shard_path(shard_id), snapshot)
    }

    fn blob_name(meta: &StoreFileMetadata) -> String {
        format!("__{:08x}-{}", meta.checksum, meta.length)
    }

    /// Snapshot names of one shard, sorted
    pub async fn list_snapshots(&self, shard_id: &ShardId) -> Result<Vec<String>, RepositoryError> {
        let prefix = format!("{}snap-", Self::shard_path(shard_id));
        let objects = self.store.list(&prefix).await?;
        Ok(objects
            .iter()
            .filter_map(|o| o.key.strip_prefix(&prefix)?.strip_suffix(".json"))
            .map(str::to_string)
            .collect())
    }

    pub async fn read_manifest(
        &self,
        shard_id: &ShardId,
        snapshot: &str,
    ) -> Result<ShardSnapshotManifest, RepositoryError> {
        let key = Self::manifest_key(shard_id, snapshot);
        if !self.store.exists(&key).await? {
            return Err(RepositoryError::SnapshotMissing {
                shard: shard_id.to_string(),
                snapshot: snapshot.to_string(),
            });
        }
        let data = self.store.get(&key).await?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Upload the files of `commit` that the repository does not hold yet
    /// and publish the manifest. Returns the shard generation id.
    pub async fn snapshot_shard(
        &self,
        shard_id: &ShardId,
        snapshot: &str,
        commit: &CommitPoint,
        files: &BTreeMap<String, Bytes>,
    ) -> Result<String, RepositoryError> {
        let manifest_key = Self::manifest_key(shard_id, snapshot);
        if self.store.exists(&manifest_key).await? {
            return Err(RepositoryError::SnapshotExists {
                shard: shard_id.to_string(),
                snapshot: snapshot.to_string(),
            });
        }
        let shard_path = Self::shard_path(shard_id);
        let existing_snapshots = self.list_snapshots(shard_id).await?.len();

        let mut entries = Vec::with_capacity(files.len());
        let mut incremental_file_count = 0;
        let mut incremental_size = 0;
        for (name, data) in files {
            let meta = StoreFileMetadata::of(name.clone(), data);
            let blob = Self::blob_name(&meta);
            let key = format!("{}{}", shard_path, blob);
            if !self.store.exists(&key).await? {
                self.store.put(&key, data).await?;
                incremental_file_count += 1;
                incremental_size += meta.length;
            }
            entries.push(SnapshotFile {
                name: meta.name,
                length: meta.length,
                checksum: meta.checksum,
                blob,
            });
        }

        let generation = format!("{}-{}", existing_snapshots + 1, commit.generation);
        let manifest = ShardSnapshotManifest {
            snapshot: snapshot.to_string(),
            shard_id: shard_id.clone(),
            generation: generation.clone(),
            commit_generation: commit.generation,
            seq_no_stats: commit.seq_no_stats,
            mapping_version: commit.mapping_version,
            total_size: entries.iter().map(|f| f.length).sum(),
            files: entries,
            incremental_file_count,
            incremental_size,
        };
        let tmp_key = format!("{}.tmp", manifest_key);
        self.store
            .put(&tmp_key, &serde_json::to_vec_pretty(&manifest)?)
            .await?;
        self.store.rename(&tmp_key, &manifest_key).await?;

        tracing::debug!(
            repository = %self.name,
            shard = %shard_id,
            snapshot,
            files = manifest.files.len(),
            uploaded = incremental_file_count,
            uploaded_bytes = incremental_size,
            "shard snapshot published"
        );
        Ok(generation)
    }

    /// Download every file of `snapshot` into `target`.
    ///
    /// Files land under recovery temp names first and are renamed into
    /// place only after all of them were fetched and verified. Once
    /// `cancel` fires nothing more is downloaded or renamed.
    pub async fn restore_shard(
        &self,
        shard_id: &ShardId,
        snapshot: &str,
        target: &Store,
        recovery_id: u64,
        cancel: &CancellationToken,
    ) -> Result<RestoreStats, RepositoryError> {
        let manifest = self.read_manifest(shard_id, snapshot).await?;
        let shard_path = Self::shard_path(shard_id);

        let result = async {
            for file in &manifest.files {
                if cancel.is_cancelled() {
                    return Err(RepositoryError::Cancelled);
                }
                let data = self
                    .store
                    .get(&format!("{}{}", shard_path, file.blob))
                    .await?;
                let actual = crc32fast::hash(&data);
                if actual != file.checksum || data.len() as u64 != file.length {
                    return Err(RepositoryError::Corruption {
                        blob: file.blob.clone(),
                        expected: file.checksum,
                        actual,
                    });
                }
                target.write_file(&temp_file_name(recovery_id, &file.name), &data)?;
            }
            if cancel.is_cancelled() {
                return Err(RepositoryError::Cancelled);
            }
            for file in &manifest.files {
                target.rename(&temp_file_name(recovery_id, &file.name), &file.name)?;
            }
            Ok(())
        }
        .await;

        if let Err(e) = result {
            if let Err(cleanup) = target.delete_temp_files(recovery_id) {
                tracing::warn!(shard = %shard_id, error = %cleanup, "failed to delete restore temp files");
            }
            return Err(e);
        }

        Ok(RestoreStats {
            files: manifest.files.len(),
            bytes: manifest.total_size,
            seq_no_stats: manifest.seq_no_stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::InMemoryObjectStore;
    use crate::store::{commit_file_name, segment_file_name};

    fn commit(generation: u64, segments: &[u64]) -> CommitPoint {
        CommitPoint {
            generation,
            seq_no_stats: SeqNoStats {
                max_seq_no: 4,
                local_checkpoint: 4,
                global_checkpoint: 4,
                max_seq_no_of_updates_or_deletes: -2,
            },
            segments: segments.iter().map(|g| segment_file_name(*g)).collect(),
            mapping_version: 0,
            translog_generation: generation + 1,
        }
    }

    fn files(entries: &[(String, &'static [u8])]) -> BTreeMap<String, Bytes> {
        entries
            .iter()
            .map(|(name, data)| (name.clone(), Bytes::from_static(data)))
            .collect()
    }

    #[tokio::test]
    async fn test_second_snapshot_is_incremental() {
        let repo = BlobStoreRepository::new("repo", InMemoryObjectStore::new());
        let shard = ShardId::new("idx", 0);

        let first = files(&[
            (segment_file_name(1), b"segment one"),
            (commit_file_name(1), b"commit one"),
        ]);
        repo.snapshot_shard(&shard, "s1", &commit(1, &[1]), &first)
            .await
            .unwrap();

        let second = files(&[
            (segment_file_name(1), b"segment one"),
            (segment_file_name(2), b"segment two"),
            (commit_file_name(2), b"commit two"),
        ]);
        repo.snapshot_shard(&shard, "s2", &commit(2, &[1, 2]), &second)
            .await
            .unwrap();

        let manifest = repo.read_manifest(&shard, "s2").await.unwrap();
        assert_eq!(manifest.files.len(), 3);
        assert_eq!(manifest.incremental_file_count, 2);
        assert_eq!(repo.list_snapshots(&shard).await.unwrap(), vec!["s1", "s2"]);
    }

    #[tokio::test]
    async fn test_duplicate_snapshot_name_rejected() {
        let repo = BlobStoreRepository::new("repo", InMemoryObjectStore::new());
        let shard = ShardId::new("idx", 0);
        let data = files(&[(commit_file_name(1), b"c")]);
        repo.snapshot_shard(&shard, "s1", &commit(1, &[]), &data)
            .await
            .unwrap();
        let err = repo
            .snapshot_shard(&shard, "s1", &commit(1, &[]), &data)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::SnapshotExists { .. }));
    }

    #[tokio::test]
    async fn test_restore_writes_files() {
        let repo = BlobStoreRepository::new("repo", InMemoryObjectStore::new());
        let shard = ShardId::new("idx", 0);
        let data = files(&[
            (segment_file_name(1), b"segment one"),
            (commit_file_name(1), b"commit one"),
        ]);
        repo.snapshot_shard(&shard, "s1", &commit(1, &[1]), &data)
            .await
            .unwrap();

        let target = Store::new();
        let stats = repo
            .restore_shard(&shard, "s1", &target, 7, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stats.files, 2);
        assert_eq!(target.read_file(&segment_file_name(1)).unwrap(), b"segment one");
        assert!(target.temp_files().is_empty());
    }

    #[tokio::test]
    async fn test_corrupted_blob_leaves_no_files() {
        let objects = InMemoryObjectStore::new();
        let repo = BlobStoreRepository::new("repo", objects.clone());
        let shard = ShardId::new("idx", 0);
        let data = files(&[
            (segment_file_name(1), b"segment one"),
            (commit_file_name(1), b"commit one"),
        ]);
        repo.snapshot_shard(&shard, "s1", &commit(1, &[1]), &data)
            .await
            .unwrap();
        let manifest = repo.read_manifest(&shard, "s1").await.unwrap();
        let victim = manifest
            .files
            .iter()
            .find(|f| f.name == segment_file_name(1))
            .unwrap();
        assert!(objects.corrupt(&format!("indices/idx/0/{}", victim.blob)));

        let target = Store::new();
        let err = repo
            .restore_shard(&shard, "s1", &target, 3, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Corruption { .. }));
        assert!(target.list().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_restore_leaves_no_files() {
        let repo = BlobStoreRepository::new("repo", InMemoryObjectStore::new());
        let shard = ShardId::new("idx", 0);
        let data = files(&[
            (segment_file_name(1), b"segment one"),
            (commit_file_name(1), b"commit one"),
        ]);
        repo.snapshot_shard(&shard, "s1", &commit(1, &[1]), &data)
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let target = Store::new();
        let err = repo
            .restore_shard(&shard, "s1", &target, 5, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, RepositoryError::Cancelled);
        assert!(target.list().is_empty());
        assert_eq!(target.latest_commit_generation(), None);
    }

    #[tokio::test]
    async fn test_missing_snapshot() {
        let repo = BlobStoreRepository::new("repo", InMemoryObjectStore::new());
        let err = repo
            .read_manifest(&ShardId::new("idx", 0), "nope")
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::SnapshotMissing { .. }));
    }
}
