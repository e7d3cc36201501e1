//! Snapshot - shard snapshots in a blob repository
//!
//! `IndexShard::snapshot_to` flushes and hands the commit's files to a
//! [`BlobStoreRepository`]; `IndexShard::recover_from_snapshot` restores
//! them and finishes like a store recovery.

mod object_store;
mod repository;

pub use object_store::{InMemoryObjectStore, LocalFsObjectStore, ObjectFuture, ObjectMeta, ObjectStore};
pub use repository::{
    BlobStoreRepository, RepositoryError, RestoreStats, ShardSnapshotManifest, SnapshotFile,
};
