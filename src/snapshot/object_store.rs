//! Object Store Abstraction
//!
//! Blob storage behind a snapshot repository.
//!
//! Implementations:
//! - `InMemoryObjectStore`: For unit tests and DST
//! - `LocalFsObjectStore`: For development and local testing

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::future::Future;
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Metadata for a stored object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Object key (path)
    pub key: String,
    pub size_bytes: u64,
}

/// Boxed future returned by object store calls
pub type ObjectFuture<'a, T> = Pin<Box<dyn Future<Output = IoResult<T>> + Send + 'a>>;

/// Object store abstraction trait
pub trait ObjectStore: Send + Sync + 'static {
    /// Put an object (create or overwrite)
    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> ObjectFuture<'a, ()>;

    fn get<'a>(&'a self, key: &'a str) -> ObjectFuture<'a, Vec<u8>>;

    fn exists<'a>(&'a self, key: &'a str) -> ObjectFuture<'a, bool>;

    /// Delete an object. Deleting a missing key is not an error.
    fn delete<'a>(&'a self, key: &'a str) -> ObjectFuture<'a, ()>;

    /// List objects with a prefix, sorted by key
    fn list<'a>(&'a self, prefix: &'a str) -> ObjectFuture<'a, Vec<ObjectMeta>>;

    /// Rename/move an object (for atomic manifest updates)
    fn rename<'a>(&'a self, from: &'a str, to: &'a str) -> ObjectFuture<'a, ()>;
}

// ============================================================================
// InMemoryObjectStore - For tests and DST
// ============================================================================

/// In-memory object store for unit tests and deterministic simulation
#[derive(Debug, Clone, Default)]
pub struct InMemoryObjectStore {
    data: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
    /// When set every call fails, modelling an unreachable repository
    unavailable: Arc<AtomicBool>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Overwrite an object's bytes in place (for corruption tests)
    pub fn corrupt(&self, key: &str) -> bool {
        match self.data.write().get_mut(key) {
            Some(data) if !data.is_empty() => {
                data[0] ^= 0xFF;
                true
            }
            _ => false,
        }
    }

    fn check_available(&self) -> IoResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(IoError::new(ErrorKind::ConnectionRefused, "object store unavailable"));
        }
        Ok(())
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> ObjectFuture<'a, ()> {
        Box::pin(async move {
            self.check_available()?;
            self.data.write().insert(key.to_string(), data.to_vec());
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> ObjectFuture<'a, Vec<u8>> {
        Box::pin(async move {
            self.check_available()?;
            self.data
                .read()
                .get(key)
                .cloned()
                .ok_or_else(|| IoError::new(ErrorKind::NotFound, format!("Key not found: {}", key)))
        })
    }

    fn exists<'a>(&'a self, key: &'a str) -> ObjectFuture<'a, bool> {
        Box::pin(async move {
            self.check_available()?;
            Ok(self.data.read().contains_key(key))
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> ObjectFuture<'a, ()> {
        Box::pin(async move {
            self.check_available()?;
            self.data.write().remove(key);
            Ok(())
        })
    }

    fn list<'a>(&'a self, prefix: &'a str) -> ObjectFuture<'a, Vec<ObjectMeta>> {
        Box::pin(async move {
            self.check_available()?;
            Ok(self
                .data
                .read()
                .range(prefix.to_string()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, v)| ObjectMeta {
                    key: k.clone(),
                    size_bytes: v.len() as u64,
                })
                .collect())
        })
    }

    fn rename<'a>(&'a self, from: &'a str, to: &'a str) -> ObjectFuture<'a, ()> {
        Box::pin(async move {
            self.check_available()?;
            let mut data = self.data.write();
            match data.remove(from) {
                Some(obj) => {
                    data.insert(to.to_string(), obj);
                    Ok(())
                }
                None => Err(IoError::new(
                    ErrorKind::NotFound,
                    format!("Source key not found: {}", from),
                )),
            }
        })
    }
}

// ============================================================================
// LocalFsObjectStore - For development
// ============================================================================

/// Local filesystem object store; keys map to paths under `base_path`
#[derive(Debug, Clone)]
pub struct LocalFsObjectStore {
    base_path: PathBuf,
}

impl LocalFsObjectStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        LocalFsObjectStore {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn full_path(&self, key: &str) -> PathBuf {
        self.base_path.join(key)
    }

    async fn ensure_parent(path: &Path) -> IoResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    fn walk_dir(dir: &Path, base: &Path, prefix: &str, objects: &mut Vec<ObjectMeta>) -> IoResult<()> {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                Self::walk_dir(&path, base, prefix, objects)?;
                continue;
            }
            let key = match path.strip_prefix(base) {
                Ok(relative) => relative.to_string_lossy().replace('\\', "/"),
                Err(_) => continue,
            };
            if key.starts_with(prefix) {
                objects.push(ObjectMeta {
                    key,
                    size_bytes: std::fs::metadata(&path)?.len(),
                });
            }
        }
        Ok(())
    }
}

impl ObjectStore for LocalFsObjectStore {
    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> ObjectFuture<'a, ()> {
        Box::pin(async move {
            let path = self.full_path(key);
            Self::ensure_parent(&path).await?;
            tokio::fs::write(&path, data).await
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> ObjectFuture<'a, Vec<u8>> {
        Box::pin(async move { tokio::fs::read(self.full_path(key)).await })
    }

    fn exists<'a>(&'a self, key: &'a str) -> ObjectFuture<'a, bool> {
        Box::pin(async move {
            match tokio::fs::metadata(self.full_path(key)).await {
                Ok(_) => Ok(true),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e),
            }
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> ObjectFuture<'a, ()> {
        Box::pin(async move {
            match tokio::fs::remove_file(self.full_path(key)).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()), // Already deleted
                Err(e) => Err(e),
            }
        })
    }

    fn list<'a>(&'a self, prefix: &'a str) -> ObjectFuture<'a, Vec<ObjectMeta>> {
        Box::pin(async move {
            if !self.base_path.exists() {
                return Ok(Vec::new());
            }
            let mut objects = Vec::new();
            Self::walk_dir(&self.base_path, &self.base_path, prefix, &mut objects)?;
            objects.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(objects)
        })
    }

    fn rename<'a>(&'a self, from: &'a str, to: &'a str) -> ObjectFuture<'a, ()> {
        Box::pin(async move {
            let to_path = self.full_path(to);
            Self::ensure_parent(&to_path).await?;
            tokio::fs::rename(self.full_path(from), &to_path).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inmemory_list_by_prefix() {
        let store = InMemoryObjectStore::new();
        store.put("a/1", b"x").await.unwrap();
        store.put("a/2", b"yy").await.unwrap();
        store.put("b/1", b"z").await.unwrap();

        let listed = store.list("a/").await.unwrap();
        assert_eq!(
            listed,
            vec![
                ObjectMeta {
                    key: "a/1".into(),
                    size_bytes: 1
                },
                ObjectMeta {
                    key: "a/2".into(),
                    size_bytes: 2
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_inmemory_rename_and_delete() {
        let store = InMemoryObjectStore::new();
        store.put("tmp", b"data").await.unwrap();
        store.rename("tmp", "final").await.unwrap();
        assert!(!store.exists("tmp").await.unwrap());
        assert_eq!(store.get("final").await.unwrap(), b"data");

        store.delete("final").await.unwrap();
        store.delete("final").await.unwrap();
        assert!(store.is_empty());
        assert!(store.rename("missing", "x").await.is_err());
    }

    #[tokio::test]
    async fn test_inmemory_unavailable() {
        let store = InMemoryObjectStore::new();
        store.put("k", b"v").await.unwrap();
        store.set_unavailable(true);
        assert!(store.get("k").await.is_err());
        store.set_unavailable(false);
        assert_eq!(store.get("k").await.unwrap(), b"v");
    }

    #[tokio::test]
    async fn test_localfs_put_get_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsObjectStore::new(dir.path());
        store.put("shard/0/blob", b"hello").await.unwrap();
        store.put("shard/1/blob", b"world!").await.unwrap();

        assert_eq!(store.get("shard/0/blob").await.unwrap(), b"hello");
        assert!(store.exists("shard/1/blob").await.unwrap());
        assert!(!store.exists("shard/2/blob").await.unwrap());

        let listed = store.list("shard/1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].size_bytes, 6);

        store.rename("shard/0/blob", "moved/blob").await.unwrap();
        assert!(store.exists("moved/blob").await.unwrap());
    }
}
