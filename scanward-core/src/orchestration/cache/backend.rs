//! Byte stores behind the result cache.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{Result, ScanError};

/// Byte storage underneath the [`CacheStore`](super::CacheStore).
#[async_trait]
pub trait CacheBackend: Send + Sync + fmt::Debug {
    /// `Ok(None)` when the key is absent.
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;
    /// Stores `bytes` under `key`, replacing any previous value.
    async fn write(&self, key: &str, bytes: &[u8]) -> Result<()>;
    /// Deletes `key`; absent keys are not an error.
    async fn remove(&self, key: &str) -> Result<()>;
    /// Every stored key starting with `prefix`.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Root directory for the on-disk result cache.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CacheRoot(PathBuf);

impl CacheRoot {
    /// Wraps a directory path.
    pub fn new(path: PathBuf) -> Self {
        Self(path)
    }

    /// The directory.
    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Debug for CacheRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CacheRoot").field(&self.0).finish()
    }
}

/// Content-addressed, integrity-checked storage via `cacache`.
#[derive(Clone, Debug)]
pub struct DiskCacheBackend {
    root: CacheRoot,
}

impl DiskCacheBackend {
    /// Stores entries under `root`.
    pub fn new(root: CacheRoot) -> Self {
        Self { root }
    }

    /// Cache directory.
    pub fn root(&self) -> &CacheRoot {
        &self.root
    }
}

#[async_trait]
impl CacheBackend for DiskCacheBackend {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match cacache::read(self.root.as_path(), key).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(cacache::Error::EntryNotFound(_, _)) => Ok(None),
            Err(cacache::Error::IntegrityError(err)) => Err(ScanError::CacheCorruption {
                key: key.to_string(),
                reason: format!("integrity check failed: {err}"),
            }),
            Err(cacache::Error::SizeMismatch(wanted, actual)) => {
                Err(ScanError::CacheCorruption {
                    key: key.to_string(),
                    reason: format!("size mismatch: wanted={wanted}, actual={actual}"),
                })
            }
            Err(cacache::Error::IoError(_, msg)) => {
                Err(ScanError::Internal(format!("cacache read I/O error: {msg}")))
            }
            Err(cacache::Error::SerdeError(_, msg)) => Err(ScanError::CacheCorruption {
                key: key.to_string(),
                reason: format!("index entry unreadable: {msg}"),
            }),
        }
    }

    async fn write(&self, key: &str, bytes: &[u8]) -> Result<()> {
        cacache::write(self.root.as_path(), key, bytes)
            .await
            .map(|_| ())
            .map_err(|e| ScanError::Internal(format!("cacache write failed: {e}")))
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let opts = cacache::index::RemoveOpts::new().remove_fully(true);
        opts.remove(self.root.as_path(), key)
            .await
            .map_err(|e| ScanError::Internal(format!("cacache remove failed: {e}")))
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let root = self.root.as_path().to_path_buf();
        let prefix = prefix.to_string();
        tokio::task::spawn_blocking(move || {
            let mut keys = Vec::new();
            if !root.exists() {
                return keys;
            }
            for entry in cacache::index::ls(&root) {
                match entry {
                    Ok(meta) if meta.key.starts_with(&prefix) => keys.push(meta.key),
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(error = %err, "result cache index entry unreadable")
                    }
                }
            }
            keys
        })
        .await
        .map_err(|e| ScanError::Internal(format!("cache index listing failed: {e}")))
    }
}

/// Process-local storage; entries vanish with the process.
#[derive(Debug, Default)]
pub struct MemoryCacheBackend {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryCacheBackend {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Overwrites raw bytes, bypassing the store. Used to simulate damage.
    pub fn put_raw(&self, key: &str, bytes: Vec<u8>) {
        self.entries.lock().insert(key.to_string(), bytes);
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn write(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.entries.lock().insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn disk_backend_round_trips_and_lists_by_prefix() {
        let dir = TempDir::new().expect("tempdir");
        let backend = DiskCacheBackend::new(CacheRoot::new(dir.path().to_path_buf()));

        backend.write("scan:aa:secret:1", b"one").await.expect("write");
        backend.write("scan:bb:secret:2", b"two").await.expect("write");

        assert_eq!(
            backend.read("scan:aa:secret:1").await.expect("read"),
            Some(b"one".to_vec())
        );
        assert_eq!(backend.read("missing").await.expect("read"), None);

        let keys = backend.keys_with_prefix("scan:aa:").await.expect("ls");
        assert_eq!(keys, vec!["scan:aa:secret:1".to_string()]);

        backend.remove("scan:aa:secret:1").await.expect("remove");
        assert_eq!(backend.read("scan:aa:secret:1").await.expect("read"), None);
    }

    #[tokio::test]
    async fn disk_backend_lists_nothing_for_missing_root() {
        let dir = TempDir::new().expect("tempdir");
        let backend = DiskCacheBackend::new(CacheRoot::new(dir.path().join("absent")));
        assert!(backend.keys_with_prefix("").await.expect("ls").is_empty());
    }
}
