//! Persistent store implementations.
//!
//! [`InMemoryStore`] keeps everything in a map and is the default for
//! embedded use and tests. [`FileStore`] writes one JSON file per key under a
//! root directory, replacing files atomically (write to a temp file, then
//! rename) so a crash never leaves a half-written record.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use stratus_abstraction::{PersistentStore, StoreError};
use tracing::debug;

/// Map-backed store.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: RwLock<BTreeMap<(String, String), Value>>,
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored values across all namespaces.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl PersistentStore for InMemoryStore {
    async fn save(&self, namespace: &str, key: &str, value: Value) -> Result<(), StoreError> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((namespace.to_string(), key.to_string()), value);
        Ok(())
    }

    async fn load(&self, namespace: &str, key: &str) -> Result<Value, StoreError> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(namespace.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                namespace: namespace.to_string(),
                key: key.to_string(),
            })
    }

    async fn list(&self, namespace: &str, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .filter(|(ns, key)| ns == namespace && key.starts_with(prefix))
            .map(|(_, key)| key.clone())
            .collect())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(namespace.to_string(), key.to_string()));
        Ok(())
    }
}

/// Directory-backed store.
///
/// A key `a/b` in namespace `ns` lives at `<root>/ns/a/b.json`.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Creates a store rooted at `root`. The directory is created on first write.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self { root: root.as_ref().to_path_buf() }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, namespace: &str, key: &str) -> Result<PathBuf, StoreError> {
        let mut path = self.root.join(Self::segment(namespace)?);
        let mut segments = key.split('/').peekable();
        while let Some(segment) = segments.next() {
            let segment = Self::segment(segment)?;
            if segments.peek().is_some() {
                path.push(segment);
            } else {
                path.push(format!("{}.json", segment));
            }
        }
        Ok(path)
    }

    fn segment(segment: &str) -> Result<&str, StoreError> {
        if segment.is_empty()
            || segment == "."
            || segment == ".."
            || segment.contains('\\')
            || segment.starts_with('.')
        {
            return Err(StoreError::Backend(format!("invalid key segment '{}'", segment)));
        }
        Ok(segment)
    }

    fn io_error(context: &str, path: &Path, err: &std::io::Error) -> StoreError {
        StoreError::Backend(format!("{} {}: {}", context, path.display(), err))
    }

    /// Collects `.json` files below `dir` as slash-separated keys.
    fn walk(dir: &Path, relative: &str, keys: &mut Vec<String>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let key = if relative.is_empty() { name.clone() } else { format!("{}/{}", relative, name) };

            if entry.file_type()?.is_dir() {
                Self::walk(&entry.path(), &key, keys)?;
            } else if let Some(stem) = key.strip_suffix(".json") {
                keys.push(stem.to_string());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PersistentStore for FileStore {
    async fn save(&self, namespace: &str, key: &str, value: Value) -> Result<(), StoreError> {
        let path = self.path_for(namespace, key)?;
        let json = serde_json::to_vec_pretty(&value)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::io_error("failed to create", parent, &e))?;
        }

        // Write to a hidden temp file, then rename over the target.
        let file_name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let temp_path = path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));
        tokio::fs::write(&temp_path, json)
            .await
            .map_err(|e| Self::io_error("failed to write", &temp_path, &e))?;
        if let Err(e) = tokio::fs::rename(&temp_path, &path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(Self::io_error("failed to replace", &path, &e));
        }

        debug!(namespace = %namespace, key = %key, "Saved record");
        Ok(())
    }

    async fn load(&self, namespace: &str, key: &str) -> Result<Value, StoreError> {
        let path = self.path_for(namespace, key)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound {
                    namespace: namespace.to_string(),
                    key: key.to_string(),
                });
            }
            Err(e) => return Err(Self::io_error("failed to read", &path, &e)),
        };
        serde_json::from_slice(&bytes).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    async fn list(&self, namespace: &str, prefix: &str) -> Result<Vec<String>, StoreError> {
        let dir = self.root.join(Self::segment(namespace)?);
        let prefix = prefix.to_string();

        tokio::task::spawn_blocking(move || {
            let mut keys = Vec::new();
            match Self::walk(&dir, "", &mut keys) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(Self::io_error("failed to list", &dir, &e)),
            }
            keys.retain(|k| k.starts_with(&prefix));
            keys.sort();
            Ok(keys)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("list task failed: {}", e)))?
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(namespace, key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_error("failed to delete", &path, &e)),
        }
    }
}
