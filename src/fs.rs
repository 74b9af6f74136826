//! Path & FS Facade: uniform, read-only, concurrency-bounded filesystem
//! access (`spec.md` §2, §5, §9 "Filesystem abstraction ... treat as a
//! path-based object storage providing list, stat, read").
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::error::{DatasetError, Result};

/// Default bound on concurrently-open filesystem handles (`spec.md` §5).
pub const DEFAULT_CONCURRENCY: usize = 256;

/// An entry returned by [`DatasetStore::list`]: a path segment plus whether
/// it names a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

/// Read-only, path-based object storage (`spec.md` §2 "Filesystem
/// abstraction"). All operations are relative to a store-specific root.
#[async_trait]
pub trait DatasetStore: Send + Sync {
    /// List the immediate children of `dir`, sorted lexicographically by name
    /// (`spec.md` §5: "encoded-ID lexicographic when the FS yields sorted
    /// entries").
    async fn list(&self, dir: &Path) -> Result<Vec<DirEntry>>;

    /// `true` if `path` exists.
    async fn stat(&self, path: &Path) -> Result<bool>;

    /// Read the full contents of `path`.
    async fn read(&self, path: &Path) -> Result<Vec<u8>>;
}

/// Local filesystem [`DatasetStore`], throttled by a bounded semaphore
/// (`spec.md` §5: "bounded queue, default 256").
pub struct LocalDatasetStore {
    root: PathBuf,
    semaphore: Arc<Semaphore>,
}

impl LocalDatasetStore {
    pub fn new(root: impl Into<PathBuf>) -> LocalDatasetStore {
        LocalDatasetStore::with_concurrency(root, DEFAULT_CONCURRENCY)
    }

    pub fn with_concurrency(root: impl Into<PathBuf>, concurrency: usize) -> LocalDatasetStore {
        LocalDatasetStore {
            root: root.into(),
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl DatasetStore for LocalDatasetStore {
    async fn list(&self, dir: &Path) -> Result<Vec<DirEntry>> {
        let _permit = self.semaphore.acquire().await.expect("semaphore never closed");
        let full = self.root.join(dir);
        let mut read_dir = match tokio::fs::read_dir(&full).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DatasetError::FileNotFound(full.display().to_string()))
            }
            Err(e) => return Err(DatasetError::FileReadError { path: full.display().to_string(), source: e }),
        };
        let mut entries = Vec::new();
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| DatasetError::FileReadError { path: full.display().to_string(), source: e })?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| DatasetError::FileReadError { path: full.display().to_string(), source: e })?;
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: file_type.is_dir(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn stat(&self, path: &Path) -> Result<bool> {
        let _permit = self.semaphore.acquire().await.expect("semaphore never closed");
        Ok(tokio::fs::metadata(self.root.join(path)).await.is_ok())
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let _permit = self.semaphore.acquire().await.expect("semaphore never closed");
        let full = self.root.join(path);
        tokio::fs::read(&full).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DatasetError::FileNotFound(full.display().to_string())
            } else {
                DatasetError::FileReadError { path: full.display().to_string(), source: e }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("title"), b"hello").await.unwrap();
        let store = LocalDatasetStore::new(dir.path());
        let contents = store.read(Path::new("title")).await.unwrap();
        assert_eq!(contents, b"hello");
    }

    #[tokio::test]
    async fn missing_file_is_file_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalDatasetStore::new(dir.path());
        let err = store.read(Path::new("nope")).await.unwrap_err();
        assert!(matches!(err, DatasetError::FileNotFound(_)));
    }

    #[tokio::test]
    async fn list_sorts_entries() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("b"), b"").await.unwrap();
        tokio::fs::write(dir.path().join("a"), b"").await.unwrap();
        let store = LocalDatasetStore::new(dir.path());
        let entries = store.list(Path::new(".")).await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
