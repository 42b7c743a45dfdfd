//! Blob I/O managers backing the durable object store and the upload staging area

use crate::error::{Result, SpatialError};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Storage backend types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// Local file system
    FileSystem,
    /// Process-local map, for tests and single-node deployments
    Memory,
}

impl StorageBackend {
    /// Parse storage backend from URL scheme. Only the built-in backends are
    /// recognised; other stores plug in as their own [`IOManager`].
    pub fn from_url(url: &str) -> Result<Self> {
        if let Some(scheme_end) = url.find("://") {
            let scheme = &url[..scheme_end];
            match scheme {
                "file" => Ok(StorageBackend::FileSystem),
                "memory" => Ok(StorageBackend::Memory),
                _ => Err(SpatialError::Configuration(format!("Unknown scheme: {}", scheme))),
            }
        } else {
            // Assume file system if no scheme
            Ok(StorageBackend::FileSystem)
        }
    }
}

/// Trait for blob operations against an object store or file system.
///
/// `read` of a missing path returns `Ok(None)`; errors mean the backend
/// could not answer.
#[async_trait]
pub trait IOManager: Send + Sync {
    /// Read the object at `path`
    async fn read(&self, path: &str) -> Result<Option<Bytes>>;

    /// Replace the object at `path` with `data`.
    async fn write(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Check if an object exists at `path`
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Delete the object at `path`; deleting a missing object is not an error.
    async fn delete(&self, path: &str) -> Result<()>;

    /// List object paths under a prefix
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Get the backend type
    fn backend(&self) -> StorageBackend;
}

/// File system I/O manager
pub struct FileSystemIOManager {
    base_path: PathBuf,
}

impl FileSystemIOManager {
    /// Create a file system I/O manager rooted at `base_path`
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    /// Get the full path for a relative object path
    fn full_path(&self, path: &str) -> PathBuf {
        self.base_path.join(path)
    }
}

fn backend_error(path: &str, err: std::io::Error) -> SpatialError {
    SpatialError::unavailable(format!("object {}", path), err)
}

#[async_trait]
impl IOManager for FileSystemIOManager {
    async fn read(&self, path: &str) -> Result<Option<Bytes>> {
        match fs::read(self.full_path(path)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(backend_error(path, e)),
        }
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        let full_path = self.full_path(path);

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| backend_error(path, e))?;
        }

        // Write beside the target and rename so readers never see a torn object.
        let tmp_path = full_path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        let mut file = fs::File::create(&tmp_path).await.map_err(|e| backend_error(path, e))?;
        file.write_all(data).await.map_err(|e| backend_error(path, e))?;
        file.sync_all().await.map_err(|e| backend_error(path, e))?;
        drop(file);
        fs::rename(&tmp_path, &full_path).await.map_err(|e| backend_error(path, e))?;
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        fs::try_exists(self.full_path(path))
            .await
            .map_err(|e| backend_error(path, e))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        match fs::remove_file(self.full_path(path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(backend_error(path, e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut entries = Vec::new();
        let mut pending = vec![prefix.trim_end_matches('/').to_string()];

        while let Some(dir) = pending.pop() {
            let full_path = self.full_path(&dir);
            if !full_path.is_dir() {
                continue;
            }
            let mut read_dir = fs::read_dir(&full_path).await.map_err(|e| backend_error(&dir, e))?;
            while let Some(entry) = read_dir.next_entry().await.map_err(|e| backend_error(&dir, e))? {
                let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                    continue;
                };
                let child = if dir.is_empty() { name } else { format!("{}/{}", dir, name) };
                if entry.path().is_dir() {
                    pending.push(child);
                } else if !child.contains(".tmp-") {
                    entries.push(child);
                }
            }
        }

        entries.sort();
        Ok(entries)
    }

    fn backend(&self) -> StorageBackend {
        StorageBackend::FileSystem
    }
}

/// In-memory I/O manager. Can be switched offline to exercise failure paths.
#[derive(Default)]
pub struct MemoryIOManager {
    objects: RwLock<BTreeMap<String, Bytes>>,
    offline: AtomicBool,
}

impl MemoryIOManager {
    /// Create an empty, online memory I/O manager
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every call fails with `StoreUnavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of objects held
    pub fn object_count(&self) -> usize {
        self.objects.read().len()
    }

    fn check_online(&self, path: &str) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SpatialError::unavailable(format!("object {}", path), "backend offline"));
        }
        Ok(())
    }
}

#[async_trait]
impl IOManager for MemoryIOManager {
    async fn read(&self, path: &str) -> Result<Option<Bytes>> {
        self.check_online(path)?;
        Ok(self.objects.read().get(path).cloned())
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        self.check_online(path)?;
        self.objects
            .write()
            .insert(path.to_string(), Bytes::copy_from_slice(data));
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.check_online(path)?;
        Ok(self.objects.read().contains_key(path))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.check_online(path)?;
        self.objects.write().remove(path);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.check_online(prefix)?;
        Ok(self
            .objects
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn backend(&self) -> StorageBackend {
        StorageBackend::Memory
    }
}

/// Parse URL and create appropriate I/O manager
///
/// Only `file://` (or a bare path) and `memory://` are built in.
pub fn create_io_manager(url: &str) -> Result<Arc<dyn IOManager>> {
    match StorageBackend::from_url(url)? {
        StorageBackend::FileSystem => {
            let path = url.strip_prefix("file://").unwrap_or(url);
            Ok(Arc::new(FileSystemIOManager::new(path)))
        }
        StorageBackend::Memory => Ok(Arc::new(MemoryIOManager::new())),
    }
}
