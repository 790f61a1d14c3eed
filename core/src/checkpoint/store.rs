use std::collections::HashMap;
use std::fs::OpenOptions;
use std::future::Future;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use fd_lock::RwLock;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::config::MetadataConfig;
use crate::errors::StoreError;

/// Durable shared metadata. Compare-and-swap is the only concurrency primitive
/// replicas rely on.
pub trait MetadataStore: Send + Sync {
    fn read(&self, key: &str) -> impl Future<Output = Result<Option<String>, StoreError>> + Send;

    /// Writes `new_value` only if the current value equals `expected`
    /// (`None` meaning the key is absent). Returns whether the write happened.
    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new_value: &str,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;
}

/// Process-local store. Shared between replicas in tests by cloning an `Arc`.
#[derive(Default)]
pub struct InMemoryMetadataStore {
    entries: Mutex<HashMap<String, String>>,
    unavailable: AtomicBool,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an outage: every call fails with `StoreError::Unavailable`
    /// until switched back.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Overwrites a value without any check.
    pub fn put(&self, key: &str, value: &str) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable {
                reason: "in-memory store switched off".to_string(),
            });
        }
        Ok(())
    }
}

impl MetadataStore for InMemoryMetadataStore {
    async fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_available()?;
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new_value: &str,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.get(key).map(String::as_str) != expected {
            return Ok(false);
        }
        entries.insert(key.to_string(), new_value.to_string());
        Ok(true)
    }
}

/// One file per key under a directory. Writes go to a temporary file that is
/// persisted over the entry, so a crash leaves either the old or the new
/// value. Compare-and-swap holds an exclusive advisory lock on a per-key lock
/// file, which makes it atomic across processes sharing the directory.
pub struct FileMetadataStore {
    root: PathBuf,
}

impl FileMetadataStore {
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Keeps `[A-Za-z0-9_-]` and writes every other byte as `%XX`, so distinct
    /// keys never share a file.
    fn file_stem(key: &str) -> String {
        let mut stem = String::with_capacity(key.len());
        for byte in key.bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
                stem.push(char::from(byte));
            } else {
                stem.push_str(&format!("%{:02X}", byte));
            }
        }
        stem
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", Self::file_stem(key)))
    }

    fn lock_path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.lock", Self::file_stem(key)))
    }

    fn read_path(path: &Path) -> Result<Option<String>, StoreError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Blocking compare-and-swap. The lock is released when `_guard` drops.
    fn swap_locked(
        root: &Path,
        path: &Path,
        lock_path: &Path,
        expected: Option<&str>,
        new_value: &str,
    ) -> Result<bool, StoreError> {
        let mut lock = RwLock::new(
            OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(lock_path)?,
        );
        let _guard = lock.write()?;

        let current = Self::read_path(path)?;
        if current.as_deref() != expected {
            return Ok(false);
        }

        let mut staged = NamedTempFile::new_in(root)?;
        staged.write_all(new_value.as_bytes())?;
        staged.as_file().sync_all()?;
        staged.persist(path).map_err(|e| StoreError::Io(e.error))?;
        Ok(true)
    }
}

impl MetadataStore for FileMetadataStore {
    async fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new_value: &str,
    ) -> Result<bool, StoreError> {
        let root = self.root.clone();
        let path = self.path_for(key);
        let lock_path = self.lock_path_for(key);
        let expected = expected.map(str::to_string);
        let new_value = new_value.to_string();

        let swapped = tokio::task::spawn_blocking(move || {
            Self::swap_locked(&root, &path, &lock_path, expected.as_deref(), &new_value)
                .map(|swapped| (swapped, path))
        })
        .await
        .map_err(|e| StoreError::Unavailable {
            reason: format!("metadata write task failed: {}", e),
        })?;

        let (swapped, path) = swapped?;
        if swapped {
            debug!(key, path = %path.display(), "Wrote metadata entry");
        }
        Ok(swapped)
    }
}

/// Store backends selectable from configuration.
pub enum MetadataBackend {
    Memory(InMemoryMetadataStore),
    File(FileMetadataStore),
}

impl MetadataBackend {
    pub async fn from_config(config: &MetadataConfig) -> Result<Self, StoreError> {
        match config {
            MetadataConfig::Memory => Ok(MetadataBackend::Memory(InMemoryMetadataStore::new())),
            MetadataConfig::File { path } => {
                Ok(MetadataBackend::File(FileMetadataStore::open(path).await?))
            }
        }
    }
}

impl MetadataStore for MetadataBackend {
    async fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self {
            MetadataBackend::Memory(store) => store.read(key).await,
            MetadataBackend::File(store) => store.read(key).await,
        }
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new_value: &str,
    ) -> Result<bool, StoreError> {
        match self {
            MetadataBackend::Memory(store) => store.compare_and_swap(key, expected, new_value).await,
            MetadataBackend::File(store) => store.compare_and_swap(key, expected, new_value).await,
        }
    }
}
