//! Volatile in-process backend (wire name `memory`). Always available; nothing survives a restart.

use crate::blob::{BlobRegistry, Namespace, ObjectUrl, UrlCache};
use crate::config::{DEFAULT_MEMORY_MAX_BYTES, MemoryConfig};
use crate::contract::FileStorage;
use crate::error::StorageError;
use crate::metadata::{
    FileInfo, FileMetadata, MetadataOverrides, Payload, StorageType, StorageUsage, StoredFile,
};
use crate::uri::{StorageUri, UriScheme};
use async_trait::async_trait;
use fxhash::FxHashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

#[derive(Debug, Default)]
struct MemoryState {
    files: FxHashMap<String, StoredFile>,
    thumbnails: FxHashMap<String, Payload>,
    /// Sum of file payload sizes. Thumbnails are not counted.
    total: u64,
}

#[derive(Debug)]
struct MemoryInner {
    max_bytes: u64,
    ready: AtomicBool,
    state: Mutex<MemoryState>,
    urls: UrlCache,
}

/// In-memory implementation of [`FileStorage`] with a byte ceiling over stored files.
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    inner: Arc<MemoryInner>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_MAX_BYTES, BlobRegistry::new())
    }
}

impl MemoryStorage {
    #[must_use]
    pub fn new(max_bytes: u64, registry: BlobRegistry) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                max_bytes,
                ready: AtomicBool::new(false),
                state: Mutex::new(MemoryState::default()),
                urls: UrlCache::new(registry, StorageType::Memory.into()),
            }),
        }
    }

    #[must_use]
    pub fn from_config(config: &MemoryConfig, registry: BlobRegistry) -> Self {
        Self::new(config.max_bytes, registry)
    }

    /// Memory storage needs no platform support.
    #[must_use]
    pub const fn is_supported() -> bool {
        true
    }

    #[must_use]
    pub fn max_bytes(&self) -> u64 {
        self.inner.max_bytes
    }

    fn mark_ready(&self) {
        if !self.inner.ready.swap(true, Ordering::AcqRel) {
            info!(max_bytes = self.inner.max_bytes, "Memory storage ready");
        }
    }
}

#[async_trait]
impl FileStorage for MemoryStorage {
    async fn initialize(&self) -> Result<(), StorageError> {
        self.mark_ready();
        Ok(())
    }

    fn is_available(&self) -> bool {
        self.inner.ready.load(Ordering::Acquire)
    }

    fn storage_type(&self) -> StorageType {
        StorageType::Memory
    }

    async fn save_file(
        &self,
        id: &str,
        payload: Payload,
        overrides: MetadataOverrides,
    ) -> Result<StorageUri, StorageError> {
        self.mark_ready();
        let metadata = FileMetadata::derive(id, &payload, overrides);
        let size = metadata.size;

        {
            let mut state = self.inner.state.lock();
            let existing = state.files.get(id).map_or(0, |f| f.metadata.size);
            let prospective = state.total.saturating_sub(existing).saturating_add(size);

            if prospective > self.inner.max_bytes {
                return Err(StorageError::QuotaExceeded {
                    message: format!(
                        "{size} bytes requested, {} of {} bytes in use",
                        state.total, self.inner.max_bytes
                    )
                    .into(),
                    context: Some(format!("Saving {id}").into()),
                    source: None,
                });
            }

            state.total = prospective;
            state.files.insert(id.to_owned(), StoredFile { payload, metadata });
        }

        self.inner.urls.evict(Namespace::Files, id);
        debug!(id, size, "File saved");
        Ok(StorageUri::new(UriScheme::Memory, id))
    }

    async fn get_file(&self, id: &str) -> Result<Option<Payload>, StorageError> {
        Ok(self.inner.state.lock().files.get(id).map(|f| f.payload.clone()))
    }

    async fn get_file_url(&self, id: &str) -> Result<Option<ObjectUrl>, StorageError> {
        self.inner.urls.resolve(Namespace::Files, id, || self.get_file(id)).await
    }

    async fn delete_file(&self, id: &str) -> Result<(), StorageError> {
        {
            let mut state = self.inner.state.lock();
            if let Some(removed) = state.files.remove(id) {
                state.total = state.total.saturating_sub(removed.metadata.size);
            }
            state.thumbnails.remove(id);
        }

        self.inner.urls.evict(Namespace::Files, id);
        self.inner.urls.evict(Namespace::Thumbnails, id);
        debug!(id, "File deleted");
        Ok(())
    }

    async fn list_files(&self) -> Result<Vec<FileInfo>, StorageError> {
        let mut files: Vec<FileInfo> = self
            .inner
            .state
            .lock()
            .files
            .iter()
            .map(|(id, f)| FileInfo { id: id.clone(), metadata: f.metadata.clone() })
            .collect();
        files.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(files)
    }

    async fn storage_usage(&self) -> Result<StorageUsage, StorageError> {
        let used = self.inner.state.lock().total;
        Ok(StorageUsage::bounded(used, Some(self.inner.max_bytes)))
    }

    async fn clear_all(&self) -> Result<(), StorageError> {
        *self.inner.state.lock() = MemoryState::default();
        self.inner.urls.clear();
        info!("Memory storage cleared");
        Ok(())
    }

    async fn save_thumbnail(&self, id: &str, payload: Payload) -> Result<ObjectUrl, StorageError> {
        self.mark_ready();
        self.inner.state.lock().thumbnails.insert(id.to_owned(), payload.clone());
        Ok(self.inner.urls.replace(Namespace::Thumbnails, id, payload))
    }

    async fn get_thumbnail(&self, id: &str) -> Result<Option<Payload>, StorageError> {
        Ok(self.inner.state.lock().thumbnails.get(id).cloned())
    }

    fn revoke_url(&self, url: &str) {
        self.inner.urls.purge_handle(url);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejected_save_leaves_state_untouched() {
        let storage = MemoryStorage::new(10, BlobRegistry::new());
        storage.save_file("a", Payload::new(vec![0; 6]), MetadataOverrides::default()).await.unwrap();

        let err = storage
            .save_file("b", Payload::new(vec![0; 5]), MetadataOverrides::default())
            .await
            .unwrap_err();
        assert!(err.is_quota_exceeded());

        let usage = storage.storage_usage().await.unwrap();
        assert_eq!(usage, StorageUsage { used: 6, available: Some(4) });
        assert!(storage.get_file("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn replacing_a_file_accounts_for_the_old_size() {
        let storage = MemoryStorage::new(10, BlobRegistry::new());
        storage.save_file("a", Payload::new(vec![0; 8]), MetadataOverrides::default()).await.unwrap();
        storage.save_file("a", Payload::new(vec![0; 10]), MetadataOverrides::default()).await.unwrap();
        assert_eq!(storage.storage_usage().await.unwrap().used, 10);

        storage.delete_file("a").await.unwrap();
        assert_eq!(storage.storage_usage().await.unwrap().used, 0);
    }

    #[tokio::test]
    async fn thumbnails_do_not_count_against_the_ceiling() {
        let storage = MemoryStorage::new(4, BlobRegistry::new());
        storage.save_thumbnail("a", Payload::new(vec![0; 64])).await.unwrap();
        assert_eq!(storage.storage_usage().await.unwrap().used, 0);
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let storage = MemoryStorage::default();
        assert!(!storage.is_available());
        storage.initialize().await.unwrap();
        storage.initialize().await.unwrap();
        assert!(storage.is_available());
        assert!(MemoryStorage::is_supported());
    }
}
