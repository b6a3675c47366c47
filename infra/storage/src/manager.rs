//! Backend selection and the collaborator-facing entry point.

use crate::backends::{DatabaseStorage, FilesystemBuilder, FilesystemStorage, MemoryStorage};
use crate::blob::{BlobRegistry, ObjectUrl};
use crate::config::StorageConfig;
use crate::contract::FileStorage;
use crate::download::Downloader;
use crate::error::StorageError;
use crate::metadata::{MetadataOverrides, Payload, StorageType};
use crate::thumbnail::ThumbnailGenerator;
use crate::uri::{StorageUri, parse_storage_uri};
use std::fmt;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

/// Result of [`StorageManager::resolve_url`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedUrl<'a> {
    /// Not a storage URI; usable as-is.
    External(&'a str),
    /// A storage URI resolved to a live object URL.
    Object(ObjectUrl),
}

impl ResolvedUrl<'_> {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::External(url) => url,
            Self::Object(url) => url.as_str(),
        }
    }
}

impl fmt::Display for ResolvedUrl<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of [`StorageManager::store_with_thumbnail`].
#[derive(Debug, Clone)]
pub struct StoredMedia {
    pub uri: StorageUri,
    /// `None` when no thumbnail could be derived or stored.
    pub thumbnail: Option<ObjectUrl>,
}

struct ManagerInner {
    config: StorageConfig,
    registry: BlobRegistry,
    active: OnceCell<Arc<dyn FileStorage>>,
    thumbnails: ThumbnailGenerator,
    downloader: Downloader,
}

impl fmt::Debug for ManagerInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerInner")
            .field("active", &self.active.get().map(|s| s.storage_type()))
            .field("live_urls", &self.registry.live_count())
            .finish_non_exhaustive()
    }
}

/// Picks the best available backend once and hands it out to every caller. Cheap to clone.
///
/// Candidates are tried in a fixed order: filesystem, database, memory. Memory always succeeds,
/// so initialization only fails if even that is impossible.
#[derive(Debug, Clone)]
pub struct StorageManager {
    inner: Arc<ManagerInner>,
}

impl Default for StorageManager {
    fn default() -> Self {
        Self::new(StorageConfig::default())
    }
}

impl StorageManager {
    #[must_use]
    pub fn new(config: StorageConfig) -> Self {
        let thumbnails = ThumbnailGenerator::new(&config.thumbnails);
        let downloader = Downloader::from_config(&config.download);
        Self::with_components(config, thumbnails, downloader)
    }

    /// Like [`StorageManager::new`] with caller-supplied thumbnail and download components.
    #[must_use]
    pub fn with_components(
        config: StorageConfig,
        thumbnails: ThumbnailGenerator,
        downloader: Downloader,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                registry: BlobRegistry::new(),
                active: OnceCell::new(),
                thumbnails,
                downloader,
            }),
        }
    }

    /// Selects and initializes the active backend.
    ///
    /// Concurrent callers share a single in-flight selection; later calls return the same
    /// backend without probing again.
    ///
    /// # Errors
    /// [`StorageError::InitializationFailed`] only when every candidate failed.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Result<Arc<dyn FileStorage>, StorageError> {
        self.inner.active.get_or_try_init(|| self.select()).await.map(Arc::clone)
    }

    async fn select(&self) -> Result<Arc<dyn FileStorage>, StorageError> {
        let config = &self.inner.config;
        let registry = &self.inner.registry;

        if FilesystemStorage::is_supported(&config.filesystem) {
            let candidate = FilesystemBuilder::from_config(&config.filesystem)
                .map(|builder| builder.registry(registry.clone()).build());
            match candidate {
                Some(Ok(storage)) => {
                    if let Some(active) = Self::adopt(storage).await {
                        return Ok(active);
                    }
                },
                Some(Err(e)) => {
                    warn!(backend = %StorageType::Filesystem, error = %e, "Rejected configuration");
                },
                None => {},
            }
        } else {
            debug!(backend = %StorageType::Filesystem, "Not supported, skipping");
        }

        if DatabaseStorage::is_supported(&config.database) {
            if let Some(storage) = DatabaseStorage::from_config(&config.database, registry.clone())
                && let Some(active) = Self::adopt(storage).await
            {
                return Ok(active);
            }
        } else {
            debug!(backend = %StorageType::Database, "Not supported, skipping");
        }

        let memory = MemoryStorage::from_config(&config.memory, registry.clone());
        memory
            .initialize()
            .await
            .map_err(|e| e.into_init_failure("No storage backend could be initialized"))?;
        info!(backend = %StorageType::Memory, "Storage backend selected");
        Ok(Arc::new(memory))
    }

    async fn adopt<S: FileStorage + 'static>(storage: S) -> Option<Arc<dyn FileStorage>> {
        let backend = storage.storage_type();
        match storage.initialize().await {
            Ok(()) => {
                info!(%backend, "Storage backend selected");
                Some(Arc::new(storage))
            },
            Err(e) => {
                warn!(%backend, error = %e, "Backend initialization failed, falling through");
                None
            },
        }
    }

    /// The active backend.
    ///
    /// # Errors
    /// [`StorageError::InitializationFailed`] before [`StorageManager::initialize`] completes.
    pub fn storage(&self) -> Result<Arc<dyn FileStorage>, StorageError> {
        self.inner.active.get().map(Arc::clone).ok_or_else(|| StorageError::InitializationFailed {
            message: "Storage manager has not been initialized".into(),
            context: None,
            source: None,
        })
    }

    /// The active backend's kind, or `None` before initialization.
    #[must_use]
    pub fn storage_type(&self) -> Option<StorageType> {
        self.inner.active.get().map(|s| s.storage_type())
    }

    #[must_use]
    pub fn registry(&self) -> &BlobRegistry {
        &self.inner.registry
    }

    #[must_use]
    pub fn thumbnails(&self) -> &ThumbnailGenerator {
        &self.inner.thumbnails
    }

    #[must_use]
    pub fn downloader(&self) -> &Downloader {
        &self.inner.downloader
    }

    /// Turns a storage URI into a displayable object URL; other URLs pass through untouched.
    ///
    /// Any storage scheme resolves against the active backend. Returns `Ok(None)` when the
    /// referenced file does not exist.
    ///
    /// # Errors
    /// Backend failures while loading the file.
    pub async fn resolve_url<'a>(
        &self,
        url: &'a str,
    ) -> Result<Option<ResolvedUrl<'a>>, StorageError> {
        let Some(uri) = parse_storage_uri(url) else {
            return Ok(Some(ResolvedUrl::External(url)));
        };

        let storage = self.initialize().await?;
        let resolved = storage.get_file_url(uri.id()).await?;
        debug!(%uri, found = resolved.is_some(), "Resolved storage URI");
        Ok(resolved.map(ResolvedUrl::Object))
    }

    /// Saves `payload` under `id` and stores a derived thumbnail next to it.
    ///
    /// Thumbnail derivation or storage failures are logged and never fail the save.
    ///
    /// # Errors
    /// Only errors from saving the file itself.
    #[instrument(skip(self, payload, overrides), fields(size = payload.size()))]
    pub async fn store_with_thumbnail(
        &self,
        id: &str,
        payload: Payload,
        overrides: MetadataOverrides,
    ) -> Result<StoredMedia, StorageError> {
        let storage = self.initialize().await?;
        let thumbnail_source = payload.clone();
        let uri = storage.save_file(id, payload, overrides).await?;

        let thumbnail = match self.inner.thumbnails.generate(&thumbnail_source).await {
            Some(thumb) => storage
                .save_thumbnail(id, thumb)
                .await
                .inspect_err(|e| warn!(error = %e, "Thumbnail could not be stored"))
                .ok(),
            None => None,
        };

        Ok(StoredMedia { uri, thumbnail })
    }
}
