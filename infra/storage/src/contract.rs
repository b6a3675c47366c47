use crate::blob::ObjectUrl;
use crate::error::StorageError;
use crate::metadata::{FileInfo, MetadataOverrides, Payload, StorageType, StorageUsage};
use crate::uri::StorageUri;
use async_trait::async_trait;
use std::fmt::Debug;

/// The uniform contract every backend implements.
///
/// Operations on an uninitialized backend initialize it first. Lookups of absent ids return
/// `Ok(None)`; errors are reserved for failures of the backend itself.
#[async_trait]
pub trait FileStorage: Send + Sync + Debug {
    /// Prepares the backend for use. Idempotent.
    ///
    /// # Errors
    /// [`StorageError::InitializationFailed`] with the underlying cause attached.
    async fn initialize(&self) -> Result<(), StorageError>;

    /// `true` once [`FileStorage::initialize`] has succeeded.
    fn is_available(&self) -> bool;

    fn storage_type(&self) -> StorageType;

    /// Stores `payload` under `id`, replacing any previous payload and metadata for that id.
    ///
    /// Returns a storage URI (`scheme://id`), not a URL. Any cached file URL for `id` is revoked.
    ///
    /// # Errors
    /// [`StorageError::QuotaExceeded`] when the write would exceed capacity,
    /// [`StorageError::InvalidData`] for ids the backend cannot address, and
    /// [`StorageError::OperationFailed`] or [`StorageError::PermissionDenied`] otherwise.
    async fn save_file(
        &self,
        id: &str,
        payload: Payload,
        overrides: MetadataOverrides,
    ) -> Result<StorageUri, StorageError>;

    async fn get_file(&self, id: &str) -> Result<Option<Payload>, StorageError>;

    /// Returns the cached object URL for `id`, minting and caching one on first use.
    async fn get_file_url(&self, id: &str) -> Result<Option<ObjectUrl>, StorageError>;

    /// Removes the file and, best-effort, its thumbnail. Absent ids are a no-op.
    async fn delete_file(&self, id: &str) -> Result<(), StorageError>;

    async fn list_files(&self) -> Result<Vec<FileInfo>, StorageError>;

    async fn storage_usage(&self) -> Result<StorageUsage, StorageError>;

    /// Empties files and thumbnails and revokes every URL this backend minted.
    async fn clear_all(&self) -> Result<(), StorageError>;

    /// Stores a thumbnail for `id` and returns a fresh object URL for it.
    async fn save_thumbnail(&self, id: &str, payload: Payload)
    -> Result<ObjectUrl, StorageError>;

    async fn get_thumbnail(&self, id: &str) -> Result<Option<Payload>, StorageError>;

    /// Releases an object URL. Foreign or already revoked URLs are ignored.
    fn revoke_url(&self, url: &str);
}
