//! Durable, sandboxed filesystem backend (wire name `opfs`).
//!
//! All data lives below `<root>/<app_name>/`:
//!
//! ```text
//! <root>/<app_name>/
//! ├── assets/<id>          file payloads
//! ├── thumbnails/<id>      derived previews
//! └── metadata.json        id -> FileMetadata index
//! ```
//!
//! Every write goes through an atomic swap: the bytes land in a unique temporary file which is
//! synced and then renamed over the target, so a crash never leaves a torn payload behind. Large
//! payloads are written to the temporary file in `chunk_size` slices.

mod builder;
mod housekeeping;
mod security;

pub use builder::{FilesystemBuilder, NoRoot, WithRoot};

use crate::blob::{BlobRegistry, Namespace, ObjectUrl, UrlCache};
use crate::config::FilesystemConfig;
use crate::contract::FileStorage;
use crate::error::{IntoStorage, StorageError, StorageErrorExt};
use crate::metadata::{
    DEFAULT_MIME_TYPE, FileInfo, FileMetadata, MetadataOverrides, Payload, StorageType,
    StorageUsage, guess_mime,
};
use crate::uri::{StorageUri, UriScheme};
use async_trait::async_trait;
use housekeeping::{ABANDONED_AFTER, Sweep, volume_available};
use chrono::{DateTime, Utc};
use fxhash::{FxHashMap, FxHashSet};
use parking_lot::RwLock;
use security::{TMP_MARKER, resolve_entry};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, error, info, warn};

const ASSETS_DIR: &str = "assets";
const THUMBNAILS_DIR: &str = "thumbnails";
const INDEX_FILE: &str = "metadata.json";

#[derive(Debug)]
struct FilesystemInner {
    /// `<root>/<app_name>` as configured.
    base: PathBuf,
    chunk_size: usize,
    stream_threshold_chunks: usize,
    quota: Option<u64>,
    tmp_counter: AtomicU64,
    /// Canonical base directory, set once bootstrapping succeeded.
    ready: OnceCell<PathBuf>,
    index: RwLock<FxHashMap<String, FileMetadata>>,
    /// Serializes index persistence so the newest snapshot is always written last.
    persist: Mutex<()>,
    urls: UrlCache,
}

impl FilesystemInner {
    fn new(
        base: PathBuf,
        chunk_size: usize,
        stream_threshold_chunks: usize,
        quota: Option<u64>,
        registry: BlobRegistry,
    ) -> Self {
        Self {
            base,
            chunk_size,
            stream_threshold_chunks,
            quota,
            tmp_counter: AtomicU64::new(1),
            ready: OnceCell::new(),
            index: RwLock::new(FxHashMap::default()),
            persist: Mutex::new(()),
            urls: UrlCache::new(registry, StorageType::Filesystem.into()),
        }
    }
}

/// Filesystem implementation of [`FileStorage`]. Cheap to clone.
///
/// # Example
///
/// ```rust
/// use lumen_storage::{FileStorage, FilesystemStorage, MetadataOverrides, Payload, StorageError};
///
/// #[tokio::main]
/// async fn main() -> Result<(), StorageError> {
///     # let tmp = tempfile::tempdir().unwrap();
///     let storage = FilesystemStorage::builder().root(tmp.path()).app_name("demo").build()?;
///     storage.initialize().await?;
///
///     let uri = storage
///         .save_file("note.txt", Payload::typed(b"hi".to_vec(), "text/plain"), MetadataOverrides::default())
///         .await?;
///     assert_eq!(uri.to_string(), "opfs://note.txt");
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct FilesystemStorage {
    inner: Arc<FilesystemInner>,
}

impl FilesystemStorage {
    #[must_use = "The storage is not usable until you call .build()"]
    pub fn builder() -> FilesystemBuilder {
        FilesystemBuilder::new()
    }

    fn from_inner(inner: FilesystemInner) -> Self {
        Self { inner: Arc::new(inner) }
    }

    /// Capability probe: a root is configured and it, or its parent, is an existing directory.
    #[must_use]
    pub fn is_supported(config: &FilesystemConfig) -> bool {
        config.root.as_deref().is_some_and(|root| {
            let parent = root
                .parent()
                .map(|p| if p.as_os_str().is_empty() { Path::new(".") } else { p });
            root.is_dir() || parent.is_some_and(Path::is_dir)
        })
    }

    /// The private `<root>/<app_name>` directory.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.inner.base
    }

    async fn ready(&self) -> Result<&Path, StorageError> {
        self.inner.ready.get_or_try_init(|| self.bootstrap()).await.map(PathBuf::as_path)
    }

    async fn bootstrap(&self) -> Result<PathBuf, StorageError> {
        let base = &self.inner.base;

        for dir in [ASSETS_DIR, THUMBNAILS_DIR] {
            let path = base.join(dir);
            fs::create_dir_all(&path).await.map_err(|e| {
                StorageError::init_failed(format!("Creating {}", path.display()), e)
            })?;
        }

        let canonical = fs::canonicalize(base).await.map_err(|e| {
            StorageError::init_failed(format!("Resolving {}", base.display()), e)
        })?;

        sweep_abandoned_writes(&canonical).await;

        let index = load_index(&canonical.join(INDEX_FILE)).await;
        let files = index.len();
        *self.inner.index.write() = index;

        info!(path = %canonical.display(), files, "Filesystem storage ready");
        Ok(canonical)
    }

    fn should_chunk(&self, len: usize) -> bool {
        len > self.inner.chunk_size.saturating_mul(self.inner.stream_threshold_chunks)
    }

    /// Writes `data` to `target` through a synced temporary file and an atomic rename.
    async fn write_atomic(&self, target: &Path, data: &[u8]) -> Result<(), StorageError> {
        let tmp = unique_tmp_path(target, &self.inner.tmp_counter);

        let written = self.write_tmp(&tmp, data).await;
        if written.is_err() {
            discard(&tmp).await;
        }
        written?;

        let swapped = swap(&tmp, target)
            .await
            .storage_context(format!("Atomic swap failed: {}", target.display()));
        if swapped.is_err() {
            discard(&tmp).await;
        }
        swapped?;

        if let Some(parent) = target.parent() {
            sync_dir(parent).await;
        }
        Ok(())
    }

    async fn write_tmp(&self, tmp: &Path, data: &[u8]) -> Result<(), StorageError> {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(tmp)
            .await
            .storage_context(format!("Temp creation failed: {}", tmp.display()))?;

        if self.should_chunk(data.len()) {
            let mut chunks = 0usize;
            for chunk in data.chunks(self.inner.chunk_size) {
                file.write_all(chunk).await.storage_context("Chunk write failed")?;
                chunks += 1;
            }
            debug!(chunks, bytes = data.len(), "Chunked write");
        } else {
            file.write_all(data).await.storage_context("Write failed")?;
        }

        file.sync_all().await.storage_context("Hardware sync failed")
    }

    async fn persist_index(&self, base: &Path) -> Result<(), StorageError> {
        let _guard = self.inner.persist.lock().await;

        let snapshot: BTreeMap<String, FileMetadata> =
            self.inner.index.read().iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let json = serde_json::to_vec_pretty(&snapshot)?;

        self.write_atomic(&base.join(INDEX_FILE), &json)
            .await
            .context("Persisting metadata index")
    }

    fn indexed_bytes(&self, excluding: Option<&str>) -> u64 {
        let index = self.inner.index.read();
        let total: u64 = index.values().map(|m| m.size).sum();
        let replaced = excluding.and_then(|id| index.get(id)).map_or(0, |m| m.size);
        total.saturating_sub(replaced)
    }
}

#[async_trait]
impl FileStorage for FilesystemStorage {
    async fn initialize(&self) -> Result<(), StorageError> {
        self.ready().await.map(|_| ())
    }

    fn is_available(&self) -> bool {
        self.inner.ready.initialized()
    }

    fn storage_type(&self) -> StorageType {
        StorageType::Filesystem
    }

    async fn save_file(
        &self,
        id: &str,
        payload: Payload,
        overrides: MetadataOverrides,
    ) -> Result<StorageUri, StorageError> {
        let base = self.ready().await?;
        let path = resolve_entry(base, ASSETS_DIR, id)?;
        let metadata = FileMetadata::derive(id, &payload, overrides);

        if let Some(quota) = self.inner.quota {
            let used = self.indexed_bytes(Some(id));
            if used.saturating_add(metadata.size) > quota {
                return Err(StorageError::QuotaExceeded {
                    message: format!(
                        "{} bytes requested, {} of {quota} bytes in use",
                        metadata.size, used
                    )
                    .into(),
                    context: Some(format!("Saving {id}").into()),
                    source: None,
                });
            }
        }

        self.write_atomic(&path, &payload.bytes).await.context(format!("Saving {id}"))?;

        self.inner.urls.evict(Namespace::Files, id);
        let size = metadata.size;
        self.inner.index.write().insert(id.to_owned(), metadata);
        self.persist_index(base).await?;

        debug!(id, size, "File saved");
        Ok(StorageUri::new(UriScheme::Opfs, id))
    }

    async fn get_file(&self, id: &str) -> Result<Option<Payload>, StorageError> {
        let base = self.ready().await?;
        let path = resolve_entry(base, ASSETS_DIR, id)?;

        let Some(bytes) = read_optional(&path).await.storage_context(format!("Reading {id}"))?
        else {
            return Ok(None);
        };

        let mime_type =
            self.inner.index.read().get(id).map(|m| m.mime_type.clone()).or_else(|| guess_mime(id));
        Ok(Some(Payload { bytes, mime_type }))
    }

    async fn get_file_url(&self, id: &str) -> Result<Option<ObjectUrl>, StorageError> {
        self.inner.urls.resolve(Namespace::Files, id, || self.get_file(id)).await
    }

    async fn delete_file(&self, id: &str) -> Result<(), StorageError> {
        let base = self.ready().await?;
        let asset = resolve_entry(base, ASSETS_DIR, id)?;

        remove_optional(&asset).await.storage_context(format!("Deleting {id}"))?;

        let thumbnail = match resolve_entry(base, THUMBNAILS_DIR, id) {
            Ok(path) => remove_optional(&path).await.map_err(StorageError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = thumbnail {
            warn!(id, error = %e, "Failed to delete thumbnail");
        }

        self.inner.urls.evict(Namespace::Files, id);
        self.inner.urls.evict(Namespace::Thumbnails, id);

        let removed = self.inner.index.write().remove(id).is_some();
        if removed {
            self.persist_index(base).await?;
        }
        debug!(id, "File deleted");
        Ok(())
    }

    async fn list_files(&self) -> Result<Vec<FileInfo>, StorageError> {
        let base = self.ready().await?;

        let mut present = Vec::new();
        let mut entries =
            fs::read_dir(base.join(ASSETS_DIR)).await.storage_context("Listing assets")?;
        while let Some(entry) = entries.next_entry().await.storage_context("Listing assets")? {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.contains(TMP_MARKER) {
                continue;
            }
            let stat = entry.metadata().await.storage_context(format!("Inspecting {name}"))?;
            if stat.is_file() {
                present.push((name, stat));
            }
        }

        let mut healed = false;
        let mut files = Vec::with_capacity(present.len());
        {
            let mut index = self.inner.index.write();
            let names: FxHashSet<&str> = present.iter().map(|(name, _)| name.as_str()).collect();
            let before = index.len();
            index.retain(|id, _| names.contains(id.as_str()));
            healed |= index.len() != before;

            for (id, stat) in &present {
                let metadata = match index.get(id) {
                    Some(metadata) => metadata.clone(),
                    None => {
                        healed = true;
                        let metadata = metadata_from_stat(id, stat);
                        index.insert(id.clone(), metadata.clone());
                        metadata
                    },
                };
                files.push(FileInfo { id: id.clone(), metadata });
            }
        }

        if healed {
            info!(files = files.len(), "Metadata index reconciled with assets directory");
            self.persist_index(base).await?;
        }

        files.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(files)
    }

    async fn storage_usage(&self) -> Result<StorageUsage, StorageError> {
        let base = self.ready().await?;
        let mut used = 0u64;
        for dir in [ASSETS_DIR, THUMBNAILS_DIR] {
            used += dir_size(&base.join(dir)).await.storage_context("Measuring usage")?;
        }

        let volume = {
            let base = base.to_path_buf();
            tokio::task::spawn_blocking(move || volume_available(&base)).await.unwrap_or_else(|e| {
                warn!(error = %e, "Free space lookup did not finish");
                None
            })
        };
        let quota = self.inner.quota.map(|quota| quota.saturating_sub(self.indexed_bytes(None)));
        let available = match (quota, volume) {
            (Some(quota), Some(volume)) => Some(quota.min(volume)),
            (quota, volume) => quota.or(volume),
        };
        Ok(StorageUsage { used, available })
    }

    async fn clear_all(&self) -> Result<(), StorageError> {
        let base = self.ready().await?;

        for dir in [ASSETS_DIR, THUMBNAILS_DIR] {
            let path = base.join(dir);
            match fs::remove_dir_all(&path).await {
                Ok(()) => {},
                Err(e) if e.kind() == io::ErrorKind::NotFound => {},
                Err(e) => return Err(e).storage_context(format!("Clearing {}", path.display())),
            }
            fs::create_dir_all(&path)
                .await
                .storage_context(format!("Recreating {}", path.display()))?;
        }

        self.inner.index.write().clear();
        self.inner.urls.clear();
        self.persist_index(base).await?;

        info!("Filesystem storage cleared");
        Ok(())
    }

    async fn save_thumbnail(&self, id: &str, payload: Payload) -> Result<ObjectUrl, StorageError> {
        let base = self.ready().await?;
        let path = resolve_entry(base, THUMBNAILS_DIR, id)?;

        self.write_atomic(&path, &payload.bytes)
            .await
            .context(format!("Saving thumbnail {id}"))?;

        debug!(id, bytes = payload.len(), "Thumbnail saved");
        Ok(self.inner.urls.replace(Namespace::Thumbnails, id, payload))
    }

    async fn get_thumbnail(&self, id: &str) -> Result<Option<Payload>, StorageError> {
        let base = self.ready().await?;
        let path = resolve_entry(base, THUMBNAILS_DIR, id)?;

        let bytes = read_optional(&path).await.storage_context(format!("Reading thumbnail {id}"))?;
        Ok(bytes.map(|bytes| {
            let mime_type = image::guess_format(&bytes).ok().map(|f| f.to_mime_type().to_owned());
            Payload { bytes, mime_type }
        }))
    }

    fn revoke_url(&self, url: &str) {
        self.inner.urls.purge_handle(url);
    }
}

async fn load_index(path: &Path) -> FxHashMap<String, FileMetadata> {
    let raw = match fs::read(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return FxHashMap::default(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Metadata index unreadable, starting empty");
            return FxHashMap::default();
        },
    };

    serde_json::from_slice(&raw).unwrap_or_else(|e| {
        warn!(path = %path.display(), error = %e, "Metadata index corrupt, starting empty");
        FxHashMap::default()
    })
}

fn metadata_from_stat(id: &str, stat: &std::fs::Metadata) -> FileMetadata {
    let created_at = stat
        .created()
        .or_else(|_| stat.modified())
        .map_or_else(|_| Utc::now(), DateTime::<Utc>::from);

    FileMetadata {
        name: id.to_owned(),
        mime_type: guess_mime(id).unwrap_or_else(|| DEFAULT_MIME_TYPE.to_owned()),
        size: stat.len(),
        created_at,
    }
}

async fn read_optional(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

async fn remove_optional(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Deletes temporaries left behind by writes interrupted before their rename. Never fails.
async fn sweep_abandoned_writes(base: &Path) {
    let base = base.to_path_buf();
    let cutoff = SystemTime::now().checked_sub(ABANDONED_AFTER).unwrap_or(SystemTime::UNIX_EPOCH);

    let sweep = match tokio::task::spawn_blocking(move || Sweep::run(&base, cutoff)).await {
        Ok(sweep) => sweep,
        Err(e) => {
            error!(error = %e, "Temporary file sweep panicked");
            return;
        },
    };
    for (path, e) in &sweep.failed {
        warn!(path = %path.display(), error = %e, "Failed to remove temporary file");
    }
    if !sweep.is_empty() {
        info!(removed = sweep.removed, failed = sweep.failed.len(), "Abandoned writes cleaned up");
    }
}

async fn dir_size(dir: &Path) -> io::Result<u64> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut total = 0;
    while let Some(entry) = entries.next_entry().await? {
        let stat = entry.metadata().await?;
        if stat.is_file() {
            total += stat.len();
        }
    }
    Ok(total)
}

/// Renames `tmp` over `target`, falling back to remove-then-rename where replacing is refused.
async fn swap(tmp: &Path, target: &Path) -> io::Result<()> {
    match fs::rename(tmp, target).await {
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            fs::remove_file(target).await?;
            fs::rename(tmp, target).await
        },
        other => other,
    }
}

async fn discard(tmp: &Path) {
    if let Err(e) = fs::remove_file(tmp).await
        && e.kind() != io::ErrorKind::NotFound
    {
        warn!(path = %tmp.display(), error = %e, "Failed to remove temporary file");
    }
}

async fn sync_dir(path: &Path) {
    match fs::File::open(path).await {
        Ok(dir) => {
            if let Err(err) = dir.sync_all().await {
                warn!(path = %path.display(), error = %err, "Directory sync failed");
            }
        },
        Err(err) => {
            warn!(path = %path.display(), error = %err, "Directory open failed");
        },
    }
}

fn unique_tmp_path(target: &Path, counter: &AtomicU64) -> PathBuf {
    let counter = counter.fetch_add(1, Ordering::Relaxed);
    let file_name = target.file_name().and_then(|s| s.to_str()).unwrap_or("entry");
    target.with_file_name(format!(".{file_name}{TMP_MARKER}{counter}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn storage(tmp: &TempDir) -> FilesystemStorage {
        FilesystemStorage::builder().root(tmp.path()).app_name("unit").build().unwrap()
    }

    #[test]
    fn chunk_threshold_is_exclusive() {
        let tmp = TempDir::new().unwrap();
        let fs = FilesystemStorage::builder()
            .root(tmp.path())
            .chunk_size(10)
            .stream_threshold_chunks(5)
            .build()
            .unwrap();

        assert!(!fs.should_chunk(50));
        assert!(fs.should_chunk(51));
    }

    #[test]
    fn builder_rejects_bad_options() {
        let tmp = TempDir::new().unwrap();
        let err = FilesystemStorage::builder().root(tmp.path()).app_name("../x").build();
        assert!(err.unwrap_err().is_invalid_data());

        let err = FilesystemStorage::builder().root(tmp.path()).chunk_size(0).build();
        assert!(err.unwrap_err().is_invalid_data());
    }

    #[test]
    fn capability_probe() {
        let tmp = TempDir::new().unwrap();
        let with = |root: Option<PathBuf>| FilesystemConfig { root, ..FilesystemConfig::default() };

        assert!(FilesystemStorage::is_supported(&with(Some(tmp.path().to_path_buf()))));
        assert!(FilesystemStorage::is_supported(&with(Some(tmp.path().join("new")))));
        assert!(!FilesystemStorage::is_supported(&with(Some(tmp.path().join("a/b/c")))));
        assert!(!FilesystemStorage::is_supported(&with(None)));
    }

    #[test]
    fn temporary_names_are_hidden_and_unique() {
        let counter = AtomicU64::new(1);
        let a = unique_tmp_path(Path::new("/x/assets/clip.mp4"), &counter);
        let b = unique_tmp_path(Path::new("/x/assets/clip.mp4"), &counter);
        assert_ne!(a, b);
        assert_eq!(a, Path::new("/x/assets/.clip.mp4.lumentmp.1"));
    }

    #[tokio::test]
    async fn corrupt_index_starts_empty() {
        let tmp = TempDir::new().unwrap();
        let fs = storage(&tmp);
        std::fs::create_dir_all(fs.base_dir()).unwrap();
        std::fs::write(fs.base_dir().join(INDEX_FILE), b"{ not json").unwrap();

        fs.initialize().await.unwrap();
        assert!(fs.is_available());
        assert!(fs.list_files().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn listing_heals_index_both_ways() {
        let tmp = TempDir::new().unwrap();
        let fs = storage(&tmp);
        fs.save_file("kept.txt", Payload::new(b"k".to_vec()), MetadataOverrides::default())
            .await
            .unwrap();
        fs.save_file("gone.txt", Payload::new(b"g".to_vec()), MetadataOverrides::default())
            .await
            .unwrap();

        let assets = fs.base_dir().join(ASSETS_DIR);
        std::fs::remove_file(assets.join("gone.txt")).unwrap();
        std::fs::write(assets.join("stray.png"), b"png-ish").unwrap();

        let files = fs.list_files().await.unwrap();
        let ids: Vec<&str> = files.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, ["kept.txt", "stray.png"]);

        let stray = &files[1].metadata;
        assert_eq!(stray.mime_type, "image/png");
        assert_eq!(stray.size, 7);

        let persisted: BTreeMap<String, FileMetadata> =
            serde_json::from_slice(&std::fs::read(fs.base_dir().join(INDEX_FILE)).unwrap())
                .unwrap();
        assert!(persisted.contains_key("stray.png"));
        assert!(!persisted.contains_key("gone.txt"));
    }

    #[tokio::test]
    async fn quota_counts_replacements_once() {
        let tmp = TempDir::new().unwrap();
        let fs = FilesystemStorage::builder().root(tmp.path()).quota(Some(10)).build().unwrap();

        fs.save_file("a", Payload::new(vec![0; 8]), MetadataOverrides::default()).await.unwrap();
        fs.save_file("a", Payload::new(vec![0; 10]), MetadataOverrides::default()).await.unwrap();

        let err = fs
            .save_file("b", Payload::new(vec![0; 1]), MetadataOverrides::default())
            .await
            .unwrap_err();
        assert!(err.is_quota_exceeded());

        let usage = fs.storage_usage().await.unwrap();
        assert_eq!(usage.available, Some(0));
    }
}
