//! Tiered media storage with automatic backend fallback.
//!
//! Media payloads (images, videos, arbitrary binaries) are persisted behind a single
//! [`FileStorage`] contract implemented by three backends:
//!
//! - **Filesystem** (`opfs://`): a private directory tree with atomic, optionally chunked writes
//!   and a JSON metadata index.
//! - **Database** (`idb://`): an embedded `SurrealDB` instance with `files` and `thumbnails`
//!   tables.
//! - **Memory** (`memory://`): volatile maps with a byte ceiling. Always available.
//!
//! A [`StorageManager`] probes the backends in that order and adopts the first one that
//! initializes. Saved files are addressed by storage URIs (`scheme://id`), which
//! [`StorageManager::resolve_url`] turns into ephemeral [`ObjectUrl`]s backed by a shared
//! [`BlobRegistry`]. JPEG thumbnails come from the [`ThumbnailGenerator`], and the [`Downloader`]
//! streams remote media into any backend.
//!
//! # Examples
//!
//! ```rust
//! use lumen_storage::{MetadataOverrides, Payload, StorageConfig, StorageError, StorageManager};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), StorageError> {
//!     let manager = StorageManager::new(StorageConfig::default());
//!     let storage = manager.initialize().await?;
//!
//!     let uri = storage
//!         .save_file("hello", Payload::typed(b"hi".to_vec(), "text/plain"), MetadataOverrides::default())
//!         .await?;
//!     assert_eq!(uri.to_string(), "memory://hello");
//!
//!     let url = manager.resolve_url("memory://hello").await?.expect("file exists");
//!     assert!(url.as_str().starts_with("blob:lumen/"));
//!     Ok(())
//! }
//! ```

mod backends;
mod blob;
mod config;
mod contract;
mod download;
mod error;
mod manager;
mod metadata;
mod thumbnail;
mod uri;

pub use backends::{
    DatabaseStorage, FilesystemBuilder, FilesystemStorage, MemoryStorage, NoRoot, SCHEMA_VERSION,
    WithRoot,
};
pub use blob::{BlobRegistry, OBJECT_URL_PREFIX, ObjectUrl};
pub use config::*;
pub use contract::FileStorage;
pub use download::{Downloader, Progress, filename_from_url};
pub use error::{Cause, StorageError, StorageErrorExt, StorageErrorKind};
pub use manager::{ResolvedUrl, StorageManager, StoredMedia};
pub use metadata::{
    DEFAULT_MIME_TYPE, FileInfo, FileMetadata, MetadataOverrides, Payload, StorageType,
    StorageUsage,
};
#[cfg(feature = "video-thumbnails")]
pub use thumbnail::FfmpegFrameSource;
pub use thumbnail::{FrameSource, ThumbnailGenerator, capture_time, dimensions};
pub use uri::{StorageUri, UriScheme, is_storage_uri, parse_storage_uri};
