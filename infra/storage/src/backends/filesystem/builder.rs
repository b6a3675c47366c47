use super::security::validate_id;
use super::{FilesystemInner, FilesystemStorage};
use crate::blob::BlobRegistry;
use crate::config::{
    DEFAULT_APP_NAME, DEFAULT_CHUNK_SIZE, DEFAULT_STREAM_THRESHOLD_CHUNKS, FilesystemConfig,
};
use crate::error::{StorageError, StorageErrorExt};
use private::Sealed;
use std::path::PathBuf;

#[derive(Debug, Clone)]
struct Options {
    app_name: String,
    chunk_size: usize,
    stream_threshold_chunks: usize,
    quota: Option<u64>,
    registry: Option<BlobRegistry>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            app_name: DEFAULT_APP_NAME.to_owned(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            stream_threshold_chunks: DEFAULT_STREAM_THRESHOLD_CHUNKS,
            quota: None,
            registry: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct NoRoot;
#[derive(Debug)]
pub struct WithRoot(PathBuf);

mod private {
    pub(super) trait Sealed {}
}
impl Sealed for NoRoot {}
impl Sealed for WithRoot {}

/// Typestate builder for [`FilesystemStorage`]; a root is required before [`build`](Self::build).
#[allow(private_bounds)]
#[derive(Debug, Default)]
pub struct FilesystemBuilder<S: Sealed = NoRoot> {
    state: S,
    options: Options,
}

#[allow(private_bounds)]
impl<S: Sealed> FilesystemBuilder<S> {
    /// Name of the private directory created below the root.
    #[must_use = "Sets the application directory name"]
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.options.app_name = name.into();
        self
    }

    #[must_use = "Sets the slice size for chunked writes"]
    pub const fn chunk_size(mut self, bytes: usize) -> Self {
        self.options.chunk_size = bytes;
        self
    }

    /// Payloads longer than `chunk_size * chunks` are written in slices.
    #[must_use = "Sets the chunked write threshold"]
    pub const fn stream_threshold_chunks(mut self, chunks: usize) -> Self {
        self.options.stream_threshold_chunks = chunks;
        self
    }

    #[must_use = "Sets the byte ceiling for stored files"]
    pub const fn quota(mut self, bytes: Option<u64>) -> Self {
        self.options.quota = bytes;
        self
    }

    /// Registry used to mint object URLs. A private registry is created when omitted.
    #[must_use = "Sets the object URL registry"]
    pub fn registry(mut self, registry: BlobRegistry) -> Self {
        self.options.registry = Some(registry);
        self
    }

    fn transition<N: Sealed>(self, state: N) -> FilesystemBuilder<N> {
        FilesystemBuilder { state, options: self.options }
    }
}

impl FilesystemBuilder<NoRoot> {
    #[must_use = "Creates a new filesystem storage builder with default configuration"]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a builder from configuration. Returns `None` when no root is configured.
    #[must_use]
    pub fn from_config(config: &FilesystemConfig) -> Option<FilesystemBuilder<WithRoot>> {
        let root = config.root.clone()?;
        Some(
            Self::new()
                .app_name(config.app_name.clone())
                .chunk_size(config.chunk_size)
                .stream_threshold_chunks(config.stream_threshold_chunks)
                .quota(config.quota)
                .root(root),
        )
    }

    #[must_use = "Sets the directory that will host the private storage tree"]
    pub fn root(self, path: impl Into<PathBuf>) -> FilesystemBuilder<WithRoot> {
        self.transition(WithRoot(path.into()))
    }
}

impl FilesystemBuilder<WithRoot> {
    /// Validates the options and returns an uninitialized backend.
    ///
    /// No I/O happens here; directories are created by `initialize`.
    ///
    /// # Errors
    /// [`StorageError::InvalidData`] if the app name is not a single path segment or a chunk
    /// setting is zero.
    pub fn build(self) -> Result<FilesystemStorage, StorageError> {
        let Options { app_name, chunk_size, stream_threshold_chunks, quota, registry } =
            self.options;

        validate_id(&app_name).context("Filesystem app name")?;
        if chunk_size == 0 || stream_threshold_chunks == 0 {
            return Err(StorageError::invalid("Chunk size and threshold must be non-zero"));
        }

        Ok(FilesystemStorage::from_inner(FilesystemInner::new(
            self.state.0.join(app_name),
            chunk_size,
            stream_threshold_chunks,
            quota,
            registry.unwrap_or_default(),
        )))
    }
}
