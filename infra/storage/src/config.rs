use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_APP_NAME: &str = "lumen";
/// Slice size used by chunked filesystem writes.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;
/// Payloads longer than `chunk_size * DEFAULT_STREAM_THRESHOLD_CHUNKS` are written in chunks.
pub const DEFAULT_STREAM_THRESHOLD_CHUNKS: usize = 5;
pub const DEFAULT_DB_NAMESPACE: &str = "lumen";
pub const DEFAULT_DB_DATABASE: &str = "media";
pub const DEFAULT_MEMORY_MAX_BYTES: u64 = 100 * 1024 * 1024;
pub const DEFAULT_THUMBNAIL_MAX_DIMENSION: u32 = 256;
pub const DEFAULT_JPEG_QUALITY: u8 = 80;
pub const DEFAULT_VIDEO_CAPTURE_SECS: f64 = 1.0;
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 5 * 60;
pub const DEFAULT_DOWNLOAD_MAX_BYTES: u64 = 500 * 1024 * 1024;

/// Settings for every storage component, deserializable from any `serde` source.
///
/// Missing sections and fields fall back to the defaults above.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub filesystem: FilesystemConfig,
    pub database: DatabaseConfig,
    pub memory: MemoryConfig,
    pub thumbnails: ThumbnailConfig,
    pub download: DownloadConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FilesystemConfig {
    /// Directory that hosts the private `<app_name>/` tree. `None` disables the backend.
    pub root: Option<PathBuf>,
    pub app_name: String,
    pub chunk_size: usize,
    pub stream_threshold_chunks: usize,
    /// Optional byte ceiling for stored files.
    pub quota: Option<u64>,
}

impl Default for FilesystemConfig {
    fn default() -> Self {
        Self {
            root: None,
            app_name: DEFAULT_APP_NAME.to_owned(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            stream_threshold_chunks: DEFAULT_STREAM_THRESHOLD_CHUNKS,
            quota: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Engine URL such as `mem://` or `rocksdb://path`. `None` disables the backend.
    pub url: Option<String>,
    pub namespace: String,
    pub database: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            namespace: DEFAULT_DB_NAMESPACE.to_owned(),
            database: DEFAULT_DB_DATABASE.to_owned(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub max_bytes: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self { max_bytes: DEFAULT_MEMORY_MAX_BYTES }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ThumbnailConfig {
    pub max_dimension: u32,
    pub jpeg_quality: u8,
    pub video_capture_secs: f64,
}

impl ThumbnailConfig {
    #[must_use]
    pub fn video_capture(&self) -> Duration {
        Duration::try_from_secs_f64(self.video_capture_secs).unwrap_or(Duration::ZERO)
    }
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            max_dimension: DEFAULT_THUMBNAIL_MAX_DIMENSION,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            video_capture_secs: DEFAULT_VIDEO_CAPTURE_SECS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub timeout_secs: u64,
    pub max_bytes: u64,
}

impl DownloadConfig {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self { timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS, max_bytes: DEFAULT_DOWNLOAD_MAX_BYTES }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_documents_keep_defaults() {
        let config: StorageConfig = serde_json::from_str(
            r#"{ "filesystem": { "root": "/var/lib/lumen", "quota": 2048 }, "memory": {} }"#,
        )
        .unwrap();

        assert_eq!(config.filesystem.root.as_deref(), Some(std::path::Path::new("/var/lib/lumen")));
        assert_eq!(config.filesystem.quota, Some(2048));
        assert_eq!(config.filesystem.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.memory.max_bytes, DEFAULT_MEMORY_MAX_BYTES);
        assert!(config.database.url.is_none());
        assert_eq!(config.download.timeout(), Duration::from_secs(300));
    }

    #[test]
    fn negative_capture_time_clamps_to_zero() {
        let config = ThumbnailConfig { video_capture_secs: -3.0, ..ThumbnailConfig::default() };
        assert_eq!(config.video_capture(), Duration::ZERO);
    }
}
