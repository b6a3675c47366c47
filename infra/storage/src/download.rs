//! Streams remote media into [`Payload`]s and, optionally, into a backend.

use crate::config::DownloadConfig;
use crate::contract::FileStorage;
use crate::error::{StorageError, StorageErrorExt};
use crate::metadata::{MetadataOverrides, Payload, guess_mime};
use crate::uri::StorageUri;
use futures::StreamExt;
use reqwest::{Client, StatusCode, Url, header};
use std::time::Duration;
use tracing::{debug, info, instrument};

const DEFAULT_FILENAME: &str = "download";
const GENERIC_MIME: &str = "application/octet-stream";

/// Progress observer receiving `(loaded, total)`. `total` equals `loaded` when the server sent no
/// `Content-Length`.
pub type Progress<'a> = &'a (dyn Fn(u64, u64) + Send + Sync);

impl From<reqwest::Error> for StorageError {
    fn from(err: reqwest::Error) -> Self {
        let message = err.to_string().into();
        let source = Some(Box::new(err) as crate::error::Cause);
        Self::OperationFailed { message, context: None, source }
    }
}

fn status_error(status: StatusCode, url: &str) -> StorageError {
    let message = format!("Server answered {status}").into();
    let context = Some(format!("Fetching {url}").into());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            StorageError::PermissionDenied { message, context, source: None }
        },
        StatusCode::PAYLOAD_TOO_LARGE | StatusCode::INSUFFICIENT_STORAGE => {
            StorageError::QuotaExceeded { message, context, source: None }
        },
        _ => StorageError::OperationFailed { message, context, source: None },
    }
}

fn too_large(size: u64, limit: u64) -> StorageError {
    StorageError::quota(format!("{size} bytes exceeds the {limit} byte download limit"))
}

/// Collects response chunks while enforcing the byte cap.
#[derive(Debug)]
struct ChunkAccumulator {
    buffer: Vec<u8>,
    limit: u64,
    expected: Option<u64>,
}

impl ChunkAccumulator {
    fn new(limit: u64, expected: Option<u64>) -> Self {
        let capacity = expected.unwrap_or(0).min(limit);
        Self {
            buffer: Vec::with_capacity(usize::try_from(capacity).unwrap_or(0)),
            limit,
            expected,
        }
    }

    fn loaded(&self) -> u64 {
        self.buffer.len() as u64
    }

    fn push(&mut self, chunk: &[u8]) -> Result<(u64, u64), StorageError> {
        let loaded = self.loaded() + chunk.len() as u64;
        if loaded > self.limit {
            return Err(too_large(loaded, self.limit));
        }
        self.buffer.extend_from_slice(chunk);
        Ok((loaded, self.expected.unwrap_or(loaded)))
    }
}

/// Last path segment of `url`, or `"download"` when there is none.
#[must_use]
pub fn filename_from_url(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_owned))
        })
        .filter(|segment| !segment.is_empty())
        .unwrap_or_else(|| DEFAULT_FILENAME.to_owned())
}

fn response_mime(response: &reqwest::Response, url: &str) -> Option<String> {
    let declared = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .map(str::trim)
        .filter(|mime| !mime.is_empty() && *mime != GENERIC_MIME)
        .map(str::to_owned);

    declared.or_else(|| guess_mime(&filename_from_url(url)))
}

/// HTTP fetcher with a hard deadline and a byte cap.
#[derive(Debug, Clone)]
pub struct Downloader {
    client: Client,
    timeout: Duration,
    max_bytes: u64,
}

impl Default for Downloader {
    fn default() -> Self {
        Self::from_config(&DownloadConfig::default())
    }
}

impl Downloader {
    #[must_use]
    pub fn new(timeout: Duration, max_bytes: u64) -> Self {
        Self { client: Client::new(), timeout, max_bytes }
    }

    #[must_use]
    pub fn from_config(config: &DownloadConfig) -> Self {
        Self::new(config.timeout(), config.max_bytes)
    }

    #[must_use]
    pub const fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Downloads `url` into memory.
    ///
    /// Exceeding the deadline drops the transfer and discards whatever was received.
    ///
    /// # Errors
    /// [`StorageError::QuotaExceeded`] when the body exceeds the byte cap,
    /// [`StorageError::PermissionDenied`] for 401/403, and [`StorageError::OperationFailed`] for
    /// other statuses, transport failures and timeouts.
    #[instrument(skip(self, progress), fields(timeout = ?self.timeout, max_bytes = self.max_bytes))]
    pub async fn fetch(
        &self,
        url: &str,
        progress: Option<Progress<'_>>,
    ) -> Result<Payload, StorageError> {
        let payload = tokio::time::timeout(self.timeout, self.transfer(url, progress))
            .await
            .map_err(|_| StorageError::OperationFailed {
                message: format!("No complete response within {:?}", self.timeout).into(),
                context: Some(format!("Fetching {url}").into()),
                source: None,
            })??;

        info!(size = payload.size(), mime = ?payload.mime_type(), "Download complete");
        Ok(payload)
    }

    async fn transfer(
        &self,
        url: &str,
        progress: Option<Progress<'_>>,
    ) -> Result<Payload, StorageError> {
        let response = self.client.get(url).send().await.map_err(StorageError::from)?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, url));
        }

        let expected = response.content_length();
        if let Some(size) = expected.filter(|size| *size > self.max_bytes) {
            return Err(too_large(size, self.max_bytes));
        }

        let mime_type = response_mime(&response, url);
        let mut accumulator = ChunkAccumulator::new(self.max_bytes, expected);
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(StorageError::from)?;
            let (loaded, total) = accumulator.push(&chunk)?;
            if let Some(report) = progress {
                report(loaded, total);
            }
        }

        debug!(loaded = accumulator.loaded(), ?expected, "Response body received");
        Ok(Payload { bytes: accumulator.buffer, mime_type })
    }

    /// Downloads `url` and saves it under `id`, named after the last URL path segment.
    ///
    /// # Errors
    /// Any [`Downloader::fetch`] error, or the backend's save error.
    #[instrument(skip(self, storage, progress), fields(backend = %storage.storage_type()))]
    pub async fn download_and_store(
        &self,
        storage: &dyn FileStorage,
        url: &str,
        id: &str,
        progress: Option<Progress<'_>>,
    ) -> Result<StorageUri, StorageError> {
        let payload = self.fetch(url, progress).await?;
        let overrides = MetadataOverrides::default().name(filename_from_url(url));
        storage.save_file(id, payload, overrides).await.context(format!("Storing {url}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_is_last_path_segment() {
        assert_eq!(filename_from_url("https://cdn.example.com/media/clip.mp4?x=1"), "clip.mp4");
        assert_eq!(filename_from_url("https://cdn.example.com/"), "download");
        assert_eq!(filename_from_url("https://cdn.example.com/dir/"), "download");
        assert_eq!(filename_from_url("not a url"), "download");
    }

    #[test]
    fn accumulator_enforces_the_cap_while_streaming() {
        let mut acc = ChunkAccumulator::new(6, None);
        assert_eq!(acc.push(b"abcd").unwrap(), (4, 4));
        assert!(acc.push(b"efg").unwrap_err().is_quota_exceeded());
        assert_eq!(acc.loaded(), 4);
    }

    #[test]
    fn accumulator_reports_declared_total() {
        let mut acc = ChunkAccumulator::new(100, Some(10));
        assert_eq!(acc.push(b"abc").unwrap(), (3, 10));
    }

    #[test]
    fn statuses_map_onto_taxonomy() {
        let url = "https://example.com/a";
        assert!(status_error(StatusCode::FORBIDDEN, url).is_permission_denied());
        assert!(status_error(StatusCode::UNAUTHORIZED, url).is_permission_denied());
        assert!(status_error(StatusCode::PAYLOAD_TOO_LARGE, url).is_quota_exceeded());
        assert!(status_error(StatusCode::INSUFFICIENT_STORAGE, url).is_quota_exceeded());
        assert!(status_error(StatusCode::NOT_FOUND, url).is_operation_failed());
    }
}
