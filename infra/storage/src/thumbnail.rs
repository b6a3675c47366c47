//! Raster previews for image and video payloads.
//!
//! Every thumbnail is a JPEG whose longer side is at most `max_dimension` pixels. Generation never
//! fails loudly: unsupported inputs and decoder errors yield `None` and are logged at `debug`.

use crate::config::ThumbnailConfig;
use crate::error::StorageError;
use crate::metadata::Payload;
use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageError, ImageReader};
use std::fmt;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const THUMBNAIL_MIME: &str = "image/jpeg";
const SVG_MIME: &str = "image/svg+xml";
/// Frames are never captured closer than this to the end of a video.
const END_MARGIN: Duration = Duration::from_millis(100);

/// Scales `(width, height)` so the longer side fits in `max`, preserving aspect ratio.
///
/// Never upscales, and both sides are at least 1.
#[must_use]
pub fn dimensions(width: u32, height: u32, max: u32) -> (u32, u32) {
    let (width, height, max) = (width.max(1), height.max(1), max.max(1));
    if width <= max && height <= max {
        return (width, height);
    }

    let scale = |short: u32, long: u32| {
        let scaled = (u64::from(short) * u64::from(max) + u64::from(long) / 2) / u64::from(long);
        u32::try_from(scaled).unwrap_or(max).clamp(1, max)
    };

    if width >= height { (max, scale(height, width)) } else { (scale(width, height), max) }
}

/// Picks the capture offset for a video: the requested time, but no later than 10% of the
/// duration and never within the final 100 ms.
#[must_use]
pub fn capture_time(requested: Duration, duration: Duration) -> Duration {
    requested.min(duration / 10).min(duration.saturating_sub(END_MARGIN))
}

/// Supplies still frames from video payloads.
#[async_trait]
pub trait FrameSource: Send + Sync + fmt::Debug {
    async fn duration(&self, video: &Payload) -> Result<Duration, StorageError>;

    async fn frame_at(&self, video: &Payload, at: Duration) -> Result<DynamicImage, StorageError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceKind {
    Image,
    Video,
}

fn classify(payload: &Payload) -> Option<SourceKind> {
    match payload.mime_type() {
        Some(SVG_MIME) => None,
        Some(mime) if mime.starts_with("image/") => Some(SourceKind::Image),
        Some(mime) if mime.starts_with("video/") => Some(SourceKind::Video),
        Some(_) => None,
        None => image::guess_format(&payload.bytes).ok().map(|_| SourceKind::Image),
    }
}

/// Derives JPEG thumbnails from image and video payloads.
#[derive(Debug, Clone)]
pub struct ThumbnailGenerator {
    max_dimension: u32,
    jpeg_quality: u8,
    video_capture: Duration,
    frames: Option<Arc<dyn FrameSource>>,
}

impl Default for ThumbnailGenerator {
    fn default() -> Self {
        Self::new(&ThumbnailConfig::default())
    }
}

impl ThumbnailGenerator {
    /// Builds a generator from configuration, wired to the default frame source when the
    /// `video-thumbnails` feature is enabled.
    #[must_use]
    pub fn new(config: &ThumbnailConfig) -> Self {
        Self {
            max_dimension: config.max_dimension.max(1),
            jpeg_quality: config.jpeg_quality.clamp(1, 100),
            video_capture: config.video_capture(),
            frames: default_frame_source(),
        }
    }

    #[must_use]
    pub fn with_frame_source(mut self, frames: Arc<dyn FrameSource>) -> Self {
        self.frames = Some(frames);
        self
    }

    #[must_use]
    pub const fn max_dimension(&self) -> u32 {
        self.max_dimension
    }

    /// Returns a JPEG preview of `source`, or `None` if it cannot be produced.
    pub async fn generate(&self, source: &Payload) -> Option<Payload> {
        let kind = classify(source)?;
        let result = match kind {
            SourceKind::Image => self.from_image(source).await,
            SourceKind::Video => self.from_video(source).await,
        };

        result
            .inspect_err(|e| debug!(?kind, error = %e, "Thumbnail generation failed"))
            .ok()
    }

    async fn from_image(&self, source: &Payload) -> Result<Payload, StorageError> {
        let bytes = source.bytes.clone();
        let (max, quality) = (self.max_dimension, self.jpeg_quality);

        tokio::task::spawn_blocking(move || encode_thumbnail(&decode(&bytes)?, max, quality))
            .await
            .map_err(|e| StorageError::failed(format!("Thumbnail task failed: {e}")))?
    }

    async fn from_video(&self, source: &Payload) -> Result<Payload, StorageError> {
        let frames = self
            .frames
            .as_ref()
            .ok_or_else(|| StorageError::failed("No frame source configured"))?;

        let duration = frames.duration(source).await?;
        let at = capture_time(self.video_capture, duration);
        let frame = frames.frame_at(source, at).await?;
        debug!(?duration, ?at, "Captured video frame");

        let (max, quality) = (self.max_dimension, self.jpeg_quality);
        tokio::task::spawn_blocking(move || encode_thumbnail(&frame, max, quality))
            .await
            .map_err(|e| StorageError::failed(format!("Thumbnail task failed: {e}")))?
    }
}

fn image_error(err: ImageError, context: &'static str) -> StorageError {
    StorageError::InvalidData {
        message: err.to_string().into(),
        context: Some(context.into()),
        source: Some(Box::new(err)),
    }
}

fn decode(bytes: &[u8]) -> Result<DynamicImage, StorageError> {
    ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(StorageError::from)?
        .decode()
        .map_err(|e| image_error(e, "Decoding image"))
}

fn encode_thumbnail(image: &DynamicImage, max: u32, quality: u8) -> Result<Payload, StorageError> {
    let (width, height) = dimensions(image.width(), image.height(), max);
    let rgb = if (width, height) == (image.width(), image.height()) {
        image.to_rgb8()
    } else {
        image.resize_exact(width, height, FilterType::Triangle).to_rgb8()
    };

    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality)
        .encode_image(&rgb)
        .map_err(|e| image_error(e, "Encoding thumbnail"))?;

    Ok(Payload::typed(buffer, THUMBNAIL_MIME))
}

#[cfg(feature = "video-thumbnails")]
fn default_frame_source() -> Option<Arc<dyn FrameSource>> {
    Some(Arc::new(ffmpeg::FfmpegFrameSource::default()))
}

#[cfg(not(feature = "video-thumbnails"))]
fn default_frame_source() -> Option<Arc<dyn FrameSource>> {
    None
}

#[cfg(feature = "video-thumbnails")]
pub use ffmpeg::FfmpegFrameSource;

#[cfg(feature = "video-thumbnails")]
mod ffmpeg {
    use super::FrameSource;
    use crate::error::{IntoStorage, StorageError};
    use crate::metadata::Payload;
    use async_trait::async_trait;
    use image::{DynamicImage, ImageFormat};
    use std::path::PathBuf;
    use std::process::Output;
    use std::time::Duration;
    use tempfile::NamedTempFile;
    use tokio::process::Command;

    /// Frame source that shells out to `ffprobe` and `ffmpeg`.
    #[derive(Debug, Clone)]
    pub struct FfmpegFrameSource {
        ffmpeg: PathBuf,
        ffprobe: PathBuf,
    }

    impl Default for FfmpegFrameSource {
        fn default() -> Self {
            Self { ffmpeg: "ffmpeg".into(), ffprobe: "ffprobe".into() }
        }
    }

    impl FfmpegFrameSource {
        #[must_use]
        pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
            Self { ffmpeg: ffmpeg.into(), ffprobe: ffprobe.into() }
        }

        async fn stage(video: &Payload) -> Result<NamedTempFile, StorageError> {
            let staged = NamedTempFile::new().storage_context("Staging video")?;
            tokio::fs::write(staged.path(), &video.bytes).await.storage_context("Staging video")?;
            Ok(staged)
        }
    }

    fn check(output: Output, tool: &str) -> Result<Vec<u8>, StorageError> {
        if output.status.success() {
            Ok(output.stdout)
        } else {
            Err(StorageError::failed(format!(
                "{tool} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    #[async_trait]
    impl FrameSource for FfmpegFrameSource {
        async fn duration(&self, video: &Payload) -> Result<Duration, StorageError> {
            let staged = Self::stage(video).await?;
            let output = Command::new(&self.ffprobe)
                .args(["-v", "error", "-show_entries", "format=duration"])
                .args(["-of", "default=noprint_wrappers=1:nokey=1"])
                .arg(staged.path())
                .output()
                .await
                .storage_context("Running ffprobe")?;

            let stdout = check(output, "ffprobe")?;
            let text = String::from_utf8_lossy(&stdout);
            text.trim()
                .parse::<f64>()
                .ok()
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                .ok_or_else(|| StorageError::invalid(format!("Unreadable duration {text:?}")))
        }

        async fn frame_at(
            &self,
            video: &Payload,
            at: Duration,
        ) -> Result<DynamicImage, StorageError> {
            let staged = Self::stage(video).await?;
            let output = Command::new(&self.ffmpeg)
                .args(["-v", "error", "-ss", &format!("{:.3}", at.as_secs_f64()), "-i"])
                .arg(staged.path())
                .args(["-frames:v", "1", "-f", "image2pipe", "-vcodec", "png", "-"])
                .output()
                .await
                .storage_context("Running ffmpeg")?;

            let png = check(output, "ffmpeg")?;
            image::load_from_memory_with_format(&png, ImageFormat::Png)
                .map_err(|e| super::image_error(e, "Decoding captured frame"))
        }
    }
}
