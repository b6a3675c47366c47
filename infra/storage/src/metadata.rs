use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// MIME type recorded when neither the caller nor the payload supplies one.
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Identifies a backend. The string forms are the stable wire names.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
pub enum StorageType {
    #[strum(serialize = "opfs")]
    #[serde(rename = "opfs")]
    Filesystem,
    #[strum(serialize = "indexeddb")]
    #[serde(rename = "indexeddb")]
    Database,
    #[strum(serialize = "memory")]
    #[serde(rename = "memory")]
    Memory,
}

/// An in-memory binary payload with an optional content type.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Payload {
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
}

impl Payload {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self { bytes: bytes.into(), mime_type: None }
    }

    pub fn typed(bytes: impl Into<Vec<u8>>, mime_type: impl Into<String>) -> Self {
        Self { bytes: bytes.into(), mime_type: Some(mime_type.into()) }
    }

    /// Builds a payload whose type is guessed from a file name extension.
    pub fn guessed(bytes: impl Into<Vec<u8>>, name: &str) -> Self {
        Self { bytes: bytes.into(), mime_type: guess_mime(name) }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        u64::try_from(self.bytes.len()).unwrap_or(u64::MAX)
    }

    #[must_use]
    pub fn mime_type(&self) -> Option<&str> {
        self.mime_type.as_deref().filter(|m| !m.is_empty())
    }
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Payload")
            .field("len", &self.bytes.len())
            .field("mime_type", &self.mime_type)
            .finish()
    }
}

/// Descriptive attributes of a stored file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

impl FileMetadata {
    /// Derives metadata for `payload` stored under `id`.
    ///
    /// `size` always comes from the payload. The name defaults to the id, the type falls back
    /// from the override to the payload and then to [`DEFAULT_MIME_TYPE`].
    pub(crate) fn derive(id: &str, payload: &Payload, overrides: MetadataOverrides) -> Self {
        let mime_type = overrides
            .mime_type
            .filter(|m| !m.is_empty())
            .or_else(|| payload.mime_type().map(ToOwned::to_owned))
            .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_owned());

        Self {
            name: overrides.name.unwrap_or_else(|| id.to_owned()),
            mime_type,
            size: payload.size(),
            created_at: overrides.created_at.unwrap_or_else(Utc::now),
        }
    }
}

/// Optional caller-supplied values for [`FileMetadata`]. `size` is never overridable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataOverrides {
    pub name: Option<String>,
    pub mime_type: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl MetadataOverrides {
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    #[must_use]
    pub const fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }
}

/// Listing projection of a stored file, without its payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub id: String,
    pub metadata: FileMetadata,
}

/// Bytes used by a backend and, when bounded, the bytes still available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageUsage {
    pub used: u64,
    pub available: Option<u64>,
}

impl StorageUsage {
    pub(crate) fn bounded(used: u64, limit: Option<u64>) -> Self {
        Self { used, available: limit.map(|limit| limit.saturating_sub(used)) }
    }
}

/// A payload together with its metadata, as held by backends that keep both in one place.
#[derive(Debug, Clone)]
pub(crate) struct StoredFile {
    pub payload: Payload,
    pub metadata: FileMetadata,
}

pub(crate) fn guess_mime(name: &str) -> Option<String> {
    mime_guess::from_path(name).first_raw().map(ToOwned::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::str::FromStr;

    #[test]
    fn metadata_defaults_come_from_id_and_payload() {
        let payload = Payload::typed(vec![0u8; 42], "image/png");
        let meta = FileMetadata::derive("cover.png", &payload, MetadataOverrides::default());

        assert_eq!(meta.name, "cover.png");
        assert_eq!(meta.mime_type, "image/png");
        assert_eq!(meta.size, 42);
    }

    #[test]
    fn overrides_win_except_for_size() {
        let when = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let payload = Payload::new(vec![1, 2, 3]);
        let overrides =
            MetadataOverrides::default().name("Holiday").mime_type("video/mp4").created_at(when);

        let meta = FileMetadata::derive("clip-7", &payload, overrides);
        assert_eq!(meta.name, "Holiday");
        assert_eq!(meta.mime_type, "video/mp4");
        assert_eq!(meta.created_at, when);
        assert_eq!(meta.size, 3);
    }

    #[test]
    fn untyped_payload_falls_back_to_octet_stream() {
        let payload = Payload::typed(b"raw".to_vec(), "");
        let meta = FileMetadata::derive("blob", &payload, MetadataOverrides::default());
        assert_eq!(meta.mime_type, DEFAULT_MIME_TYPE);
    }

    #[test]
    fn metadata_serializes_camel_case() {
        let meta = FileMetadata {
            name: "a".into(),
            mime_type: "image/jpeg".into(),
            size: 1,
            created_at: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["mimeType"], "image/jpeg");
        assert_eq!(json["createdAt"], "2024-01-02T03:04:05Z");
    }

    #[test]
    fn storage_type_wire_names() {
        assert_eq!(StorageType::Filesystem.to_string(), "opfs");
        assert_eq!(StorageType::Database.to_string(), "indexeddb");
        assert_eq!(StorageType::from_str("memory").ok(), Some(StorageType::Memory));
    }

    #[test]
    fn bounded_usage_saturates() {
        assert_eq!(StorageUsage::bounded(10, Some(4)).available, Some(0));
        assert_eq!(StorageUsage::bounded(10, None).available, None);
    }
}
