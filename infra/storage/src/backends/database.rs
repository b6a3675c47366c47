//! Structured database backend (wire name `indexeddb`, URI scheme `idb`) on top of SurrealDB.
//!
//! Any engine reachable through `surrealdb::engine::any` works; `mem://` is always compiled in
//! and `rocksdb://` is available with the `database-rocksdb` feature. Payloads are stored
//! base64-encoded next to their metadata and looked up by `key`.

use crate::blob::{BlobRegistry, Namespace, ObjectUrl, UrlCache};
use crate::config::DatabaseConfig;
use crate::contract::FileStorage;
use crate::error::{Cause, IntoStorage, StorageError};
use crate::metadata::{
    FileInfo, FileMetadata, MetadataOverrides, Payload, StorageType, StorageUsage,
};
use crate::uri::{StorageUri, UriScheme};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, SecondsFormat, Utc};
use std::sync::Arc;
use surrealdb::Surreal;
use surrealdb::engine::any::{Any, connect};
use surrealdb::types::SurrealValue;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument};

/// Version recorded in `meta:schema` after the schema has been applied.
pub const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = "
    DEFINE TABLE IF NOT EXISTS files SCHEMALESS;
    DEFINE INDEX IF NOT EXISTS files_key ON TABLE files FIELDS key UNIQUE;
    DEFINE INDEX IF NOT EXISTS files_mime_type ON TABLE files FIELDS metadata.mime_type;
    DEFINE INDEX IF NOT EXISTS files_created_at ON TABLE files FIELDS metadata.created_at;
    DEFINE TABLE IF NOT EXISTS thumbnails SCHEMALESS;
    DEFINE INDEX IF NOT EXISTS thumbnails_key ON TABLE thumbnails FIELDS key UNIQUE;
    UPSERT meta:schema SET version = $version;
";

const QUOTA_MARKERS: [&str; 4] = ["quota", "no space left", "disk full", "storage full"];

#[derive(Debug, Clone, SurrealValue)]
struct MetadataRecord {
    name: String,
    mime_type: String,
    size: i64,
    created_at: String,
}

#[derive(Debug, SurrealValue)]
struct FileRecord {
    key: String,
    payload: String,
    metadata: MetadataRecord,
}

#[derive(Debug, SurrealValue)]
struct ListedRecord {
    key: String,
    metadata: MetadataRecord,
}

#[derive(Debug, SurrealValue)]
struct ThumbnailRecord {
    key: String,
    payload: String,
    mime_type: Option<String>,
}

impl From<&FileMetadata> for MetadataRecord {
    fn from(meta: &FileMetadata) -> Self {
        Self {
            name: meta.name.clone(),
            mime_type: meta.mime_type.clone(),
            size: i64::try_from(meta.size).unwrap_or(i64::MAX),
            created_at: meta.created_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}

impl TryFrom<MetadataRecord> for FileMetadata {
    type Error = StorageError;

    fn try_from(record: MetadataRecord) -> Result<Self, Self::Error> {
        let created_at = DateTime::parse_from_rfc3339(&record.created_at)
            .map_err(|e| StorageError::InvalidData {
                message: format!("Bad timestamp {:?}", record.created_at).into(),
                context: Some(format!("Decoding metadata for {}", record.name).into()),
                source: Some(Box::new(e)),
            })?
            .with_timezone(&Utc);

        Ok(Self {
            name: record.name,
            mime_type: record.mime_type,
            size: u64::try_from(record.size).unwrap_or_default(),
            created_at,
        })
    }
}

impl From<surrealdb::Error> for StorageError {
    fn from(err: surrealdb::Error) -> Self {
        let message = err.to_string();
        let lowered = message.to_lowercase();
        let source: Option<Cause> = Some(Box::new(err));

        if QUOTA_MARKERS.iter().any(|marker| lowered.contains(marker)) {
            Self::QuotaExceeded { message: message.into(), context: None, source }
        } else {
            Self::OperationFailed { message: message.into(), context: None, source }
        }
    }
}

fn decode_payload(encoded: &str, key: &str) -> Result<Vec<u8>, StorageError> {
    STANDARD.decode(encoded).map_err(|e| StorageError::InvalidData {
        message: e.to_string().into(),
        context: Some(format!("Decoding payload for {key}").into()),
        source: Some(Box::new(e)),
    })
}

#[derive(Debug)]
struct DatabaseInner {
    url: String,
    namespace: String,
    database: String,
    db: OnceCell<Surreal<Any>>,
    urls: UrlCache,
}

impl Drop for DatabaseInner {
    fn drop(&mut self) {
        if self.db.initialized() {
            debug!(ns = %self.namespace, db = %self.database, "Database storage handle dropped");
        }
    }
}

/// SurrealDB implementation of [`FileStorage`]. Cheap to clone.
#[derive(Debug, Clone)]
pub struct DatabaseStorage {
    inner: Arc<DatabaseInner>,
}

impl DatabaseStorage {
    #[must_use]
    pub fn new(
        url: impl Into<String>,
        namespace: impl Into<String>,
        database: impl Into<String>,
        registry: BlobRegistry,
    ) -> Self {
        Self {
            inner: Arc::new(DatabaseInner {
                url: url.into(),
                namespace: namespace.into(),
                database: database.into(),
                db: OnceCell::new(),
                urls: UrlCache::new(registry, StorageType::Database.into()),
            }),
        }
    }

    /// Returns `None` when no URL is configured.
    #[must_use]
    pub fn from_config(config: &DatabaseConfig, registry: BlobRegistry) -> Option<Self> {
        let url = config.url.as_deref()?;
        Some(Self::new(url, config.namespace.clone(), config.database.clone(), registry))
    }

    /// Capability probe: a URL is configured and its engine is compiled into this build.
    #[must_use]
    pub fn is_supported(config: &DatabaseConfig) -> bool {
        config.url.as_deref().is_some_and(|url| {
            let scheme = url.split_once("://").map_or(url, |(scheme, _)| scheme);
            match scheme {
                "mem" | "memory" => true,
                "rocksdb" => cfg!(feature = "database-rocksdb"),
                _ => false,
            }
        })
    }

    async fn db(&self) -> Result<&Surreal<Any>, StorageError> {
        self.inner.db.get_or_try_init(|| self.connect()).await
    }

    #[instrument(skip(self), fields(url = %self.inner.url, ns = %self.inner.namespace, db = %self.inner.database))]
    async fn connect(&self) -> Result<Surreal<Any>, StorageError> {
        let inner = &self.inner;

        let instance = connect(inner.url.as_str())
            .await
            .map_err(|e| StorageError::init_failed("Initializing engine", e))?;

        instance
            .use_ns(&inner.namespace)
            .use_db(&inner.database)
            .await
            .map_err(|e| StorageError::init_failed("Activating session", e))?;

        instance
            .query(SCHEMA)
            .bind(("version", SCHEMA_VERSION))
            .await
            .and_then(|response| response.check().map_err(surrealdb::Error::from))
            .map_err(|e| StorageError::init_failed("Applying schema", e))?;

        info!(version = SCHEMA_VERSION, "Database storage ready");
        Ok(instance)
    }

    async fn upsert(
        &self,
        table: &'static str,
        key: &str,
        record: impl SurrealValue + Send + 'static,
    ) -> Result<(), StorageError> {
        let query = format!(
            "BEGIN TRANSACTION;
            DELETE {table} WHERE key = $key;
            CREATE {table} CONTENT $record;
            COMMIT TRANSACTION;"
        );

        self.db()
            .await?
            .query(query)
            .bind(("key", key.to_owned()))
            .bind(("record", record))
            .await?
            .check()
            .map_err(surrealdb::Error::from)?;
        Ok(())
    }
}

#[async_trait]
impl FileStorage for DatabaseStorage {
    async fn initialize(&self) -> Result<(), StorageError> {
        self.db().await.map(|_| ())
    }

    fn is_available(&self) -> bool {
        self.inner.db.initialized()
    }

    fn storage_type(&self) -> StorageType {
        StorageType::Database
    }

    async fn save_file(
        &self,
        id: &str,
        payload: Payload,
        overrides: MetadataOverrides,
    ) -> Result<StorageUri, StorageError> {
        let metadata = FileMetadata::derive(id, &payload, overrides);
        let record = FileRecord {
            key: id.to_owned(),
            payload: STANDARD.encode(&payload.bytes),
            metadata: MetadataRecord::from(&metadata),
        };

        self.upsert("files", id, record).await.storage_context(format!("Saving {id}"))?;
        self.inner.urls.evict(Namespace::Files, id);

        debug!(id, size = metadata.size, "File saved");
        Ok(StorageUri::new(UriScheme::Idb, id))
    }

    async fn get_file(&self, id: &str) -> Result<Option<Payload>, StorageError> {
        let records = self
            .db()
            .await?
            .query("SELECT key, payload, metadata FROM files WHERE key = $key LIMIT 1")
            .bind(("key", id.to_owned()))
            .await
            .storage_context(format!("Reading {id}"))?
            .take::<Vec<FileRecord>>(0)
            .storage_context(format!("Decoding {id}"))?;

        let Some(record) = records.into_iter().next() else {
            return Ok(None);
        };
        let bytes = decode_payload(&record.payload, &record.key)?;
        Ok(Some(Payload { bytes, mime_type: Some(record.metadata.mime_type) }))
    }

    async fn get_file_url(&self, id: &str) -> Result<Option<ObjectUrl>, StorageError> {
        self.inner.urls.resolve(Namespace::Files, id, || self.get_file(id)).await
    }

    async fn delete_file(&self, id: &str) -> Result<(), StorageError> {
        self.db()
            .await?
            .query("DELETE files WHERE key = $key; DELETE thumbnails WHERE key = $key;")
            .bind(("key", id.to_owned()))
            .await?
            .check()
            .map_err(surrealdb::Error::from)
            .storage_context(format!("Deleting {id}"))?;

        self.inner.urls.evict(Namespace::Files, id);
        self.inner.urls.evict(Namespace::Thumbnails, id);
        debug!(id, "File deleted");
        Ok(())
    }

    async fn list_files(&self) -> Result<Vec<FileInfo>, StorageError> {
        let records = self
            .db()
            .await?
            .query("SELECT key, metadata FROM files ORDER BY key")
            .await
            .storage_context("Listing files")?
            .take::<Vec<ListedRecord>>(0)
            .storage_context("Decoding listing")?;

        records
            .into_iter()
            .map(|record| {
                Ok(FileInfo { id: record.key, metadata: FileMetadata::try_from(record.metadata)? })
            })
            .collect()
    }

    async fn storage_usage(&self) -> Result<StorageUsage, StorageError> {
        let used = self
            .db()
            .await?
            .query("RETURN math::sum((SELECT VALUE metadata.size FROM files))")
            .await
            .storage_context("Measuring usage")?
            .take::<Option<i64>>(0)
            .storage_context("Decoding usage")?
            .unwrap_or_default();

        Ok(StorageUsage { used: u64::try_from(used).unwrap_or_default(), available: None })
    }

    async fn clear_all(&self) -> Result<(), StorageError> {
        self.db()
            .await?
            .query("DELETE files; DELETE thumbnails;")
            .await?
            .check()
            .map_err(surrealdb::Error::from)
            .storage_context("Clearing tables")?;

        self.inner.urls.clear();
        info!("Database storage cleared");
        Ok(())
    }

    async fn save_thumbnail(&self, id: &str, payload: Payload) -> Result<ObjectUrl, StorageError> {
        let record = ThumbnailRecord {
            key: id.to_owned(),
            payload: STANDARD.encode(&payload.bytes),
            mime_type: payload.mime_type.clone(),
        };
        self.upsert("thumbnails", id, record)
            .await
            .storage_context(format!("Saving thumbnail {id}"))?;

        debug!(id, bytes = payload.len(), "Thumbnail saved");
        Ok(self.inner.urls.replace(Namespace::Thumbnails, id, payload))
    }

    async fn get_thumbnail(&self, id: &str) -> Result<Option<Payload>, StorageError> {
        let records = self
            .db()
            .await?
            .query("SELECT key, payload, mime_type FROM thumbnails WHERE key = $key LIMIT 1")
            .bind(("key", id.to_owned()))
            .await
            .storage_context(format!("Reading thumbnail {id}"))?
            .take::<Vec<ThumbnailRecord>>(0)
            .storage_context(format!("Decoding thumbnail {id}"))?;

        records
            .into_iter()
            .next()
            .map(|record| {
                decode_payload(&record.payload, &record.key)
                    .map(|bytes| Payload { bytes, mime_type: record.mime_type })
            })
            .transpose()
    }

    fn revoke_url(&self, url: &str) {
        self.inner.urls.purge_handle(url);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: Option<&str>) -> DatabaseConfig {
        DatabaseConfig { url: url.map(ToOwned::to_owned), ..DatabaseConfig::default() }
    }

    #[test]
    fn capability_probe_checks_compiled_engines() {
        assert!(DatabaseStorage::is_supported(&config(Some("mem://"))));
        assert!(!DatabaseStorage::is_supported(&config(Some("tikv://cluster:2379"))));
        assert!(!DatabaseStorage::is_supported(&config(None)));
        assert_eq!(
            DatabaseStorage::is_supported(&config(Some("rocksdb:///var/lib/lumen"))),
            cfg!(feature = "database-rocksdb")
        );
    }

    #[test]
    fn metadata_records_keep_timestamps() {
        let meta = FileMetadata {
            name: "a.png".into(),
            mime_type: "image/png".into(),
            size: 12,
            created_at: Utc::now(),
        };
        let record = MetadataRecord::from(&meta);
        let back = FileMetadata::try_from(record).unwrap();
        assert_eq!(back.size, 12);
        assert_eq!(back.created_at.timestamp_millis(), meta.created_at.timestamp_millis());
    }

    #[test]
    fn bad_timestamp_is_invalid_data() {
        let record = MetadataRecord {
            name: "x".into(),
            mime_type: "text/plain".into(),
            size: 1,
            created_at: "yesterday".into(),
        };
        assert!(FileMetadata::try_from(record).unwrap_err().is_invalid_data());
    }

    #[tokio::test]
    async fn schema_version_is_recorded() {
        let storage = DatabaseStorage::new("mem://", "lumen", "schema_test", BlobRegistry::new());
        storage.initialize().await.unwrap();
        assert!(storage.is_available());

        let version = storage
            .db()
            .await
            .unwrap()
            .query("RETURN meta:schema.version")
            .await
            .unwrap()
            .take::<Option<i64>>(0)
            .unwrap();
        assert_eq!(version, Some(SCHEMA_VERSION));
    }
}
