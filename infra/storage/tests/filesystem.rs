use lumen_storage::*;
use tempfile::TempDir;

const CHUNK: usize = 4 * 1024;

fn storage(root: &std::path::Path) -> FilesystemStorage {
    FilesystemStorage::builder().root(root).chunk_size(CHUNK).build().unwrap()
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| u8::try_from(i % 251).unwrap()).collect()
}

#[tokio::test]
async fn chunked_writes_round_trip() {
    let temp = TempDir::new().unwrap();
    let storage = storage(temp.path());
    let bytes = patterned(6 * CHUNK + 17);

    storage
        .save_file("movie.mp4", Payload::guessed(bytes.clone(), "movie.mp4"), MetadataOverrides::default())
        .await
        .unwrap();

    let read = storage.get_file("movie.mp4").await.unwrap().unwrap();
    assert_eq!(read.bytes, bytes);
    assert_eq!(read.mime_type(), Some("video/mp4"));

    let on_disk = std::fs::metadata(storage.base_dir().join("assets").join("movie.mp4")).unwrap();
    assert_eq!(on_disk.len(), bytes.len() as u64);
}

#[tokio::test]
async fn index_survives_reopening() {
    let temp = TempDir::new().unwrap();
    {
        let first = storage(temp.path());
        first
            .save_file("notes", Payload::typed(b"n".to_vec(), "text/plain"), MetadataOverrides::default().name("Notes"))
            .await
            .unwrap();
    }

    let reopened = storage(temp.path());
    let files = reopened.list_files().await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].metadata.name, "Notes");
    assert_eq!(files[0].metadata.mime_type, "text/plain");
}

#[tokio::test]
async fn traversal_ids_are_rejected() {
    let temp = TempDir::new().unwrap();
    let storage = storage(temp.path());

    for id in ["../escape", "a/b", "..", "", "x\\y"] {
        let err = storage
            .save_file(id, Payload::new(b"x".to_vec()), MetadataOverrides::default())
            .await
            .unwrap_err();
        assert!(err.is_invalid_data(), "{id:?}: {err}");
    }
    assert!(!temp.path().join("escape").exists());
}

#[tokio::test]
async fn quota_limits_stored_bytes() {
    let temp = TempDir::new().unwrap();
    let storage = FilesystemStorage::builder().root(temp.path()).quota(Some(100)).build().unwrap();

    storage.save_file("a", Payload::new(vec![0; 60]), MetadataOverrides::default()).await.unwrap();
    let err = storage
        .save_file("b", Payload::new(vec![0; 60]), MetadataOverrides::default())
        .await
        .unwrap_err();
    assert!(err.is_quota_exceeded());

    let usage = storage.storage_usage().await.unwrap();
    assert_eq!(usage.available, Some(40));
    assert!(storage.get_file("b").await.unwrap().is_none());
}

#[tokio::test]
async fn usage_reports_free_space_without_a_quota() {
    let temp = TempDir::new().unwrap();
    let storage = storage(temp.path());
    storage.save_file("a", Payload::new(vec![0; 64]), MetadataOverrides::default()).await.unwrap();

    let usage = storage.storage_usage().await.unwrap();
    assert_eq!(usage.used, 64);
    assert!(usage.available.is_some(), "free space comes from the volume holding the root");
}
