use lumen_storage::*;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn downloader() -> Downloader {
    Downloader::new(Duration::from_secs(5), 1024)
}

async fn serve(route: &str, response: ResponseTemplate) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET")).and(path(route)).respond_with(response).mount(&server).await;
    server
}

/// Answers one request with a chunked body and no `Content-Length`.
async fn serve_chunked(chunks: usize, chunk_len: usize) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = [0u8; 2048];
        let _ = socket.read(&mut request).await;

        let head = "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nTransfer-Encoding: chunked\r\n\r\n";
        let mut response = head.as_bytes().to_vec();
        for _ in 0..chunks {
            response.extend_from_slice(format!("{chunk_len:x}\r\n").as_bytes());
            response.extend(std::iter::repeat_n(b'x', chunk_len));
            response.extend_from_slice(b"\r\n");
        }
        response.extend_from_slice(b"0\r\n\r\n");
        // The client hangs up once it gives up on the body.
        let _ = socket.write_all(&response).await;
        let _ = socket.shutdown().await;
    });

    format!("http://{addr}/stream.bin")
}

#[tokio::test]
async fn fetch_reports_progress_and_content_type() {
    let body = vec![42u8; 600];
    let server =
        serve("/media/cover", ResponseTemplate::new(200).set_body_raw(body.clone(), "image/webp")).await;

    let seen = Mutex::new(Vec::new());
    let report = |loaded: u64, total: u64| seen.lock().push((loaded, total));

    let payload =
        downloader().fetch(&format!("{}/media/cover", server.uri()), Some(&report)).await.unwrap();

    assert_eq!(payload.bytes, body);
    assert_eq!(payload.mime_type(), Some("image/webp"));

    let seen = seen.into_inner();
    assert!(!seen.is_empty());
    assert_eq!(seen.last(), Some(&(600, 600)));
    assert!(seen.windows(2).all(|w| w[0].0 <= w[1].0), "progress is monotonic");
}

#[tokio::test]
async fn generic_content_type_falls_back_to_the_url() {
    let server = serve("/clips/intro.mp4", ResponseTemplate::new(200).set_body_bytes(vec![1u8; 8])).await;

    let payload = downloader().fetch(&format!("{}/clips/intro.mp4", server.uri()), None).await.unwrap();
    assert_eq!(payload.mime_type(), Some("video/mp4"));
}

#[tokio::test]
async fn oversized_bodies_are_rejected() {
    let server = serve("/huge.bin", ResponseTemplate::new(200).set_body_bytes(vec![0u8; 2048])).await;

    let err = downloader().fetch(&format!("{}/huge.bin", server.uri()), None).await.unwrap_err();
    assert!(err.is_quota_exceeded(), "{err}");
}

#[tokio::test]
async fn bodies_without_a_length_are_capped_while_streaming() {
    let within = downloader().fetch(&serve_chunked(3, 256).await, None).await.unwrap();
    assert_eq!(within.bytes.len(), 768);

    let err = downloader().fetch(&serve_chunked(8, 256).await, None).await.unwrap_err();
    assert!(err.is_quota_exceeded(), "{err}");
}

#[tokio::test]
async fn http_statuses_map_onto_error_kinds() {
    let cases: [(u16, StorageErrorKind); 5] = [
        (403, StorageErrorKind::PermissionDenied),
        (401, StorageErrorKind::PermissionDenied),
        (413, StorageErrorKind::QuotaExceeded),
        (404, StorageErrorKind::OperationFailed),
        (500, StorageErrorKind::OperationFailed),
    ];

    for (status, kind) in cases {
        let server = serve("/status", ResponseTemplate::new(status)).await;
        let err = downloader().fetch(&format!("{}/status", server.uri()), None).await.unwrap_err();
        assert_eq!(err.kind(), kind, "status {status}");
    }
}

#[tokio::test]
async fn slow_servers_time_out() {
    let server = serve(
        "/slow",
        ResponseTemplate::new(200).set_body_bytes(vec![1u8; 4]).set_delay(Duration::from_secs(2)),
    )
    .await;

    let downloader = Downloader::new(Duration::from_millis(100), 1024);
    let err = downloader.fetch(&format!("{}/slow", server.uri()), None).await.unwrap_err();
    assert!(err.is_operation_failed(), "{err}");
}

#[tokio::test]
async fn unreachable_hosts_fail_as_operations() {
    let err = downloader().fetch("http://127.0.0.1:9/unreachable", None).await.unwrap_err();
    assert!(err.is_operation_failed(), "{err}");
}

#[tokio::test]
async fn download_and_store_names_the_file_after_the_url() {
    let server =
        serve("/albums/summer/beach.png", ResponseTemplate::new(200).set_body_raw(b"png".to_vec(), "image/png"))
            .await;

    let storage = MemoryStorage::default();
    let url = format!("{}/albums/summer/beach.png", server.uri());
    let uri = downloader().download_and_store(&storage, &url, "beach", None).await.unwrap();
    assert_eq!(uri.to_string(), "memory://beach");

    let files = storage.list_files().await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].metadata.name, "beach.png");
    assert_eq!(files[0].metadata.mime_type, "image/png");
    assert_eq!(files[0].metadata.size, 3);
}
