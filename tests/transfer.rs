//! Transfer engine tests against wiremock servers.

use bytes::Bytes;
use hifi_dl::config::EngineConfig;
use hifi_dl::downloader::Downloader;
use hifi_dl::error::DownloadError;
use hifi_dl::progress::ProgressReporter;
use hifi_dl::store::{FsStore, MemoryStore, SessionHandle, SessionStore};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn engine(store: Arc<dyn SessionStore>, concurrency: usize) -> Downloader {
    let config = EngineConfig {
        concurrency,
        retry_delay_ms: 10,
        ..Default::default()
    };
    Downloader::new(config.http_client(), store, &config)
}

fn segment_body(index: usize) -> Vec<u8> {
    format!("<segment {index}>").into_bytes()
}

/// Mount `count` segments whose response delays shrink with the index, so
/// later segments of a window finish first.
async fn mount_segments(server: &MockServer, count: usize) -> Vec<String> {
    for i in 0..count {
        Mock::given(method("GET"))
            .and(path(format!("/seg/{i}")))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(segment_body(i))
                    .set_delay(Duration::from_millis(((count - i) * 15) as u64)),
            )
            .mount(server)
            .await;
    }
    (0..count).map(|i| format!("{}/seg/{i}", server.uri())).collect()
}

#[tokio::test]
async fn segments_merge_in_index_order_for_any_concurrency() {
    let temp_dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    let urls = mount_segments(&server, 7).await;
    let expected: Vec<u8> = (0..7).flat_map(segment_body).collect();

    for concurrency in 1..=7 {
        let store = Arc::new(MemoryStore::new(temp_dir.path()));
        let downloader = engine(store, concurrency);
        let session = SessionHandle::new("tmp", concurrency);
        let buffers = downloader
            .fetch_segments(
                &session,
                "",
                &urls,
                &CancellationToken::new(),
                &ProgressReporter::detached(),
                "Downloading",
            )
            .await
            .unwrap();

        assert_eq!(buffers.len(), urls.len());
        let merged: Vec<u8> = buffers.iter().flat_map(|b| b.to_vec()).collect();
        assert_eq!(merged, expected, "concurrency {concurrency}");
    }
}

#[tokio::test]
async fn failing_segment_is_retried_and_lands_at_its_index() {
    let temp_dir = TempDir::new().unwrap();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/seg/1"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    for i in 0..3 {
        Mock::given(method("GET"))
            .and(path(format!("/seg/{i}")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(segment_body(i)))
            .mount(&server)
            .await;
    }

    let urls: Vec<String> = (0..3).map(|i| format!("{}/seg/{i}", server.uri())).collect();
    let downloader = engine(Arc::new(FsStore::new(temp_dir.path())), 3);
    let buffers = downloader
        .fetch_segments(
            &SessionHandle::new("tmp", "42"),
            "",
            &urls,
            &CancellationToken::new(),
            &ProgressReporter::detached(),
            "Downloading",
        )
        .await
        .unwrap();

    assert_eq!(&buffers[1][..], &segment_body(1)[..]);
    let stored = std::fs::read(temp_dir.path().join("tmp/42/segment_0001")).unwrap();
    assert_eq!(stored, segment_body(1));
}

#[tokio::test]
async fn three_failures_surface_the_http_error() {
    let temp_dir = TempDir::new().unwrap();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/seg/0"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let downloader = engine(Arc::new(FsStore::new(temp_dir.path())), 2);
    let err = downloader
        .fetch_segments(
            &SessionHandle::new("tmp", "1"),
            "",
            &[format!("{}/seg/0", server.uri())],
            &CancellationToken::new(),
            &ProgressReporter::detached(),
            "Downloading",
        )
        .await
        .unwrap_err();

    assert!(matches!(err, DownloadError::HttpStatus { status, .. } if status.as_u16() == 500));
}

#[tokio::test]
async fn stored_segments_are_not_requested_again() {
    let temp_dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    let store = Arc::new(FsStore::new(temp_dir.path()));
    let session = SessionHandle::new("tmp", "7");
    store
        .append(&session.segment_key("", 0), b"cached init")
        .await
        .unwrap();

    Mock::given(method("GET"))
        .and(path("/seg/0"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"fresh".to_vec()))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/seg/1"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b" media".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let urls: Vec<String> = (0..2).map(|i| format!("{}/seg/{i}", server.uri())).collect();
    let buffers = engine(store, 5)
        .fetch_segments(
            &session,
            "",
            &urls,
            &CancellationToken::new(),
            &ProgressReporter::detached(),
            "Downloading",
        )
        .await
        .unwrap();
    assert_eq!(buffers, vec![Bytes::from_static(b"cached init"), Bytes::from_static(b" media")]);
}

#[tokio::test]
async fn cancelling_mid_window_starts_no_further_requests() {
    let temp_dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(b"slow".to_vec())
                .set_delay(Duration::from_millis(500)),
        )
        .mount(&server)
        .await;

    let urls: Vec<String> = (0..6).map(|i| format!("{}/seg/{i}", server.uri())).collect();
    let downloader = engine(Arc::new(MemoryStore::new(temp_dir.path())), 2);
    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let err = downloader
        .fetch_segments(
            &SessionHandle::new("tmp", "1"),
            "",
            &urls,
            &token,
            &ProgressReporter::detached(),
            "Downloading",
        )
        .await
        .unwrap_err();
    assert!(err.is_cancelled());

    tokio::time::sleep(Duration::from_millis(700)).await;
    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
}

#[tokio::test]
async fn complete_resource_transfers_nothing() {
    let temp_dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    let content = b"0123456789abcdef".to_vec();

    Mock::given(method("HEAD"))
        .and(path("/track.flac"))
        .respond_with(
            ResponseTemplate::new(200).insert_header("Content-Length", content.len().to_string()),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/track.flac"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(content.clone()))
        .expect(0)
        .mount(&server)
        .await;

    let store = Arc::new(FsStore::new(temp_dir.path()));
    let session = SessionHandle::new("tmp", "99");
    store.append(&session.resource_key("track"), &content).await.unwrap();

    let body = engine(store, 5)
        .fetch_resource(
            &session,
            "track",
            &format!("{}/track.flac", server.uri()),
            &CancellationToken::new(),
            &ProgressReporter::detached(),
            "Downloading",
        )
        .await
        .unwrap();
    assert_eq!(&body[..], &content[..]);
}

#[tokio::test]
async fn partial_resource_resumes_with_range_request() {
    let temp_dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    let content = b"0123456789abcdef".to_vec();

    Mock::given(method("HEAD"))
        .and(path("/track.flac"))
        .respond_with(
            ResponseTemplate::new(200).insert_header("Content-Length", content.len().to_string()),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/track.flac"))
        .and(header("Range", "bytes=6-"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(content[6..].to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(FsStore::new(temp_dir.path()));
    let session = SessionHandle::new("tmp", "5");
    store.append(&session.resource_key("track"), &content[..6]).await.unwrap();

    let body = engine(store.clone(), 5)
        .fetch_resource(
            &session,
            "track",
            &format!("{}/track.flac", server.uri()),
            &CancellationToken::new(),
            &ProgressReporter::detached(),
            "Downloading",
        )
        .await
        .unwrap();
    assert_eq!(&body[..], &content[..]);
}

#[tokio::test]
async fn ignored_range_restarts_from_zero() {
    let temp_dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    let content = b"the whole file".to_vec();

    Mock::given(method("HEAD"))
        .and(path("/track.flac"))
        .respond_with(
            ResponseTemplate::new(200).insert_header("Content-Length", content.len().to_string()),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/track.flac"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(content.clone()))
        .mount(&server)
        .await;

    let store = Arc::new(FsStore::new(temp_dir.path()));
    let session = SessionHandle::new("tmp", "3");
    store.append(&session.resource_key("track"), b"the ").await.unwrap();

    let body = engine(store, 5)
        .fetch_resource(
            &session,
            "track",
            &format!("{}/track.flac", server.uri()),
            &CancellationToken::new(),
            &ProgressReporter::detached(),
            "Downloading",
        )
        .await
        .unwrap();
    assert_eq!(&body[..], &content[..]);
}

#[tokio::test]
async fn fetch_optional_swallows_failures() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/cover.jpg"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let temp_dir = TempDir::new().unwrap();
    let downloader = engine(Arc::new(MemoryStore::new(temp_dir.path())), 1);
    let cover = downloader
        .fetch_optional(&format!("{}/cover.jpg", server.uri()), &CancellationToken::new())
        .await;
    assert!(cover.is_none());
}

#[tokio::test]
async fn memory_store_leftovers_never_prefix_a_new_body() {
    let temp_dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    let content = b"FULLFILE".to_vec();

    Mock::given(method("HEAD"))
        .and(path("/track.flac"))
        .respond_with(
            ResponseTemplate::new(200).insert_header("Content-Length", content.len().to_string()),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/track.flac"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(content.clone()))
        .mount(&server)
        .await;

    // An earlier attempt that died mid-stream.
    let store = Arc::new(MemoryStore::new(temp_dir.path()));
    let session = SessionHandle::new("tmp", "8");
    store.append(&session.resource_key("track"), b"FULL").await.unwrap();

    let body = engine(store.clone(), 2)
        .fetch_resource(
            &session,
            "track",
            &format!("{}/track.flac", server.uri()),
            &CancellationToken::new(),
            &ProgressReporter::detached(),
            "Downloading",
        )
        .await
        .unwrap();
    assert_eq!(&body[..], &content[..]);
    assert_eq!(store.buffered_keys(), 0);
}

/// Serves `content` with chunked encoding: the first `first` bytes right
/// away, then nothing until the client gives up. HEAD gets the full length.
async fn stalling_server(content: &'static [u8], first: usize) -> String {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else { return };
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                if request.starts_with(b"HEAD") {
                    let head = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        content.len()
                    );
                    let _ = socket.write_all(head.as_bytes()).await;
                    return;
                }
                let head = "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n";
                let chunk = format!("{:x}\r\n", first);
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(chunk.as_bytes()).await;
                let _ = socket.write_all(&content[..first]).await;
                let _ = socket.write_all(b"\r\n").await;
                let _ = socket.flush().await;
                tokio::time::sleep(Duration::from_secs(30)).await;
            });
        }
    });
    format!("http://{addr}/track.flac")
}

#[tokio::test]
async fn cancelled_stream_keeps_flushed_bytes_and_resumes_from_them() {
    const CONTENT: &[u8] = b"0123456789abcdefghijklmnopqrstuv";
    let temp_dir = TempDir::new().unwrap();
    let store = Arc::new(FsStore::new(temp_dir.path()));
    let session = SessionHandle::new("tmp", "21");
    let key = session.resource_key("track");

    let url = stalling_server(CONTENT, 10).await;
    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        canceller.cancel();
    });

    let err = engine(store.clone(), 2)
        .fetch_resource(&session, "track", &url, &token, &ProgressReporter::detached(), "Downloading")
        .await
        .unwrap_err();
    assert!(err.is_cancelled(), "got {err}");

    let stored = store.read_partial(&key).await.unwrap().unwrap_or_default();
    assert!(!stored.is_empty());
    assert_eq!(&stored[..], &CONTENT[..stored.len()]);

    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/track.flac"))
        .respond_with(
            ResponseTemplate::new(200).insert_header("Content-Length", CONTENT.len().to_string()),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/track.flac"))
        .and(header("Range", format!("bytes={}-", stored.len()).as_str()))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(CONTENT[stored.len()..].to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let body: Bytes = engine(store, 2)
        .fetch_resource(
            &session,
            "track",
            &format!("{}/track.flac", server.uri()),
            &CancellationToken::new(),
            &ProgressReporter::detached(),
            "Downloading",
        )
        .await
        .unwrap();
    assert_eq!(&body[..], CONTENT);
}
