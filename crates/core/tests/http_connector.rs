mod common;

use std::sync::Arc;

use common::{MockResponse, pattern, spawn_http};
use serde_json::json;
use tgrelay_core::{
    ByteRange, CancelFlag, ChatTransport, Connector, Error, HttpConnector, HttpConnectorConfig,
    LogStatusSink, MediaKind, ProgressReporter, PullSource, RetryPolicy, SourceLength, Strategy,
    TelegramBotApi, TelegramBotApiTransport, TransferAdapter, TransferRequest,
};

#[tokio::test]
async fn range_and_strategy_headers_reach_the_server() {
    let (base, requests) = spawn_http(|_| {
        MockResponse::bytes(206, pattern(100, 50))
            .header("Accept-Ranges", "bytes")
            .header("Content-Range", "bytes 100-149/1000")
    })
    .await;

    let connector = HttpConnector::new(HttpConnectorConfig::default());
    let strategy = Strategy::named("with-referer").with_header("Referer", "https://video.example/");
    let mut conn = connector
        .connect(&format!("{base}/file.bin"), &strategy, ByteRange::span(100, 149))
        .await
        .unwrap();

    assert_eq!(conn.status(), 206);
    assert_eq!(conn.content_length(), Some(50));
    assert!(conn.accepts_ranges());

    let mut body = Vec::new();
    while let Some(chunk) = conn.next_chunk().await.unwrap() {
        body.extend_from_slice(&chunk);
    }
    assert_eq!(body, pattern(100, 50));
    assert_eq!(conn.content_length(), Some(50));

    let recorded = requests.lock().unwrap().clone();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].method, "GET");
    assert_eq!(recorded[0].path, "/file.bin");
    assert_eq!(recorded[0].header("range"), Some("bytes=100-149"));
    assert_eq!(recorded[0].header("referer"), Some("https://video.example/"));
    assert!(recorded[0].header("user-agent").unwrap().starts_with("Mozilla/5.0"));
}

#[tokio::test]
async fn full_request_sends_no_range_header() {
    let (base, requests) = spawn_http(|_| MockResponse::bytes(200, b"hello".to_vec())).await;

    let connector = HttpConnector::new(HttpConnectorConfig::default());
    let conn = connector
        .connect(&format!("{base}/a"), &Strategy::direct(), ByteRange::full())
        .await
        .unwrap();
    assert_eq!(conn.status(), 200);
    assert!(!conn.accepts_ranges());
    drop(conn);

    assert!(requests.lock().unwrap()[0].header("range").is_none());
}

#[tokio::test]
async fn adapter_streams_over_http() {
    let (base, _requests) = spawn_http(|_| MockResponse::bytes(200, pattern(0, 200_000))).await;

    let mut a = TransferAdapter::new(
        Arc::new(HttpConnector::new(HttpConnectorConfig::default())),
        RetryPolicy::direct(),
        TransferRequest::new(format!("{base}/big.bin"), "big.bin", 150_000),
        CancelFlag::new(),
    );

    let mut out = Vec::new();
    loop {
        let chunk = a.read(32 * 1024).await.unwrap();
        if chunk.is_empty() {
            break;
        }
        out.extend_from_slice(&chunk);
    }
    assert_eq!(out, pattern(0, 150_000));
    assert!(a.state().truncated());
    assert_eq!(a.state().total_size(), Some(200_000));
}

#[tokio::test]
async fn http_errors_exhaust_the_policy() {
    let (base, requests) = spawn_http(|req| {
        if req.header("x-route") == Some("b") {
            MockResponse::bytes(200, b"ok".to_vec())
        } else {
            MockResponse::bytes(403, b"forbidden".to_vec())
        }
    })
    .await;

    let policy = RetryPolicy::new(vec![
        Strategy::direct(),
        Strategy::named("route-b").with_header("X-Route", "b"),
    ])
    .unwrap();
    let mut a = TransferAdapter::new(
        Arc::new(HttpConnector::new(HttpConnectorConfig::default())),
        policy.clone(),
        TransferRequest::new(format!("{base}/x"), "x", 1024),
        CancelFlag::new(),
    );
    a.open().await.unwrap();
    assert_eq!(a.adopted_strategy().unwrap().name, "route-b");
    assert_eq!(&a.read(10).await.unwrap()[..], b"ok");
    assert_eq!(requests.lock().unwrap().len(), 2);

    let mut b = TransferAdapter::new(
        Arc::new(HttpConnector::new(HttpConnectorConfig::default())),
        RetryPolicy::direct(),
        TransferRequest::new(format!("{base}/x"), "x", 1024),
        CancelFlag::new(),
    );
    assert!(matches!(
        b.open().await,
        Err(Error::ResolutionExhausted { attempts: 1 })
    ));
}

#[tokio::test]
async fn declared_length_is_kept_after_the_first_read() {
    let (base, _requests) = spawn_http(|_| MockResponse::bytes(200, pattern(0, 200_000))).await;

    let mut a = TransferAdapter::new(
        Arc::new(HttpConnector::new(HttpConnectorConfig::default())),
        RetryPolicy::direct(),
        TransferRequest::new(format!("{base}/clip.mp4"), "clip.mp4", 1_000_000),
        CancelFlag::new(),
    );
    a.open().await.unwrap();
    assert_eq!(a.length(), SourceLength::Declared(200_000));

    let mut delivered = 0u64;
    loop {
        let chunk = a.read(16 * 1024).await.unwrap();
        if chunk.is_empty() {
            break;
        }
        delivered += chunk.len() as u64;
    }
    assert_eq!(delivered, 200_000);
    assert_eq!(a.state().total_size(), Some(200_000));
    assert!(!a.state().truncated());
}

#[tokio::test]
async fn relayed_upload_carries_every_byte_to_the_bot_api() {
    let payload = pattern(0, 200_000);
    let served = payload.clone();
    let (files, _) = spawn_http(move |_| MockResponse::bytes(200, served.clone())).await;
    let (bot, uploads) = spawn_http(|_| {
        MockResponse::json(
            200,
            json!({"ok": true, "result": {"message_id": 9, "video": {"file_id": "BAAC"}}}),
        )
    })
    .await;

    let mut source = TransferAdapter::new(
        Arc::new(HttpConnector::new(HttpConnectorConfig::default())),
        RetryPolicy::direct(),
        TransferRequest::new(format!("{files}/clip.mp4"), "clip.mp4", 1_000_000),
        CancelFlag::new(),
    );
    let transport = TelegramBotApiTransport::new(Arc::new(
        TelegramBotApi::new(bot.as_str(), "123456:test-token").unwrap(),
    ))
    .with_chunk_bytes(32 * 1024);
    let mut progress = ProgressReporter::new("clip.mp4", Arc::new(LogStatusSink), CancelFlag::new());

    let sent = transport
        .send("42", &mut source, MediaKind::Video, "", &mut progress)
        .await
        .unwrap();
    assert_eq!(sent.bytes, 200_000);

    let recorded = uploads.lock().unwrap().clone();
    assert_eq!(recorded.len(), 1);
    let body = &recorded[0].body;
    assert!(
        body.windows(payload.len()).any(|w| w == payload.as_slice()),
        "whole payload present"
    );
    let boundary = recorded[0]
        .header("content-type")
        .and_then(|v| v.split("boundary=").nth(1))
        .unwrap()
        .to_string();
    assert!(
        body.ends_with(format!("--{boundary}--\r\n").as_bytes()),
        "closing boundary present"
    );
}
