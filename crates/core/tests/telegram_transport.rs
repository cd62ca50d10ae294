mod common;

use std::sync::Arc;

use common::{MockResponse, pattern, spawn_http};
use serde_json::json;
use tgrelay_core::{
    CancelFlag, ChatTransport, CobaltResolver, Error, LinkResolver, MediaKind, MemorySource,
    ProgressReporter, StatusSink, TelegramBotApi, TelegramBotApiTransport, TelegramStatusMessage,
};

const TOKEN: &str = "123456:test-token";

fn api(base: &str) -> Arc<TelegramBotApi> {
    Arc::new(TelegramBotApi::new(base, TOKEN).unwrap())
}

fn reporter() -> ProgressReporter {
    ProgressReporter::new(
        "clip.mp4",
        Arc::new(tgrelay_core::LogStatusSink),
        CancelFlag::new(),
    )
}

#[tokio::test]
async fn send_video_streams_a_multipart_body() {
    let (base, requests) = spawn_http(|_| {
        MockResponse::json(
            200,
            json!({"ok": true, "result": {"message_id": 77, "video": {"file_id": "BAAC-video"}}}),
        )
    })
    .await;

    let transport = TelegramBotApiTransport::new(api(&base)).with_chunk_bytes(4096);
    let payload = pattern(0, 20_000);
    let mut source = MemorySource::new("clip.mp4", payload.clone());
    let mut progress = reporter();

    let sent = transport
        .send("-100555", &mut source, MediaKind::Video, "a caption", &mut progress)
        .await
        .unwrap();

    assert_eq!(sent.message_id, 77);
    assert_eq!(sent.kind, MediaKind::Video);
    assert_eq!(sent.file_id.as_deref(), Some("BAAC-video"));
    assert_eq!(sent.bytes, 20_000);
    assert_eq!(progress.last_reported(), 20_000);

    let recorded = requests.lock().unwrap().clone();
    assert_eq!(recorded.len(), 1);
    let req = &recorded[0];
    assert_eq!(req.method, "POST");
    assert_eq!(req.path, format!("/bot{TOKEN}/sendVideo"));
    assert!(req.header("content-type").unwrap().starts_with("multipart/form-data"));

    let text = req.body_text();
    assert!(text.contains("name=\"chat_id\""));
    assert!(text.contains("-100555"));
    assert!(text.contains("name=\"video\"; filename=\"clip.mp4\""));
    assert!(text.contains("name=\"caption\""));
    assert!(text.contains("name=\"supports_streaming\""));
    assert!(
        req.body.windows(payload.len()).any(|w| w == payload.as_slice()),
        "payload bytes present verbatim"
    );
}

#[tokio::test]
async fn send_document_reads_the_document_file_id() {
    let (base, requests) = spawn_http(|_| {
        MockResponse::json(
            200,
            json!({"ok": true, "result": {"message_id": 5, "document": {"file_id": "BQAC-doc"}}}),
        )
    })
    .await;

    let transport = TelegramBotApiTransport::new(api(&base));
    let mut source = MemorySource::new("notes.pdf", b"%PDF-1.7".to_vec());
    let sent = transport
        .send("42", &mut source, MediaKind::Document, "", &mut reporter())
        .await
        .unwrap();

    assert_eq!(sent.file_id.as_deref(), Some("BQAC-doc"));
    let req = requests.lock().unwrap()[0].clone();
    assert!(req.path.ends_with("/sendDocument"));
    let text = req.body_text();
    assert!(!text.contains("name=\"caption\""));
    assert!(!text.contains("supports_streaming"));
}

#[tokio::test]
async fn bad_request_on_video_is_reported_as_rejection() {
    let (base, _requests) = spawn_http(|_| {
        MockResponse::json(
            400,
            json!({"ok": false, "error_code": 400, "description": "Bad Request: wrong file type"}),
        )
    })
    .await;

    let transport = TelegramBotApiTransport::new(api(&base));
    let mut source = MemorySource::new("clip.mkv", vec![1u8; 1000]);
    let err = transport
        .send("42", &mut source, MediaKind::Video, "", &mut reporter())
        .await
        .unwrap_err();

    match err {
        Error::TransportRejected { kind, message } => {
            assert_eq!(kind, MediaKind::Video);
            assert!(message.contains("wrong file type"));
        }
        other => panic!("expected TransportRejected, got {other:?}"),
    }
}

#[tokio::test]
async fn chat_not_found_on_video_is_not_a_rejection() {
    let (base, requests) = spawn_http(|_| {
        MockResponse::json(
            400,
            json!({"ok": false, "error_code": 400, "description": "Bad Request: chat not found"}),
        )
    })
    .await;

    let transport = TelegramBotApiTransport::new(api(&base));
    let mut source = MemorySource::new("clip.mp4", vec![1u8; 1000]);
    let err = transport
        .send("-100999", &mut source, MediaKind::Video, "", &mut reporter())
        .await
        .unwrap_err();

    match err {
        Error::Telegram { message } => assert!(message.contains("chat not found"), "{message}"),
        other => panic!("expected Telegram, got {other:?}"),
    }
    assert_eq!(requests.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn server_errors_are_not_rejections() {
    let (base, _requests) = spawn_http(|_| {
        MockResponse::json(
            502,
            json!({"ok": false, "error_code": 502, "description": "Bad Gateway"}),
        )
    })
    .await;

    let transport = TelegramBotApiTransport::new(api(&base));
    let mut source = MemorySource::new("clip.mp4", vec![1u8; 10]);
    let err = transport
        .send("42", &mut source, MediaKind::Video, "", &mut reporter())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Telegram { .. }));
    assert!(err.retryable());
    assert!(!err.to_string().contains(TOKEN));
}

#[tokio::test]
async fn status_message_is_sent_edited_then_deleted() {
    let (base, requests) = spawn_http(|req| {
        if req.path.ends_with("/sendMessage") {
            MockResponse::json(200, json!({"ok": true, "result": {"message_id": 901}}))
        } else if req.path.ends_with("/editMessageText") {
            if req.body_text().contains("same text") {
                MockResponse::json(
                    400,
                    json!({"ok": false, "error_code": 400,
                           "description": "Bad Request: message is not modified"}),
                )
            } else {
                MockResponse::json(200, json!({"ok": true, "result": true}))
            }
        } else {
            MockResponse::json(200, json!({"ok": true, "result": true}))
        }
    })
    .await;

    let status = TelegramStatusMessage::new(api(&base), "42");
    status.show("Uploading 10%").await.unwrap();
    assert_eq!(status.message_id().await, Some(901));
    status.show("Uploading 50%").await.unwrap();
    status.show("same text").await.unwrap();
    status.clear().await.unwrap();
    assert_eq!(status.message_id().await, None);

    // A second clear has nothing to delete.
    status.clear().await.unwrap();

    let recorded = requests.lock().unwrap().clone();
    let methods: Vec<_> = recorded
        .iter()
        .map(|r| r.path.rsplit('/').next().unwrap().to_string())
        .collect();
    assert_eq!(
        methods,
        ["sendMessage", "editMessageText", "editMessageText", "deleteMessage"]
    );
    let edit: serde_json::Value = serde_json::from_slice(&recorded[1].body).unwrap();
    assert_eq!(edit["message_id"], 901);
    assert_eq!(edit["chat_id"], "42");
}

#[tokio::test]
async fn cobalt_resolver_posts_the_page_url() {
    let (base, requests) = spawn_http(|req| {
        let body: serde_json::Value = serde_json::from_slice(&req.body).unwrap();
        if body["url"] == "https://video.example/private" {
            MockResponse::json(400, json!({"status": "error", "text": "login required"}))
        } else {
            MockResponse::json(
                200,
                json!({"status": "stream", "url": "https://cdn.example/v.mp4", "filename": "v.mp4"}),
            )
        }
    })
    .await;

    let resolver = CobaltResolver::new(format!("{base}/api/json"), "720").unwrap();
    let link = resolver
        .resolve("https://video.example/watch?v=1")
        .await
        .unwrap();
    assert_eq!(link.direct_url, "https://cdn.example/v.mp4");
    assert_eq!(link.display_name(), "v.mp4");

    let err = resolver
        .resolve("https://video.example/private")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ResolutionFailure { ref reason } if reason == "login required"));

    let first: serde_json::Value =
        serde_json::from_slice(&requests.lock().unwrap()[0].body).unwrap();
    assert_eq!(first["vQuality"], "720");
    assert_eq!(first["vCodec"], "h264");
}

#[tokio::test]
async fn cobalt_non_json_reply_is_a_resolution_failure() {
    let (base, _requests) =
        spawn_http(|_| MockResponse::bytes(503, b"upstream down".to_vec())).await;

    let resolver = CobaltResolver::new(format!("{base}/api/json"), "1080").unwrap();
    let err = resolver.resolve("https://video.example/x").await.unwrap_err();
    match err {
        Error::ResolutionFailure { reason } => {
            assert!(reason.contains("503"), "{reason}");
            assert!(reason.contains("upstream down"), "{reason}");
        }
        other => panic!("expected ResolutionFailure, got {other:?}"),
    }
}

#[tokio::test]
async fn get_me_returns_the_bot_username() {
    let (base, requests) = spawn_http(|_| {
        MockResponse::json(
            200,
            json!({"ok": true, "result": {"id": 1, "is_bot": true, "username": "relay_bot"}}),
        )
    })
    .await;

    let username = api(&base).get_me().await.unwrap();
    assert_eq!(username.as_deref(), Some("relay_bot"));
    assert!(requests.lock().unwrap()[0].path.ends_with("/getMe"));

    let (base, _requests) = spawn_http(|_| {
        MockResponse::json(
            401,
            json!({"ok": false, "error_code": 401, "description": "Unauthorized"}),
        )
    })
    .await;
    let err = api(&base).get_me().await.unwrap_err();
    assert!(err.to_string().contains("Unauthorized"));
}
