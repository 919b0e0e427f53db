//! HTTP API tests driven through the router with `tower::ServiceExt`,
//! no socket needed.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use tower::ServiceExt;

use camrelay::config::ServerConfig;
use camrelay::recording::RecorderManager;
use camrelay::server::{build_router, AppState};
use camrelay::stream::ViewerRegistry;
use camrelay::webrtc::build_api;

fn state_without_recorder() -> AppState {
    let mut config = ServerConfig::default();
    config.recording_unavailable_reason = "No recording_dir configured".to_string();
    AppState {
        api: Arc::new(build_api().unwrap()),
        registry: Arc::new(ViewerRegistry::new()),
        recorder: None,
        config: Arc::new(config),
    }
}

fn state_with_recorder(dir: &std::path::Path) -> AppState {
    let recorder = Arc::new(RecorderManager::new(dir, true, 30.0));
    recorder.spawn();
    AppState {
        api: Arc::new(build_api().unwrap()),
        registry: Arc::new(ViewerRegistry::new()),
        recorder: Some(recorder),
        config: Arc::new(ServerConfig::default()),
    }
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

#[tokio::test]
async fn test_status_endpoint() {
    let router = build_router(state_without_recorder());
    let response = router
        .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .unwrap(),
        "*"
    );
    assert_eq!(body_bytes(response).await, b"OK");
}

#[tokio::test]
async fn test_options_preflight() {
    let router = build_router(state_without_recorder());
    let response = router
        .oneshot(
            Request::builder()
                .method("OPTIONS")
                .uri("/offer")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers.get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), "*");
    assert_eq!(
        headers.get(header::ACCESS_CONTROL_ALLOW_METHODS).unwrap(),
        "GET, POST, OPTIONS"
    );
    assert_eq!(
        headers.get(header::ACCESS_CONTROL_ALLOW_HEADERS).unwrap(),
        "Content-Type"
    );
}

#[tokio::test]
async fn test_configured_cors_origin_reflected() {
    let mut config = ServerConfig::default();
    config.cors_origin = "http://cam.local".to_string();
    let state = AppState {
        config: Arc::new(config),
        ..state_without_recorder()
    };

    let router = build_router(state);
    let response = router
        .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(
        response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .unwrap(),
        "http://cam.local"
    );
}

#[tokio::test]
async fn test_malformed_offers_rejected_without_registering() {
    let state = state_without_recorder();
    let registry = Arc::clone(&state.registry);
    let router = build_router(state);

    for body in [
        "{}",
        "not json",
        r#"{"type":"offer"}"#,
        r#"{"type":"offer","sdp":""}"#,
        r#"{"type":"answer","sdp":"v=0"}"#,
        r#"{"type":"offer","sdp":"this is not sdp"}"#,
    ] {
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/offer")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            response.status(),
            StatusCode::BAD_REQUEST,
            "body {:?} should be rejected",
            body
        );
    }

    assert_eq!(registry.viewer_count().await, 0);
}

#[tokio::test]
async fn test_record_endpoints_unavailable_without_recorder() {
    let router = build_router(state_without_recorder());

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/record/status")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let status: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(status["available"], false);
    assert_eq!(status["unavailableReason"], "No recording_dir configured");

    for (method, uri) in [
        ("POST", "/record/start"),
        ("POST", "/record/stop"),
        ("GET", "/record/list"),
        ("GET", "/record/download/x.mp4"),
    ] {
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            response.status(),
            StatusCode::SERVICE_UNAVAILABLE,
            "{} {}",
            method,
            uri
        );
    }
}

#[tokio::test]
async fn test_record_start_conflict_maps_to_409() {
    let dir = tempfile::tempdir().unwrap();
    let router = build_router(state_with_recorder(dir.path()));

    // No SPS/PPS seen yet, so start is refused as a conflict.
    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/record/start")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_record_status_reports_camel_case_fields() {
    let dir = tempfile::tempdir().unwrap();
    let router = build_router(state_with_recorder(dir.path()));

    let response = router
        .oneshot(
            Request::builder()
                .uri("/record/status")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let status: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(status["available"], true);
    assert_eq!(status["recording"], false);
    assert_eq!(status["finalizing"], false);
    assert_eq!(status["maxDurationMs"], 30 * 60 * 1000);
    // Optional fields are omitted while idle.
    assert!(status.get("filePath").is_none());
    assert!(status.get("bytesWritten").is_none());
}

#[tokio::test]
async fn test_download_rejects_traversal_and_wrong_suffix() {
    let dir = tempfile::tempdir().unwrap();
    let router = build_router(state_with_recorder(dir.path()));

    for uri in [
        "/record/download/..%2F..%2Fetc%2Fpasswd.mp4",
        "/record/download/secret.h264",
        "/record/download/..",
    ] {
        let response = router
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", uri);
    }

    let response = router
        .oneshot(
            Request::builder()
                .uri("/record/download/missing.mp4")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_download_streams_file_with_headers() {
    let dir = tempfile::tempdir().unwrap();
    let content = vec![0x42u8; 4096];
    std::fs::write(dir.path().join("recording_x.mp4"), &content).unwrap();

    let router = build_router(state_with_recorder(dir.path()));
    let response = router
        .oneshot(
            Request::builder()
                .uri("/record/download/recording_x.mp4")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/octet-stream"
    );
    assert_eq!(
        response.headers().get(header::CONTENT_LENGTH).unwrap(),
        "4096"
    );
    assert_eq!(
        response.headers().get(header::CONTENT_DISPOSITION).unwrap(),
        "attachment; filename=\"recording_x.mp4\""
    );
    assert_eq!(body_bytes(response).await, content);
}

#[tokio::test]
async fn test_record_list_serializes_recordings() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("recording_a.mp4"), vec![1u8; 10]).unwrap();

    let router = build_router(state_with_recorder(dir.path()));
    let response = router
        .oneshot(
            Request::builder()
                .uri("/record/list")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let listing: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    let recordings = listing["recordings"].as_array().unwrap();
    assert_eq!(recordings.len(), 1);
    assert_eq!(recordings[0]["filename"], "recording_a.mp4");
    assert_eq!(recordings[0]["sizeBytes"], 10);
}
