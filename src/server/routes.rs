//! HTTP API handlers
//!
//! Thin glue over the core: signaling, recording control, and downloads.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use webrtc::api::API;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::config::ServerConfig;
use crate::errors::ServerError;
use crate::recording::{DownloadError, RecorderManager, RecordingFile, RecordingStatus};
use crate::stream::ViewerRegistry;
use crate::webrtc::session;

/// Shared state handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    pub api: Arc<API>,
    pub registry: Arc<ViewerRegistry>,
    pub recorder: Option<Arc<RecorderManager>>,
    pub config: Arc<ServerConfig>,
}

/// Liveness probe.
pub async fn status() -> &'static str {
    "OK"
}

#[derive(Debug, Deserialize)]
struct OfferBody {
    #[serde(rename = "type")]
    kind: String,
    sdp: String,
}

/// `POST /offer`: SDP offer in, SDP answer out.
pub async fn offer(State(state): State<AppState>, body: String) -> Response {
    let parsed: OfferBody = match serde_json::from_str(&body) {
        Ok(parsed) => parsed,
        Err(_) => return (StatusCode::BAD_REQUEST, "invalid offer").into_response(),
    };
    if parsed.kind != "offer" || parsed.sdp.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "invalid offer").into_response();
    }

    let offer = match RTCSessionDescription::offer(parsed.sdp) {
        Ok(offer) => offer,
        Err(e) => {
            log::warn!("Rejected malformed offer: {}", e);
            return (StatusCode::BAD_REQUEST, "invalid offer").into_response();
        }
    };

    match session::negotiate(
        &state.api,
        Arc::clone(&state.registry),
        state.config.framerate,
        offer,
    )
    .await
    {
        Ok(answer) => Json(answer).into_response(),
        Err(e) => {
            log::error!("Offer negotiation failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to negotiate session",
            )
                .into_response()
        }
    }
}

/// `GET /record/status`
pub async fn record_status(State(state): State<AppState>) -> Json<RecordingStatus> {
    match &state.recorder {
        Some(recorder) => Json(recorder.status().await),
        None => Json(RecordingStatus::unavailable(
            &state.config.recording_unavailable_reason,
        )),
    }
}

/// `POST /record/start`
pub async fn record_start(State(state): State<AppState>) -> Response {
    let Some(recorder) = &state.recorder else {
        return (StatusCode::SERVICE_UNAVAILABLE, "recording not available").into_response();
    };
    match recorder.start().await {
        Ok(status) => Json(status).into_response(),
        Err(ServerError::RecordingError(msg)) => {
            log::warn!("Failed to start recording: {}", msg);
            (StatusCode::CONFLICT, msg).into_response()
        }
        Err(e) => {
            log::error!("Failed to start recording: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// `POST /record/stop`
pub async fn record_stop(State(state): State<AppState>) -> Response {
    let Some(recorder) = &state.recorder else {
        return (StatusCode::SERVICE_UNAVAILABLE, "recording not available").into_response();
    };
    match recorder.stop().await {
        Ok(status) => Json(status).into_response(),
        Err(ServerError::RecordingError(msg)) => {
            log::warn!("Failed to stop recording: {}", msg);
            (StatusCode::CONFLICT, msg).into_response()
        }
        Err(e) => {
            log::error!("Failed to stop recording: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

#[derive(Debug, Serialize)]
struct RecordingList {
    recordings: Vec<RecordingFile>,
}

/// `GET /record/list`
pub async fn record_list(State(state): State<AppState>) -> Response {
    let Some(recorder) = &state.recorder else {
        return (StatusCode::SERVICE_UNAVAILABLE, "recording not available").into_response();
    };
    match recorder.list_recordings().await {
        Ok(recordings) => Json(RecordingList { recordings }).into_response(),
        Err(e) => {
            log::error!("Failed to list recordings: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// `GET /record/download/:filename`
pub async fn record_download(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Response {
    let Some(recorder) = &state.recorder else {
        return (StatusCode::SERVICE_UNAVAILABLE, "recording not available").into_response();
    };

    let path = match recorder.resolve_download(&filename) {
        Ok(path) => path,
        Err(DownloadError::InvalidName) => {
            return (StatusCode::BAD_REQUEST, "invalid filename").into_response();
        }
        Err(DownloadError::NotFound) => {
            return (StatusCode::NOT_FOUND, "file not found").into_response();
        }
    };

    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(_) => return (StatusCode::NOT_FOUND, "file not found").into_response(),
    };
    let size = match file.metadata().await {
        Ok(meta) => meta.len(),
        Err(e) => {
            log::error!("Failed to stat {}: {}", path.display(), e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "failed to stat file").into_response();
        }
    };

    let body = Body::from_stream(ReaderStream::new(file));
    (
        [
            (
                header::CONTENT_TYPE,
                "application/octet-stream".to_string(),
            ),
            (header::CONTENT_LENGTH, size.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename),
            ),
        ],
        body,
    )
        .into_response()
}
