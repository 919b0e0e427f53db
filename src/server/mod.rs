//! HTTP server: router construction, CORS, graceful serve
//!
//! Every endpoint is wrapped with CORS from the configured origin, and
//! OPTIONS preflights short-circuit with 200 before routing.

pub mod routes;

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;

use crate::errors::ServerError;

pub use routes::AppState;

/// Assemble the full route table over `state`.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(routes::status))
        .route("/offer", post(routes::offer))
        .route("/record/status", get(routes::record_status))
        .route("/record/start", post(routes::record_start))
        .route("/record/stop", post(routes::record_stop))
        .route("/record/list", get(routes::record_list))
        .route("/record/download/:filename", get(routes::record_download))
        .layer(middleware::from_fn_with_state(state.clone(), cors))
        .with_state(state)
}

/// CORS layer: reflect the configured origin on every response and answer
/// preflights directly.
async fn cors(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let origin = state.config.cors_origin.clone();

    if request.method() == Method::OPTIONS {
        let mut response = StatusCode::OK.into_response();
        apply_cors_headers(response.headers_mut(), &origin);
        return response;
    }

    let mut response = next.run(request).await;
    apply_cors_headers(response.headers_mut(), &origin);
    response
}

fn apply_cors_headers(headers: &mut HeaderMap, origin: &str) {
    if let Ok(value) = HeaderValue::from_str(origin) {
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
    }
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
}

/// Bind and serve until `shutdown` fires, then drain in-flight requests.
pub async fn run(port: u16, router: Router, shutdown: CancellationToken) -> Result<(), ServerError> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| ServerError::IoError(format!("failed to bind port {}: {}", port, e)))?;

    log::info!("HTTP server listening on http://0.0.0.0:{}", port);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| ServerError::IoError(format!("HTTP server error: {}", e)))
}
