//! camrelay server binary
//!
//! Wires the pieces together: config, camera process, broadcast loop,
//! optional recorder, and the HTTP/WebRTC front end. Shuts down in
//! dependency order on SIGINT/SIGTERM.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use camrelay::camera::CameraSource;
use camrelay::config::ServerConfig;
use camrelay::recording::RecorderManager;
use camrelay::server::{self, AppState};
use camrelay::stream::{run_broadcaster, ViewerRegistry};
use camrelay::webrtc::build_api;

/// Grace period for draining in-flight HTTP requests.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.txt".to_string());
    let config = Arc::new(ServerConfig::load(&config_path));
    log::info!("Config: {}", config.summary());

    let api = match build_api() {
        Ok(api) => Arc::new(api),
        Err(e) => {
            log::error!("Failed to initialize WebRTC engine: {}", e);
            std::process::exit(1);
        }
    };

    let registry = Arc::new(ViewerRegistry::new());

    let recorder = if config.recording_available() {
        let recorder = Arc::new(RecorderManager::new(
            &config.recording_dir,
            config.recording_skip_conversion,
            config.recording_max_minutes,
        ));
        recorder.spawn();
        Some(recorder)
    } else {
        log::warn!(
            "Recording disabled: {}",
            config.recording_unavailable_reason
        );
        None
    };

    let camera = Arc::new(CameraSource::new());
    let nalu_rx = match camera.subscribe().await {
        Ok(rx) => rx,
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(1);
        }
    };

    let camera_cmd = config.effective_camera_cmd();
    log::info!("Camera command: {}", camera_cmd);
    if let Err(e) = camera.start(&camera_cmd).await {
        log::error!("{}", e);
        std::process::exit(1);
    }

    let broadcaster = tokio::spawn(run_broadcaster(
        Arc::clone(&registry),
        recorder.clone(),
        nalu_rx,
    ));

    let state = AppState {
        api,
        registry: Arc::clone(&registry),
        recorder: recorder.clone(),
        config: Arc::clone(&config),
    };
    let router = server::build_router(state);

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            log::info!("Shutdown signal received");
            shutdown.cancel();
        });
    }

    let mut http = tokio::spawn(server::run(config.addr, router, shutdown.clone()));

    tokio::select! {
        result = &mut http => {
            // Server ended on its own (e.g. bind failure) before any signal.
            match result {
                Ok(Ok(())) => log::warn!("HTTP server exited unexpectedly"),
                Ok(Err(e)) => log::error!("{}", e),
                Err(e) => log::error!("HTTP server task failed: {}", e),
            }
        }
        _ = shutdown.cancelled() => {
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut http).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => log::error!("{}", e),
                Ok(Err(e)) => log::error!("HTTP server task failed: {}", e),
                Err(_) => {
                    log::warn!("HTTP server did not drain within {:?}", SHUTDOWN_GRACE);
                    http.abort();
                }
            }
        }
    }

    camera.stop().await;
    let _ = broadcaster.await;
    if let Some(recorder) = recorder {
        recorder.shutdown().await;
    }
    registry.close_all().await;

    log::info!("Server stopped");
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(term) => term,
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
