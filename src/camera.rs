//! Camera process management and H.264 ingest
//!
//! Launches the camera command (e.g. rpicam-vid) as a child process,
//! reads raw Annex-B H.264 from its stdout, and publishes complete NAL
//! units on a broadcast channel. Throughput notes that shaped this code:
//! large reads to minimize syscalls, incremental NAL extraction so bytes
//! are scanned once, and a ring channel so a slow consumer can never
//! stall the camera.

use std::process::Stdio;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::errors::ServerError;
use crate::media::{AnnexBSplitter, NalUnit};

/// NAL channel capacity; sized to absorb encoder bursts.
const DEFAULT_CHANNEL_CAPACITY: usize = 2000;

/// Read size for the child's stdout.
const DEFAULT_READ_BUFFER: usize = 256 * 1024;

struct CameraState {
    child: Option<Child>,
    reader: Option<JoinHandle<()>>,
    running: bool,
}

/// Owns the camera child process and the NAL unit channel.
///
/// The channel has ring semantics: when the single downstream consumer
/// falls more than the capacity behind, the oldest units are discarded
/// and the consumer observes a `Lagged` error with the drop count. The
/// ingest side never blocks.
pub struct CameraSource {
    nalu_tx: Mutex<Option<broadcast::Sender<NalUnit>>>,
    read_buffer: usize,
    state: Mutex<CameraState>,
}

impl CameraSource {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY, DEFAULT_READ_BUFFER)
    }

    pub fn with_capacity(channel_capacity: usize, read_buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(channel_capacity);
        Self {
            nalu_tx: Mutex::new(Some(tx)),
            read_buffer,
            state: Mutex::new(CameraState {
                child: None,
                reader: None,
                running: false,
            }),
        }
    }

    /// Subscribe to the NAL unit stream. Fails once `stop` has closed the
    /// channel.
    pub async fn subscribe(&self) -> Result<broadcast::Receiver<NalUnit>, ServerError> {
        let tx = self.nalu_tx.lock().await;
        tx.as_ref()
            .map(|tx| tx.subscribe())
            .ok_or_else(|| ServerError::CameraError("camera source is stopped".to_string()))
    }

    /// Launch the camera command via a shell and start the reader task.
    pub async fn start(&self, camera_cmd: &str) -> Result<(), ServerError> {
        let mut state = self.state.lock().await;
        if state.running {
            return Err(ServerError::CameraError(
                "camera is already running".to_string(),
            ));
        }

        // The camera device is exclusive; clear out any stale instance of
        // the same binary before claiming it.
        kill_previous_instances(camera_cmd).await;

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(camera_cmd)
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| ServerError::CameraError(format!("failed to start camera: {}", e)))?;

        let stdout = child.stdout.take().ok_or_else(|| {
            ServerError::CameraError("camera process has no stdout pipe".to_string())
        })?;

        let tx = {
            let guard = self.nalu_tx.lock().await;
            guard
                .as_ref()
                .cloned()
                .ok_or_else(|| ServerError::CameraError("camera source is stopped".to_string()))?
        };

        log::info!("Camera process started, streaming H264...");

        let read_buffer = self.read_buffer;
        state.reader = Some(tokio::spawn(async move {
            read_stream(stdout, tx, read_buffer).await;
        }));
        state.child = Some(child);
        state.running = true;

        Ok(())
    }

    /// Stop the camera: interrupt then kill the child, join the reader,
    /// close the NAL channel.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if !state.running {
            return;
        }

        log::info!("Stopping camera process...");

        if let Some(mut child) = state.child.take() {
            interrupt(&child).await;
            let wait = tokio::time::timeout(std::time::Duration::from_secs(2), child.wait());
            match wait.await {
                Ok(Ok(status)) => log::debug!("Camera process exited: {}", status),
                _ => {
                    let _ = child.kill().await;
                }
            }
        }

        // The child's exit surfaces as EOF in the reader.
        if let Some(reader) = state.reader.take() {
            let _ = reader.await;
        }

        // Dropping the sender closes the channel for all subscribers.
        self.nalu_tx.lock().await.take();
        state.running = false;

        log::info!("Camera stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.running
    }
}

impl Default for CameraSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Reader loop: stdout bytes -> splitter -> broadcast channel.
async fn read_stream(
    mut stdout: tokio::process::ChildStdout,
    tx: broadcast::Sender<NalUnit>,
    read_buffer: usize,
) {
    let mut buf = vec![0u8; read_buffer];
    let mut splitter = AnnexBSplitter::new();
    let mut units = Vec::new();
    let mut total_nalus: u64 = 0;

    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => {
                log::info!("Camera stream ended normally");
                break;
            }
            Ok(n) => {
                splitter.push(&buf[..n], &mut units);
                for unit in units.drain(..) {
                    total_nalus += 1;
                    // Ring channel: never blocks, drops oldest when the
                    // consumer lags. Send only fails with no subscribers.
                    let _ = tx.send(unit);
                }
            }
            Err(e) => {
                log::error!("Stream read error: {}", e);
                break;
            }
        }
    }

    log::info!("Camera stats - Total NALUs: {}", total_nalus);
}

/// Camera binaries that hold the device exclusively and are safe to clear.
const CAMERA_BINARIES: &[&str] = &["rpicam-vid", "libcamera-vid", "raspivid"];

/// Best-effort `pkill -9` of earlier instances of the camera binary named
/// in the command, so the device is free before we spawn.
async fn kill_previous_instances(camera_cmd: &str) {
    let Some(binary) = camera_cmd.split_whitespace().next() else {
        return;
    };
    let name = binary.rsplit('/').next().unwrap_or(binary);
    if !CAMERA_BINARIES.contains(&name) {
        return;
    }
    let _ = Command::new("pkill").args(["-9", name]).status().await;
}

/// Send SIGINT so the camera can flush; `Child::kill` is the fallback.
async fn interrupt(child: &Child) {
    if let Some(pid) = child.id() {
        let _ = Command::new("kill")
            .args(["-INT", &pid.to_string()])
            .status()
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_start_twice_is_refused() {
        let camera = CameraSource::new();
        camera.start("cat /dev/null && sleep 5").await.unwrap();
        let second = camera.start("cat /dev/null").await;
        assert!(second.is_err());
        camera.stop().await;
    }

    #[tokio::test]
    async fn test_child_stream_reaches_subscribers() {
        let camera = CameraSource::new();
        let mut rx = camera.subscribe().await.unwrap();

        // Emit two complete NAL units plus a terminator from a shell
        // child (octal escapes: 0147 = SPS header, 0145 = IDR header).
        let cmd = "printf '\\000\\000\\000\\001\\147\\252\\000\\000\\000\\001\\145\\273\\000\\000\\000\\001'";
        camera.start(cmd).await.unwrap();

        let first = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for NAL")
            .unwrap();
        assert!(first.is_sps());
        let second = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for NAL")
            .unwrap();
        assert!(second.is_idr());

        camera.stop().await;

        // Channel closes once the camera is stopped.
        loop {
            match rx.recv().await {
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let camera = CameraSource::new();
        camera.stop().await;
        assert!(!camera.is_running().await);
    }
}
