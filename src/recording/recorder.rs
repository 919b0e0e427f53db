//! H.264 recorder with IDR gating and atomic publication
//!
//! Recording starts from the cached SPS/PPS and the next keyframe, so the
//! file is decodable from byte zero. The write path goes through a 64 KB
//! buffered writer to batch syscalls. On stop the `.tmp` file is flushed,
//! synced, and renamed to `.h264` before the (optional) ffmpeg MP4 mux
//! runs; the rename is the publication fence observers rely on.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::errors::ServerError;
use crate::media::{NalUnit, NaluType};

/// Buffer ahead of the file to batch writes and reduce syscalls.
const WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// Recorder inbox depth; overflow drops frames silently.
const INBOX_CAPACITY: usize = 500;

/// Current recording state, as reported over the HTTP API.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingStatus {
    pub available: bool,
    pub recording: bool,
    pub finalizing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unavailable_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub max_duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_written: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frames_written: Option<u64>,
}

impl RecordingStatus {
    /// Status for a server where recording could not be enabled.
    pub fn unavailable(reason: &str) -> Self {
        Self {
            available: false,
            unavailable_reason: if reason.is_empty() {
                None
            } else {
                Some(reason.to_string())
            },
            ..Default::default()
        }
    }
}

/// One finished recording, for the listing endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingFile {
    pub filename: String,
    pub size_bytes: u64,
    pub created_at: i64,
    pub duration_ms: u64,
}

/// Sidecar metadata written next to each muxed recording.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingMeta {
    pub duration_ms: u64,
    pub size_bytes: u64,
}

/// Why a download request was refused.
#[derive(Debug, PartialEq, Eq)]
pub enum DownloadError {
    InvalidName,
    NotFound,
}

struct RecorderInner {
    recording: bool,
    finalizing: bool,
    writer: Option<BufWriter<File>>,
    temp_path: Option<PathBuf>,
    final_path: Option<PathBuf>,
    muxed_path: Option<PathBuf>,
    started_at: Option<Instant>,
    start_time_ms: Option<i64>,
    bytes_written: u64,
    frames_written: u64,
    waiting_for_idr: bool,
    /// Distinguishes recordings so a stale auto-stop timer can't touch a
    /// newer session.
    session: u64,
    auto_stop: Option<JoinHandle<()>>,
    last_sps: Option<NalUnit>,
    last_pps: Option<NalUnit>,
}

/// Handles recording of the H.264 stream to disk plus MP4 finalization.
pub struct RecorderManager {
    recording_dir: PathBuf,
    skip_conversion: bool,
    max_duration: Duration,
    inner: Mutex<RecorderInner>,
    nalu_tx: mpsc::Sender<NalUnit>,
    nalu_rx: StdMutex<Option<mpsc::Receiver<NalUnit>>>,
    done: CancellationToken,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl RecorderManager {
    pub fn new<P: AsRef<Path>>(
        recording_dir: P,
        skip_conversion: bool,
        max_minutes: f64,
    ) -> Self {
        let (nalu_tx, nalu_rx) = mpsc::channel(INBOX_CAPACITY);
        Self {
            recording_dir: recording_dir.as_ref().to_path_buf(),
            skip_conversion,
            max_duration: Duration::from_secs_f64(max_minutes * 60.0),
            inner: Mutex::new(RecorderInner {
                recording: false,
                finalizing: false,
                writer: None,
                temp_path: None,
                final_path: None,
                muxed_path: None,
                started_at: None,
                start_time_ms: None,
                bytes_written: 0,
                frames_written: 0,
                waiting_for_idr: false,
                session: 0,
                auto_stop: None,
                last_sps: None,
                last_pps: None,
            }),
            nalu_tx,
            nalu_rx: StdMutex::new(None),
            done: CancellationToken::new(),
            task: StdMutex::new(None),
        }
        .with_inbox(nalu_rx)
    }

    fn with_inbox(self, rx: mpsc::Receiver<NalUnit>) -> Self {
        *self.nalu_rx.lock().unwrap() = Some(rx);
        self
    }

    /// Non-blocking handoff from the broadcaster. Overflow loses the
    /// frame for the recorder only.
    pub fn try_forward(&self, nalu: NalUnit) {
        let _ = self.nalu_tx.try_send(nalu);
    }

    /// Start the inbox-draining task.
    pub fn spawn(self: &Arc<Self>) {
        let inbox = self.nalu_rx.lock().unwrap().take();
        let Some(mut inbox) = inbox else {
            log::error!("Recorder task started twice");
            return;
        };
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = inbox.recv() => {
                        let Some(nalu) = received else { break };
                        manager.handle_nalu(&nalu).await;
                    }
                    _ = manager.done.cancelled() => break,
                }
            }
        });
        *self.task.lock().unwrap() = Some(handle);
    }

    /// Begin a new recording. Refused while one is active or finalizing,
    /// and until SPS/PPS have been observed on the stream.
    pub async fn start(self: &Arc<Self>) -> Result<RecordingStatus, ServerError> {
        let mut inner = self.inner.lock().await;

        if inner.recording {
            return Err(ServerError::RecordingError(
                "recording already in progress".to_string(),
            ));
        }
        if inner.finalizing {
            return Err(ServerError::RecordingError(
                "previous recording is still finalizing".to_string(),
            ));
        }
        let (Some(sps), Some(pps)) = (inner.last_sps.clone(), inner.last_pps.clone()) else {
            return Err(ServerError::RecordingError(
                "SPS/PPS not yet available (wait for camera stream to initialize)".to_string(),
            ));
        };

        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let stem = format!("recording_{}", timestamp);
        let temp_path = self.recording_dir.join(format!("{}.h264.tmp", stem));
        let final_path = self.recording_dir.join(format!("{}.h264", stem));
        let muxed_path = self.recording_dir.join(format!("{}.mp4", stem));

        let file = File::create(&temp_path)
            .map_err(|e| ServerError::IoError(format!("failed to create recording file: {}", e)))?;
        let mut writer = BufWriter::with_capacity(WRITE_BUFFER_SIZE, file);

        // Prime decoders: parameter sets first, then everything from the
        // next IDR onward.
        let mut bytes_written = 0u64;
        for unit in [&sps, &pps] {
            writer
                .write_all(unit.as_bytes())
                .map_err(|e| ServerError::IoError(format!("failed to write prefix: {}", e)))?;
            bytes_written += unit.len() as u64;
        }

        inner.writer = Some(writer);
        inner.temp_path = Some(temp_path);
        inner.final_path = Some(final_path);
        inner.muxed_path = Some(muxed_path);
        inner.started_at = Some(Instant::now());
        inner.start_time_ms = Some(chrono::Utc::now().timestamp_millis());
        inner.bytes_written = bytes_written;
        inner.frames_written = 0;
        inner.waiting_for_idr = true;
        inner.recording = true;
        inner.session += 1;

        let manager = Arc::clone(self);
        let session = inner.session;
        let max_duration = self.max_duration;
        inner.auto_stop = Some(tokio::spawn(async move {
            tokio::time::sleep(max_duration).await;
            manager.auto_stop(session).await;
        }));

        log::info!("Recording started, waiting for keyframe...");
        Ok(self.status_locked(&inner))
    }

    /// Stop the active recording: close the file, publish it via rename,
    /// then mux to MP4 unless conversion is disabled.
    pub async fn stop(self: &Arc<Self>) -> Result<RecordingStatus, ServerError> {
        let (final_path, muxed_path, duration_ms, bytes_written) = {
            let mut inner = self.inner.lock().await;

            if inner.finalizing {
                return Err(ServerError::RecordingError(
                    "finalization already in progress".to_string(),
                ));
            }
            if !inner.recording {
                return Err(ServerError::RecordingError(
                    "no recording in progress".to_string(),
                ));
            }

            inner.recording = false;
            if let Some(timer) = inner.auto_stop.take() {
                timer.abort();
            }

            let writer = inner.writer.take().ok_or_else(|| {
                ServerError::RecordingError("recording file already closed".to_string())
            })?;
            let file = writer.into_inner().map_err(|e| {
                ServerError::IoError(format!("failed to flush recording: {}", e))
            })?;
            file.sync_all()
                .map_err(|e| ServerError::IoError(format!("failed to sync recording: {}", e)))?;
            drop(file);

            let temp_path = inner.temp_path.take().ok_or_else(|| {
                ServerError::RecordingError("recording has no temp file".to_string())
            })?;
            let final_path = inner.final_path.clone().ok_or_else(|| {
                ServerError::RecordingError("recording has no final path".to_string())
            })?;
            let muxed_path = inner.muxed_path.clone().ok_or_else(|| {
                ServerError::RecordingError("recording has no mux path".to_string())
            })?;

            inner.finalizing = true;

            // Publication fence: the .h264 only becomes visible to
            // external observers through this rename.
            if let Err(e) = std::fs::rename(&temp_path, &final_path) {
                inner.finalizing = false;
                inner.temp_path = Some(temp_path);
                return Err(ServerError::IoError(format!(
                    "failed to publish recording: {}",
                    e
                )));
            }

            let duration_ms = inner
                .started_at
                .map(|t| t.elapsed().as_millis() as u64)
                .unwrap_or(0);
            (final_path, muxed_path, duration_ms, inner.bytes_written)
        };

        // The state mutex is released while ffmpeg runs so status queries
        // observe `finalizing` instead of stalling.
        let mut published = display_name(&final_path);
        if self.skip_conversion {
            log::info!("Recording stopped: {} (conversion skipped)", published);
        } else {
            match convert_to_mp4(&final_path, &muxed_path).await {
                Ok(()) => {
                    let _ = std::fs::remove_file(&final_path);
                    write_meta(&muxed_path, duration_ms, bytes_written);
                    published = display_name(&muxed_path);
                    log::info!(
                        "Recording stopped and MP4 finalized: {} (duration: {}ms, size: {} bytes)",
                        published,
                        duration_ms,
                        bytes_written
                    );
                }
                Err(e) => {
                    log::warn!("MP4 conversion failed, keeping raw H264 file: {}", e);
                }
            }
        }

        let mut inner = self.inner.lock().await;
        inner.finalizing = false;
        let frames_written = inner.frames_written;
        let start_time_ms = inner.start_time_ms.take();
        inner.started_at = None;
        inner.final_path = None;
        inner.muxed_path = None;

        Ok(RecordingStatus {
            available: true,
            recording: false,
            finalizing: false,
            file_path: Some(published),
            start_time: start_time_ms,
            duration_ms: Some(duration_ms),
            max_duration_ms: self.max_duration.as_millis() as u64,
            bytes_written: Some(bytes_written),
            frames_written: Some(frames_written),
            ..Default::default()
        })
    }

    async fn auto_stop(self: Arc<Self>, session: u64) {
        {
            let mut inner = self.inner.lock().await;
            if !inner.recording || inner.session != session {
                return;
            }
            // Past the sleep now; nothing left for stop() to abort.
            inner.auto_stop = None;
        }
        log::info!("Recording reached max duration, auto-stopping");
        if let Err(e) = self.stop().await {
            log::warn!("Auto-stop failed: {}", e);
        }
    }

    /// Process one NAL unit from the inbox.
    ///
    /// SPS/PPS are always cached so a future start has a prefix to write,
    /// even while not recording.
    async fn handle_nalu(&self, nalu: &NalUnit) {
        let mut inner = self.inner.lock().await;

        match nalu.nalu_type() {
            NaluType::Sps => inner.last_sps = Some(nalu.clone()),
            NaluType::Pps => inner.last_pps = Some(nalu.clone()),
            _ => {}
        }

        if !inner.recording {
            return;
        }

        if inner.waiting_for_idr {
            if nalu.is_idr() {
                inner.waiting_for_idr = false;
                log::info!("Keyframe received, recording video stream...");
            } else {
                // Nothing but an IDR may follow the prefix.
                return;
            }
        }

        let Some(writer) = inner.writer.as_mut() else {
            return;
        };
        if let Err(e) = writer.write_all(nalu.as_bytes()) {
            log::warn!("Recording write error: {}", e);
            return;
        }
        inner.bytes_written += nalu.len() as u64;
        inner.frames_written += 1;
    }

    pub async fn status(&self) -> RecordingStatus {
        let inner = self.inner.lock().await;
        self.status_locked(&inner)
    }

    fn status_locked(&self, inner: &RecorderInner) -> RecordingStatus {
        let mut status = RecordingStatus {
            available: true,
            recording: inner.recording,
            finalizing: inner.finalizing,
            max_duration_ms: self.max_duration.as_millis() as u64,
            ..Default::default()
        };

        if inner.recording || inner.finalizing {
            status.file_path = inner.final_path.as_deref().map(display_name);
            status.start_time = inner.start_time_ms;
            status.duration_ms = inner.started_at.map(|t| t.elapsed().as_millis() as u64);
            status.bytes_written = Some(inner.bytes_written);
            status.frames_written = Some(inner.frames_written);
        }

        status
    }

    /// Whether SPS/PPS have been seen, i.e. whether `start` can succeed.
    pub async fn has_parameter_sets(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.last_sps.is_some() && inner.last_pps.is_some()
    }

    /// All finished `.mp4` recordings, enriched from their sidecars.
    pub async fn list_recordings(&self) -> Result<Vec<RecordingFile>, ServerError> {
        let mut dir = tokio::fs::read_dir(&self.recording_dir)
            .await
            .map_err(|e| ServerError::IoError(format!("failed to read recording directory: {}", e)))?;

        let mut recordings = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| ServerError::IoError(e.to_string()))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.ends_with(".mp4") {
                continue;
            }
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if meta.is_dir() {
                continue;
            }

            let created_at = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0);

            let duration_ms = read_meta(&entry.path())
                .map(|m| m.duration_ms)
                .unwrap_or(0);

            recordings.push(RecordingFile {
                filename: name,
                size_bytes: meta.len(),
                created_at,
                duration_ms,
            });
        }

        Ok(recordings)
    }

    /// Resolve a download request to a path, refusing traversal attempts
    /// and anything that is not a finished `.mp4`.
    pub fn resolve_download(&self, filename: &str) -> Result<PathBuf, DownloadError> {
        if filename.is_empty()
            || filename.contains('/')
            || filename.contains('\\')
            || filename.contains("..")
        {
            return Err(DownloadError::InvalidName);
        }
        if !filename.ends_with(".mp4") {
            return Err(DownloadError::InvalidName);
        }

        let path = self.recording_dir.join(filename);
        if !path.is_file() {
            return Err(DownloadError::NotFound);
        }
        Ok(path)
    }

    /// Graceful shutdown: stop the inbox task, then close an active file
    /// without promoting it. The `.tmp` stays behind as evidence; crash
    /// and shutdown are indistinguishable to observers.
    pub async fn shutdown(&self) {
        self.done.cancel();
        let handle = self.task.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let mut inner = self.inner.lock().await;
        if inner.recording {
            inner.recording = false;
            if let Some(timer) = inner.auto_stop.take() {
                timer.abort();
            }
            if let Some(writer) = inner.writer.take() {
                match writer.into_inner() {
                    Ok(file) => {
                        let _ = file.sync_all();
                    }
                    Err(e) => log::warn!("Failed to flush recording during shutdown: {}", e),
                }
            }
            if let Some(temp) = &inner.temp_path {
                log::warn!(
                    "Shutdown with active recording; leaving {} unpromoted",
                    temp.display()
                );
            }
        }
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

/// Mux the raw H.264 into an MP4 container, stream copy only.
async fn convert_to_mp4(h264_path: &Path, mp4_path: &Path) -> Result<(), ServerError> {
    let status = tokio::process::Command::new("ffmpeg")
        .arg("-f")
        .arg("h264")
        .arg("-i")
        .arg(h264_path)
        .arg("-c:v")
        .arg("copy")
        .arg("-movflags")
        .arg("+faststart")
        .arg("-y")
        .arg(mp4_path)
        .status()
        .await
        .map_err(|e| ServerError::RecordingError(format!("failed to run ffmpeg: {}", e)))?;

    if !status.success() {
        return Err(ServerError::RecordingError(format!(
            "ffmpeg exited with {}",
            status
        )));
    }
    Ok(())
}

fn write_meta(muxed_path: &Path, duration_ms: u64, size_bytes: u64) {
    let meta = RecordingMeta {
        duration_ms,
        size_bytes,
    };
    let meta_path = sidecar_path(muxed_path);
    match serde_json::to_vec(&meta) {
        Ok(data) => {
            if let Err(e) = std::fs::write(&meta_path, data) {
                log::warn!("Failed to write recording metadata: {}", e);
            }
        }
        Err(e) => log::warn!("Failed to serialize recording metadata: {}", e),
    }
}

fn read_meta(muxed_path: &Path) -> Option<RecordingMeta> {
    let data = std::fs::read(sidecar_path(muxed_path)).ok()?;
    serde_json::from_slice(&data).ok()
}

fn sidecar_path(muxed_path: &Path) -> PathBuf {
    let mut name = muxed_path.as_os_str().to_os_string();
    name.push(".meta");
    PathBuf::from(name)
}
