//! Server configuration
//!
//! Loads a flat `key = value` config file, applies defaults and validation,
//! and probes the recording directory before recording is offered.

use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

/// Runtime configuration for one camera relay instance.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP port the HTTP server binds to
    pub addr: u16,
    /// Camera frame width in pixels
    pub width: u32,
    /// Camera frame height in pixels
    pub height: u32,
    /// Camera frames per second
    pub framerate: u32,
    /// Sensor rotation in degrees (0, 90, 180, 270)
    pub rotation: u32,
    /// H.264 bitrate hint in bits/sec; 0 lets the encoder choose
    pub bitrate: u32,
    /// Allowed CORS origin for the HTTP API
    pub cors_origin: String,
    /// Full camera command; generated from the fields above when not set
    pub camera_cmd: Option<String>,
    /// Directory for recording artifacts; empty string disables recording
    pub recording_dir: String,
    /// Why recording is unavailable, when it is
    pub recording_unavailable_reason: String,
    /// Skip the ffmpeg MP4 conversion when a recording stops
    pub recording_skip_conversion: bool,
    /// Auto-stop a recording after this many minutes
    pub recording_max_minutes: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: 8765,
            width: 1280,
            height: 720,
            framerate: 30,
            rotation: 180,
            bitrate: 0,
            cors_origin: "*".to_string(),
            camera_cmd: None,
            recording_dir: String::new(),
            recording_unavailable_reason: String::new(),
            recording_skip_conversion: false,
            recording_max_minutes: 30.0,
        }
    }
}

impl ServerConfig {
    /// Load configuration from `path` and validate it.
    ///
    /// A missing file yields the defaults. Lines are `key = value`; `#`
    /// starts a comment; values may be wrapped in single or double quotes;
    /// unknown keys are ignored so one file can serve several tools.
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let mut conf = Self::default();

        match fs::read_to_string(path.as_ref()) {
            Ok(contents) => conf.apply(&contents),
            Err(e) => {
                log::warn!(
                    "Could not read config file {}: {} (using defaults)",
                    path.as_ref().display(),
                    e
                );
            }
        }

        conf.validate();
        conf
    }

    /// Parse `key = value` lines into the config, without validation.
    fn apply(&mut self, contents: &str) {
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, val)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let val = strip_quotes(val.trim());

            match key {
                "addr" => set_parsed(&mut self.addr, key, val),
                "width" => set_parsed(&mut self.width, key, val),
                "height" => set_parsed(&mut self.height, key, val),
                "framerate" => set_parsed(&mut self.framerate, key, val),
                "rotation" => set_parsed(&mut self.rotation, key, val),
                "bitrate" => set_parsed(&mut self.bitrate, key, val),
                "cors_origin" => self.cors_origin = val.to_string(),
                "camera_cmd" => self.camera_cmd = Some(val.to_string()),
                "recording_dir" => self.recording_dir = val.to_string(),
                "recording_skip_conversion" => {
                    self.recording_skip_conversion = val == "true";
                }
                "recording_max_minutes" => set_parsed(&mut self.recording_max_minutes, key, val),
                _ => {}
            }
        }
    }

    /// Check values and replace invalid ones with defaults, warning as we go.
    pub fn validate(&mut self) {
        if self.addr == 0 {
            log::warn!("Invalid port 0, using default 8765");
            self.addr = 8765;
        }
        if self.width == 0 {
            log::warn!("Invalid width 0, using default 1280");
            self.width = 1280;
        }
        if self.height == 0 {
            log::warn!("Invalid height 0, using default 720");
            self.height = 720;
        }
        if self.framerate == 0 || self.framerate > 120 {
            log::warn!("Invalid framerate {}, using default 30", self.framerate);
            self.framerate = 30;
        }
        if !matches!(self.rotation, 0 | 90 | 180 | 270) {
            log::warn!("Invalid rotation {}, using default 180", self.rotation);
            self.rotation = 180;
        }
        if !self.recording_max_minutes.is_finite() || self.recording_max_minutes <= 0.0 {
            log::warn!(
                "Invalid recording_max_minutes {}, using default 30",
                self.recording_max_minutes
            );
            self.recording_max_minutes = 30.0;
        }
        if self.cors_origin == "*" {
            log::warn!("CORS origin set to '*' - this is insecure for production");
        }

        if self.recording_dir.is_empty() {
            self.recording_unavailable_reason = "No recording_dir configured".to_string();
        } else {
            self.validate_recording_dir();
        }
    }

    /// Probe the recording directory, retrying while it is not yet
    /// accessible (an NFS mount may not be ready at boot). Gives up after
    /// 5 attempts 2 seconds apart and disables recording with a reason.
    fn validate_recording_dir(&mut self) {
        const MAX_RETRIES: u32 = 5;
        const RETRY_INTERVAL: Duration = Duration::from_secs(2);

        for attempt in 1..=MAX_RETRIES {
            match self.try_recording_dir() {
                None => {
                    log::info!("Recording enabled: {}", self.recording_dir);
                    self.recording_unavailable_reason.clear();
                    return;
                }
                Some(reason) => {
                    if attempt < MAX_RETRIES {
                        log::info!(
                            "Recording directory not ready (attempt {}/{}): {} - retrying in {:?}",
                            attempt,
                            MAX_RETRIES,
                            reason,
                            RETRY_INTERVAL
                        );
                        std::thread::sleep(RETRY_INTERVAL);
                    } else {
                        log::warn!(
                            "Recording directory not ready after {} attempts: {}",
                            MAX_RETRIES,
                            reason
                        );
                        self.recording_unavailable_reason = reason;
                        self.recording_dir.clear();
                    }
                }
            }
        }
    }

    /// One accessibility probe. `None` means usable; otherwise the reason.
    fn try_recording_dir(&self) -> Option<String> {
        let meta = match fs::metadata(&self.recording_dir) {
            Ok(m) => m,
            Err(e) => return Some(format!("Directory does not exist or is not accessible: {}", e)),
        };
        if !meta.is_dir() {
            return Some("Path is not a directory".to_string());
        }

        // Probe writability by touching a scratch file.
        let test_file = Path::new(&self.recording_dir).join(".write_test");
        if let Err(e) = fs::File::create(&test_file) {
            return Some(format!("Directory is not writable: {}", e));
        }
        let _ = fs::remove_file(&test_file);

        if !self.recording_skip_conversion && !ffmpeg_available() {
            return Some("ffmpeg not found in PATH (required for MP4 recording)".to_string());
        }

        None
    }

    /// Whether the recorder can be constructed at all.
    pub fn recording_available(&self) -> bool {
        !self.recording_dir.is_empty()
    }

    /// The shell command that produces raw Annex-B H.264 on stdout.
    ///
    /// `camera_cmd` wins when set; otherwise an rpicam-vid invocation is
    /// generated from the configured geometry.
    pub fn effective_camera_cmd(&self) -> String {
        if let Some(cmd) = &self.camera_cmd {
            return cmd.clone();
        }
        let mut cmd = format!(
            "rpicam-vid -t 0 --width {} --height {} --framerate {} --rotation {} --inline --nopreview --codec h264",
            self.width, self.height, self.framerate, self.rotation
        );
        if self.bitrate > 0 {
            cmd.push_str(&format!(" --bitrate {}", self.bitrate));
        }
        cmd.push_str(" -o -");
        cmd
    }

    /// One-line summary for the boot log.
    pub fn summary(&self) -> String {
        let recording = if self.recording_dir.is_empty() {
            "disabled".to_string()
        } else {
            self.recording_dir.clone()
        };
        let bitrate = if self.bitrate > 0 {
            format!("{}kbps", self.bitrate / 1000)
        } else {
            "auto".to_string()
        };
        format!(
            "Port={}, Resolution={}x{}@{}fps, Rotation={}, Bitrate={}, CORS={}, Recording={}",
            self.addr,
            self.width,
            self.height,
            self.framerate,
            self.rotation,
            bitrate,
            self.cors_origin,
            recording
        )
    }
}

fn strip_quotes(val: &str) -> &str {
    let bytes = val.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return &val[1..val.len() - 1];
        }
    }
    val
}

fn set_parsed<T: std::str::FromStr>(slot: &mut T, key: &str, val: &str) {
    match val.parse() {
        Ok(v) => *slot = v,
        Err(_) => log::warn!("Ignoring unparseable value for {}: {:?}", key, val),
    }
}

fn ffmpeg_available() -> bool {
    Command::new("ffmpeg")
        .arg("-version")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}
