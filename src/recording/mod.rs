//! Server-side recording
//!
//! A parallel sink on the NAL stream that writes a gated raw H.264 file
//! and hands it to ffmpeg for MP4 muxing when the recording stops.
//!
//! The active file is written as `recording_<ts>.h264.tmp` and promoted to
//! `recording_<ts>.h264` with an atomic rename on stop; external watchers
//! of the recording directory must key on the rename, never on file
//! creation.

mod recorder;

pub use recorder::{
    DownloadError, RecorderManager, RecordingFile, RecordingMeta, RecordingStatus,
};
