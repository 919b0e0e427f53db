//! camrelay: live H.264 camera streaming to browsers over WebRTC
//!
//! This crate relays a raw H.264 Annex-B stream from a camera process to
//! any number of concurrent WebRTC viewers, with optional server-side
//! recording to MP4.
//!
//! # Architecture
//! - Camera subprocess stdout -> NAL unit parsing (`camera`, `media`)
//! - Single broadcast loop with keyframe caching (`stream`)
//! - Per-viewer bounded inboxes, RTP pacing, and drop-on-overflow
//!   backpressure (`stream::viewer`)
//! - HTTP signaling and recording control (`server`, `webrtc`)
//! - Gated H.264 recording with atomic publication and ffmpeg muxing
//!   (`recording`)
//!
//! Each camera runs its own server instance; there is no multi-camera
//! aggregation in one process.

pub mod camera;
pub mod config;
pub mod errors;
pub mod media;
pub mod recording;
pub mod server;
pub mod stream;
pub mod webrtc;

// Re-exports for convenience
pub use camera::CameraSource;
pub use config::ServerConfig;
pub use errors::ServerError;
pub use media::{AnnexBSplitter, NalUnit, NaluType};
pub use recording::{RecorderManager, RecordingStatus};
pub use stream::{run_broadcaster, Viewer, ViewerRegistry};
