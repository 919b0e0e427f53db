//! Fan-out engine: keyframe cache, viewer registry, per-viewer pacing,
//! and the broadcast loop that feeds them.

pub mod broadcast;
pub mod cache;
pub mod registry;
pub mod viewer;

pub use broadcast::run_broadcaster;
pub use cache::KeyframeCache;
pub use registry::ViewerRegistry;
pub use viewer::{FrameStats, PeerOutput, RtpOutput, Viewer};
