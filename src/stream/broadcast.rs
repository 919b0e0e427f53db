//! Broadcast loop: camera channel -> keyframe cache, recorder, viewers
//!
//! Single consumer of the camera's NAL channel. All downstream deliveries
//! are non-blocking: a stalled viewer or recorder can only lose its own
//! frames, never delay the others.

use std::sync::Arc;

use tokio::sync::broadcast;

use super::registry::ViewerRegistry;
use crate::media::NalUnit;
use crate::recording::RecorderManager;

/// Run until the camera channel closes.
pub async fn run_broadcaster(
    registry: Arc<ViewerRegistry>,
    recorder: Option<Arc<RecorderManager>>,
    mut nalu_rx: broadcast::Receiver<NalUnit>,
) {
    let mut lagged_total: u64 = 0;

    loop {
        match nalu_rx.recv().await {
            Ok(nalu) => {
                registry.update_cache(&nalu).await;

                if let Some(recorder) = &recorder {
                    recorder.try_forward(nalu.clone());
                }

                registry.fan_out(&nalu).await;
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                // Ingest outpaced us; the channel already dropped the
                // oldest n units.
                lagged_total += n;
                log::warn!("Broadcaster lagging, {} NAL units dropped", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }

    if lagged_total > 0 {
        log::info!("Broadcast loop finished, {} NAL units dropped in total", lagged_total);
    } else {
        log::info!("Broadcast loop finished");
    }
}
