//! Registry of live viewers
//!
//! Threadsafe set of viewers plus the keyframe cache. Registration primes
//! the new viewer with cached SPS/PPS/IDR while holding the same write
//! lock the broadcaster's iteration contends on, so a viewer can never
//! observe a live NAL unit before its priming burst.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::cache::KeyframeCache;
use super::viewer::Viewer;
use crate::media::NalUnit;

pub struct ViewerRegistry {
    viewers: RwLock<HashMap<u64, Arc<Viewer>>>,
    cache: RwLock<KeyframeCache>,
}

impl ViewerRegistry {
    pub fn new() -> Self {
        Self {
            viewers: RwLock::new(HashMap::new()),
            cache: RwLock::new(KeyframeCache::new()),
        }
    }

    /// Register a viewer: prime it with the cached keyframes, insert it,
    /// then start its drain task.
    ///
    /// Priming and insertion happen under the viewers write lock; the
    /// broadcaster needs the read lock to forward, so delivery of live
    /// units is serialized behind the priming burst.
    pub async fn add(&self, viewer: Arc<Viewer>) {
        let mut viewers = self.viewers.write().await;

        let cached = self.cache.read().await.snapshot();
        for nalu in cached.into_iter().flatten() {
            viewer.send_nalu(&nalu).await;
        }

        viewers.insert(viewer.id(), Arc::clone(&viewer));
        drop(viewers);

        viewer.spawn_drain().await;
        log::info!("Viewer {} registered", viewer.id());
    }

    /// Deregister and tear down a viewer. Returns false when it was
    /// already gone (teardown can race between the connection-state
    /// handler and shutdown).
    pub async fn remove(&self, id: u64) -> bool {
        let viewer = self.viewers.write().await.remove(&id);
        let Some(viewer) = viewer else { return false };

        viewer.shutdown().await;
        viewer.close_output().await;
        log::info!("Viewer {} removed", id);
        true
    }

    /// Record a NAL unit in the keyframe cache. Only the broadcaster
    /// calls this.
    pub async fn update_cache(&self, nalu: &NalUnit) {
        self.cache.write().await.observe(nalu);
    }

    /// Non-blocking delivery of one unit to every registered inbox.
    pub async fn fan_out(&self, nalu: &NalUnit) {
        let viewers = self.viewers.read().await;
        for viewer in viewers.values() {
            viewer.try_enqueue(nalu.clone());
        }
    }

    pub async fn viewer_count(&self) -> usize {
        self.viewers.read().await.len()
    }

    /// Whether SPS and PPS have been observed, i.e. whether a late joiner
    /// can be primed into a decodable state.
    pub async fn has_cached_keyframes(&self) -> bool {
        self.cache.read().await.has_parameter_sets()
    }

    /// Tear down every viewer; used at process shutdown.
    pub async fn close_all(&self) {
        let viewers: Vec<Arc<Viewer>> = {
            let mut map = self.viewers.write().await;
            map.drain().map(|(_, v)| v).collect()
        };
        for viewer in viewers {
            viewer.shutdown().await;
            viewer.close_output().await;
        }
    }
}

impl Default for ViewerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
