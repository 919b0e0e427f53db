//! Keyframe cache for late joiners
//!
//! A viewer that connects mid-stream cannot decode anything until it has
//! seen SPS, PPS, and a keyframe. The broadcaster keeps the most recent of
//! each here so new viewers can be primed immediately instead of waiting
//! out the GOP.

use crate::media::{NalUnit, NaluType};

/// Most recent SPS / PPS / IDR observed on the ingest stream.
#[derive(Debug, Default)]
pub struct KeyframeCache {
    sps: Option<NalUnit>,
    pps: Option<NalUnit>,
    last_idr: Option<NalUnit>,
}

impl KeyframeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `nalu` if it is a parameter set or keyframe.
    ///
    /// SPS and PPS rarely change, so they are only reassigned when the
    /// bytes differ. Every IDR is different and always replaces the cache.
    pub fn observe(&mut self, nalu: &NalUnit) {
        match nalu.nalu_type() {
            NaluType::Sps => {
                if self.sps.as_ref().map(|c| c.as_bytes()) != Some(nalu.as_bytes()) {
                    self.sps = Some(nalu.clone());
                }
            }
            NaluType::Pps => {
                if self.pps.as_ref().map(|c| c.as_bytes()) != Some(nalu.as_bytes()) {
                    self.pps = Some(nalu.clone());
                }
            }
            NaluType::Idr => {
                self.last_idr = Some(nalu.clone());
            }
            _ => {}
        }
    }

    /// Copies of the cached units, in decode order (SPS, PPS, IDR).
    pub fn snapshot(&self) -> [Option<NalUnit>; 3] {
        [self.sps.clone(), self.pps.clone(), self.last_idr.clone()]
    }

    pub fn has_parameter_sets(&self) -> bool {
        self.sps.is_some() && self.pps.is_some()
    }
}
