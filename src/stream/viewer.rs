//! Per-viewer pacing and RTP delivery
//!
//! Each WebRTC viewer owns a bounded NAL inbox, an RTP packetizer, and a
//! monotonic 90 kHz timestamp cursor. A dedicated drain task is the only
//! writer to the viewer's track; it multiplexes the inbox, a once-a-second
//! stats tick, and the done signal.
//!
//! Timestamps come from the cursor, not the wall clock: the cursor advances
//! by `90000 / fps` per logical frame, which keeps the RTP clock smooth
//! even when NAL arrivals jitter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp::codecs::h264::H264Payloader;
use webrtc::rtp::packet::Packet;
use webrtc::rtp::packetizer::{new_packetizer, Packetizer};
use webrtc::rtp::sequence::new_random_sequencer;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;

use crate::media::NalUnit;

/// RTP payload budget per packet.
pub const MAX_PAYLOAD_SIZE: usize = 1200;

/// Dynamic payload type negotiated for H.264.
pub const VIDEO_PAYLOAD_TYPE: u8 = 96;

/// Video RTP clock rate.
pub const VIDEO_CLOCK_RATE: u32 = 90000;

/// Per-viewer NAL inbox depth; sized to tolerate bursts.
const INBOX_CAPACITY: usize = 500;

static NEXT_VIEWER_ID: AtomicU64 = AtomicU64::new(1);

/// Where a viewer's RTP packets go.
///
/// The production impl wraps a peer connection and its video track; tests
/// substitute a recorder of packets so the pacing engine can be exercised
/// without ICE or DTLS.
#[async_trait]
pub trait RtpOutput: Send + Sync {
    /// Whether the transport is ready for live media.
    fn is_connected(&self) -> bool;

    async fn write_rtp(&self, packet: &Packet) -> Result<(), webrtc::Error>;

    /// Tear down the underlying transport.
    async fn close(&self);
}

/// `RtpOutput` over a real peer connection and local track.
pub struct PeerOutput {
    peer: Arc<RTCPeerConnection>,
    track: Arc<TrackLocalStaticRTP>,
}

impl PeerOutput {
    pub fn new(peer: Arc<RTCPeerConnection>, track: Arc<TrackLocalStaticRTP>) -> Self {
        Self { peer, track }
    }
}

#[async_trait]
impl RtpOutput for PeerOutput {
    fn is_connected(&self) -> bool {
        self.peer.connection_state() == RTCPeerConnectionState::Connected
    }

    async fn write_rtp(&self, packet: &Packet) -> Result<(), webrtc::Error> {
        self.track.write_rtp(packet).await.map(|_| ())
    }

    async fn close(&self) {
        if let Err(e) = self.peer.close().await {
            log::warn!("Error closing peer connection: {}", e);
        }
    }
}

/// Stats message pushed over the viewer's data channel once per second.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameStats {
    pub sent_frames: u64,
    pub dropped_frames: u64,
    /// Unix millis when the sample was taken
    pub timestamp: i64,
}

/// Packetizer plus the timestamp cursor it paces.
struct Pacer {
    packetizer: Box<dyn Packetizer + Send + Sync>,
    ts_cursor: u32,
    ts_inc: u32,
}

/// One connected WebRTC viewer.
pub struct Viewer {
    id: u64,
    output: Arc<dyn RtpOutput>,
    pacer: Mutex<Pacer>,
    inbox_tx: mpsc::Sender<NalUnit>,
    inbox_rx: StdMutex<Option<mpsc::Receiver<NalUnit>>>,
    data_channel: StdMutex<Option<Arc<RTCDataChannel>>>,
    sent_frames: AtomicU64,
    dropped_frames: AtomicU64,
    done: CancellationToken,
    drain: Mutex<Option<JoinHandle<()>>>,
}

impl Viewer {
    pub fn new(output: Arc<dyn RtpOutput>, fps: u32) -> Self {
        let fps = if fps == 0 { 30 } else { fps };
        let packetizer: Box<dyn Packetizer + Send + Sync> = Box::new(new_packetizer(
            MAX_PAYLOAD_SIZE,
            VIDEO_PAYLOAD_TYPE,
            rand::random::<u32>(),
            Box::<H264Payloader>::default(),
            Box::new(new_random_sequencer()),
            VIDEO_CLOCK_RATE,
        ));
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);

        Self {
            id: NEXT_VIEWER_ID.fetch_add(1, Ordering::Relaxed),
            output,
            pacer: Mutex::new(Pacer {
                packetizer,
                ts_cursor: 0,
                ts_inc: VIDEO_CLOCK_RATE / fps,
            }),
            inbox_tx,
            inbox_rx: StdMutex::new(Some(inbox_rx)),
            data_channel: StdMutex::new(None),
            sent_frames: AtomicU64::new(0),
            dropped_frames: AtomicU64::new(0),
            done: CancellationToken::new(),
            drain: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn sent_frames(&self) -> u64 {
        self.sent_frames.load(Ordering::Relaxed)
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Non-blocking enqueue from the broadcaster. A full inbox drops the
    /// unit and charges this viewer only.
    pub fn try_enqueue(&self, nalu: NalUnit) {
        if self.inbox_tx.try_send(nalu).is_err() {
            self.dropped_frames.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Store the peer-initiated stats channel. The browser opens it; we
    /// only ever observe the handle.
    pub fn set_data_channel(&self, dc: Arc<RTCDataChannel>) {
        let mut slot = self.data_channel.lock().unwrap();
        *slot = Some(dc);
    }

    /// Packetize one NAL unit and write it out, advancing the timestamp
    /// cursor by one frame increment. Every fragment of the unit carries
    /// the same timestamp. Write errors are logged and tolerated; the
    /// connection-state machinery handles actual teardown.
    pub async fn send_nalu(&self, nalu: &NalUnit) {
        let mut pacer = self.pacer.lock().await;
        pacer.ts_cursor = pacer.ts_cursor.wrapping_add(pacer.ts_inc);
        let timestamp = pacer.ts_cursor;
        let samples = pacer.ts_inc;

        let packets = match pacer.packetizer.packetize(nalu.as_bytes(), samples) {
            Ok(packets) => packets,
            Err(e) => {
                log::warn!("Packetize error: {}", e);
                return;
            }
        };
        drop(pacer);

        for mut packet in packets {
            packet.header.timestamp = timestamp;
            if let Err(e) = self.output.write_rtp(&packet).await {
                log::warn!("WriteRTP error: {}", e);
            }
        }
    }

    /// Start the drain task. Called exactly once, after the viewer has
    /// been primed and registered.
    pub async fn spawn_drain(self: &Arc<Self>) {
        let inbox = self.inbox_rx.lock().unwrap().take();
        let Some(inbox) = inbox else {
            log::error!("Viewer {} drain task started twice", self.id);
            return;
        };
        let viewer = Arc::clone(self);
        let handle = tokio::spawn(async move {
            drain_loop(viewer, inbox).await;
        });
        *self.drain.lock().await = Some(handle);
    }

    /// Signal the drain task and wait for it to finish.
    pub async fn shutdown(&self) {
        self.done.cancel();
        let handle = self.drain.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Close the underlying transport.
    pub async fn close_output(&self) {
        self.output.close().await;
    }

    async fn send_stats(&self) {
        let dc = self.data_channel.lock().unwrap().clone();
        let Some(dc) = dc else { return };
        if dc.ready_state() != RTCDataChannelState::Open {
            return;
        }

        let stats = FrameStats {
            sent_frames: self.sent_frames(),
            dropped_frames: self.dropped_frames(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        match serde_json::to_string(&stats) {
            Ok(json) => {
                if let Err(e) = dc.send_text(json).await {
                    log::warn!("Error sending stats: {}", e);
                }
            }
            Err(e) => log::warn!("Error serializing stats: {}", e),
        }
    }
}

async fn drain_loop(viewer: Arc<Viewer>, mut inbox: mpsc::Receiver<NalUnit>) {
    let period = Duration::from_secs(1);
    let mut stats_tick = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            received = inbox.recv() => {
                let Some(nalu) = received else { return };
                if viewer.output.is_connected() {
                    viewer.send_nalu(&nalu).await;
                    viewer.sent_frames.fetch_add(1, Ordering::Relaxed);
                }
            }
            _ = stats_tick.tick() => {
                viewer.send_stats().await;
            }
            _ = viewer.done.cancelled() => {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_wire_format() {
        let stats = FrameStats {
            sent_frames: 10,
            dropped_frames: 2,
            timestamp: 1_700_000_000_000,
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["sentFrames"], 10);
        assert_eq!(json["droppedFrames"], 2);
        assert_eq!(json["timestamp"], 1_700_000_000_000i64);
    }
}
