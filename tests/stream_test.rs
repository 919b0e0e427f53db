//! Fan-out engine integration tests
//!
//! Exercise the broadcaster, registry, and per-viewer pacing against a
//! mock RTP output, so no ICE/DTLS is required: cold and late joins,
//! backpressure isolation, and the timestamp rules.
//!
//! Note on observable packets: the H264 payloader aggregates SPS/PPS into
//! a STAP-A that precedes the next VCL NAL, so parameter sets advance the
//! timestamp cursor without emitting standalone packets.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use webrtc::rtp::packet::Packet;

use camrelay::media::NalUnit;
use camrelay::stream::{run_broadcaster, RtpOutput, Viewer, ViewerRegistry};

/// Collects written packets; optionally stalls forever to model a peer
/// whose transport never drains.
struct MockOutput {
    connected: AtomicBool,
    block_writes: bool,
    packets: Mutex<Vec<Packet>>,
}

impl MockOutput {
    fn new(connected: bool, block_writes: bool) -> Arc<Self> {
        Arc::new(Self {
            connected: AtomicBool::new(connected),
            block_writes,
            packets: Mutex::new(Vec::new()),
        })
    }

    fn packets(&self) -> Vec<Packet> {
        self.packets.lock().unwrap().clone()
    }
}

#[async_trait]
impl RtpOutput for MockOutput {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn write_rtp(&self, packet: &Packet) -> Result<(), webrtc::Error> {
        if self.block_writes {
            std::future::pending::<()>().await;
        }
        self.packets.lock().unwrap().push(packet.clone());
        Ok(())
    }

    async fn close(&self) {}
}

fn sps() -> NalUnit {
    NalUnit::from_payload(&[0x67, 0x42, 0x00, 0x1F])
}

fn pps() -> NalUnit {
    NalUnit::from_payload(&[0x68, 0xCE, 0x3C, 0x80])
}

fn idr(size: usize) -> NalUnit {
    let mut payload = vec![0x65];
    payload.extend(std::iter::repeat(0xAB).take(size));
    NalUnit::from_payload(&payload)
}

/// P slice carrying a sequence counter in its first two body bytes.
fn p_slice(seq: u16) -> NalUnit {
    let mut payload = vec![0x41];
    payload.extend_from_slice(&seq.to_be_bytes());
    NalUnit::from_payload(&payload)
}

async fn wait_until<F: Fn() -> bool>(cond: F, what: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Unique timestamps in packet-arrival order.
fn timestamps(packets: &[Packet]) -> Vec<u32> {
    let mut ts: Vec<u32> = packets.iter().map(|p| p.header.timestamp).collect();
    ts.dedup();
    ts
}

#[tokio::test]
async fn test_cold_join_receives_full_sequence() {
    let registry = Arc::new(ViewerRegistry::new());
    let (tx, rx) = broadcast::channel(64);
    let broadcaster = tokio::spawn(run_broadcaster(Arc::clone(&registry), None, rx));

    let output = MockOutput::new(true, false);
    let viewer = Arc::new(Viewer::new(output.clone(), 30));
    registry.add(Arc::clone(&viewer)).await;

    for unit in [sps(), pps(), idr(16), p_slice(1), p_slice(2), p_slice(3)] {
        tx.send(unit).unwrap();
    }

    wait_until(|| viewer.sent_frames() == 6, "all six NAL units to be sent").await;
    assert_eq!(viewer.dropped_frames(), 0);

    // Cursor: SPS 3000, PPS 6000 (aggregated, no packets), IDR 9000,
    // then 12000 / 15000 / 18000 for the P slices.
    let packets = output.packets();
    assert_eq!(timestamps(&packets), vec![9000, 12000, 15000, 18000]);

    // The keyframe's first packet is the STAP-A carrying SPS+PPS.
    assert_eq!(packets[0].payload[0] & 0x1F, 24);

    drop(tx);
    broadcaster.await.unwrap();
}

#[tokio::test]
async fn test_late_join_primed_before_live() {
    let registry = Arc::new(ViewerRegistry::new());
    let (tx, rx) = broadcast::channel(64);
    let _broadcaster = tokio::spawn(run_broadcaster(Arc::clone(&registry), None, rx));

    // A canary viewer fences the test: once it has seen all six units,
    // the broadcaster is fully caught up and the cache is warm.
    let canary_output = MockOutput::new(true, false);
    let canary = Arc::new(Viewer::new(canary_output, 30));
    registry.add(Arc::clone(&canary)).await;

    for unit in [sps(), pps(), idr(16), p_slice(1), p_slice(2), p_slice(3)] {
        tx.send(unit).unwrap();
    }
    wait_until(|| canary.sent_frames() == 6, "broadcaster to catch up").await;
    assert!(registry.has_cached_keyframes().await);

    let output = MockOutput::new(true, false);
    let viewer = Arc::new(Viewer::new(output.clone(), 30));
    registry.add(Arc::clone(&viewer)).await;

    // Priming happens during add, before any further live unit exists.
    let primed = output.packets();
    assert!(!primed.is_empty(), "priming produced no packets");
    assert_eq!(timestamps(&primed), vec![9000]);
    assert_eq!(primed[0].payload[0] & 0x1F, 24, "expected STAP-A with SPS+PPS");

    // Live NALs delivered after the burst, cursor continuing monotonically.
    tx.send(p_slice(4)).unwrap();
    tx.send(p_slice(5)).unwrap();
    wait_until(|| viewer.sent_frames() == 2, "live NAL units after join").await;

    let packets = output.packets();
    assert_eq!(timestamps(&packets), vec![9000, 12000, 15000]);
}

#[tokio::test]
async fn test_backpressure_isolation() {
    const EMITTED: u16 = 800;

    let registry = Arc::new(ViewerRegistry::new());
    let (tx, rx) = broadcast::channel(2000);
    let _broadcaster = tokio::spawn(run_broadcaster(Arc::clone(&registry), None, rx));

    // Viewer A stalls on its first write and never drains its inbox.
    let stalled_output = MockOutput::new(true, true);
    let stalled = Arc::new(Viewer::new(stalled_output, 30));
    // Viewer B consumes at full speed.
    let fast_output = MockOutput::new(true, false);
    let fast = Arc::new(Viewer::new(fast_output.clone(), 30));

    registry.add(Arc::clone(&stalled)).await;
    registry.add(Arc::clone(&fast)).await;

    for seq in 0..EMITTED {
        tx.send(p_slice(seq)).unwrap();
    }

    wait_until(
        || fast.sent_frames() == EMITTED as u64,
        "fast viewer to receive everything",
    )
    .await;

    assert_eq!(fast.dropped_frames(), 0);
    assert!(
        stalled.dropped_frames() > 0,
        "stalled viewer should have dropped frames"
    );

    // Per-viewer ordering: the fast viewer saw the P slices in emission
    // order, none missing.
    let sequence: Vec<u16> = fast_output
        .packets()
        .iter()
        .filter(|p| p.payload[0] & 0x1F == 1)
        .map(|p| u16::from_be_bytes([p.payload[1], p.payload[2]]))
        .collect();
    let expected: Vec<u16> = (0..EMITTED).collect();
    assert_eq!(sequence, expected);

    // The stalled viewer must not be torn down through the registry here:
    // its drain task is wedged inside the blocking mock write.
}

#[tokio::test]
async fn test_fragments_share_timestamp() {
    let output = MockOutput::new(true, false);
    let viewer = Viewer::new(output.clone(), 30);

    // Big enough to force FU-A fragmentation at the 1200-byte budget.
    viewer.send_nalu(&idr(5000)).await;
    let packets = output.packets();
    assert!(packets.len() > 1, "expected fragmentation");
    assert!(packets.iter().all(|p| p.header.timestamp == 3000));

    // Next NAL advances by exactly one frame increment.
    viewer.send_nalu(&p_slice(1)).await;
    let packets = output.packets();
    assert_eq!(packets.last().unwrap().header.timestamp, 6000);
}

#[tokio::test]
async fn test_disconnected_viewer_consumes_without_sending() {
    let registry = Arc::new(ViewerRegistry::new());
    let (tx, rx) = broadcast::channel(64);
    let _broadcaster = tokio::spawn(run_broadcaster(Arc::clone(&registry), None, rx));

    let output = MockOutput::new(false, false);
    let viewer = Arc::new(Viewer::new(output.clone(), 30));
    registry.add(Arc::clone(&viewer)).await;

    for seq in 0..50 {
        tx.send(p_slice(seq)).unwrap();
    }

    // The drain keeps the inbox empty but writes nothing while the peer
    // is not connected.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(viewer.sent_frames(), 0);
    assert_eq!(viewer.dropped_frames(), 0);
    assert!(output.packets().is_empty());

    registry.remove(viewer.id()).await;
    assert_eq!(registry.viewer_count().await, 0);
}
