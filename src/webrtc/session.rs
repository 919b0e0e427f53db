//! Offer/answer negotiation and viewer setup
//!
//! One `POST /offer` allocates a peer connection, a video track, and a
//! viewer, then answers with every ICE candidate embedded. The viewer is
//! registered only after the answer is ready, so its priming burst and
//! drain task start together.

use std::sync::Arc;
use std::time::Duration;

use webrtc::api::media_engine::MIME_TYPE_H264;
use webrtc::api::API;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

use crate::errors::ServerError;
use crate::stream::{PeerOutput, Viewer, ViewerRegistry};

/// How long the answer may wait for ICE gathering to complete.
const ICE_GATHER_TIMEOUT: Duration = Duration::from_secs(5);

/// Negotiate one viewer session from an SDP offer.
///
/// Any failure before the answer is produced closes the partially built
/// peer connection.
pub async fn negotiate(
    api: &API,
    registry: Arc<ViewerRegistry>,
    framerate: u32,
    offer: RTCSessionDescription,
) -> Result<RTCSessionDescription, ServerError> {
    let peer = Arc::new(
        api.new_peer_connection(RTCConfiguration::default())
            .await
            .map_err(|e| {
                ServerError::WebrtcError(format!("failed to create peer connection: {}", e))
            })?,
    );

    match negotiate_viewer(&peer, registry, framerate, offer).await {
        Ok(answer) => Ok(answer),
        Err(e) => {
            let _ = peer.close().await;
            Err(e)
        }
    }
}

async fn negotiate_viewer(
    peer: &Arc<RTCPeerConnection>,
    registry: Arc<ViewerRegistry>,
    framerate: u32,
    offer: RTCSessionDescription,
) -> Result<RTCSessionDescription, ServerError> {
    let track = Arc::new(TrackLocalStaticRTP::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_H264.to_owned(),
            ..Default::default()
        },
        "video".to_owned(),
        "camrelay".to_owned(),
    ));

    peer.add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
        .await
        .map_err(|e| ServerError::WebrtcError(format!("failed to add track: {}", e)))?;

    let output = Arc::new(PeerOutput::new(Arc::clone(peer), track));
    let viewer = Arc::new(Viewer::new(output, framerate));
    let viewer_id = viewer.id();

    // The browser opens the stats channel; we only store the handle.
    {
        let viewer = Arc::clone(&viewer);
        peer.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            log::info!("Data channel received from client: {}", dc.label());
            let viewer = Arc::clone(&viewer);
            Box::pin(async move {
                dc.on_open(Box::new(|| {
                    log::info!("Data channel opened");
                    Box::pin(async {})
                }));
                dc.on_close(Box::new(|| {
                    log::info!("Data channel closed");
                    Box::pin(async {})
                }));
                dc.on_error(Box::new(|e| {
                    Box::pin(async move {
                        log::warn!("Data channel error: {}", e);
                    })
                }));
                viewer.set_data_channel(dc);
            })
        }));
    }

    // Teardown rides on connection state; removal also closes the peer.
    {
        let registry = Arc::clone(&registry);
        peer.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            log::info!("PeerConnection state: {}", state);
            let registry = Arc::clone(&registry);
            Box::pin(async move {
                if matches!(
                    state,
                    RTCPeerConnectionState::Disconnected
                        | RTCPeerConnectionState::Failed
                        | RTCPeerConnectionState::Closed
                ) {
                    registry.remove(viewer_id).await;
                }
            })
        }));
    }

    // Trickle is disabled; candidates are only logged here.
    peer.on_ice_candidate(Box::new(|candidate: Option<RTCIceCandidate>| {
        if let Some(candidate) = candidate {
            log::debug!("New ICE candidate: {:?}", candidate);
        }
        Box::pin(async {})
    }));

    peer.set_remote_description(offer)
        .await
        .map_err(|e| ServerError::WebrtcError(format!("failed to set remote description: {}", e)))?;

    let answer = peer
        .create_answer(None)
        .await
        .map_err(|e| ServerError::WebrtcError(format!("failed to create answer: {}", e)))?;
    peer.set_local_description(answer)
        .await
        .map_err(|e| ServerError::WebrtcError(format!("failed to set local description: {}", e)))?;

    // Bounded wait; a slow network answers with whatever was gathered.
    let mut gather_complete = peer.gathering_complete_promise().await;
    if tokio::time::timeout(ICE_GATHER_TIMEOUT, gather_complete.recv())
        .await
        .is_err()
    {
        log::warn!(
            "ICE gathering incomplete after {:?}, answering anyway",
            ICE_GATHER_TIMEOUT
        );
    }

    registry.add(viewer).await;

    peer.local_description()
        .await
        .ok_or_else(|| ServerError::WebrtcError("no local description available".to_string()))
}
