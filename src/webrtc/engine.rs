//! Media engine and API construction

use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264};
use webrtc::api::{APIBuilder, API};
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};

use crate::errors::ServerError;
use crate::stream::viewer::{VIDEO_CLOCK_RATE, VIDEO_PAYLOAD_TYPE};

/// Baseline-profile fmtp line browsers accept for packetization-mode 1.
pub const H264_FMTP_LINE: &str =
    "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f";

/// Build a WebRTC API with H.264 video registered at payload type 96.
pub fn build_api() -> Result<API, ServerError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_H264.to_owned(),
                    clock_rate: VIDEO_CLOCK_RATE,
                    channels: 0,
                    sdp_fmtp_line: H264_FMTP_LINE.to_owned(),
                    rtcp_feedback: vec![],
                },
                payload_type: VIDEO_PAYLOAD_TYPE,
                ..Default::default()
            },
            RTPCodecType::Video,
        )
        .map_err(|e| ServerError::WebrtcError(format!("failed to register H264 codec: {}", e)))?;

    Ok(APIBuilder::new().with_media_engine(media_engine).build())
}
