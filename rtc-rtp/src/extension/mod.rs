//! Payloads of the RTP header extensions the media stream stamps and reads.

pub mod abs_send_time_extension;
pub mod audio_level_extension;
pub mod transport_cc_extension;

/// Well known header extension URIs negotiated through `a=extmap`.
pub const ABS_SEND_TIME_URI: &str = "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time";
pub const TRANSPORT_CC_URI: &str =
    "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01";
pub const SSRC_AUDIO_LEVEL_URI: &str = "urn:ietf:params:rtp-hdrext:ssrc-audio-level";
pub const CSRC_AUDIO_LEVEL_URI: &str = "urn:ietf:params:rtp-hdrext:csrc-audio-level";
pub const ORIGINAL_HEADER_BLOCK_URI: &str = "urn:ietf:params:rtp-hdrext:ohb";
pub const FRAME_MARKING_URI: &str = "http://tools.ietf.org/html/draft-ietf-avtext-framemarking-07";
