//! Codec registry
//!
//! Static audio/video capability tables registered on every media engine, and
//! the classifier that maps a negotiated MIME type to a [`Codec`] tag.

use serde::{Deserialize, Serialize};
use webrtc::api::media_engine::MediaEngine;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::RTCPFeedback;

use crate::types::MediaKind;

pub const MIME_TYPE_H264: &str = "video/H264";
pub const MIME_TYPE_H265: &str = "video/H265";
pub const MIME_TYPE_VP8: &str = "video/VP8";
pub const MIME_TYPE_VP9: &str = "video/VP9";
pub const MIME_TYPE_AV1: &str = "video/AV1";
pub const MIME_TYPE_OPUS: &str = "audio/opus";

/// Codec tag carried alongside every relayed packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Codec {
    #[default]
    Unknown,
    H264,
    H265,
    Vp8,
    Vp9,
    Av1,
    Opus,
}

impl Codec {
    /// Classify a video MIME type. Unknown types map to [`Codec::Unknown`].
    #[must_use]
    pub fn from_video_mime(mime_type: &str) -> Self {
        let lower = mime_type.to_lowercase();
        // Order matters: "h264" must be checked before the broader matches
        [
            (MIME_TYPE_H264, Self::H264),
            (MIME_TYPE_VP8, Self::Vp8),
            (MIME_TYPE_VP9, Self::Vp9),
            (MIME_TYPE_AV1, Self::Av1),
            (MIME_TYPE_H265, Self::H265),
        ]
        .into_iter()
        .find(|(mime, _)| lower.contains(&mime.to_lowercase()))
        .map_or(Self::Unknown, |(_, codec)| codec)
    }

    /// Classify an audio MIME type. Unknown types map to [`Codec::Unknown`].
    #[must_use]
    pub fn from_audio_mime(mime_type: &str) -> Self {
        if mime_type.to_lowercase().contains(MIME_TYPE_OPUS) {
            Self::Opus
        } else {
            Self::Unknown
        }
    }

    /// Classify any MIME type, dispatching on its media kind.
    #[must_use]
    pub fn from_mime(mime_type: &str) -> Self {
        match MediaKind::from_mime_type(mime_type) {
            MediaKind::Audio => Self::from_audio_mime(mime_type),
            MediaKind::Video => Self::from_video_mime(mime_type),
        }
    }

    #[must_use]
    pub const fn kind(self) -> Option<MediaKind> {
        match self {
            Self::Unknown => None,
            Self::Opus => Some(MediaKind::Audio),
            Self::H264 | Self::H265 | Self::Vp8 | Self::Vp9 | Self::Av1 => Some(MediaKind::Video),
        }
    }
}

fn video_rtcp_feedback() -> Vec<RTCPFeedback> {
    [("goog-remb", ""), ("ccm", "fir"), ("nack", ""), ("nack", "pli")]
        .into_iter()
        .map(|(typ, parameter)| RTCPFeedback {
            typ: typ.to_string(),
            parameter: parameter.to_string(),
        })
        .collect()
}

fn video_codec(payload_type: u8, mime_type: &str, fmtp: &str) -> RTCRtpCodecParameters {
    RTCRtpCodecParameters {
        capability: RTCRtpCodecCapability {
            mime_type: mime_type.to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: fmtp.to_string(),
            rtcp_feedback: video_rtcp_feedback(),
        },
        payload_type,
        ..Default::default()
    }
}

/// Video capabilities offered to publishers and subscribers
#[must_use]
pub fn video_codecs() -> Vec<RTCRtpCodecParameters> {
    vec![
        video_codec(96, MIME_TYPE_H264, "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"),
        video_codec(102, MIME_TYPE_H264, "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42001f"),
        video_codec(104, MIME_TYPE_H264, "level-asymmetry-allowed=1;packetization-mode=0;profile-level-id=42001f"),
        video_codec(108, MIME_TYPE_H264, "level-asymmetry-allowed=1;packetization-mode=0;profile-level-id=42e01f"),
        video_codec(39, MIME_TYPE_H264, "level-asymmetry-allowed=1;packetization-mode=0;profile-level-id=4d001f"),
        video_codec(45, MIME_TYPE_AV1, ""),
        video_codec(98, MIME_TYPE_VP9, "profile-id=0"),
        video_codec(100, MIME_TYPE_VP9, "profile-id=2"),
        video_codec(113, MIME_TYPE_H265, "level-id=93;profile-id=1;tier-flag=0;tx-mode=SRST"),
        video_codec(115, MIME_TYPE_VP8, ""),
    ]
}

/// Audio capabilities offered to publishers and subscribers
#[must_use]
pub fn audio_codecs() -> Vec<RTCRtpCodecParameters> {
    vec![RTCRtpCodecParameters {
        capability: RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_string(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
            rtcp_feedback: Vec::new(),
        },
        payload_type: 111,
        ..Default::default()
    }]
}

/// Register every supported codec on a media engine.
pub fn register_codecs(media_engine: &mut MediaEngine) -> webrtc::error::Result<()> {
    for codec in video_codecs() {
        media_engine.register_codec(codec, RTPCodecType::Video)?;
    }
    for codec in audio_codecs() {
        media_engine.register_codec(codec, RTPCodecType::Audio)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_video() {
        assert_eq!(Codec::from_video_mime("video/H264"), Codec::H264);
        assert_eq!(Codec::from_video_mime("video/h264"), Codec::H264);
        assert_eq!(Codec::from_video_mime("video/H265"), Codec::H265);
        assert_eq!(Codec::from_video_mime("video/VP8"), Codec::Vp8);
        assert_eq!(Codec::from_video_mime("video/VP9"), Codec::Vp9);
        assert_eq!(Codec::from_video_mime("video/AV1"), Codec::Av1);
        assert_eq!(Codec::from_video_mime("video/rtx"), Codec::Unknown);
    }

    #[test]
    fn test_classify_audio() {
        assert_eq!(Codec::from_audio_mime("audio/opus"), Codec::Opus);
        assert_eq!(Codec::from_audio_mime("audio/OPUS"), Codec::Opus);
        assert_eq!(Codec::from_audio_mime("audio/PCMU"), Codec::Unknown);
        assert_eq!(Codec::from_mime("audio/opus"), Codec::Opus);
        assert_eq!(Codec::from_mime("video/VP8"), Codec::Vp8);
    }

    #[test]
    fn test_tables_classify_to_their_kind() {
        for codec in video_codecs() {
            let tag = Codec::from_mime(&codec.capability.mime_type);
            assert_eq!(tag.kind(), Some(MediaKind::Video));
        }
        for codec in audio_codecs() {
            assert_eq!(Codec::from_mime(&codec.capability.mime_type), Codec::Opus);
        }
    }

    #[test]
    fn test_register_codecs() {
        let mut media_engine = MediaEngine::default();
        assert!(register_codecs(&mut media_engine).is_ok());
    }
}
