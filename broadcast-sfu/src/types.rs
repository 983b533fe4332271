//! Common types used throughout the SFU implementation

use serde::{Deserialize, Serialize};
use std::fmt;

/// Key identifying one logical broadcast
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamKey(String);

impl StreamKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for StreamKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for StreamKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of a publisher or subscriber session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh random id
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Public part of a streaming profile, resolved from a bearer token by the
/// authorization layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicProfile {
    pub stream_key: StreamKey,
    pub is_public: bool,
    pub motd: String,
}

impl PublicProfile {
    pub fn new(stream_key: impl Into<StreamKey>) -> Self {
        Self {
            stream_key: stream_key.into(),
            is_public: true,
            motd: String::new(),
        }
    }
}

/// Media kind of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    /// Classify a negotiated MIME type. Anything that is not `audio/*` is video.
    #[must_use]
    pub fn from_mime_type(mime_type: &str) -> Self {
        if mime_type.to_ascii_lowercase().starts_with("audio") {
            Self::Audio
        } else {
            Self::Video
        }
    }
}

impl From<MediaKind> for webrtc::rtp_transceiver::rtp_codec::RTPCodecType {
    fn from(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Audio => Self::Audio,
            MediaKind::Video => Self::Video,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_kind_from_mime() {
        assert_eq!(MediaKind::from_mime_type("audio/opus"), MediaKind::Audio);
        assert_eq!(MediaKind::from_mime_type("Audio/OPUS"), MediaKind::Audio);
        assert_eq!(MediaKind::from_mime_type("video/H264"), MediaKind::Video);
        assert_eq!(MediaKind::from_mime_type(""), MediaKind::Video);
    }

    #[test]
    fn test_session_ids_are_unique() {
        assert_ne!(SessionId::generate(), SessionId::generate());
    }

    #[test]
    fn test_stream_key_serializes_as_string() {
        let key = StreamKey::from("live");
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"live\"");
    }
}
