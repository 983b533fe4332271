//! Serializable status snapshots served by the admin and status APIs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{SessionId, StreamKey};

/// One simulcast layer of a publisher's audio
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioTrackState {
    pub rid: String,
    pub priority: u32,
    pub packets_received: u64,
    pub packets_dropped: u64,
    pub last_received: Option<DateTime<Utc>>,
}

/// One simulcast layer of a publisher's video
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoTrackState {
    pub rid: String,
    pub priority: u32,
    /// Bytes received during the last second
    pub bitrate: u64,
    pub packets_received: u64,
    pub packets_dropped: u64,
    pub last_received: Option<DateTime<Utc>>,
    pub last_keyframe: Option<DateTime<Utc>>,
}

/// Outbound state of one subscriber
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhepSessionState {
    pub id: SessionId,

    pub audio_layer_current: String,
    pub audio_timestamp: u32,
    pub audio_packets_written: u64,
    pub audio_packets_dropped: u64,
    pub audio_sequence_number: u16,

    pub video_layer_current: String,
    pub video_timestamp: u32,
    /// Bytes written during the last second
    pub video_bitrate: u64,
    pub video_packets_written: u64,
    pub video_packets_dropped: u64,
    pub video_sequence_number: u16,
}

/// Full state of one stream, the payload of the admin status API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSessionState {
    pub stream_key: StreamKey,
    pub stream_start: DateTime<Utc>,
    pub is_public: bool,
    pub motd: String,
    pub audio_tracks: Vec<AudioTrackState>,
    pub video_tracks: Vec<VideoTrackState>,
    pub sessions: Vec<WhepSessionState>,
}

/// Summary pushed to viewers in `status` events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatus {
    pub stream_key: StreamKey,
    pub motd: String,
    pub viewers: usize,
    pub is_online: bool,
    pub stream_start: DateTime<Utc>,
}

/// Layers a publisher currently offers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AvailableLayers {
    pub audio: Vec<String>,
    pub video: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_status_uses_camel_case() {
        let status = StreamStatus {
            stream_key: StreamKey::from("live"),
            motd: "hello".to_string(),
            viewers: 3,
            is_online: true,
            stream_start: Utc::now(),
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["streamKey"], "live");
        assert_eq!(json["isOnline"], true);
        assert_eq!(json["viewers"], 3);
        assert!(json.get("streamStart").is_some());
    }

    #[test]
    fn test_whep_state_field_names() {
        let state = WhepSessionState {
            id: SessionId::from("abc"),
            audio_layer_current: "Audio".to_string(),
            audio_timestamp: 5000,
            audio_packets_written: 1,
            audio_packets_dropped: 0,
            audio_sequence_number: 5000,
            video_layer_current: "high".to_string(),
            video_timestamp: 5000,
            video_bitrate: 0,
            video_packets_written: 2,
            video_packets_dropped: 1,
            video_sequence_number: 5001,
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["id"], "abc");
        assert_eq!(json["videoLayerCurrent"], "high");
        assert_eq!(json["videoPacketsDropped"], 1);
        assert_eq!(json["audioSequenceNumber"], 5000);
    }
}
