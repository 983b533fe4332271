//! Server-sent event rendering
//!
//! Events are rendered once into their wire form
//! (`event: <name>\ndata: <json>\n\n`) and copied to every subscriber.

use serde::Serialize;
use serde_json::json;
use tracing::warn;

use crate::status::{AvailableLayers, StreamStatus};

pub const EVENT_STATUS: &str = "status";
pub const EVENT_LAYERS: &str = "layers";
pub const EVENT_STREAM_START: &str = "streamStart";
pub const EVENT_CURRENT_LAYERS: &str = "currentLayers";

fn render(name: &str, data: &impl Serialize) -> Option<String> {
    match serde_json::to_string(data) {
        Ok(json) => Some(format!("event: {name}\ndata: {json}\n\n")),
        Err(e) => {
            warn!(event = name, error = %e, "Failed to serialize SSE event");
            None
        }
    }
}

/// Periodic stream summary
#[must_use]
pub fn status(status: &StreamStatus) -> Option<String> {
    render(EVENT_STATUS, status)
}

/// Sent when a host attaches, carrying the fresh stream summary
#[must_use]
pub fn stream_start(status: &StreamStatus) -> Option<String> {
    render(EVENT_STREAM_START, status)
}

/// Layers the publisher offers. Video is keyed "1" and audio "2".
#[must_use]
pub fn layers(layers: &AvailableLayers) -> Option<String> {
    let encodings = |rids: &[String]| {
        rids.iter()
            .map(|rid| json!({ "encodingId": rid }))
            .collect::<Vec<_>>()
    };
    let data = json!({
        "1": { "layers": encodings(&layers.video) },
        "2": { "layers": encodings(&layers.audio) },
    });
    render(EVENT_LAYERS, &data)
}

/// The layers one subscriber is currently tuned to
#[must_use]
pub fn current_layers(audio_layer: &str, video_layer: &str) -> Option<String> {
    let data = json!({
        "audioLayerCurrent": audio_layer,
        "videoLayerCurrent": video_layer,
    });
    render(EVENT_CURRENT_LAYERS, &data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StreamKey;
    use chrono::Utc;

    fn data_of(event: &str) -> serde_json::Value {
        let data = event
            .lines()
            .find_map(|line| line.strip_prefix("data: "))
            .unwrap();
        serde_json::from_str(data).unwrap()
    }

    #[test]
    fn test_status_event_framing() {
        let event = status(&StreamStatus {
            stream_key: StreamKey::from("live"),
            motd: String::new(),
            viewers: 2,
            is_online: true,
            stream_start: Utc::now(),
        })
        .unwrap();

        assert!(event.starts_with("event: status\ndata: {"));
        assert!(event.ends_with("}\n\n"));
        assert_eq!(data_of(&event)["viewers"], 2);
    }

    #[test]
    fn test_layers_event_shape() {
        let event = layers(&AvailableLayers {
            audio: vec!["Audio".to_string()],
            video: vec!["high".to_string(), "low".to_string()],
        })
        .unwrap();

        assert!(event.starts_with("event: layers\n"));
        let data = data_of(&event);
        assert_eq!(data["1"]["layers"][0]["encodingId"], "high");
        assert_eq!(data["1"]["layers"][1]["encodingId"], "low");
        assert_eq!(data["2"]["layers"][0]["encodingId"], "Audio");
    }

    #[test]
    fn test_current_layers_event() {
        let event = current_layers("Audio", "low").unwrap();
        assert!(event.starts_with("event: currentLayers\n"));
        let data = data_of(&event);
        assert_eq!(data["audioLayerCurrent"], "Audio");
        assert_eq!(data["videoLayerCurrent"], "low");
    }
}
