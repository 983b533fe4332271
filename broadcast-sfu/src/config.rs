//! SFU Configuration

use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sfu: SfuConfig,
    pub webrtc: WebRtcConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from an optional file, overridden by
    /// `BROADCAST__<SECTION>__<FIELD>` environment variables.
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("BROADCAST")
                .prefix_separator("__")
                .separator("__")
                .list_separator("|")
                .with_list_parse_key("webrtc.stun_servers")
                .with_list_parse_key("webrtc.nat_1to1_ips")
                .with_list_parse_key("webrtc.network_types")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }
}

/// How relayed packets reach a subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayMode {
    /// Write from the publisher's read loop
    Direct,
    /// Hand off through a bounded per-subscriber queue, dropping when full
    Queued,
}

/// Session engine tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SfuConfig {
    /// Status broadcast and emptiness check period
    pub status_interval_ms: u64,
    /// Subscriber snapshot refresh period
    pub snapshot_interval_ms: u64,
    /// Minimum spacing between two PLIs sent for the same SSRC
    pub pli_debounce_ms: u64,
    pub pli_channel_capacity: usize,
    pub track_change_channel_capacity: usize,
    pub sse_channel_capacity: usize,
    pub relay_mode: RelayMode,
    pub audio_queue_capacity: usize,
    pub video_queue_capacity: usize,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            status_interval_ms: 5000,
            snapshot_interval_ms: 1000,
            pli_debounce_ms: 2000,
            pli_channel_capacity: 50,
            track_change_channel_capacity: 50,
            sse_channel_capacity: 100,
            relay_mode: RelayMode::Queued,
            audio_queue_capacity: 50,
            video_queue_capacity: 50,
        }
    }
}

impl SfuConfig {
    #[must_use]
    pub const fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }

    #[must_use]
    pub const fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }

    #[must_use]
    pub const fn pli_debounce(&self) -> Duration {
        Duration::from_millis(self.pli_debounce_ms)
    }
}

/// TURN server entry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnServer {
    /// e.g. "turn:turn.example.com:3478"
    pub url: String,
    pub username: String,
    pub credential: String,
}

/// ICE and transport settings used to build peer connections
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    /// e.g. "stun:stun.l.google.com:19302"
    pub stun_servers: Vec<String>,
    pub turn_servers: Vec<TurnServer>,
    /// Public addresses advertised instead of the host candidates
    pub nat_1to1_ips: Vec<String>,
    /// "host" or "srflx"
    pub nat_candidate_type: String,
    /// Any of "udp4", "udp6", "tcp4", "tcp6"
    pub network_types: Vec<String>,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: Vec::new(),
            turn_servers: Vec::new(),
            nat_1to1_ips: Vec::new(),
            nat_candidate_type: "host".to_string(),
            network_types: vec!["udp4".to_string(), "udp6".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}
