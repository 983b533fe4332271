//! Broadcast SFU (Selective Forwarding Unit)
//!
//! A WebRTC SFU for one-to-many broadcasting. Publishers push media over
//! WHIP, viewers pull it over WHEP, and the SFU forwards RTP without
//! transcoding.
//!
//! ## Architecture
//!
//! - **`SessionManager`**: Registry of stream sessions keyed by stream key
//! - **`StreamSession`**: One broadcast, with at most one host and many viewers
//! - **`Host`**: The publisher's peer connection and its simulcast layers
//! - **`WhepSession`**: One viewer, with its own continuous RTP numbering
//! - **`MultiCodecTrack`**: Outbound track writing any negotiated codec
//!
//! ## Features
//!
//! - Simulcast layer selection per viewer, gated on keyframes
//! - Sequence number and timestamp rewriting across layer switches
//! - Debounced keyframe requests towards the publisher
//! - Bounded per-viewer relay queues that drop instead of blocking
//! - Server-sent status and layer events
//!
//! ## Usage
//!
//! ```rust,ignore
//! use broadcast_sfu::{Config, PublicProfile, SfuEngine};
//!
//! let engine = SfuEngine::new(&Config::load(Some("broadcast.toml"))?)?;
//! let answer = engine.accept_whip(&PublicProfile::new("live"), &offer).await?;
//! let viewer = engine.accept_whep(&PublicProfile::new("live"), &viewer_offer).await?;
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod events;
pub mod host;
pub mod logging;
pub mod manager;
pub mod multi_codec_track;
pub mod relay;
pub mod session;
pub mod status;
pub mod types;
pub mod whep;

pub use codec::Codec;
pub use config::{Config, LoggingConfig, RelayMode, SfuConfig, WebRtcConfig};
pub use connection::MediaConnection;
pub use engine::{SfuEngine, WhepAnswer, WhipAnswer};
pub use error::{Result, SfuError};
pub use host::{Host, Track};
pub use manager::SessionManager;
pub use multi_codec_track::{MultiCodecTrack, RtpWriter};
pub use relay::RelayPacket;
pub use session::{Reservation, StreamSession};
pub use status::{StreamSessionState, StreamStatus, WhepSessionState};
pub use types::{MediaKind, PublicProfile, SessionId, StreamKey};
pub use whep::WhepSession;
