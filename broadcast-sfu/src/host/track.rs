//! Publisher-side track records

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use webrtc::rtp::packet::Packet;

use crate::codec::Codec;
use crate::relay::{strip_header_extensions, DeltaTracker, KeyframeDetector, RelayPacket};
use crate::status::{AudioTrackState, VideoTrackState};
use crate::types::MediaKind;

/// Statistics of one simulcast layer published by a host
pub struct Track {
    rid: String,
    kind: MediaKind,
    codec: Codec,
    priority: u32,
    media_ssrc: u32,

    packets_received: AtomicU64,
    packets_dropped: AtomicU64,
    bytes_received: AtomicU64,
    /// Bytes received during the last bitrate sample
    bitrate: AtomicU64,
    bytes_at_last_sample: AtomicU64,

    last_received: Mutex<Option<DateTime<Utc>>>,
    last_keyframe: Mutex<Option<DateTime<Utc>>>,
}

impl Track {
    #[must_use]
    pub fn new(rid: impl Into<String>, kind: MediaKind, codec: Codec, priority: u32, media_ssrc: u32) -> Self {
        Self {
            rid: rid.into(),
            kind,
            codec,
            priority,
            media_ssrc,
            packets_received: AtomicU64::new(0),
            packets_dropped: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bitrate: AtomicU64::new(0),
            bytes_at_last_sample: AtomicU64::new(0),
            last_received: Mutex::new(None),
            last_keyframe: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn rid(&self) -> &str {
        &self.rid
    }

    #[must_use]
    pub const fn kind(&self) -> MediaKind {
        self.kind
    }

    #[must_use]
    pub const fn codec(&self) -> Codec {
        self.codec
    }

    /// Lower is preferred
    #[must_use]
    pub const fn priority(&self) -> u32 {
        self.priority
    }

    #[must_use]
    pub const fn media_ssrc(&self) -> u32 {
        self.media_ssrc
    }

    #[must_use]
    pub fn packets_received(&self) -> u64 {
        self.packets_received.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn packets_dropped(&self) -> u64 {
        self.packets_dropped.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn bitrate(&self) -> u64 {
        self.bitrate.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn last_keyframe(&self) -> Option<DateTime<Utc>> {
        *self.last_keyframe.lock()
    }

    pub(crate) fn record_packet(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        *self.last_received.lock() = Some(Utc::now());
    }

    pub(crate) fn record_keyframe(&self) {
        *self.last_keyframe.lock() = Some(Utc::now());
    }

    pub(crate) fn record_dropped(&self, count: u64) {
        self.packets_dropped.fetch_add(count, Ordering::Relaxed);
    }

    /// Store the bytes received since the previous sample as the bitrate.
    pub(crate) fn sample_bitrate(&self) {
        let total = self.bytes_received.load(Ordering::Relaxed);
        let previous = self.bytes_at_last_sample.swap(total, Ordering::Relaxed);
        self.bitrate.store(total.saturating_sub(previous), Ordering::Relaxed);
    }

    #[must_use]
    pub fn audio_state(&self) -> AudioTrackState {
        AudioTrackState {
            rid: self.rid.clone(),
            priority: self.priority,
            packets_received: self.packets_received(),
            packets_dropped: self.packets_dropped(),
            last_received: *self.last_received.lock(),
        }
    }

    #[must_use]
    pub fn video_state(&self) -> VideoTrackState {
        VideoTrackState {
            rid: self.rid.clone(),
            priority: self.priority,
            bitrate: self.bitrate(),
            packets_received: self.packets_received(),
            packets_dropped: self.packets_dropped(),
            last_received: *self.last_received.lock(),
            last_keyframe: self.last_keyframe(),
        }
    }
}

/// Read-side state of one inbound layer, owned by its read loop
pub struct InboundTrack {
    track: Arc<Track>,
    layer: Arc<str>,
    deltas: DeltaTracker,
    keyframes: Option<KeyframeDetector>,
}

impl InboundTrack {
    pub(crate) fn new(track: Arc<Track>) -> Self {
        let keyframes = (track.kind() == MediaKind::Video).then(|| KeyframeDetector::new(track.codec()));
        Self {
            layer: Arc::from(track.rid()),
            track,
            deltas: DeltaTracker::new(),
            keyframes,
        }
    }

    #[must_use]
    pub const fn track(&self) -> &Arc<Track> {
        &self.track
    }

    /// Account for a packet read from the network and turn it into a relay
    /// packet. `size` is the packet's wire size.
    pub fn prepare(&mut self, mut packet: Packet, size: usize) -> RelayPacket {
        self.track.record_packet(size);

        let is_keyframe = match self.keyframes.as_mut() {
            Some(detector) => detector.is_keyframe(&packet.payload),
            None => true,
        };
        if is_keyframe && self.keyframes.is_some() {
            self.track.record_keyframe();
        }

        strip_header_extensions(&mut packet);
        let delta = self
            .deltas
            .update(packet.header.sequence_number, packet.header.timestamp);

        RelayPacket {
            layer: Arc::clone(&self.layer),
            packet,
            codec: self.track.codec(),
            is_keyframe,
            sequence_delta: delta.sequence,
            timestamp_delta: delta.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn video_packet(sequence_number: u16, payload: &'static [u8]) -> Packet {
        let mut packet = Packet::default();
        packet.header.sequence_number = sequence_number;
        packet.header.timestamp = u32::from(sequence_number) * 3000;
        packet.payload = Bytes::from_static(payload);
        packet
    }

    #[test]
    fn test_prepare_records_statistics() {
        let track = Arc::new(Track::new("high", MediaKind::Video, Codec::H264, 1, 42));
        let mut inbound = InboundTrack::new(Arc::clone(&track));

        let first = inbound.prepare(video_packet(10, &[0x65, 0x88, 0x84, 0x00]), 100);
        let second = inbound.prepare(video_packet(11, &[0x41, 0x9a, 0x02, 0x04]), 50);

        assert!(first.is_keyframe);
        assert!(!second.is_keyframe);
        assert_eq!(first.sequence_delta, 0);
        assert_eq!(second.sequence_delta, 1);
        assert_eq!(second.timestamp_delta, 3000);
        assert_eq!(&*second.layer, "high");
        assert_eq!(track.packets_received(), 2);
        assert!(track.last_keyframe().is_some());

        track.sample_bitrate();
        assert_eq!(track.bitrate(), 150);
        track.sample_bitrate();
        assert_eq!(track.bitrate(), 0);
    }

    #[test]
    fn test_audio_packets_are_always_keyframes() {
        let track = Arc::new(Track::new("Audio", MediaKind::Audio, Codec::Opus, 100, 7));
        let mut inbound = InboundTrack::new(Arc::clone(&track));
        let relay = inbound.prepare(video_packet(1, &[0x00]), 20);
        assert!(relay.is_keyframe);
        assert_eq!(relay.codec, Codec::Opus);
        assert!(track.last_keyframe().is_none());
    }

    #[test]
    fn test_state_snapshots() {
        let track = Track::new("low", MediaKind::Video, Codec::Vp8, 2, 9);
        track.record_packet(10);
        track.record_dropped(3);
        let state = track.video_state();
        assert_eq!(state.rid, "low");
        assert_eq!(state.priority, 2);
        assert_eq!(state.packets_received, 1);
        assert_eq!(state.packets_dropped, 3);
        assert!(state.last_received.is_some());
    }
}
