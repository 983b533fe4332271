//! RTP relay primitives
//!
//! This module handles the per-packet work shared by the publisher read loops
//! and the subscriber send path:
//! - Delta computation between consecutive inbound packets, with wraparound
//!   correction
//! - Per-subscriber sequence number and timestamp rewriting
//! - H264 keyframe detection
//! - Header extension stripping

use bytes::Bytes;
use std::sync::Arc;
use webrtc::rtp::codecs::h264::H264Packet;
use webrtc::rtp::packet::Packet;
use webrtc::rtp::packetizer::Depacketizer;

use crate::codec::Codec;

/// Label used for an audio track published without a RID
pub const AUDIO_LAYER_DEFAULT: &str = "Audio";
/// Label used for a video track published without a RID
pub const VIDEO_LAYER_DEFAULT: &str = "Video";

/// First sequence number and timestamp written to a fresh subscriber
pub const INITIAL_REWRITE_VALUE: u16 = 5000;

const NALU_TYPE_BITMASK: u8 = 0x1f;
const NALU_TYPE_IDR: u8 = 5;
const NALU_TYPE_SPS: u8 = 7;
const NALU_TYPE_PPS: u8 = 8;

/// Negative deltas below this are treated as a sequence number wrap
const SEQUENCE_WRAP_THRESHOLD: i64 = -(u16::MAX as i64 / 10);
/// Negative deltas below this are treated as a timestamp wrap
const TIMESTAMP_WRAP_THRESHOLD: i64 = -(u32::MAX as i64 / 10);

/// A packet read from the publisher, ready to be handed to subscribers
#[derive(Debug, Clone)]
pub struct RelayPacket {
    /// Simulcast layer (RID or default label) the packet was read from
    pub layer: Arc<str>,
    pub packet: Packet,
    pub codec: Codec,
    /// Always true for audio and for codecs without keyframe detection
    pub is_keyframe: bool,
    pub sequence_delta: i64,
    pub timestamp_delta: i64,
}

/// Distance between two consecutive inbound packets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketDelta {
    pub sequence: i64,
    pub timestamp: i64,
}

/// Tracks the last sequence number and timestamp seen on one inbound track
#[derive(Debug, Default)]
pub struct DeltaTracker {
    last: Option<(u16, u32)>,
}

impl DeltaTracker {
    #[must_use]
    pub const fn new() -> Self {
        Self { last: None }
    }

    /// Record a packet and return its distance from the previous one.
    ///
    /// The first packet always has a zero delta. A large negative distance is
    /// assumed to be a counter wrap rather than reordering.
    pub fn update(&mut self, sequence_number: u16, timestamp: u32) -> PacketDelta {
        let delta = match self.last {
            None => PacketDelta::default(),
            Some((last_sequence, last_timestamp)) => {
                let mut sequence = i64::from(sequence_number) - i64::from(last_sequence);
                if sequence < SEQUENCE_WRAP_THRESHOLD {
                    sequence += i64::from(u16::MAX) + 1;
                }

                let mut timestamp = i64::from(timestamp) - i64::from(last_timestamp);
                if timestamp < TIMESTAMP_WRAP_THRESHOLD {
                    timestamp += i64::from(u32::MAX) + 1;
                }

                PacketDelta {
                    sequence,
                    timestamp,
                }
            }
        };

        self.last = Some((sequence_number, timestamp));
        delta
    }
}

/// Running outbound sequence number and timestamp of one subscriber stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RewriteState {
    pub sequence_number: u16,
    pub timestamp: u32,
    /// Set once the first packet has been stamped
    pub started: bool,
}

impl Default for RewriteState {
    fn default() -> Self {
        Self {
            sequence_number: INITIAL_REWRITE_VALUE,
            timestamp: u32::from(INITIAL_REWRITE_VALUE),
            started: false,
        }
    }
}

impl RewriteState {
    /// Accumulate a delta and return the values to stamp on the packet. The
    /// first packet is stamped with the current values whatever its delta.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn advance(&mut self, sequence_delta: i64, timestamp_delta: i64) -> (u16, u32) {
        if !self.started {
            self.started = true;
            return (self.sequence_number, self.timestamp);
        }
        // Truncation keeps the arithmetic modulo the field width
        self.sequence_number = self.sequence_number.wrapping_add(sequence_delta as u16);
        self.timestamp = self.timestamp.wrapping_add(timestamp_delta as u32);
        (self.sequence_number, self.timestamp)
    }
}

/// Classifies inbound video packets as keyframe-bearing.
///
/// Holds depacketizer state, so one instance belongs to exactly one inbound
/// track.
pub struct KeyframeDetector {
    codec: Codec,
    h264: Option<H264Packet>,
}

impl KeyframeDetector {
    #[must_use]
    pub fn new(codec: Codec) -> Self {
        Self {
            codec,
            h264: (codec == Codec::H264).then(H264Packet::default),
        }
    }

    /// H264 packets are keyframes when the first reassembled NAL unit is an
    /// IDR slice, SPS or PPS. Every other codec reports true.
    pub fn is_keyframe(&mut self, payload: &Bytes) -> bool {
        let Some(depacketizer) = self.h264.as_mut() else {
            return self.codec != Codec::H264;
        };

        match depacketizer.depacketize(payload) {
            // Annex B output: 4 byte start code, then the NAL header
            Ok(nalu) if nalu.len() >= 6 => matches!(
                nalu[4] & NALU_TYPE_BITMASK,
                NALU_TYPE_IDR | NALU_TYPE_SPS | NALU_TYPE_PPS
            ),
            _ => false,
        }
    }
}

/// Remove sender-local RTP header extensions before relaying.
pub fn strip_header_extensions(packet: &mut Packet) {
    packet.header.extension = false;
    packet.header.extension_profile = 0;
    packet.header.extensions.clear();
}

/// Layer label for a remote track, substituting the default for an empty RID.
#[must_use]
pub fn layer_label(rid: &str, is_audio: bool) -> String {
    match (rid.is_empty(), is_audio) {
        (false, _) => rid.to_string(),
        (true, true) => AUDIO_LAYER_DEFAULT.to_string(),
        (true, false) => VIDEO_LAYER_DEFAULT.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::rtp::header::Extension;

    #[test]
    fn test_first_packet_has_zero_delta() {
        let mut tracker = DeltaTracker::new();
        assert_eq!(tracker.update(1234, 90_000), PacketDelta::default());
        assert_eq!(
            tracker.update(1235, 93_000),
            PacketDelta {
                sequence: 1,
                timestamp: 3000
            }
        );
    }

    #[test]
    fn test_sequence_wrap_is_corrected() {
        let mut tracker = DeltaTracker::new();
        let deltas: Vec<i64> = [65534u16, 65535, 0, 1]
            .into_iter()
            .map(|seq| tracker.update(seq, 0).sequence)
            .collect();
        assert_eq!(deltas, vec![0, 1, 1, 1]);
    }

    #[test]
    fn test_timestamp_wrap_is_corrected() {
        let mut tracker = DeltaTracker::new();
        tracker.update(1, u32::MAX - 1000);
        assert_eq!(tracker.update(2, 2000).timestamp, 3001);
    }

    #[test]
    fn test_small_reorder_is_not_a_wrap() {
        let mut tracker = DeltaTracker::new();
        tracker.update(100, 0);
        assert_eq!(tracker.update(98, 0).sequence, -2);
    }

    #[test]
    fn test_rewrite_starts_at_initial_value() {
        let mut state = RewriteState::default();
        let mut tracker = DeltaTracker::new();
        let written: Vec<u16> = [65534u16, 65535, 0, 1]
            .into_iter()
            .map(|seq| {
                let delta = tracker.update(seq, 0);
                state.advance(delta.sequence, delta.timestamp).0
            })
            .collect();
        assert_eq!(written, vec![5000, 5001, 5002, 5003]);
    }

    #[test]
    fn test_first_write_ignores_inbound_delta() {
        let mut state = RewriteState::default();
        assert_eq!(state.advance(7, 21_000), (5000, 5000));
        assert_eq!(state.advance(1, 3000), (5001, 8000));
    }

    #[test]
    fn test_rewrite_wraps_outbound_counter() {
        let mut state = RewriteState {
            sequence_number: u16::MAX,
            timestamp: u32::MAX,
            started: true,
        };
        assert_eq!(state.advance(1, 2), (0, 1));
        assert_eq!(state.advance(-1, -1), (u16::MAX, 0));
    }

    #[test]
    fn test_h264_keyframe_detection() {
        let mut detector = KeyframeDetector::new(Codec::H264);
        // IDR slice
        assert!(detector.is_keyframe(&Bytes::from_static(&[0x65, 0x88, 0x84, 0x00])));
        // SPS
        assert!(detector.is_keyframe(&Bytes::from_static(&[0x67, 0x42, 0xe0, 0x1f])));
        // PPS
        assert!(detector.is_keyframe(&Bytes::from_static(&[0x68, 0xce, 0x3c, 0x80])));
        // Non-IDR slice
        assert!(!detector.is_keyframe(&Bytes::from_static(&[0x41, 0x9a, 0x02, 0x04])));
    }

    #[test]
    fn test_h264_stap_a_leading_sps_is_keyframe() {
        let mut detector = KeyframeDetector::new(Codec::H264);
        let stap_a = Bytes::from_static(&[
            0x78, 0x00, 0x04, 0x67, 0x42, 0xe0, 0x1f, 0x00, 0x02, 0x68, 0xce,
        ]);
        assert!(detector.is_keyframe(&stap_a));
    }

    #[test]
    fn test_h264_short_or_invalid_payload_is_not_keyframe() {
        let mut detector = KeyframeDetector::new(Codec::H264);
        assert!(!detector.is_keyframe(&Bytes::new()));
        assert!(!detector.is_keyframe(&Bytes::from_static(&[0x65])));
    }

    #[test]
    fn test_other_codecs_are_always_keyframes() {
        let mut detector = KeyframeDetector::new(Codec::Vp8);
        assert!(detector.is_keyframe(&Bytes::from_static(&[0x00])));
        let mut detector = KeyframeDetector::new(Codec::Opus);
        assert!(detector.is_keyframe(&Bytes::new()));
    }

    #[test]
    fn test_strip_header_extensions() {
        let mut packet = Packet::default();
        packet.header.extension = true;
        packet.header.extension_profile = 0xBEDE;
        packet.header.extensions.push(Extension {
            id: 1,
            payload: Bytes::from_static(&[0x01]),
        });

        strip_header_extensions(&mut packet);

        assert!(!packet.header.extension);
        assert_eq!(packet.header.extension_profile, 0);
        assert!(packet.header.extensions.is_empty());
    }

    #[test]
    fn test_layer_label_defaults() {
        assert_eq!(layer_label("", true), AUDIO_LAYER_DEFAULT);
        assert_eq!(layer_label("", false), VIDEO_LAYER_DEFAULT);
        assert_eq!(layer_label("high", false), "high");
    }
}
