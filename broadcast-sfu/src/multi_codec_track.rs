//! Outbound track that can emit RTP under any negotiated payload type
//!
//! Every subscriber gets one of these per media kind. The payload type of each
//! write is resolved from the codec tag carried by the relayed packet, so a
//! subscriber can move between simulcast layers encoded with different codecs
//! without renegotiating.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecParameters, RTPCodecType};
use webrtc::track::track_local::{TrackLocal, TrackLocalContext, TrackLocalWriter};

use crate::codec::Codec;
use crate::error::{Result, SfuError};
use crate::types::MediaKind;

/// Sink for relayed RTP packets
#[async_trait]
pub trait RtpWriter: Send + Sync {
    /// Write a packet tagged with the codec it was encoded with. The
    /// implementation may rewrite SSRC and payload type in place.
    async fn write_rtp(&self, packet: &mut Packet, codec: Codec) -> Result<()>;
}

/// Where a bound track sends its packets
#[async_trait]
trait PacketSink: Send + Sync {
    async fn send(&self, packet: &Packet) -> Result<()>;
}

struct WriteStream(Arc<dyn TrackLocalWriter + Send + Sync>);

#[async_trait]
impl PacketSink for WriteStream {
    async fn send(&self, packet: &Packet) -> Result<()> {
        self.0.write_rtp(packet).await?;
        Ok(())
    }
}

#[derive(Default)]
struct Binding {
    ssrc: u32,
    sink: Option<Arc<dyn PacketSink>>,
    payload_types: HashMap<Codec, u8>,
}

pub struct MultiCodecTrack {
    id: String,
    stream_id: String,
    kind: MediaKind,
    binding: RwLock<Binding>,
}

impl MultiCodecTrack {
    pub fn new(id: impl Into<String>, stream_id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            id: id.into(),
            stream_id: stream_id.into(),
            kind,
            binding: RwLock::new(Binding::default()),
        }
    }

    #[must_use]
    pub const fn media_kind(&self) -> MediaKind {
        self.kind
    }

    /// Payload type resolved for `codec` during the last bind
    #[must_use]
    pub fn payload_type(&self, codec: Codec) -> Option<u8> {
        self.binding.read().payload_types.get(&codec).copied()
    }

    #[must_use]
    pub fn ssrc(&self) -> u32 {
        self.binding.read().ssrc
    }

    /// Record the payload type of every recognised codec offered by the peer
    /// and return the parameters this track advertises.
    fn resolve(
        &self,
        ssrc: u32,
        sink: Option<Arc<dyn PacketSink>>,
        codec_parameters: &[RTCRtpCodecParameters],
    ) -> Result<RTCRtpCodecParameters> {
        let mut payload_types = HashMap::new();
        let mut advertised: Option<RTCRtpCodecParameters> = None;

        for parameters in codec_parameters {
            let codec = Codec::from_mime(&parameters.capability.mime_type);
            if codec.kind() != Some(self.kind) {
                continue;
            }
            payload_types.entry(codec).or_insert(parameters.payload_type);
            if advertised.is_none() {
                advertised = Some(parameters.clone());
            }
        }

        let advertised = advertised.ok_or_else(|| {
            SfuError::Negotiation(format!(
                "no supported {:?} codec offered for track {}",
                self.kind, self.id
            ))
        })?;

        info!(
            track_id = %self.id,
            stream_id = %self.stream_id,
            kind = ?self.kind,
            payload_type = advertised.payload_type,
            "Binding multi codec track"
        );

        *self.binding.write() = Binding {
            ssrc,
            sink,
            payload_types,
        };

        Ok(advertised)
    }
}

#[async_trait]
impl RtpWriter for MultiCodecTrack {
    async fn write_rtp(&self, packet: &mut Packet, codec: Codec) -> Result<()> {
        let sink = {
            let binding = self.binding.read();
            let Some(sink) = binding.sink.clone() else {
                // Not bound yet, nothing to write to
                return Ok(());
            };
            let Some(payload_type) = binding.payload_types.get(&codec).copied() else {
                return Err(SfuError::UnresolvedCodec(codec));
            };
            packet.header.ssrc = binding.ssrc;
            packet.header.payload_type = payload_type;
            sink
        };

        sink.send(packet).await
    }
}

#[async_trait]
impl TrackLocal for MultiCodecTrack {
    async fn bind(&self, t: &TrackLocalContext) -> webrtc::error::Result<RTCRtpCodecParameters> {
        let sink = t
            .write_stream()
            .map(|stream| Arc::new(WriteStream(stream)) as Arc<dyn PacketSink>);
        self.resolve(t.ssrc(), sink, t.codec_parameters())
            .map_err(|e| webrtc::Error::new(e.to_string()))
    }

    async fn unbind(&self, _t: &TrackLocalContext) -> webrtc::error::Result<()> {
        debug!(track_id = %self.id, "Unbinding multi codec track");
        self.binding.write().sink = None;
        Ok(())
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn stream_id(&self) -> &str {
        &self.stream_id
    }

    fn kind(&self) -> RTPCodecType {
        self.kind.into()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{audio_codecs, video_codecs};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct CapturingSink {
        written: Mutex<Vec<(u32, u8)>>,
    }

    #[async_trait]
    impl PacketSink for CapturingSink {
        async fn send(&self, packet: &Packet) -> Result<()> {
            self.written
                .lock()
                .push((packet.header.ssrc, packet.header.payload_type));
            Ok(())
        }
    }

    fn bound_video_track() -> (MultiCodecTrack, Arc<CapturingSink>) {
        let track = MultiCodecTrack::new("video-1", "live", MediaKind::Video);
        let writer = Arc::new(CapturingSink::default());
        let params = track
            .resolve(4242, Some(writer.clone() as Arc<dyn PacketSink>), &video_codecs())
            .unwrap();
        assert_eq!(params.capability.mime_type, "video/H264");
        (track, writer)
    }

    #[test]
    fn test_resolve_records_first_payload_type_per_codec() {
        let (track, _) = bound_video_track();
        assert_eq!(track.payload_type(Codec::H264), Some(96));
        assert_eq!(track.payload_type(Codec::Vp9), Some(98));
        assert_eq!(track.payload_type(Codec::Av1), Some(45));
        assert_eq!(track.payload_type(Codec::Opus), None);
        assert_eq!(track.ssrc(), 4242);
    }

    #[test]
    fn test_resolve_audio_ignores_video_codecs() {
        let track = MultiCodecTrack::new("audio-1", "live", MediaKind::Audio);
        let mut offered = video_codecs();
        offered.extend(audio_codecs());
        let params = track.resolve(1, None, &offered).unwrap();
        assert_eq!(params.payload_type, 111);
        assert_eq!(track.payload_type(Codec::H264), None);
    }

    #[test]
    fn test_resolve_fails_without_matching_codec() {
        let track = MultiCodecTrack::new("audio-1", "live", MediaKind::Audio);
        assert!(track.resolve(1, None, &video_codecs()).is_err());
    }

    #[tokio::test]
    async fn test_write_switches_payload_type_per_codec() {
        let (track, writer) = bound_video_track();

        let mut packet = Packet::default();
        packet.header.ssrc = 1;
        track.write_rtp(&mut packet, Codec::H264).await.unwrap();
        track.write_rtp(&mut packet, Codec::Vp9).await.unwrap();
        track.write_rtp(&mut packet, Codec::H264).await.unwrap();

        assert_eq!(*writer.written.lock(), vec![(4242, 96), (4242, 98), (4242, 96)]);
    }

    #[tokio::test]
    async fn test_write_unresolved_codec_is_rejected() {
        let (track, writer) = bound_video_track();
        let mut packet = Packet::default();
        let result = track.write_rtp(&mut packet, Codec::Opus).await;
        assert!(matches!(result, Err(SfuError::UnresolvedCodec(Codec::Opus))));
        assert!(writer.written.lock().is_empty());
    }

    #[tokio::test]
    async fn test_write_before_bind_is_skipped() {
        let track = MultiCodecTrack::new("video-1", "live", MediaKind::Video);
        let mut packet = Packet::default();
        assert!(track.write_rtp(&mut packet, Codec::H264).await.is_ok());
    }
}
