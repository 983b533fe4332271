//! Publisher session
//!
//! This module handles:
//! - The single inbound peer connection of a stream
//! - Per-layer track records and the read loops that relay their packets
//! - Keyframe requests towards the publisher
//! - Per-layer bitrate sampling

pub mod pli;
pub mod simulcast;
pub mod track;

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_remote::TrackRemote;
use webrtc::util::marshal::MarshalSize;

use crate::codec::Codec;
use crate::config::SfuConfig;
use crate::connection::MediaConnection;
use crate::relay::{layer_label, RelayPacket};
use crate::status::{AudioTrackState, AvailableLayers, VideoTrackState};
use crate::types::{MediaKind, SessionId, StreamKey};
use crate::whep::WhepSession;

pub use pli::{PliDebouncer, PliRequest};
pub use simulcast::{layer_priority, DEFAULT_PRIORITY};
pub use track::{InboundTrack, Track};

const BITRATE_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Immutable copy of the subscriber set read by the relay hot path
pub type SubscriberSnapshot = Arc<Vec<Arc<WhepSession>>>;

pub struct Host {
    id: SessionId,
    stream_key: StreamKey,
    config: SfuConfig,
    cancel: CancellationToken,

    connection: Mutex<Option<Arc<dyn MediaConnection>>>,

    audio_tracks: RwLock<HashMap<String, Arc<Track>>>,
    video_tracks: RwLock<HashMap<String, Arc<Track>>>,

    pli_tx: mpsc::Sender<PliRequest>,
    track_change_tx: mpsc::Sender<()>,

    subscribers: RwLock<SubscriberSnapshot>,
}

impl Host {
    /// Create a host for `connection` and start its keyframe request and
    /// bitrate tasks. `track_change_tx` is notified whenever the published
    /// track set changes.
    pub fn new(
        stream_key: StreamKey,
        connection: Arc<dyn MediaConnection>,
        config: &SfuConfig,
        parent: &CancellationToken,
        track_change_tx: mpsc::Sender<()>,
    ) -> Arc<Self> {
        let (pli_tx, pli_rx) = mpsc::channel(config.pli_channel_capacity.max(1));
        let id = SessionId::generate();

        info!(stream_key = %stream_key, host_id = %id, "Creating host");

        let host = Arc::new(Self {
            id,
            stream_key,
            config: config.clone(),
            cancel: parent.child_token(),
            connection: Mutex::new(Some(connection)),
            audio_tracks: RwLock::new(HashMap::new()),
            video_tracks: RwLock::new(HashMap::new()),
            pli_tx,
            track_change_tx,
            subscribers: RwLock::new(Arc::new(Vec::new())),
        });

        let span = info_span!("host", stream_key = %host.stream_key, host_id = %host.id);
        tokio::spawn(Arc::clone(&host).run_pli_loop(pli_rx).instrument(span.clone()));
        tokio::spawn(Arc::clone(&host).run_bitrate_loop().instrument(span));

        host
    }

    #[must_use]
    pub const fn id(&self) -> &SessionId {
        &self.id
    }

    #[must_use]
    pub const fn stream_key(&self) -> &StreamKey {
        &self.stream_key
    }

    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// True while the host has not been torn down and its transport is open.
    #[must_use]
    pub fn is_live(&self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.connection
            .lock()
            .as_ref()
            .is_some_and(|connection| !connection.is_closed())
    }

    /// Install the WebRTC callbacks that feed this host.
    pub fn register_peer_connection_handlers(self: &Arc<Self>, peer_connection: &RTCPeerConnection) {
        let weak = Arc::downgrade(self);
        peer_connection.on_track(Box::new(move |remote, _receiver, _transceiver| {
            let weak = Weak::clone(&weak);
            Box::pin(async move {
                if let Some(host) = weak.upgrade() {
                    host.start_track_reader(remote).await;
                }
            })
        }));

        let weak = Arc::downgrade(self);
        peer_connection.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let weak = Weak::clone(&weak);
            Box::pin(async move {
                let Some(host) = weak.upgrade() else { return };
                debug!(host_id = %host.id, %state, "Host ICE connection state changed");
                if matches!(
                    state,
                    RTCIceConnectionState::Failed | RTCIceConnectionState::Closed
                ) {
                    host.cancel.cancel();
                }
            })
        }));

        let weak = Arc::downgrade(self);
        peer_connection.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let weak = Weak::clone(&weak);
            Box::pin(async move {
                let Some(host) = weak.upgrade() else { return };
                match state {
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                        info!(host_id = %host.id, %state, "Host connection ended");
                        host.cancel.cancel();
                    }
                    RTCPeerConnectionState::Connected => {
                        info!(host_id = %host.id, "Host connected");
                    }
                    _ => {}
                }
            })
        }));
    }

    async fn start_track_reader(self: Arc<Self>, remote: Arc<TrackRemote>) {
        let codec_parameters = remote.codec();
        let kind = MediaKind::from_mime_type(&codec_parameters.capability.mime_type);
        let codec = Codec::from_mime(&codec_parameters.capability.mime_type);
        let rid = layer_label(&remote.rid().to_string(), kind == MediaKind::Audio);

        let priority = match self.remote_sdp().await {
            Some(sdp) => layer_priority(&rid, &sdp),
            None => DEFAULT_PRIORITY,
        };

        let inbound = self.open_track(kind, &rid, codec, priority, remote.ssrc());
        let span = info_span!("track_reader", stream_key = %self.stream_key, rid = %rid, ?kind);
        tokio::spawn(self.read_track(remote, inbound).instrument(span));
    }

    async fn remote_sdp(&self) -> Option<String> {
        let connection = self.connection.lock().clone()?;
        connection.remote_sdp().await
    }

    /// Register a published layer, or return the existing record for its RID,
    /// and get the read-side state for it.
    pub fn open_track(
        &self,
        kind: MediaKind,
        rid: &str,
        codec: Codec,
        priority: u32,
        media_ssrc: u32,
    ) -> InboundTrack {
        let track = {
            let mut tracks = self.tracks(kind).write();
            Arc::clone(tracks.entry(rid.to_string()).or_insert_with(|| {
                info!(
                    stream_key = %self.stream_key,
                    rid = %rid,
                    ?kind,
                    ?codec,
                    priority,
                    "Adding track"
                );
                Arc::new(Track::new(rid, kind, codec, priority, media_ssrc))
            }))
        };
        self.notify_track_change();
        InboundTrack::new(track)
    }

    async fn read_track(self: Arc<Self>, remote: Arc<TrackRemote>, mut inbound: InboundTrack) {
        let kind = inbound.track().kind();
        loop {
            let result = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                result = remote.read_rtp() => result,
            };

            match result {
                Ok((packet, _attributes)) => {
                    let size = packet.marshal_size();
                    let relay = inbound.prepare(packet, size);
                    self.relay(kind, inbound.track(), relay).await;
                }
                Err(e) => {
                    info!(error = %e, "Track ended");
                    self.cancel.cancel();
                    break;
                }
            }
        }
        self.notify_track_change();
    }

    /// Hand a packet to every subscriber tuned to its layer.
    pub async fn relay(&self, kind: MediaKind, track: &Track, packet: RelayPacket) {
        let subscribers = self.subscribers();
        for whep in subscribers.iter() {
            if !whep.is_tuned_to(kind, &packet.layer) {
                continue;
            }
            if !whep.deliver(kind, packet.clone()).await {
                track.record_dropped(1);
            }
        }
    }

    /// Current subscriber snapshot
    #[must_use]
    pub fn subscribers(&self) -> SubscriberSnapshot {
        Arc::clone(&self.subscribers.read())
    }

    pub(crate) fn set_subscribers(&self, snapshot: SubscriberSnapshot) {
        *self.subscribers.write() = snapshot;
    }

    /// Queue a keyframe request. Dropped when the queue is full.
    pub fn request_keyframe(&self, request: PliRequest) {
        if let Err(e) = self.pli_tx.try_send(request) {
            debug!(host_id = %self.id, error = %e, "PLI queue full, skipping request");
        }
    }

    fn pli_targets(&self, layer: Option<&str>) -> Vec<u32> {
        let tracks = self.video_tracks.read();
        match layer {
            Some(layer) => tracks.get(layer).map(|t| t.media_ssrc()).into_iter().collect(),
            None => tracks.values().map(|t| t.media_ssrc()).collect(),
        }
    }

    async fn run_pli_loop(self: Arc<Self>, mut requests: mpsc::Receiver<PliRequest>) {
        let mut debouncer = PliDebouncer::new(self.config.pli_debounce());
        loop {
            let request = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                request = requests.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            let Some(connection) = self.connection.lock().clone() else {
                break;
            };

            for ssrc in self.pli_targets(request.layer.as_deref()) {
                if !debouncer.try_acquire(ssrc, Instant::now()) {
                    continue;
                }
                debug!(media_ssrc = ssrc, layer = ?request.layer, "Sending PLI to host");
                if let Err(e) = connection.send_picture_loss_indication(ssrc).await {
                    warn!(error = %e, "Failed to send PLI, closing host");
                    self.cancel.cancel();
                    return;
                }
            }
        }
    }

    async fn run_bitrate_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(BITRATE_SAMPLE_INTERVAL);
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    for track in self.video_tracks.read().values() {
                        track.sample_bitrate();
                    }
                }
            }
        }
    }

    fn tracks(&self, kind: MediaKind) -> &RwLock<HashMap<String, Arc<Track>>> {
        match kind {
            MediaKind::Audio => &self.audio_tracks,
            MediaKind::Video => &self.video_tracks,
        }
    }

    fn notify_track_change(&self) {
        // A pending notification already covers this change
        let _ = self.track_change_tx.try_send(());
    }

    #[must_use]
    pub fn has_tracks(&self) -> bool {
        !self.audio_tracks.read().is_empty() || !self.video_tracks.read().is_empty()
    }

    #[must_use]
    pub fn has_layer(&self, kind: MediaKind, rid: &str) -> bool {
        self.tracks(kind).read().contains_key(rid)
    }

    /// RID of the preferred layer of `kind`: the lowest priority value, ties
    /// broken by name.
    #[must_use]
    pub fn highest_priority_layer(&self, kind: MediaKind) -> Option<String> {
        self.tracks(kind)
            .read()
            .values()
            .min_by(|a, b| a.priority().cmp(&b.priority()).then_with(|| a.rid().cmp(b.rid())))
            .map(|track| track.rid().to_string())
    }

    #[must_use]
    pub fn highest_priority_audio_track(&self) -> Option<String> {
        self.highest_priority_layer(MediaKind::Audio)
    }

    #[must_use]
    pub fn highest_priority_video_track(&self) -> Option<String> {
        self.highest_priority_layer(MediaKind::Video)
    }

    #[must_use]
    pub fn available_layers(&self) -> AvailableLayers {
        let mut layers = AvailableLayers {
            audio: self.audio_tracks.read().keys().cloned().collect(),
            video: self.video_tracks.read().keys().cloned().collect(),
        };
        layers.audio.sort();
        layers.video.sort();
        layers
    }

    #[must_use]
    pub fn audio_track_states(&self) -> Vec<AudioTrackState> {
        let mut states: Vec<_> = self.audio_tracks.read().values().map(|t| t.audio_state()).collect();
        states.sort_by(|a, b| a.rid.cmp(&b.rid));
        states
    }

    #[must_use]
    pub fn video_track_states(&self) -> Vec<VideoTrackState> {
        let mut states: Vec<_> = self.video_tracks.read().values().map(|t| t.video_state()).collect();
        states.sort_by(|a, b| a.rid.cmp(&b.rid));
        states
    }

    /// Forget every published layer.
    pub fn clear_tracks(&self) {
        if !self.has_tracks() {
            return;
        }
        self.audio_tracks.write().clear();
        self.video_tracks.write().clear();
        self.notify_track_change();
    }

    /// Tear the host down: cancel its tasks, close the peer connection and
    /// clear its tracks. Read loops end on their next iteration.
    pub async fn close(&self) {
        self.cancel.cancel();

        let connection = self.connection.lock().take();
        if let Some(connection) = connection {
            info!(stream_key = %self.stream_key, host_id = %self.id, "Closing host connection");
            if let Err(e) = connection.close().await {
                warn!(host_id = %self.id, error = %e, "Failed to close host peer connection");
            }
        }

        self.set_subscribers(Arc::new(Vec::new()));
        self.clear_tracks();
    }
}
