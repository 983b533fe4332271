//! Stream session
//!
//! A [`StreamSession`] aggregates everything published under one stream key:
//! at most one [`Host`] and any number of [`WhepSession`]s. It arbitrates host
//! replacement, keeps the host's subscriber snapshot fresh, announces status
//! and layer changes, and closes itself once it has become empty.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;

use crate::config::SfuConfig;
use crate::connection::MediaConnection;
use crate::error::{Result, SfuError};
use crate::events;
use crate::host::{Host, PliRequest};
use crate::multi_codec_track::{MultiCodecTrack, RtpWriter};
use crate::status::{StreamSessionState, StreamStatus};
use crate::types::{MediaKind, PublicProfile, SessionId, StreamKey};
use crate::whep::WhepSession;

#[derive(Debug, Clone)]
struct ProfileState {
    is_public: bool,
    motd: String,
}

pub struct StreamSession {
    /// Distinguishes successive sessions created under the same key
    id: SessionId,
    stream_key: StreamKey,
    config: SfuConfig,

    profile: RwLock<ProfileState>,
    has_host: AtomicBool,
    stream_start: RwLock<DateTime<Utc>>,

    host: RwLock<Option<Arc<Host>>>,
    wheps: RwLock<HashMap<SessionId, Arc<WhepSession>>>,
    /// Offers being negotiated against this session
    pending: AtomicUsize,

    closed: AtomicBool,
    cancel: CancellationToken,
    track_change_tx: mpsc::Sender<()>,
}

impl StreamSession {
    /// Create a session and start its status and snapshot loops.
    pub fn new(profile: &PublicProfile, config: &SfuConfig, parent: &CancellationToken) -> Arc<Self> {
        let (track_change_tx, track_change_rx) =
            mpsc::channel(config.track_change_channel_capacity.max(1));

        let session = Arc::new(Self {
            id: SessionId::generate(),
            stream_key: profile.stream_key.clone(),
            config: config.clone(),
            profile: RwLock::new(ProfileState {
                is_public: profile.is_public,
                motd: profile.motd.clone(),
            }),
            has_host: AtomicBool::new(false),
            stream_start: RwLock::new(Utc::now()),
            host: RwLock::new(None),
            wheps: RwLock::new(HashMap::new()),
            pending: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            cancel: parent.child_token(),
            track_change_tx,
        });

        info!(stream_key = %session.stream_key, session_id = %session.id, "Creating stream session");

        let span = info_span!("stream_session", stream_key = %session.stream_key);
        tokio::spawn(
            Arc::clone(&session)
                .run_status_loop(track_change_rx)
                .instrument(span.clone()),
        );
        tokio::spawn(Arc::clone(&session).run_snapshot_loop().instrument(span));

        session
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
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn has_host(&self) -> bool {
        self.has_host.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_public(&self) -> bool {
        self.profile.read().is_public
    }

    #[must_use]
    pub fn host(&self) -> Option<Arc<Host>> {
        self.host.read().clone()
    }

    #[must_use]
    pub fn whep(&self, id: &SessionId) -> Option<Arc<WhepSession>> {
        self.wheps.read().get(id).cloned()
    }

    #[must_use]
    pub fn whep_count(&self) -> usize {
        self.wheps.read().len()
    }

    fn open_wheps(&self) -> Vec<Arc<WhepSession>> {
        self.wheps
            .read()
            .values()
            .filter(|whep| !whep.is_closed())
            .cloned()
            .collect()
    }

    /// A session without a host, subscribers or offers in flight has nothing
    /// left to do.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.host.read().is_none()
            && self.wheps.read().is_empty()
            && self.pending.load(Ordering::Acquire) == 0
    }

    /// Hold the session open while an offer is negotiated against it.
    pub fn reserve(self: &Arc<Self>) -> Result<Reservation> {
        // Taken under the host lock so an emptiness check cannot interleave
        let _host = self.host.write();
        if self.is_closed() {
            return Err(SfuError::SessionClosed);
        }
        self.pending.fetch_add(1, Ordering::AcqRel);
        Ok(Reservation {
            session: Arc::clone(self),
        })
    }

    pub fn update_profile(&self, profile: &PublicProfile) {
        let mut state = self.profile.write();
        state.is_public = profile.is_public;
        state.motd = profile.motd.clone();
    }

    /// Create a host over a publisher peer connection and register its
    /// callbacks. Nothing is announced until [`Self::install_host`].
    pub fn prepare_peer_host(&self, peer_connection: &Arc<RTCPeerConnection>) -> Result<Arc<Host>> {
        let host = self.prepare_host(Arc::clone(peer_connection) as Arc<dyn MediaConnection>)?;
        host.register_peer_connection_handlers(peer_connection);
        Ok(host)
    }

    /// Create a host that is not yet attached.
    ///
    /// Fails with [`SfuError::HostAlreadyExists`] while a live host is
    /// attached.
    pub fn prepare_host(&self, connection: Arc<dyn MediaConnection>) -> Result<Arc<Host>> {
        if self.is_closed() {
            return Err(SfuError::SessionClosed);
        }
        if self.host.read().as_ref().is_some_and(|host| host.is_live()) {
            return Err(SfuError::HostAlreadyExists);
        }
        Ok(Host::new(
            self.stream_key.clone(),
            connection,
            &self.config,
            &self.cancel,
            self.track_change_tx.clone(),
        ))
    }

    /// Make a prepared host the session's host and announce it. A host whose
    /// transport is gone is replaced; a live one is kept.
    pub async fn install_host(&self, host: &Arc<Host>) -> Result<()> {
        let replaced = {
            let mut current = self.host.write();
            if self.is_closed() {
                return Err(SfuError::SessionClosed);
            }
            if current.as_ref().is_some_and(|current| current.is_live()) {
                return Err(SfuError::HostAlreadyExists);
            }
            current.replace(Arc::clone(host))
        };

        if let Some(replaced) = replaced {
            info!(stream_key = %self.stream_key, host_id = %replaced.id(), "Replacing stale host");
            replaced.close().await;
        }

        self.has_host.store(true, Ordering::Release);
        *self.stream_start.write() = Utc::now();
        self.refresh_snapshot();

        info!(stream_key = %self.stream_key, host_id = %host.id(), "Host attached");
        if let Some(event) = events::stream_start(&self.status()) {
            self.broadcast(&event);
        }

        Ok(())
    }

    /// Attach a publisher over any [`MediaConnection`]. Packets are fed
    /// through [`Host::open_track`] and [`Host::relay`].
    pub async fn attach_host(&self, connection: Arc<dyn MediaConnection>) -> Result<Arc<Host>> {
        let host = self.prepare_host(connection)?;
        if let Err(e) = self.install_host(&host).await {
            host.close().await;
            return Err(e);
        }
        Ok(host)
    }

    /// Detach and close the current host, if any.
    pub async fn remove_host(&self) {
        let host = self.host.write().take();
        if let Some(host) = host {
            self.release_host(host).await;
        }
        self.close_if_empty().await;
    }

    /// Detach `host` only if it is still the current one.
    pub async fn detach_host(&self, host: &Arc<Host>) {
        let removed = {
            let mut current = self.host.write();
            if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, host)) {
                current.take()
            } else {
                None
            }
        };
        if let Some(host) = removed {
            self.release_host(host).await;
        }
        self.close_if_empty().await;
    }

    async fn release_host(&self, host: Arc<Host>) {
        info!(stream_key = %self.stream_key, host_id = %host.id(), "Removing host");
        self.has_host.store(false, Ordering::Release);
        host.close().await;
    }

    /// Attach a subscriber peer connection with its two outbound tracks.
    pub async fn add_whep(
        self: &Arc<Self>,
        id: SessionId,
        peer_connection: Arc<RTCPeerConnection>,
        audio_track: Arc<MultiCodecTrack>,
        video_track: Arc<MultiCodecTrack>,
        video_rtcp_sender: Arc<RTCRtpSender>,
    ) -> Result<Arc<WhepSession>> {
        let whep = self
            .attach_whep(
                id,
                Arc::clone(&peer_connection) as Arc<dyn MediaConnection>,
                audio_track,
                video_track,
            )
            .await?;

        self.register_whep_handlers(&whep, &peer_connection);
        self.spawn_rtcp_reader(&whep, video_rtcp_sender);

        Ok(whep)
    }

    /// Attach a subscriber over any transport. Requires a host; both layers
    /// start on the host's preferred layer.
    pub async fn attach_whep(
        self: &Arc<Self>,
        id: SessionId,
        connection: Arc<dyn MediaConnection>,
        audio: Arc<dyn RtpWriter>,
        video: Arc<dyn RtpWriter>,
    ) -> Result<Arc<WhepSession>> {
        if self.is_closed() {
            return Err(SfuError::SessionClosed);
        }
        let host = self.host().ok_or(SfuError::NoHost)?;

        let whep = WhepSession::new(id.clone(), connection, audio, video, &self.config, &self.cancel);
        if let Some(layer) = host.highest_priority_audio_track() {
            whep.set_audio_layer(&layer);
        }
        if let Some(layer) = host.highest_priority_video_track() {
            whep.set_video_layer(&layer);
        }

        let inserted = {
            let mut wheps = self.wheps.write();
            if self.is_closed() {
                false
            } else {
                wheps.insert(id.clone(), Arc::clone(&whep));
                true
            }
        };
        if !inserted {
            whep.close().await;
            return Err(SfuError::SessionClosed);
        }

        whep.spawn_workers();
        self.spawn_whep_watcher(&whep);
        self.refresh_snapshot();

        info!(
            stream_key = %self.stream_key,
            session_id = %id,
            audio_layer = %whep.audio_layer(),
            video_layer = %whep.video_layer(),
            "WHEP session attached"
        );

        if let Some(event) = events::status(&self.status()) {
            whep.send_event(event);
        }
        if let Some(event) = events::layers(&host.available_layers()) {
            whep.send_event(event);
        }

        Ok(whep)
    }

    fn spawn_whep_watcher(self: &Arc<Self>, whep: &Arc<WhepSession>) {
        let session = Arc::downgrade(self);
        let token = whep.cancel_token();
        let id = whep.id().clone();
        tokio::spawn(async move {
            token.cancelled().await;
            if let Some(session) = session.upgrade() {
                session.remove_whep(&id).await;
            }
        });
    }

    fn register_whep_handlers(
        self: &Arc<Self>,
        whep: &Arc<WhepSession>,
        peer_connection: &RTCPeerConnection,
    ) {
        let session = Arc::downgrade(self);
        let whep = Arc::downgrade(whep);
        peer_connection.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let session = Weak::clone(&session);
            let whep = Weak::clone(&whep);
            Box::pin(async move {
                let Some(whep) = whep.upgrade() else { return };
                debug!(session_id = %whep.id(), %state, "WHEP ICE connection state changed");
                match state {
                    RTCIceConnectionState::Connected => {
                        if let Some(session) = session.upgrade() {
                            session.request_keyframe_for(&whep);
                        }
                    }
                    RTCIceConnectionState::Failed | RTCIceConnectionState::Closed => {
                        whep.close().await;
                    }
                    _ => {}
                }
            })
        }));
    }

    /// Forward picture loss reports from the viewer to the host.
    fn spawn_rtcp_reader(self: &Arc<Self>, whep: &Arc<WhepSession>, sender: Arc<RTCRtpSender>) {
        let session = Arc::downgrade(self);
        let whep = Arc::clone(whep);
        tokio::spawn(async move {
            let token = whep.cancel_token();
            loop {
                let result = tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    result = sender.read_rtcp() => result,
                };
                let Ok((packets, _attributes)) = result else {
                    break;
                };
                let has_pli = packets.iter().any(|packet| {
                    packet
                        .as_any()
                        .downcast_ref::<PictureLossIndication>()
                        .is_some()
                });
                if has_pli {
                    let Some(session) = session.upgrade() else { break };
                    session.request_keyframe_for(&whep);
                }
            }
            debug!(session_id = %whep.id(), "WHEP RTCP reader stopped");
        });
    }

    /// Ask the host for a keyframe on the layer `whep` is watching.
    pub fn request_keyframe_for(&self, whep: &WhepSession) {
        let Some(host) = self.host() else { return };
        let layer = whep.video_layer();
        if layer.is_empty() {
            host.request_keyframe(PliRequest::all_layers());
        } else {
            host.request_keyframe(PliRequest::for_layer(layer));
        }
    }

    /// Remove a subscriber and close it. Closes the session if it became
    /// empty.
    pub async fn remove_whep(&self, id: &SessionId) {
        let whep = self.wheps.write().remove(id);
        if let Some(whep) = whep {
            info!(stream_key = %self.stream_key, session_id = %id, "Removing WHEP session");
            whep.close().await;
            self.refresh_snapshot();
        }
        self.close_if_empty().await;
    }

    pub fn set_audio_layer(&self, whep_id: &SessionId, rid: &str) -> Result<()> {
        let whep = self
            .whep(whep_id)
            .ok_or_else(|| SfuError::SessionNotFound(whep_id.to_string()))?;
        whep.set_audio_layer(rid);
        Self::send_current_layers(&whep);
        Ok(())
    }

    /// Switch a subscriber's video layer and ask the host for a keyframe on
    /// the new layer.
    pub fn set_video_layer(&self, whep_id: &SessionId, rid: &str) -> Result<()> {
        let whep = self
            .whep(whep_id)
            .ok_or_else(|| SfuError::SessionNotFound(whep_id.to_string()))?;
        whep.set_video_layer(rid);
        Self::send_current_layers(&whep);
        if let Some(host) = self.host() {
            host.request_keyframe(PliRequest::for_layer(rid));
        }
        Ok(())
    }

    fn send_current_layers(whep: &WhepSession) {
        if let Some(event) = events::current_layers(&whep.audio_layer(), &whep.video_layer()) {
            whep.send_event(event);
        }
    }

    /// Move subscribers whose layer is no longer published onto the host's
    /// preferred layer.
    pub fn reconcile_layers(&self) {
        let Some(host) = self.host() else { return };

        for whep in self.open_wheps() {
            let mut changed = false;
            for kind in [MediaKind::Audio, MediaKind::Video] {
                if host.has_layer(kind, &whep.layer(kind)) {
                    continue;
                }
                let Some(preferred) = host.highest_priority_layer(kind) else {
                    continue;
                };
                match kind {
                    MediaKind::Audio => whep.set_audio_layer(&preferred),
                    MediaKind::Video => {
                        whep.set_video_layer(&preferred);
                        host.request_keyframe(PliRequest::for_layer(preferred));
                    }
                }
                changed = true;
            }
            if changed {
                Self::send_current_layers(&whep);
            }
        }
    }

    fn on_track_change(&self) {
        self.reconcile_layers();
        let layers = self
            .host()
            .map(|host| host.available_layers())
            .unwrap_or_default();
        if let Some(event) = events::layers(&layers) {
            self.broadcast(&event);
        }
    }

    fn broadcast(&self, event: &str) {
        for whep in self.open_wheps() {
            whep.send_event(event.to_string());
        }
    }

    /// Publish the current subscriber set to the host's relay path.
    pub fn refresh_snapshot(&self) {
        let Some(host) = self.host() else { return };
        host.set_subscribers(Arc::new(self.open_wheps()));
    }

    async fn run_snapshot_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.snapshot_interval());
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => self.refresh_snapshot(),
            }
        }
        if let Some(host) = self.host() {
            host.set_subscribers(Arc::new(Vec::new()));
        }
    }

    async fn run_status_loop(self: Arc<Self>, mut track_changes: mpsc::Receiver<()>) {
        let period = self.config.status_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);

        loop {
            let host = self.host();
            let host_token = host.as_ref().map(|host| host.cancel_token());
            let host_ended = async move {
                match host_token {
                    Some(token) => token.cancelled().await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = host_ended => {
                    if let Some(host) = host {
                        self.detach_host(&host).await;
                    }
                }
                Some(()) = track_changes.recv() => self.on_track_change(),
                _ = ticker.tick() => {
                    self.close_if_empty().await;
                    if self.is_closed() {
                        break;
                    }
                    if let Some(event) = events::status(&self.status()) {
                        self.broadcast(&event);
                    }
                }
            }
        }
        debug!("Status loop stopped");
    }

    /// Close every subscriber and the host, then cancel the session. Only the
    /// first call has any effect.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.teardown().await;
    }

    /// Close the session if it has no host, no subscribers and no offer in
    /// flight. The check and the transition to closed happen under the same
    /// locks that [`Self::reserve`] and [`Self::attach_whep`] take.
    async fn close_if_empty(&self) {
        let idle = {
            let host = self.host.read();
            let wheps = self.wheps.read();
            host.is_none()
                && wheps.is_empty()
                && self.pending.load(Ordering::Acquire) == 0
                && !self.closed.swap(true, Ordering::AcqRel)
        };
        if idle {
            info!(stream_key = %self.stream_key, "Stream session is empty");
            self.teardown().await;
        }
    }

    async fn teardown(&self) {
        info!(stream_key = %self.stream_key, session_id = %self.id, "Closing stream session");

        let wheps: Vec<_> = self.wheps.write().drain().map(|(_, whep)| whep).collect();
        join_all(wheps.iter().map(|whep| whep.close())).await;

        let host = self.host.write().take();
        if let Some(host) = host {
            self.release_host(host).await;
        }
        self.cancel.cancel();
    }

    #[must_use]
    pub fn status(&self) -> StreamStatus {
        StreamStatus {
            stream_key: self.stream_key.clone(),
            motd: self.profile.read().motd.clone(),
            viewers: self.whep_count(),
            is_online: self.has_host(),
            stream_start: *self.stream_start.read(),
        }
    }

    #[must_use]
    pub fn state(&self) -> StreamSessionState {
        let profile = self.profile.read().clone();
        let host = self.host();

        let mut sessions: Vec<_> = self.open_wheps().iter().map(|whep| whep.state()).collect();
        sessions.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));

        StreamSessionState {
            stream_key: self.stream_key.clone(),
            stream_start: *self.stream_start.read(),
            is_public: profile.is_public,
            motd: profile.motd,
            audio_tracks: host.as_ref().map(|h| h.audio_track_states()).unwrap_or_default(),
            video_tracks: host.as_ref().map(|h| h.video_track_states()).unwrap_or_default(),
            sessions,
        }
    }
}

/// Keeps a [`StreamSession`] from being collected while an offer is
/// negotiated against it. Released on drop.
pub struct Reservation {
    session: Arc<StreamSession>,
}

impl Reservation {
    #[must_use]
    pub const fn session(&self) -> &Arc<StreamSession> {
        &self.session
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.session.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Codec;
    use crate::host::DEFAULT_PRIORITY;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use webrtc::rtp::packet::Packet;

    #[derive(Default)]
    struct FakeConnection {
        closes: AtomicUsize,
    }

    #[async_trait]
    impl MediaConnection for FakeConnection {
        async fn send_picture_loss_indication(&self, _media_ssrc: u32) -> Result<()> {
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn is_closed(&self) -> bool {
            self.closes.load(Ordering::SeqCst) > 0
        }

        async fn remote_sdp(&self) -> Option<String> {
            None
        }
    }

    struct NullWriter;

    #[async_trait]
    impl RtpWriter for NullWriter {
        async fn write_rtp(&self, _packet: &mut Packet, _codec: Codec) -> Result<()> {
            Ok(())
        }
    }

    fn session() -> Arc<StreamSession> {
        StreamSession::new(
            &PublicProfile::new("live"),
            &SfuConfig::default(),
            &CancellationToken::new(),
        )
    }

    async fn viewer(session: &Arc<StreamSession>, id: &str) -> Result<Arc<WhepSession>> {
        session
            .attach_whep(
                SessionId::from(id),
                Arc::new(FakeConnection::default()),
                Arc::new(NullWriter),
                Arc::new(NullWriter),
            )
            .await
    }

    #[tokio::test]
    async fn test_whep_requires_host() {
        let session = session();
        assert!(matches!(viewer(&session, "a").await, Err(SfuError::NoHost)));
        assert!(!session.has_host());
    }

    #[tokio::test]
    async fn test_live_host_is_not_replaced() {
        let session = session();
        session.attach_host(Arc::new(FakeConnection::default())).await.unwrap();
        let second = session.attach_host(Arc::new(FakeConnection::default())).await;
        assert!(matches!(second, Err(SfuError::HostAlreadyExists)));
        assert!(session.has_host());
    }

    #[tokio::test]
    async fn test_closed_host_is_replaced() {
        let session = session();
        let first_connection = Arc::new(FakeConnection::default());
        let first = session.attach_host(first_connection.clone()).await.unwrap();
        first_connection.close().await.unwrap();

        let second = session.attach_host(Arc::new(FakeConnection::default())).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(first.is_cancelled());
    }

    #[tokio::test]
    async fn test_whep_defaults_to_preferred_layers() {
        let session = session();
        let host = session.attach_host(Arc::new(FakeConnection::default())).await.unwrap();
        host.open_track(MediaKind::Video, "low", Codec::H264, 2, 1);
        host.open_track(MediaKind::Video, "high", Codec::H264, 1, 2);
        host.open_track(MediaKind::Audio, "Audio", Codec::Opus, DEFAULT_PRIORITY, 3);

        let whep = viewer(&session, "a").await.unwrap();
        assert_eq!(whep.video_layer(), "high");
        assert_eq!(whep.audio_layer(), "Audio");
        assert!(whep.is_waiting_for_keyframe());

        let mut events = whep.take_event_receiver().unwrap();
        assert!(events.recv().await.unwrap().starts_with("event: status\n"));
        assert!(events.recv().await.unwrap().starts_with("event: layers\n"));
    }

    #[tokio::test]
    async fn test_set_video_layer_sends_current_layers() {
        let session = session();
        let host = session.attach_host(Arc::new(FakeConnection::default())).await.unwrap();
        host.open_track(MediaKind::Video, "high", Codec::H264, 1, 2);
        let whep = viewer(&session, "a").await.unwrap();
        let mut events = whep.take_event_receiver().unwrap();
        events.recv().await.unwrap();
        events.recv().await.unwrap();

        session.set_video_layer(whep.id(), "low").unwrap();
        let event = events.recv().await.unwrap();
        assert!(event.starts_with("event: currentLayers\n"));
        assert!(event.contains("\"videoLayerCurrent\":\"low\""));

        assert!(matches!(
            session.set_video_layer(&SessionId::from("missing"), "low"),
            Err(SfuError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reconcile_moves_viewers_off_missing_layers() {
        let session = session();
        let host = session.attach_host(Arc::new(FakeConnection::default())).await.unwrap();
        let whep = viewer(&session, "a").await.unwrap();
        assert_eq!(whep.video_layer(), "");

        host.open_track(MediaKind::Video, "Video", Codec::H264, DEFAULT_PRIORITY, 1);
        session.reconcile_layers();
        assert_eq!(whep.video_layer(), "Video");
    }

    #[tokio::test]
    async fn test_removing_last_viewer_without_host_closes_session() {
        let session = session();
        let host = session.attach_host(Arc::new(FakeConnection::default())).await.unwrap();
        let whep = viewer(&session, "a").await.unwrap();

        session.detach_host(&host).await;
        assert!(!session.has_host());
        assert!(!session.is_closed());

        session.remove_whep(whep.id()).await;
        assert!(whep.is_closed());
        assert!(session.is_closed());
        assert!(session.cancel_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_removing_only_host_closes_session() {
        let session = session();
        session.attach_host(Arc::new(FakeConnection::default())).await.unwrap();

        session.remove_host().await;
        assert!(!session.has_host());
        assert!(session.is_closed());
        assert!(session.cancel_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_prepared_host_is_announced_on_install() {
        let session = session();
        let stale = Arc::new(FakeConnection::default());
        let first = session.attach_host(stale.clone()).await.unwrap();
        let whep = viewer(&session, "a").await.unwrap();
        let mut events = whep.take_event_receiver().unwrap();
        while events.try_recv().is_ok() {}
        stale.close().await.unwrap();
        let started = session.status().stream_start;

        let second = session.prepare_host(Arc::new(FakeConnection::default())).unwrap();
        assert!(Arc::ptr_eq(&session.host().unwrap(), &first));
        assert!(!first.is_cancelled());
        assert!(events.try_recv().is_err());
        assert_eq!(session.status().stream_start, started);

        session.install_host(&second).await.unwrap();
        assert!(Arc::ptr_eq(&session.host().unwrap(), &second));
        assert!(first.is_cancelled());
        assert!(events.recv().await.unwrap().starts_with("event: streamStart\n"));
    }

    #[tokio::test]
    async fn test_prepare_refuses_while_host_is_live() {
        let session = session();
        session.attach_host(Arc::new(FakeConnection::default())).await.unwrap();
        assert!(matches!(
            session.prepare_host(Arc::new(FakeConnection::default())),
            Err(SfuError::HostAlreadyExists)
        ));
    }

    #[tokio::test]
    async fn test_reservation_keeps_session_open() {
        let config = SfuConfig {
            status_interval_ms: 20,
            ..Default::default()
        };
        let session = StreamSession::new(&PublicProfile::new("live"), &config, &CancellationToken::new());

        let reservation = session.reserve().unwrap();
        assert!(!session.is_empty());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!session.is_closed());

        drop(reservation);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(session.is_closed());
        assert!(matches!(session.reserve(), Err(SfuError::SessionClosed)));
    }

    #[tokio::test]
    async fn test_host_cancellation_detaches_host() {
        let session = session();
        let host = session.attach_host(Arc::new(FakeConnection::default())).await.unwrap();
        let _whep = viewer(&session, "a").await.unwrap();

        host.cancel_token().cancel();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(session.host().is_none());
        assert!(!session.has_host());
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn test_close_is_terminal() {
        let session = session();
        session.attach_host(Arc::new(FakeConnection::default())).await.unwrap();
        let whep = viewer(&session, "a").await.unwrap();

        session.close().await;
        session.close().await;

        assert!(whep.is_closed());
        assert!(session.host().is_none());
        assert!(matches!(
            session.attach_host(Arc::new(FakeConnection::default())).await,
            Err(SfuError::SessionClosed)
        ));
        assert!(matches!(viewer(&session, "b").await, Err(SfuError::SessionClosed)));
    }

    #[tokio::test]
    async fn test_state_reports_tracks_and_viewers() {
        let session = session();
        let host = session.attach_host(Arc::new(FakeConnection::default())).await.unwrap();
        host.open_track(MediaKind::Video, "high", Codec::H264, 1, 2);
        viewer(&session, "a").await.unwrap();

        let state = session.state();
        assert_eq!(state.stream_key.as_str(), "live");
        assert_eq!(state.video_tracks.len(), 1);
        assert_eq!(state.sessions.len(), 1);
        assert_eq!(state.sessions[0].video_layer_current, "high");

        let status = session.status();
        assert_eq!(status.viewers, 1);
        assert!(status.is_online);
    }
}
