//! WHIP/WHEP entry points
//!
//! [`SfuEngine`] is what the HTTP handlers talk to: it builds peer
//! connections from the configured webrtc API, runs the offer/answer exchange
//! and wires the resulting connection into the right stream session.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::API;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;

use crate::config::Config;
use crate::connection::{build_api, negotiate_answer, parse_offer, rtc_configuration};
use crate::error::{Result, SfuError};
use crate::manager::SessionManager;
use crate::multi_codec_track::MultiCodecTrack;
use crate::session::StreamSession;
use crate::types::{MediaKind, PublicProfile, SessionId, StreamKey};

/// Answer to a WHIP offer
#[derive(Debug, Clone)]
pub struct WhipAnswer {
    /// Id of the host created for the publisher
    pub session_id: SessionId,
    pub sdp: String,
}

/// Answer to a WHEP offer
#[derive(Debug, Clone)]
pub struct WhepAnswer {
    /// Id of the subscriber, used for layer selection and its event stream
    pub session_id: SessionId,
    pub sdp: String,
}

pub struct SfuEngine {
    api: API,
    rtc_config: RTCConfiguration,
    manager: Arc<SessionManager>,
}

impl SfuEngine {
    pub fn new(config: &Config) -> Result<Self> {
        let api = build_api(&config.webrtc)?;
        let rtc_config = rtc_configuration(&config.webrtc);
        info!(
            stun_servers = config.webrtc.stun_servers.len(),
            turn_servers = config.webrtc.turn_servers.len(),
            "SFU engine initialized"
        );
        Ok(Self {
            api,
            rtc_config,
            manager: SessionManager::new(config.sfu.clone()),
        })
    }

    #[must_use]
    pub const fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    async fn new_peer_connection(&self) -> Result<Arc<RTCPeerConnection>> {
        let peer_connection = self.api.new_peer_connection(self.rtc_config.clone()).await?;
        Ok(Arc::new(peer_connection))
    }

    /// Accept a publisher offer for `profile`'s stream. The host is only
    /// installed once the answer is ready, so a failed negotiation leaves the
    /// session as it was.
    pub async fn accept_whip(&self, profile: &PublicProfile, offer: &str) -> Result<WhipAnswer> {
        let offer = parse_offer(offer)?;
        let reservation = self.manager.reserve_session(profile, true)?;
        let session = reservation.session();

        let peer_connection = self.new_peer_connection().await?;
        let host = match session.prepare_peer_host(&peer_connection) {
            Ok(host) => host,
            Err(e) => {
                discard(&peer_connection).await;
                return Err(e);
            }
        };

        let negotiated = match negotiate_answer(&peer_connection, offer).await {
            Ok(sdp) => session.install_host(&host).await.map(|()| sdp),
            Err(e) => Err(e),
        };

        match negotiated {
            Ok(sdp) => {
                info!(stream_key = %profile.stream_key, host_id = %host.id(), "WHIP session negotiated");
                Ok(WhipAnswer {
                    session_id: host.id().clone(),
                    sdp,
                })
            }
            Err(e) => {
                warn!(stream_key = %profile.stream_key, error = %e, "WHIP negotiation failed");
                host.close().await;
                Err(e)
            }
        }
    }

    /// Accept a viewer offer for `profile`'s stream. Fails with
    /// [`SfuError::NoHost`] while nobody is publishing; the stream session is
    /// kept so the viewer can poll for the host.
    pub async fn accept_whep(&self, profile: &PublicProfile, offer: &str) -> Result<WhepAnswer> {
        let offer = parse_offer(offer)?;
        let reservation = self.manager.reserve_session(profile, false)?;
        let session = reservation.session();
        if !session.has_host() {
            return Err(SfuError::NoHost);
        }

        let peer_connection = self.new_peer_connection().await?;
        let id = SessionId::generate();
        match Self::wire_whep(session, id, &peer_connection, offer).await {
            Ok(answer) => {
                info!(stream_key = %profile.stream_key, session_id = %answer.session_id, "WHEP session negotiated");
                Ok(answer)
            }
            Err(e) => {
                warn!(stream_key = %profile.stream_key, error = %e, "WHEP negotiation failed");
                discard(&peer_connection).await;
                Err(e)
            }
        }
    }

    async fn wire_whep(
        session: &Arc<StreamSession>,
        id: SessionId,
        peer_connection: &Arc<RTCPeerConnection>,
        offer: RTCSessionDescription,
    ) -> Result<WhepAnswer> {
        let stream_id = session.stream_key().to_string();
        let audio_track = Arc::new(MultiCodecTrack::new(
            format!("audio-{id}"),
            stream_id.clone(),
            MediaKind::Audio,
        ));
        let video_track = Arc::new(MultiCodecTrack::new(
            format!("video-{id}"),
            stream_id,
            MediaKind::Video,
        ));

        let audio_sender = peer_connection
            .add_track(Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        let video_sender = peer_connection
            .add_track(Arc::clone(&video_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        spawn_rtcp_drain(audio_sender);

        let sdp = negotiate_answer(peer_connection, offer).await?;

        session
            .add_whep(
                id.clone(),
                Arc::clone(peer_connection),
                audio_track,
                video_track,
                video_sender,
            )
            .await?;

        Ok(WhepAnswer { session_id: id, sdp })
    }

    /// Whether a publisher is attached to `stream_key`
    #[must_use]
    pub fn has_host(&self, stream_key: &StreamKey) -> bool {
        self.manager
            .get_session(stream_key)
            .is_some_and(|session| session.has_host())
    }

    /// Take the event stream of a subscriber. Only the first call succeeds.
    pub fn whep_events(&self, whep_id: &SessionId) -> Result<mpsc::Receiver<String>> {
        let (_, whep) = self
            .manager
            .get_whep_session(whep_id)
            .ok_or_else(|| SfuError::SessionNotFound(whep_id.to_string()))?;
        whep.take_event_receiver()
            .ok_or_else(|| SfuError::SessionNotFound(whep_id.to_string()))
    }

    pub async fn close_whep(&self, whep_id: &SessionId) -> Result<()> {
        let (session, _) = self
            .manager
            .get_whep_session(whep_id)
            .ok_or_else(|| SfuError::SessionNotFound(whep_id.to_string()))?;
        session.remove_whep(whep_id).await;
        Ok(())
    }

    pub async fn close_host(&self, host_id: &SessionId) -> Result<()> {
        let (session, host) = self
            .manager
            .get_host_session(host_id)
            .ok_or_else(|| SfuError::SessionNotFound(host_id.to_string()))?;
        session.detach_host(&host).await;
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
    }
}

async fn discard(peer_connection: &RTCPeerConnection) {
    if let Err(e) = peer_connection.close().await {
        debug!(error = %e, "Failed to close discarded peer connection");
    }
}

/// The audio sender's RTCP carries nothing we act on, but it has to be read
/// for the interceptors to run.
fn spawn_rtcp_drain(sender: Arc<RTCRtpSender>) {
    tokio::spawn(async move { while sender.read_rtcp().await.is_ok() {} });
}
