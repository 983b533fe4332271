//! Peer connection plumbing
//!
//! [`MediaConnection`] is the narrow surface the session engine needs from a
//! peer connection. The remaining helpers build the webrtc API and run the
//! offer/answer exchange for the WHIP/WHEP handlers.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice::network_type::NetworkType;
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;

use crate::codec::register_codecs;
use crate::config::WebRtcConfig;
use crate::error::{Result, SfuError};

/// Operations the session engine performs on a peer connection
#[async_trait]
pub trait MediaConnection: Send + Sync {
    /// Ask the remote sender for a fresh keyframe on `media_ssrc`.
    async fn send_picture_loss_indication(&self, media_ssrc: u32) -> Result<()>;

    async fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;

    /// SDP of the applied remote description, if any
    async fn remote_sdp(&self) -> Option<String>;
}

#[async_trait]
impl MediaConnection for RTCPeerConnection {
    async fn send_picture_loss_indication(&self, media_ssrc: u32) -> Result<()> {
        let pli = PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc,
        };
        self.write_rtcp(&[Box::new(pli)]).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        RTCPeerConnection::close(self).await?;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.connection_state() == RTCPeerConnectionState::Closed
    }

    async fn remote_sdp(&self) -> Option<String> {
        self.current_remote_description()
            .await
            .map(|description| description.sdp)
    }
}

fn parse_network_type(name: &str) -> Result<NetworkType> {
    match name.to_lowercase().as_str() {
        "udp4" => Ok(NetworkType::Udp4),
        "udp6" => Ok(NetworkType::Udp6),
        "tcp4" => Ok(NetworkType::Tcp4),
        "tcp6" => Ok(NetworkType::Tcp6),
        other => Err(config::ConfigError::Message(format!("unknown network type: {other}")).into()),
    }
}

fn parse_candidate_type(name: &str) -> Result<RTCIceCandidateType> {
    match name.to_lowercase().as_str() {
        "host" => Ok(RTCIceCandidateType::Host),
        "srflx" => Ok(RTCIceCandidateType::Srflx),
        other => Err(config::ConfigError::Message(format!(
            "unsupported NAT candidate type: {other}"
        ))
        .into()),
    }
}

/// Build a webrtc API with the codec tables, the default interceptors and the
/// configured transport settings.
pub fn build_api(config: &WebRtcConfig) -> Result<API> {
    let mut media_engine = MediaEngine::default();
    register_codecs(&mut media_engine)?;

    let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

    let mut setting_engine = SettingEngine::default();
    if !config.nat_1to1_ips.is_empty() {
        let candidate_type = parse_candidate_type(&config.nat_candidate_type)?;
        setting_engine.set_nat_1to1_ips(config.nat_1to1_ips.clone(), candidate_type);
    }

    let network_types = config
        .network_types
        .iter()
        .map(|name| parse_network_type(name))
        .collect::<Result<Vec<_>>>()?;
    if !network_types.is_empty() {
        setting_engine.set_network_types(network_types);
    }

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .with_setting_engine(setting_engine)
        .build())
}

/// ICE configuration from the configured STUN and TURN servers
#[must_use]
pub fn rtc_configuration(config: &WebRtcConfig) -> RTCConfiguration {
    let ice_servers = config
        .stun_servers
        .iter()
        .map(|url| RTCIceServer {
            urls: vec![url.clone()],
            ..Default::default()
        })
        .chain(config.turn_servers.iter().map(|turn| RTCIceServer {
            urls: vec![turn.url.clone()],
            username: turn.username.clone(),
            credential: turn.credential.clone(),
            ..Default::default()
        }))
        .collect();

    RTCConfiguration {
        ice_servers,
        ..Default::default()
    }
}

/// Parse an SDP offer without touching any connection.
pub fn parse_offer(offer: &str) -> Result<RTCSessionDescription> {
    RTCSessionDescription::offer(offer.to_string())
        .map_err(|e| SfuError::Negotiation(format!("invalid offer: {e}")))
}

/// Apply `offer`, create the answer and wait for ICE gathering so the
/// returned SDP carries every local candidate.
pub async fn negotiate_answer(
    peer_connection: &Arc<RTCPeerConnection>,
    offer: RTCSessionDescription,
) -> Result<String> {
    let negotiation = |e: webrtc::Error| SfuError::Negotiation(e.to_string());

    peer_connection
        .set_remote_description(offer)
        .await
        .map_err(negotiation)?;

    let answer = peer_connection.create_answer(None).await.map_err(negotiation)?;

    let mut gather_complete = peer_connection.gathering_complete_promise().await;
    peer_connection
        .set_local_description(answer)
        .await
        .map_err(negotiation)?;
    let _ = gather_complete.recv().await;

    debug!("ICE gathering complete");

    peer_connection
        .local_description()
        .await
        .map(|description| description.sdp)
        .ok_or_else(|| SfuError::Negotiation("no local description after answer".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TurnServer;

    #[test]
    fn test_rtc_configuration_lists_stun_then_turn() {
        let config = WebRtcConfig {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: vec![TurnServer {
                url: "turn:turn.example.com:3478".to_string(),
                username: "user".to_string(),
                credential: "secret".to_string(),
            }],
            ..Default::default()
        };

        let rtc = rtc_configuration(&config);
        assert_eq!(rtc.ice_servers.len(), 2);
        assert_eq!(rtc.ice_servers[0].urls, vec!["stun:stun.l.google.com:19302"]);
        assert_eq!(rtc.ice_servers[1].username, "user");
        assert_eq!(rtc.ice_servers[1].credential, "secret");
    }

    #[test]
    fn test_parse_network_types() {
        assert_eq!(parse_network_type("UDP4").unwrap(), NetworkType::Udp4);
        assert_eq!(parse_network_type("tcp6").unwrap(), NetworkType::Tcp6);
        assert!(matches!(parse_network_type("sctp"), Err(SfuError::Config(_))));
    }

    #[test]
    fn test_parse_candidate_type() {
        assert_eq!(parse_candidate_type("host").unwrap(), RTCIceCandidateType::Host);
        assert_eq!(parse_candidate_type("srflx").unwrap(), RTCIceCandidateType::Srflx);
        assert!(parse_candidate_type("relay").is_err());
    }

    #[test]
    fn test_build_api_with_defaults() {
        assert!(build_api(&WebRtcConfig::default()).is_ok());
    }

    #[test]
    fn test_build_api_rejects_unknown_network_type() {
        let config = WebRtcConfig {
            network_types: vec!["carrier-pigeon".to_string()],
            ..Default::default()
        };
        assert!(build_api(&config).is_err());
    }

    #[test]
    fn test_parse_offer_rejects_garbage() {
        assert!(matches!(parse_offer("not sdp"), Err(SfuError::Negotiation(_))));
    }
}
