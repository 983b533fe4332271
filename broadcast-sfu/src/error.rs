use thiserror::Error;

use crate::codec::Codec;

#[derive(Error, Debug)]
pub enum SfuError {
    #[error("session already has a host")]
    HostAlreadyExists,

    #[error("no host was found on the current session")]
    NoHost,

    #[error("session is closed")]
    SessionClosed,

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("stream not found: {0}")]
    StreamNotFound(String),

    #[error("transport closed")]
    TransportClosed,

    #[error("codec {0:?} was not negotiated with the remote peer")]
    UnresolvedCodec(Codec),

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("WebRTC error: {0}")]
    WebRtc(webrtc::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl From<webrtc::Error> for SfuError {
    fn from(err: webrtc::Error) -> Self {
        match err {
            // Writes after the transport went away
            webrtc::Error::ErrClosedPipe | webrtc::Error::ErrConnectionClosed => {
                Self::TransportClosed
            }
            _ => Self::WebRtc(err),
        }
    }
}

impl SfuError {
    /// True when the error means the peer is gone for good.
    #[must_use]
    pub const fn is_transport_closed(&self) -> bool {
        matches!(self, Self::TransportClosed)
    }
}

pub type Result<T, E = SfuError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_pipe_maps_to_transport_closed() {
        let err = SfuError::from(webrtc::Error::ErrClosedPipe);
        assert!(err.is_transport_closed());

        let err = SfuError::from(webrtc::Error::ErrConnectionClosed);
        assert!(err.is_transport_closed());
    }

    #[test]
    fn test_other_webrtc_errors_are_wrapped() {
        let err = SfuError::from(webrtc::Error::new("boom".to_string()));
        assert!(matches!(err, SfuError::WebRtc(_)));
        assert!(!err.is_transport_closed());
    }
}
