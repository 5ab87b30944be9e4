//! Error types for the call orchestrator

/// Result type alias using the crate Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while establishing or running a call
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Local media could not be acquired (permission denied / device missing)
    #[error("Media access error: {0}")]
    MediaAccess(String),

    /// Signaling channel could not be set up
    #[error("Signaling setup error: {0}")]
    SignalingSetup(String),

    /// Signaling publish/subscribe failure at runtime
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// Offer/answer received while the local negotiation state does not allow it
    #[error("Invalid negotiation state: {0}")]
    InvalidNegotiationState(String),

    /// A negotiation candidate could not be applied (stale/duplicate)
    #[error("Candidate apply error: {0}")]
    CandidateApply(String),

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    Sdp(String),

    /// Data channel error
    #[error("Data channel error: {0}")]
    DataChannel(String),

    /// WebRTC peer connection error
    #[error("Peer connection error: {0}")]
    PeerConnection(String),

    /// Reconnection attempts exhausted
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Call already ended; operation not possible
    #[error("Call ended")]
    CallEnded,

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is fatal for the session.
    ///
    /// Fatal errors always go through the single fail-and-notify transition;
    /// the host never observes one without a matching state change.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::MediaAccess(_)
                | Error::SignalingSetup(_)
                | Error::ConnectionLost(_)
                | Error::InvalidConfig(_)
        )
    }

    /// Check if this error is recovered locally (logged, no state change)
    pub fn is_recoverable_locally(&self) -> bool {
        matches!(
            self,
            Error::InvalidNegotiationState(_) | Error::CandidateApply(_)
        )
    }

    /// Sanitized, user-actionable message for the host.
    ///
    /// Never exposes raw internal error text or stack traces.
    pub fn user_message(&self) -> String {
        match self {
            Error::MediaAccess(_) => {
                "Could not access your camera or microphone. Check device permissions and try again.".to_string()
            }
            Error::SignalingSetup(_) | Error::Signaling(_) => {
                "Could not reach the call service. Check your network connection and try again.".to_string()
            }
            Error::ConnectionLost(_) => {
                "The connection could not be recovered. Please rejoin the call or switch to an alternate conferencing link.".to_string()
            }
            Error::CallEnded => "The call has ended.".to_string(),
            _ => "Something went wrong with the call. Please try again.".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidConfig("test".to_string());
        assert_eq!(err.to_string(), "Invalid configuration: test");
    }

    #[test]
    fn test_error_is_fatal() {
        assert!(Error::MediaAccess("denied".to_string()).is_fatal());
        assert!(Error::SignalingSetup("refused".to_string()).is_fatal());
        assert!(Error::ConnectionLost("retries exhausted".to_string()).is_fatal());
        assert!(!Error::CandidateApply("stale".to_string()).is_fatal());
    }

    #[test]
    fn test_error_is_recoverable_locally() {
        assert!(Error::InvalidNegotiationState("glare".to_string()).is_recoverable_locally());
        assert!(Error::CandidateApply("duplicate".to_string()).is_recoverable_locally());
        assert!(!Error::MediaAccess("denied".to_string()).is_recoverable_locally());
    }

    #[test]
    fn test_user_message_is_sanitized() {
        let err = Error::MediaAccess("NotAllowedError: device xyz at /dev/video0".to_string());
        let msg = err.user_message();
        assert!(!msg.contains("/dev/video0"));
        assert!(msg.contains("permissions"));
    }

    #[test]
    fn test_connection_lost_suggests_alternate_path() {
        let msg = Error::ConnectionLost("3 attempts".to_string()).user_message();
        assert!(msg.contains("alternate"));
    }
}
