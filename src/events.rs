//! Host-facing lifecycle state and event stream

use crate::media::MediaHandle;
use crate::messenger::ChatMessage;
use crate::quality::{ConnectionQuality, ConnectionStats};
use crate::signaling::DeviceInfo;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use webrtc::track::track_remote::TrackRemote;

/// Connection lifecycle state. Exactly one current value per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Acquiring media and setting up signaling
    Initializing,
    /// Negotiation in progress, transport not yet up
    Connecting,
    /// Direct link established
    Connected,
    /// Transport lost; supervised recovery in progress
    Reconnecting,
    /// Recovery exhausted or fatal startup error (terminal)
    Failed,
    /// Torn down by an explicit end-call (terminal)
    Ended,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Initializing => "initializing",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
            ConnectionState::Ended => "ended",
        };
        f.write_str(s)
    }
}

/// Events delivered to the host application over the call's event channel.
///
/// Error payloads are always sanitized user-facing text, never raw internals.
#[derive(Clone)]
pub enum CallEvent {
    /// The lifecycle state changed (or re-emitted for `connecting`)
    StateChanged(ConnectionState),

    /// Fresh statistics sample with its derived classification
    QualityChanged(ConnectionQuality, ConnectionStats),

    /// Local capture media is ready for preview
    LocalMedia(MediaHandle),

    /// A remote media track arrived
    RemoteTrack(Arc<TrackRemote>),

    /// Chat message (remote, or local echo after a successful send)
    Message(ChatMessage),

    /// Fatal condition; the session state changed alongside this event
    Error(String),

    /// The remote peer muted/unmuted audio
    RemoteAudioToggle(bool),

    /// The remote peer enabled/disabled video
    RemoteVideoToggle(bool),

    /// The remote peer described its capture devices
    RemoteDeviceInfo(DeviceInfo),
}

// Manual impl: `TrackRemote` does not implement `Debug`
impl std::fmt::Debug for CallEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallEvent::StateChanged(state) => f.debug_tuple("StateChanged").field(state).finish(),
            CallEvent::QualityChanged(quality, stats) => f
                .debug_tuple("QualityChanged")
                .field(quality)
                .field(stats)
                .finish(),
            CallEvent::LocalMedia(handle) => f.debug_tuple("LocalMedia").field(handle).finish(),
            CallEvent::RemoteTrack(track) => f
                .debug_struct("RemoteTrack")
                .field("kind", &track.kind())
                .field("ssrc", &track.ssrc())
                .finish(),
            CallEvent::Message(message) => f.debug_tuple("Message").field(message).finish(),
            CallEvent::Error(message) => f.debug_tuple("Error").field(message).finish(),
            CallEvent::RemoteAudioToggle(enabled) => {
                f.debug_tuple("RemoteAudioToggle").field(enabled).finish()
            }
            CallEvent::RemoteVideoToggle(enabled) => {
                f.debug_tuple("RemoteVideoToggle").field(enabled).finish()
            }
            CallEvent::RemoteDeviceInfo(info) => {
                f.debug_tuple("RemoteDeviceInfo").field(info).finish()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
        assert_eq!(ConnectionState::Ended.to_string(), "ended");
    }

    #[test]
    fn test_state_serde_tags() {
        let json = serde_json::to_string(&ConnectionState::Reconnecting).unwrap();
        assert_eq!(json, "\"reconnecting\"");
        let back: ConnectionState = serde_json::from_str("\"failed\"").unwrap();
        assert_eq!(back, ConnectionState::Failed);
    }
}
