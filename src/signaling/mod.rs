//! Signaling transport boundary and wire message types
//!
//! The orchestrator talks to an external low-latency publish/subscribe channel
//! through the [`SignalingTransport`] trait. Two kinds of traffic share the
//! session channel: addressed negotiation messages (offer, answer, candidate)
//! and broadcast fallback messages used when the data channel is unavailable.
//! Every payload is a tagged enum with exhaustive matching at this boundary;
//! unknown or malformed variants are rejected with an error, never a panic.

pub mod memory;

use crate::messenger::ChatMessage;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// A per-session publish/subscribe channel (consumed collaborator).
///
/// Implementations must deliver events for a given channel in publish order;
/// the orchestrator relies on that ordering and performs no reordering of its
/// own beyond the self-echo filter.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Subscribe to a session channel. The returned receiver yields every
    /// event published on the channel, including the subscriber's own.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::UnboundedReceiver<ChannelEvent>>;

    /// Publish an event to all subscribers of a session channel
    async fn publish(&self, channel: &str, event: ChannelEvent) -> Result<()>;

    /// Tear down the subscription for a session channel
    async fn unsubscribe(&self, channel: &str) -> Result<()>;
}

/// Any event travelling over a session channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ChannelEvent {
    /// Addressed negotiation traffic between the two peers
    Signal(SignalMessage),

    /// Broadcast fallback messaging (chat, device info, media toggles)
    Broadcast(FallbackMessage),
}

impl ChannelEvent {
    /// Convert to JSON for transports that carry raw strings
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| crate::Error::Serialization(format!("Failed to serialize event: {}", e)))
    }

    /// Parse from JSON, rejecting unknown or malformed payloads
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| crate::Error::Serialization(format!("Failed to deserialize event: {}", e)))
    }
}

/// Addressed signaling messages for offer/answer negotiation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalMessage {
    /// Session description offer from the initiator
    Offer {
        /// Sender user id
        from: String,
        /// Recipient user id
        to: String,
        /// Unix timestamp in milliseconds
        timestamp: u64,
        /// SDP offer
        sdp: String,
    },

    /// Session description answer from the responder
    Answer {
        /// Sender user id
        from: String,
        /// Recipient user id
        to: String,
        /// Unix timestamp in milliseconds
        timestamp: u64,
        /// SDP answer
        sdp: String,
    },

    /// Trickled negotiation candidate
    IceCandidate {
        /// Sender user id
        from: String,
        /// Recipient user id
        to: String,
        /// Unix timestamp in milliseconds
        timestamp: u64,
        /// Candidate payload
        candidate: CandidatePayload,
    },
}

impl SignalMessage {
    /// Sender id, used for the self-echo filter
    pub fn from(&self) -> &str {
        match self {
            SignalMessage::Offer { from, .. } => from,
            SignalMessage::Answer { from, .. } => from,
            SignalMessage::IceCandidate { from, .. } => from,
        }
    }
}

/// Serialized negotiation candidate as exchanged over signaling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CandidatePayload {
    /// Candidate attribute line
    pub candidate: String,

    /// Media stream identification tag
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,

    /// Media line index
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

impl CandidatePayload {
    /// Convert into the webrtc-rs candidate init form
    pub fn to_init(&self) -> webrtc::ice_transport::ice_candidate::RTCIceCandidateInit {
        webrtc::ice_transport::ice_candidate::RTCIceCandidateInit {
            candidate: self.candidate.clone(),
            sdp_mid: self.sdp_mid.clone(),
            sdp_mline_index: self.sdp_mline_index,
            ..Default::default()
        }
    }

    /// Build from the webrtc-rs candidate init form
    pub fn from_init(init: webrtc::ice_transport::ice_candidate::RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
        }
    }
}

/// Broadcast messages carried over signaling when the data channel is not
/// usable, and over the data channel itself when it is.
///
/// Receivers must discard payloads whose `user_id` equals their own id;
/// broadcasts are visible to their sender.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum FallbackMessage {
    /// Chat text
    ChatMessage {
        /// Originating user id
        user_id: String,
        /// Unix timestamp in milliseconds
        timestamp: u64,
        /// The chat message itself
        message: ChatMessage,
    },

    /// Capture device description for the remote UI
    DeviceInfo {
        /// Originating user id
        user_id: String,
        /// Unix timestamp in milliseconds
        timestamp: u64,
        /// Device description
        info: DeviceInfo,
    },

    /// A peer muted/unmuted audio or enabled/disabled video
    MediaToggle {
        /// Originating user id
        user_id: String,
        /// Unix timestamp in milliseconds
        timestamp: u64,
        /// Which track kind was toggled
        media: MediaKind,
        /// New enabled state
        enabled: bool,
    },
}

impl FallbackMessage {
    /// Originating user id, used for the self-echo filter
    pub fn user_id(&self) -> &str {
        match self {
            FallbackMessage::ChatMessage { user_id, .. } => user_id,
            FallbackMessage::DeviceInfo { user_id, .. } => user_id,
            FallbackMessage::MediaToggle { user_id, .. } => user_id,
        }
    }
}

/// Track kind referenced by a media toggle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Audio track
    Audio,
    /// Video track
    Video,
}

/// Capture device description exchanged between peers
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeviceInfo {
    /// Camera label, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub camera: Option<String>,

    /// Microphone label, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub microphone: Option<String>,

    /// Platform/user-agent description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
}

/// Current time as Unix milliseconds, for message timestamps
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messenger::ChatKind;

    #[test]
    fn test_offer_round_trip() {
        let event = ChannelEvent::Signal(SignalMessage::Offer {
            from: "alice".to_string(),
            to: "bob".to_string(),
            timestamp: 1_700_000_000_000,
            sdp: "v=0\r\no=- ...".to_string(),
        });

        let json = event.to_json().unwrap();
        assert!(json.contains("\"type\":\"offer\""));
        let parsed = ChannelEvent::from_json(&json).unwrap();
        assert_eq!(event, parsed);
    }

    #[test]
    fn test_candidate_round_trip() {
        let event = ChannelEvent::Signal(SignalMessage::IceCandidate {
            from: "bob".to_string(),
            to: "alice".to_string(),
            timestamp: 1,
            candidate: CandidatePayload {
                candidate: "candidate:1 1 udp 2130706431 192.0.2.1 54400 typ host".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            },
        });

        let json = event.to_json().unwrap();
        assert!(json.contains("\"type\":\"ice-candidate\""));
        assert_eq!(ChannelEvent::from_json(&json).unwrap(), event);
    }

    #[test]
    fn test_chat_broadcast_tag_and_sender() {
        let event = ChannelEvent::Broadcast(FallbackMessage::ChatMessage {
            user_id: "alice".to_string(),
            timestamp: 2,
            message: ChatMessage {
                id: "m-1".to_string(),
                sender_id: "alice".to_string(),
                sender_name: "Alice".to_string(),
                content: "hi".to_string(),
                timestamp: 2,
                kind: ChatKind::Text,
            },
        });

        let json = event.to_json().unwrap();
        assert!(json.contains("\"type\":\"chat-message\""));

        if let ChannelEvent::Broadcast(msg) = ChannelEvent::from_json(&json).unwrap() {
            assert_eq!(msg.user_id(), "alice");
        } else {
            panic!("expected broadcast");
        }
    }

    #[test]
    fn test_malformed_payload_is_rejected() {
        assert!(ChannelEvent::from_json("not json").is_err());
        assert!(ChannelEvent::from_json(r#"{"kind":"signal","type":"warp","sdp":""}"#).is_err());
    }

    #[test]
    fn test_media_toggle_round_trip() {
        let event = ChannelEvent::Broadcast(FallbackMessage::MediaToggle {
            user_id: "bob".to_string(),
            timestamp: 3,
            media: MediaKind::Video,
            enabled: false,
        });
        let json = event.to_json().unwrap();
        assert!(json.contains("\"type\":\"media-toggle\""));
        assert_eq!(ChannelEvent::from_json(&json).unwrap(), event);
    }
}
