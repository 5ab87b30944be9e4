//! Dual-path application messaging
//!
//! Chat, device info and media-toggle payloads travel over the negotiated
//! data channel when it is open, and are broadcast over signaling otherwise.
//! Each send uses exactly one path. Both paths carry the same tagged
//! [`FallbackMessage`] encoding, so receivers handle inbound traffic
//! identically and drop their own echoes by sender id.

use crate::events::CallEvent;
use crate::session::SessionIdentity;
use crate::signaling::{
    now_millis, ChannelEvent, DeviceInfo, FallbackMessage, MediaKind, SignalingTransport,
};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

/// A single chat entry as surfaced to the host
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    /// Unique message id
    pub id: String,

    /// User id of the author
    pub sender_id: String,

    /// Display name of the author
    pub sender_name: String,

    /// Message body
    pub content: String,

    /// Unix timestamp in milliseconds
    pub timestamp: u64,

    /// Text or system notice
    pub kind: ChatKind,
}

/// Chat entry category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    /// User-authored text
    Text,
    /// Generated notice (join/leave and similar)
    System,
}

/// Sends and receives application messages over the data channel with a
/// signaling broadcast fallback.
pub struct DataChannelMessenger {
    identity: SessionIdentity,
    signaling: Arc<dyn SignalingTransport>,
    channel: RwLock<Option<Arc<RTCDataChannel>>>,
    events: mpsc::UnboundedSender<CallEvent>,
}

impl DataChannelMessenger {
    pub fn new(
        identity: SessionIdentity,
        signaling: Arc<dyn SignalingTransport>,
        events: mpsc::UnboundedSender<CallEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            identity,
            signaling,
            channel: RwLock::new(None),
            events,
        })
    }

    /// Adopt a data channel and wire its callbacks. Called with the locally
    /// created channel on the initiator and the announced one on the responder.
    pub async fn attach(self: &Arc<Self>, dc: Arc<RTCDataChannel>) {
        let label = dc.label().to_string();

        dc.on_open(Box::new(move || {
            debug!(label = %label, "data channel open");
            Box::pin(async {})
        }));

        let inbound = Arc::clone(self);
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let inbound = Arc::clone(&inbound);
            Box::pin(async move {
                match serde_json::from_slice::<FallbackMessage>(&msg.data) {
                    Ok(payload) => inbound.handle_inbound(payload),
                    Err(e) => warn!(error = %e, "discarding malformed data channel payload"),
                }
            })
        }));

        let detach = Arc::clone(self);
        dc.on_close(Box::new(move || {
            let detach = Arc::clone(&detach);
            Box::pin(async move {
                debug!("data channel closed");
                *detach.channel.write().await = None;
            })
        }));

        *self.channel.write().await = Some(dc);
    }

    /// Drop the current channel; subsequent sends use the fallback path
    pub async fn detach(&self) {
        *self.channel.write().await = None;
    }

    /// Whether the attached channel is currently open
    pub async fn is_open(&self) -> bool {
        match self.channel.read().await.as_ref() {
            Some(dc) => dc.ready_state() == RTCDataChannelState::Open,
            None => false,
        }
    }

    /// Send a chat message, echoing it locally so the sender's own UI shows
    /// it exactly once regardless of path.
    pub async fn send_chat(&self, sender_name: &str, content: &str) -> Result<ChatMessage> {
        let chat = ChatMessage {
            id: uuid::Uuid::new_v4().to_string(),
            sender_id: self.identity.local_user_id.clone(),
            sender_name: sender_name.to_string(),
            content: content.to_string(),
            timestamp: now_millis(),
            kind: ChatKind::Text,
        };

        let _ = self.events.send(CallEvent::Message(chat.clone()));

        self.deliver(FallbackMessage::ChatMessage {
            user_id: self.identity.local_user_id.clone(),
            timestamp: chat.timestamp,
            message: chat.clone(),
        })
        .await?;

        Ok(chat)
    }

    /// Announce local capture devices to the remote peer
    pub async fn send_device_info(&self, info: DeviceInfo) -> Result<()> {
        self.deliver(FallbackMessage::DeviceInfo {
            user_id: self.identity.local_user_id.clone(),
            timestamp: now_millis(),
            info,
        })
        .await
    }

    /// Announce a local mute/camera toggle to the remote peer
    pub async fn send_media_toggle(&self, media: MediaKind, enabled: bool) -> Result<()> {
        self.deliver(FallbackMessage::MediaToggle {
            user_id: self.identity.local_user_id.clone(),
            timestamp: now_millis(),
            media,
            enabled,
        })
        .await
    }

    /// Route an inbound broadcast to host events, dropping self-echoes.
    ///
    /// Shared by both arrival paths: data channel payloads and signaling
    /// broadcasts.
    pub fn handle_inbound(&self, payload: FallbackMessage) {
        if self.identity.is_self(payload.user_id()) {
            return;
        }

        let event = match payload {
            FallbackMessage::ChatMessage { message, .. } => CallEvent::Message(message),
            FallbackMessage::DeviceInfo { info, .. } => CallEvent::RemoteDeviceInfo(info),
            FallbackMessage::MediaToggle { media, enabled, .. } => match media {
                MediaKind::Audio => CallEvent::RemoteAudioToggle(enabled),
                MediaKind::Video => CallEvent::RemoteVideoToggle(enabled),
            },
        };
        let _ = self.events.send(event);
    }

    /// Pick exactly one path for an outbound payload: the data channel when
    /// open, otherwise a single signaling broadcast. A data channel send
    /// error also falls back, still publishing only once.
    async fn deliver(&self, payload: FallbackMessage) -> Result<()> {
        let dc = self.channel.read().await.clone();
        if let Some(dc) = dc {
            if dc.ready_state() == RTCDataChannelState::Open {
                let json = serde_json::to_string(&payload).map_err(|e| {
                    Error::Serialization(format!("Failed to encode message: {}", e))
                })?;
                match dc.send_text(json).await {
                    Ok(_) => return Ok(()),
                    Err(e) => {
                        warn!(error = %e, "data channel send failed, using signaling fallback");
                    }
                }
            }
        }

        debug!(payload = ?payload, "broadcasting over signaling fallback");
        self.signaling
            .publish(
                &self.identity.channel_id(),
                ChannelEvent::Broadcast(payload),
            )
            .await
    }
}
