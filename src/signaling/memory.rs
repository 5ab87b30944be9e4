//! In-process signaling hub
//!
//! A loopback [`SignalingTransport`] that fans every published event out to all
//! channel subscribers in publish order. Used by the integration tests and by
//! demos that run both peers inside one process.

use super::{ChannelEvent, SignalingTransport};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// In-process publish/subscribe hub
#[derive(Default)]
pub struct MemorySignaling {
    channels: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<ChannelEvent>>>>,
}

impl MemorySignaling {
    /// Create a new hub, shareable between peers
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of live subscribers on a channel
    pub async fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .await
            .get(channel)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl SignalingTransport for MemorySignaling {
    async fn subscribe(&self, channel: &str) -> Result<mpsc::UnboundedReceiver<ChannelEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut channels = self.channels.lock().await;
        channels.entry(channel.to_string()).or_default().push(tx);
        debug!(channel, "memory signaling subscription added");
        Ok(rx)
    }

    async fn publish(&self, channel: &str, event: ChannelEvent) -> Result<()> {
        let mut channels = self.channels.lock().await;
        let subs = channels
            .get_mut(channel)
            .ok_or_else(|| Error::Signaling(format!("No subscribers on channel {}", channel)))?;

        // Fan out, dropping senders whose receiver side is gone
        subs.retain(|tx| tx.send(event.clone()).is_ok());
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        self.channels.lock().await.remove(channel);
        debug!(channel, "memory signaling channel removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::SignalMessage;

    fn offer(from: &str, n: u64) -> ChannelEvent {
        ChannelEvent::Signal(SignalMessage::Offer {
            from: from.to_string(),
            to: "peer".to_string(),
            timestamp: n,
            sdp: String::new(),
        })
    }

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let hub = MemorySignaling::new();
        let mut rx_a = hub.subscribe("call:1").await.unwrap();
        let mut rx_b = hub.subscribe("call:1").await.unwrap();

        hub.publish("call:1", offer("alice", 1)).await.unwrap();

        assert_eq!(rx_a.recv().await.unwrap(), offer("alice", 1));
        assert_eq!(rx_b.recv().await.unwrap(), offer("alice", 1));
    }

    #[tokio::test]
    async fn test_publish_preserves_order() {
        let hub = MemorySignaling::new();
        let mut rx = hub.subscribe("call:1").await.unwrap();

        for n in 0..10 {
            hub.publish("call:1", offer("alice", n)).await.unwrap();
        }
        for n in 0..10 {
            assert_eq!(rx.recv().await.unwrap(), offer("alice", n));
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_errors() {
        let hub = MemorySignaling::new();
        assert!(hub.publish("call:none", offer("alice", 1)).await.is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_closes_channel() {
        let hub = MemorySignaling::new();
        let mut rx = hub.subscribe("call:1").await.unwrap();
        assert_eq!(hub.subscriber_count("call:1").await, 1);

        hub.unsubscribe("call:1").await.unwrap();
        assert_eq!(hub.subscriber_count("call:1").await, 0);
        assert!(rx.recv().await.is_none());
    }
}
