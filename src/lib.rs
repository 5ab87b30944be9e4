//! Peer-to-peer call orchestration for exactly two participants
//!
//! This crate establishes, monitors and recovers a direct audio/video/data
//! link between two peers, coordinating offer/answer negotiation and
//! candidate exchange over an external publish/subscribe signaling channel.
//!
//! # Features
//!
//! - **Deterministic roles**: initiator vs. responder follows from a pure
//!   comparison of the two user ids, eliminating negotiation glare
//! - **Candidate buffering**: candidates that outrun the remote description
//!   are queued and drained exactly once, in arrival order
//! - **Dual-path messaging**: chat and control messages use the data channel
//!   when open, with an exactly-once signaling broadcast fallback
//! - **Quality monitoring**: periodic transport sampling classified as
//!   poor/fair/good/excellent
//! - **Supervised recovery**: bounded, backoff-paced full renegotiation
//!   after transport drops
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  Host application                                    │
//! │  ↓ operations            ↑ CallEvent stream          │
//! │  CallOrchestrator (one engine loop per session)      │
//! │  ├─ SignalingTransport (pub/sub, injected)           │
//! │  ├─ MediaProvider (capture handles, injected)        │
//! │  ├─ CandidateQueue (early-candidate buffering)       │
//! │  ├─ DataChannelMessenger (dual-path delivery)        │
//! │  ├─ QualityMonitor (periodic stats sampling)         │
//! │  └─ ReconnectionSupervisor (bounded backoff retries) │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use peerlink::{CallConfig, CallOrchestrator, SessionIdentity};
//! use peerlink::media::SyntheticMediaProvider;
//! use peerlink::signaling::memory::MemorySignaling;
//! use std::sync::Arc;
//!
//! # async fn example() -> peerlink::Result<()> {
//! let identity = SessionIdentity::new("session-1", "alice", "bob");
//! let (call, mut events) = CallOrchestrator::new(
//!     identity,
//!     CallConfig::default(),
//!     MemorySignaling::new(),
//!     Arc::new(SyntheticMediaProvider::default()),
//! )
//! .await?;
//!
//! call.initialize().await?;
//! while let Some(event) = events.recv().await {
//!     println!("call event: {:?}", event);
//! }
//! call.end_call().await?;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod candidates;
pub mod config;
pub mod error;
pub mod events;
pub mod media;
pub mod messenger;
pub mod orchestrator;
pub mod quality;
pub mod reconnect;
pub mod session;
pub mod signaling;

// Re-exports for public API
pub use config::{CallConfig, MediaConstraints, TurnServerConfig};
pub use error::{Error, Result};
pub use events::{CallEvent, ConnectionState};
pub use media::{MediaHandle, MediaProvider};
pub use messenger::{ChatKind, ChatMessage};
pub use orchestrator::CallOrchestrator;
pub use quality::{ConnectionQuality, ConnectionStats};
pub use session::{Role, SessionIdentity};
pub use signaling::{ChannelEvent, DeviceInfo, SignalMessage, SignalingTransport};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_version() {
        assert!(!super::version().is_empty());
    }
}
