//! Media provider boundary
//!
//! The orchestrator never owns device state; it receives a [`MediaHandle`]
//! from an injected [`MediaProvider`] at initialization. The handle carries
//! the local audio/video tracks, their mute flags and the capture settings the
//! quality monitor reports against.

use crate::config::MediaConstraints;
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Supplier of local capture media (consumed collaborator).
///
/// Ownership of the underlying devices stays with the caller; the orchestrator
/// only holds the handle it is given and releases it on teardown.
#[async_trait]
pub trait MediaProvider: Send + Sync {
    /// Acquire a fresh capture handle for the given constraints
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<MediaHandle>;

    /// Adopt an already-acquired handle (e.g. from a shared device preview).
    /// The default implementation hands the handle back unchanged.
    async fn reuse(&self, handle: MediaHandle) -> Result<MediaHandle> {
        Ok(handle)
    }
}

/// Local capture tracks plus their enabled state
#[derive(Clone)]
pub struct MediaHandle {
    /// Opus audio track
    pub audio: Arc<TrackLocalStaticSample>,

    /// VP8 video track
    pub video: Arc<TrackLocalStaticSample>,

    /// Capture settings the tracks were opened with
    pub settings: MediaConstraints,

    audio_enabled: Arc<AtomicBool>,
    video_enabled: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl MediaHandle {
    /// Wrap a pair of local tracks
    pub fn new(
        audio: Arc<TrackLocalStaticSample>,
        video: Arc<TrackLocalStaticSample>,
        settings: MediaConstraints,
    ) -> Self {
        Self {
            audio,
            video,
            settings,
            audio_enabled: Arc::new(AtomicBool::new(true)),
            video_enabled: Arc::new(AtomicBool::new(true)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flip the audio mute flag, returning the new enabled state
    pub fn toggle_audio(&self) -> bool {
        let enabled = !self.audio_enabled.load(Ordering::SeqCst);
        self.audio_enabled.store(enabled, Ordering::SeqCst);
        debug!(enabled, "local audio toggled");
        enabled
    }

    /// Flip the video flag, returning the new enabled state
    pub fn toggle_video(&self) -> bool {
        let enabled = !self.video_enabled.load(Ordering::SeqCst);
        self.video_enabled.store(enabled, Ordering::SeqCst);
        debug!(enabled, "local video toggled");
        enabled
    }

    /// Current audio enabled state
    pub fn audio_enabled(&self) -> bool {
        self.audio_enabled.load(Ordering::SeqCst)
    }

    /// Current video enabled state
    pub fn video_enabled(&self) -> bool {
        self.video_enabled.load(Ordering::SeqCst)
    }

    /// Release the capture tracks. Idempotent.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            debug!("local media stopped");
        }
    }

    /// Whether `stop()` has been called
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for MediaHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaHandle")
            .field("settings", &self.settings)
            .field("audio_enabled", &self.audio_enabled())
            .field("video_enabled", &self.video_enabled())
            .finish()
    }
}

/// Default provider fabricating sample-fed local tracks.
///
/// Real capture backends implement [`MediaProvider`] themselves and push
/// samples into the returned tracks; this provider only creates the track
/// objects with the standard Opus/VP8 capabilities.
#[derive(Debug, Default)]
pub struct SyntheticMediaProvider {
    /// When set, `acquire` fails as if the user denied device access.
    /// Lets tests exercise the fatal startup path.
    pub deny_access: bool,
}

#[async_trait]
impl MediaProvider for SyntheticMediaProvider {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<MediaHandle> {
        if self.deny_access {
            return Err(Error::MediaAccess("capture permission denied".to_string()));
        }

        let stream_id = format!("stream-{}", uuid::Uuid::new_v4());

        let audio = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: constraints.sample_rate,
                channels: constraints.channels,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            "audio".to_string(),
            stream_id.clone(),
        ));

        let video = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: "video/VP8".to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            "video".to_string(),
            stream_id,
        ));

        debug!(
            width = constraints.width,
            height = constraints.height,
            "synthetic media acquired"
        );

        Ok(MediaHandle::new(audio, video, *constraints))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_default_constraints() {
        let provider = SyntheticMediaProvider::default();
        let handle = provider.acquire(&MediaConstraints::default()).await.unwrap();

        assert!(handle.audio_enabled());
        assert!(handle.video_enabled());
        assert!(!handle.is_stopped());
        assert_eq!(handle.settings.width, 1280);
    }

    #[tokio::test]
    async fn test_acquire_denied() {
        let provider = SyntheticMediaProvider { deny_access: true };
        let err = provider
            .acquire(&MediaConstraints::default())
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_toggles_flip_state() {
        let provider = SyntheticMediaProvider::default();
        let handle = provider.acquire(&MediaConstraints::default()).await.unwrap();

        assert!(!handle.toggle_audio());
        assert!(!handle.audio_enabled());
        assert!(handle.toggle_audio());

        assert!(!handle.toggle_video());
        assert!(handle.toggle_video());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let provider = SyntheticMediaProvider::default();
        let handle = provider.acquire(&MediaConstraints::default()).await.unwrap();

        handle.stop();
        handle.stop();
        assert!(handle.is_stopped());
    }

    #[tokio::test]
    async fn test_reuse_returns_same_handle() {
        let provider = SyntheticMediaProvider::default();
        let handle = provider.acquire(&MediaConstraints::default()).await.unwrap();
        handle.toggle_audio();

        let reused = provider.reuse(handle.clone()).await.unwrap();
        assert!(!reused.audio_enabled());
    }
}
