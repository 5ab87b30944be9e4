//! Configuration types for the call orchestrator

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration for a [`CallOrchestrator`](crate::CallOrchestrator)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    /// STUN server URLs (at least one required)
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional)
    pub turn_servers: Vec<TurnServerConfig>,

    /// Delay before the initiator publishes its offer, giving the remote
    /// subscription time to become active (default: 500ms)
    pub offer_settle_delay_ms: u64,

    /// Statistics sampling interval in milliseconds (default: 2000ms)
    pub stats_interval_ms: u64,

    /// Maximum automatic reconnection attempts (default: 3)
    pub max_reconnect_attempts: u32,

    /// Linear backoff step between reconnection attempts in milliseconds
    /// (attempt N waits N * step, default: 2000ms)
    pub reconnect_backoff_step_ms: u64,

    /// Local capture constraints
    pub media: MediaConstraints,
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn:// or turns://)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

/// Requested local capture settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Capture width in pixels
    pub width: u32,

    /// Capture height in pixels
    pub height: u32,

    /// Capture frame rate in fps
    pub frame_rate: f32,

    /// Audio sample rate in Hz
    pub sample_rate: u32,

    /// Audio channel count
    pub channels: u16,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            frame_rate: 30.0,
            sample_rate: 48000,
            channels: 2,
        }
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: Vec::new(),
            offer_settle_delay_ms: 500,
            stats_interval_ms: 2000,
            max_reconnect_attempts: 3,
            reconnect_backoff_step_ms: 2000,
            media: MediaConstraints::default(),
        }
    }
}

impl CallConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `stun_servers` is empty
    /// - `stats_interval_ms` is not in range 500-30000
    /// - `max_reconnect_attempts` is 0
    /// - `reconnect_backoff_step_ms` is 0
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if self.stun_servers.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one STUN server is required".to_string(),
            ));
        }

        if self.stats_interval_ms < 500 || self.stats_interval_ms > 30_000 {
            return Err(Error::InvalidConfig(format!(
                "stats_interval_ms must be in range 500-30000, got {}",
                self.stats_interval_ms
            )));
        }

        if self.max_reconnect_attempts == 0 {
            return Err(Error::InvalidConfig(
                "max_reconnect_attempts must be at least 1".to_string(),
            ));
        }

        if self.reconnect_backoff_step_ms == 0 {
            return Err(Error::InvalidConfig(
                "reconnect_backoff_step_ms must be non-zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Statistics sampling interval as a Duration
    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    /// Offer settle delay as a Duration
    pub fn offer_settle_delay(&self) -> Duration {
        Duration::from_millis(self.offer_settle_delay_ms)
    }

    /// Add TURN servers to this configuration
    pub fn with_turn_servers(mut self, turn_servers: Vec<TurnServerConfig>) -> Self {
        self.turn_servers = turn_servers;
        self
    }
}
