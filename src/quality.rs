//! Connection quality sampling and classification
//!
//! While the call is connected, a periodic task samples transport statistics,
//! derives bandwidth/latency/loss figures and classifies them. The monitor is
//! stopped on any transition out of `connected` and always on teardown.

use crate::config::MediaConstraints;
use crate::events::CallEvent;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::stats::StatsReportType;

/// Derived connection quality classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    /// Latency > 300ms or loss > 5%
    Poor,
    /// Latency > 200ms or loss > 2%
    Fair,
    /// Latency > 100ms or loss > 1%
    Good,
    /// Everything below the `good` thresholds
    Excellent,
}

impl ConnectionQuality {
    /// Classify a (latency, loss) pair.
    ///
    /// Pure function, evaluated in strict priority order; the first matching
    /// threshold wins. Latency and loss both exceeding the `fair` thresholds
    /// at once also classifies as poor.
    pub fn classify(latency_ms: f64, packet_loss_pct: f64) -> Self {
        if latency_ms > 300.0
            || packet_loss_pct > 5.0
            || (latency_ms > 200.0 && packet_loss_pct > 2.0)
        {
            ConnectionQuality::Poor
        } else if latency_ms > 200.0 || packet_loss_pct > 2.0 {
            ConnectionQuality::Fair
        } else if latency_ms > 100.0 || packet_loss_pct > 1.0 {
            ConnectionQuality::Good
        } else {
            ConnectionQuality::Excellent
        }
    }
}

/// Snapshot of transport health as reported to the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStats {
    /// Inbound video bandwidth in kbps
    pub bandwidth_kbps: u32,

    /// Round-trip time of the succeeded candidate pair in milliseconds
    pub latency_ms: f64,

    /// Inbound packet loss, percent
    pub packet_loss_pct: f64,

    /// Video resolution as `WIDTHxHEIGHT`
    pub resolution: String,

    /// Video frame rate in fps
    pub frame_rate: f32,

    /// Classification derived from latency and loss
    pub quality: ConnectionQuality,
}

impl Default for ConnectionStats {
    fn default() -> Self {
        Self {
            bandwidth_kbps: 0,
            latency_ms: 0.0,
            packet_loss_pct: 0.0,
            resolution: "0x0".to_string(),
            frame_rate: 0.0,
            quality: ConnectionQuality::Excellent,
        }
    }
}

/// One raw reading from the transport
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TransportSample {
    /// Cumulative inbound video bytes
    pub video_bytes_received: u64,

    /// Cumulative inbound packets received
    pub packets_received: u64,

    /// Cumulative inbound packets lost
    pub packets_lost: u64,

    /// Round-trip time of the nominated candidate pair, milliseconds
    pub rtt_ms: Option<f64>,

    /// Video width in pixels
    pub width: u32,

    /// Video height in pixels
    pub height: u32,

    /// Video frame rate in fps
    pub frame_rate: f32,
}

/// Source of raw transport samples.
///
/// Abstracted so the classification pipeline can be driven deterministically
/// in tests; production uses [`PeerStatsSource`].
#[async_trait]
pub trait StatsSource: Send + Sync {
    /// Take one reading; `None` when the transport is gone
    async fn sample(&self) -> Option<TransportSample>;
}

/// Reads samples from a live `RTCPeerConnection`
pub struct PeerStatsSource {
    pc: Arc<RTCPeerConnection>,
    settings: MediaConstraints,
}

impl PeerStatsSource {
    /// Wrap a peer connection and the capture settings it negotiates
    pub fn new(pc: Arc<RTCPeerConnection>, settings: MediaConstraints) -> Self {
        Self { pc, settings }
    }
}

#[async_trait]
impl StatsSource for PeerStatsSource {
    async fn sample(&self) -> Option<TransportSample> {
        let report = self.pc.get_stats().await;

        let mut sample = TransportSample {
            width: self.settings.width,
            height: self.settings.height,
            frame_rate: self.settings.frame_rate,
            ..Default::default()
        };

        for (_, stat) in report.reports {
            match stat {
                StatsReportType::InboundRTP(s) => {
                    if s.kind == "video" {
                        sample.video_bytes_received += s.bytes_received;
                    }
                    sample.packets_received += s.packets_received;
                }
                // Loss is only reported on the remote-inbound-rtp entries
                StatsReportType::RemoteInboundRTP(s) => {
                    sample.packets_lost += s.packets_lost.max(0) as u64;
                }
                StatsReportType::CandidatePair(pair) if pair.nominated => {
                    sample.rtt_ms = Some(pair.current_round_trip_time * 1000.0);
                }
                _ => {}
            }
        }

        Some(sample)
    }
}

/// Derive host-facing stats from two consecutive raw samples
pub fn derive_stats(
    prev: &TransportSample,
    current: &TransportSample,
    interval: Duration,
) -> ConnectionStats {
    let secs = interval.as_secs_f64().max(0.001);
    let byte_delta = current
        .video_bytes_received
        .saturating_sub(prev.video_bytes_received);
    let bandwidth_kbps = ((byte_delta as f64 * 8.0) / secs / 1000.0) as u32;

    let latency_ms = current.rtt_ms.unwrap_or(0.0);

    let total = current.packets_lost + current.packets_received;
    let packet_loss_pct = if total > 0 {
        (current.packets_lost as f64 / total as f64) * 100.0
    } else {
        0.0
    };

    ConnectionStats {
        bandwidth_kbps,
        latency_ms,
        packet_loss_pct,
        resolution: format!("{}x{}", current.width, current.height),
        frame_rate: current.frame_rate,
        quality: ConnectionQuality::classify(latency_ms, packet_loss_pct),
    }
}

/// Periodic sampler, started on `connected` and cancelled on the way out
pub struct QualityMonitor {
    interval: Duration,
    events: mpsc::UnboundedSender<CallEvent>,
    task: Mutex<Option<JoinHandle<()>>>,
    latest: Arc<RwLock<ConnectionStats>>,
}

impl QualityMonitor {
    /// Create a stopped monitor
    pub fn new(interval: Duration, events: mpsc::UnboundedSender<CallEvent>) -> Self {
        Self {
            interval,
            events,
            task: Mutex::new(None),
            latest: Arc::new(RwLock::new(ConnectionStats::default())),
        }
    }

    /// Start sampling from the given source, replacing any earlier run
    pub async fn start(&self, source: Arc<dyn StatsSource>) {
        self.stop().await;

        let interval = self.interval;
        let events = self.events.clone();
        let latest = Arc::clone(&self.latest);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; use it to seed the baseline
            ticker.tick().await;
            let mut prev = match source.sample().await {
                Some(s) => s,
                None => return,
            };

            loop {
                ticker.tick().await;
                let Some(current) = source.sample().await else {
                    warn!("stats source gone, stopping quality sampling");
                    return;
                };

                let stats = derive_stats(&prev, &current, interval);
                prev = current;

                debug!(
                    bandwidth_kbps = stats.bandwidth_kbps,
                    latency_ms = stats.latency_ms,
                    loss_pct = stats.packet_loss_pct,
                    quality = ?stats.quality,
                    "quality sample"
                );

                *latest.write().await = stats.clone();
                if events
                    .send(CallEvent::QualityChanged(stats.quality, stats))
                    .is_err()
                {
                    return;
                }
            }
        });

        *self.task.lock().await = Some(handle);
    }

    /// Cancel the sampling task. Safe to call repeatedly.
    pub async fn stop(&self) {
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
            debug!("quality monitor stopped");
        }
    }

    /// Whether a sampling task is currently running
    pub async fn is_running(&self) -> bool {
        self.task.lock().await.is_some()
    }

    /// Most recent derived stats (default until the first sample lands)
    pub async fn latest(&self) -> ConnectionStats {
        self.latest.read().await.clone()
    }
}
