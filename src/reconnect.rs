//! Reconnection scheduling
//!
//! When the transport drops unexpectedly, the supervisor arms a one-shot
//! timer with linearly growing backoff and hands the attempt back to the
//! engine loop, which performs a full renegotiation. After the configured
//! number of attempts the call is declared failed.

use crate::config::CallConfig;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// How many times and how fast to retry a dropped connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of reconnection attempts before giving up
    pub max_attempts: u32,

    /// Backoff grows by this step per attempt
    pub backoff_step: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &CallConfig) -> Self {
        Self {
            max_attempts: config.max_reconnect_attempts,
            backoff_step: Duration::from_millis(config.reconnect_backoff_step_ms),
        }
    }

    /// Delay before the given 1-based attempt: `attempt * step`
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.backoff_step.saturating_mul(attempt)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }
}

/// Owns the retry counter and the pending backoff timer.
///
/// Armed attempts are delivered on the channel passed to [`new`](Self::new);
/// the receiver is drained by the engine loop so retries interleave with
/// signaling in a single place.
pub struct ReconnectionSupervisor {
    policy: RetryPolicy,
    attempts: AtomicU32,
    timer: Mutex<Option<JoinHandle<()>>>,
    retries: mpsc::UnboundedSender<u32>,
}

impl ReconnectionSupervisor {
    pub fn new(policy: RetryPolicy, retries: mpsc::UnboundedSender<u32>) -> Self {
        Self {
            policy,
            attempts: AtomicU32::new(0),
            timer: Mutex::new(None),
            retries,
        }
    }

    /// Attempts made since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Arm the backoff timer for the next attempt.
    ///
    /// Returns the attempt number, or `None` when the policy is exhausted
    /// and the caller must fail the call.
    pub async fn schedule(&self) -> Option<u32> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.policy.should_retry(attempt) {
            info!(attempt, max = self.policy.max_attempts, "retries exhausted");
            return None;
        }

        let delay = self.policy.backoff_for(attempt);
        info!(attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");

        let retries = self.retries.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = retries.send(attempt);
        });

        let mut timer = self.timer.lock().await;
        if let Some(old) = timer.replace(handle) {
            old.abort();
        }
        Some(attempt)
    }

    /// Whether a backoff timer is currently armed
    pub async fn pending(&self) -> bool {
        self.timer
            .lock()
            .await
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Disarm any pending timer. Safe to call repeatedly.
    pub async fn cancel(&self) {
        if let Some(handle) = self.timer.lock().await.take() {
            handle.abort();
            debug!("pending reconnect timer cancelled");
        }
    }

    /// Clear the attempt counter once the connection is back up
    pub fn reset(&self) {
        self.attempts.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff_step: Duration::from_millis(2000),
        }
    }

    #[test]
    fn test_linear_backoff() {
        let policy = policy();
        assert_eq!(policy.backoff_for(1), Duration::from_millis(2000));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(4000));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(6000));
    }

    #[test]
    fn test_should_retry_bounds() {
        let policy = policy();
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_delivers_after_backoff() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let supervisor = ReconnectionSupervisor::new(policy(), tx);

        assert_eq!(supervisor.schedule().await, Some(1));
        assert!(rx.try_recv().is_err());

        tokio::time::advance(Duration::from_millis(2000)).await;
        assert_eq!(rx.recv().await, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_after_max_attempts() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let supervisor = ReconnectionSupervisor::new(policy(), tx);

        assert_eq!(supervisor.schedule().await, Some(1));
        assert_eq!(supervisor.schedule().await, Some(2));
        assert_eq!(supervisor.schedule().await, Some(3));
        assert_eq!(supervisor.schedule().await, None);
        assert_eq!(supervisor.attempts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_suppresses_delivery() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let supervisor = ReconnectionSupervisor::new(policy(), tx);

        supervisor.schedule().await;
        supervisor.cancel().await;

        tokio::time::advance(Duration::from_millis(5000)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_restores_budget() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let supervisor = ReconnectionSupervisor::new(policy(), tx);

        supervisor.schedule().await;
        supervisor.schedule().await;
        supervisor.reset();
        assert_eq!(supervisor.attempts(), 0);
        assert_eq!(supervisor.schedule().await, Some(1));
        supervisor.cancel().await;
    }
}
