//! Buffering for negotiation candidates that arrive early
//!
//! Trickled candidates routinely outrun the offer/answer they belong to. The
//! queue holds them until the remote description is applied, then releases
//! them once, in arrival order. Apply failures on individual candidates are
//! the caller's business (stale/duplicate candidates are common and only
//! logged); the queue just guarantees ordering and exactly-once drainage.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

/// FIFO buffer for candidates received before the remote description
#[derive(Default)]
pub struct CandidateQueue {
    queued: Mutex<Vec<RTCIceCandidateInit>>,
    remote_known: AtomicBool,
}

impl CandidateQueue {
    /// Create an empty queue for a fresh negotiation round
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the remote description has been applied for this round
    pub fn remote_known(&self) -> bool {
        self.remote_known.load(Ordering::SeqCst)
    }

    /// Offer a candidate to the queue.
    ///
    /// Returns `true` if it was buffered (remote description still unknown);
    /// `false` means the caller should apply it live.
    pub fn offer(&self, candidate: RTCIceCandidateInit) -> bool {
        if self.remote_known() {
            return false;
        }
        let mut queued = self.queued.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        // Re-check under the lock so a concurrent drain can't strand us
        if self.remote_known() {
            return false;
        }
        queued.push(candidate);
        true
    }

    /// Mark the remote description applied and take every buffered candidate,
    /// in original arrival order. The queue stays empty for the rest of the
    /// round; later candidates are applied live.
    pub fn drain(&self) -> Vec<RTCIceCandidateInit> {
        let mut queued = self.queued.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        self.remote_known.store(true, Ordering::SeqCst);
        std::mem::take(&mut *queued)
    }

    /// Forget everything for a new negotiation round (reconnection)
    pub fn reset(&self) {
        let mut queued = self.queued.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        queued.clear();
        self.remote_known.store(false, Ordering::SeqCst);
    }

    /// Number of buffered candidates
    pub fn len(&self) -> usize {
        self.queued.lock().unwrap_or_else(std::sync::PoisonError::into_inner).len()
    }

    /// Whether the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
