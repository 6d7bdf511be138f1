//! Cooperative cancellation.
//!
//! An [`AbortSignal`] is shared by the controller that may cancel a long-running loop
//! and the worker running it. Setting it is safe from any task or thread. It is cleared
//! by the loop that observed it, and by its owner before a new loop starts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Shared abort flag with the reason of the first request.
#[derive(Clone, Debug)]
pub struct AbortSignal {
    flag: Arc<AtomicBool>,
    reason: Arc<std::sync::RwLock<Option<String>>>,
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortSignal {
    /// A signal that is not requested.
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            reason: Arc::new(std::sync::RwLock::new(None)),
        }
    }

    /// Request cancellation. Only the first reason is kept.
    pub fn request(&self, reason: impl Into<String>) {
        if let Ok(mut r) = self.reason.write() {
            if r.is_none() {
                *r = Some(reason.into());
            }
        }
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested since the last reset
    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Reason of the first request
    pub fn reason(&self) -> Option<String> {
        self.reason.read().ok().and_then(|r| r.clone())
    }

    /// Clear the signal. Call from the loop that consumed it, or before starting one.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
        if let Ok(mut r) = self.reason.write() {
            *r = None;
        }
    }

    /// Resolve once cancellation is requested, re-checking every `granularity`.
    pub async fn cancelled(&self, granularity: Duration) {
        let step = granularity.max(Duration::from_millis(1));
        while !self.is_requested() {
            tokio::time::sleep(step).await;
        }
    }

    /// Sleep for `duration`, re-checking the signal every `granularity`.
    ///
    /// Returns `true` if the full duration elapsed, `false` if it was cut short.
    pub async fn sleep_interruptible(&self, duration: Duration, granularity: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let step = granularity.max(Duration::from_millis(1));
        loop {
            if self.is_requested() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            tokio::time::sleep(step.min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_and_reset() {
        let signal = AbortSignal::new();
        assert!(!signal.is_requested());

        signal.request("user abort");
        signal.request("second reason");
        assert!(signal.is_requested());
        assert_eq!(signal.reason(), Some("user abort".to_string()));

        signal.reset();
        assert!(!signal.is_requested());
        assert_eq!(signal.reason(), None);
    }

    #[test]
    fn clones_share_state() {
        let signal = AbortSignal::new();
        let worker = signal.clone();
        signal.request("stop");
        assert!(worker.is_requested());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_resolves_after_request() {
        let signal = AbortSignal::new();
        let remote = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            remote.request("abort");
        });

        let start = Instant::now();
        signal.cancelled(Duration::from_millis(10)).await;
        assert!(signal.is_requested());
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert!(start.elapsed() < Duration::from_millis(230));
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_completes_without_request() {
        let signal = AbortSignal::new();
        let start = Instant::now();
        let completed = signal
            .sleep_interruptible(Duration::from_millis(600), Duration::from_millis(10))
            .await;
        assert!(completed);
        assert!(start.elapsed() >= Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_is_cut_short_within_granularity() {
        let signal = AbortSignal::new();
        let remote = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(105)).await;
            remote.request("abort");
        });

        let start = Instant::now();
        let completed = signal
            .sleep_interruptible(Duration::from_secs(10), Duration::from_millis(10))
            .await;
        assert!(!completed);
        assert!(start.elapsed() < Duration::from_millis(130));
    }
}
