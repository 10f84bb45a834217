//! Exponential back-off for the reconnection supervisor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

/// Retry timing parameters.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Base wait before the first retry.
    pub retry_interval: Duration,
    /// Ceiling for the doubled wait.
    pub max_retry_interval: Duration,
    /// Retry budget; `-1` retries forever.
    pub max_retries: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(1),
            max_retry_interval: Duration::from_secs(30),
            max_retries: -1,
        }
    }
}

impl RetryPolicy {
    /// Wait before the `retry`-th retry (1-indexed):
    /// `min(retry_interval * 2^min(retry - 1, 12), max_retry_interval)`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(12);
        let delay = self.retry_interval * (1u32 << exponent);
        delay.min(self.max_retry_interval)
    }

    /// Check if the retry budget is spent.
    pub fn exhausted(&self, retry: u32) -> bool {
        self.max_retries >= 0 && i64::from(retry) > self.max_retries
    }
}

/// Cancellation flag for the reconnection supervisor.
///
/// Cancelling short-circuits an in-flight back-off sleep and keeps any
/// later supervisor from re-entering until the flag is rearmed by the
/// next user-initiated connect.
#[derive(Debug, Default)]
pub(crate) struct Cancellation {
    cancelled: AtomicBool,
    notify: Notify,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn rearm(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    /// Sleep for `duration`; returns false when cancelled before or
    /// during the wait.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_cancelled() {
            return false;
        }
        let notified = self.notify.notified();
        tokio::select! {
            _ = tokio::time::sleep(duration) => !self.is_cancelled(),
            _ = notified => false,
        }
    }
}
