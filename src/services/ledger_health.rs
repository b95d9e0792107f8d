//! Consecutive ledger failure tracking for one running agent.

use std::sync::atomic::{AtomicU32, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Trips once `threshold` ledger calls in a row have failed after retries.
/// Any success resets the streak.
#[derive(Debug)]
pub struct LedgerHealth {
    consecutive_failures: AtomicU32,
    threshold: u32,
    tripped: CancellationToken,
}

impl LedgerHealth {
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            threshold: threshold.max(1),
            tripped: CancellationToken::new(),
        }
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    /// Returns `true` on the call that trips the monitor.
    pub fn record_failure(&self, context: &str) -> bool {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.threshold && !self.tripped.is_cancelled() {
            warn!(failures, threshold = self.threshold, context, "Ledger failure threshold reached");
            self.tripped.cancel();
            return true;
        }
        false
    }

    /// Fold a call result into the streak.
    pub fn observe<T, E>(&self, result: &Result<T, E>, context: &str) {
        match result {
            Ok(_) => self.record_success(),
            Err(_) => {
                self.record_failure(context);
            }
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.is_cancelled()
    }

    /// Resolves once the threshold has been crossed.
    pub async fn tripped(&self) {
        self.tripped.cancelled().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trips_after_consecutive_failures() {
        let health = LedgerHealth::new(3);
        assert!(!health.record_failure("a"));
        assert!(!health.record_failure("b"));
        assert!(health.record_failure("c"));
        assert!(health.is_tripped());
        assert!(!health.record_failure("d"));
    }

    #[test]
    fn test_success_resets_streak() {
        let health = LedgerHealth::new(2);
        health.record_failure("a");
        health.record_success();
        assert_eq!(health.consecutive_failures(), 0);
        assert!(!health.record_failure("b"));
        assert!(!health.is_tripped());
    }
}
