//! Throttled warnings for background loops that keep failing.
//!
//! A loop calls [`FailureLog::failure`] on every failed attempt and emits a
//! WARN only when it returns `Some`; [`FailureLog::success`] reports how many
//! failures preceded a recovery so the loop can log it once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Default window between two warnings for the same failing loop.
pub const DEFAULT_WARN_INTERVAL: Duration = Duration::from_secs(60);

/// Consecutive-failure counter that grants at most one warning per window.
#[derive(Debug)]
pub struct FailureLog {
    origin: Instant,
    window_ms: u64,
    /// Offset from `origin` before which no warning is granted.
    quiet_until_ms: AtomicU64,
    consecutive: AtomicU64,
}

impl Default for FailureLog {
    fn default() -> Self {
        Self::new(DEFAULT_WARN_INTERVAL)
    }
}

impl FailureLog {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            origin: Instant::now(),
            window_ms: u64::try_from(window.as_millis()).unwrap_or(u64::MAX),
            quiet_until_ms: AtomicU64::new(0),
            consecutive: AtomicU64::new(0),
        }
    }

    /// Count a failure. Returns the streak length when a warning is due.
    pub fn failure(&self) -> Option<u64> {
        let streak = self.consecutive.fetch_add(1, Ordering::Relaxed).saturating_add(1);
        self.claim_warning().then_some(streak)
    }

    /// Reset the streak and reopen the warning window. Returns the streak
    /// length if it was non-zero.
    pub fn success(&self) -> Option<u64> {
        let streak = self.consecutive.swap(0, Ordering::Relaxed);
        if streak == 0 {
            return None;
        }
        self.quiet_until_ms.store(0, Ordering::Relaxed);
        Some(streak)
    }

    #[must_use]
    pub fn consecutive(&self) -> u64 {
        self.consecutive.load(Ordering::Relaxed)
    }

    /// Only one of several concurrent failures wins the window.
    fn claim_warning(&self) -> bool {
        let elapsed = u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX);
        let quiet_until = self.quiet_until_ms.load(Ordering::Relaxed);
        if elapsed < quiet_until {
            return false;
        }
        self.quiet_until_ms
            .compare_exchange(
                quiet_until,
                elapsed.saturating_add(self.window_ms),
                Ordering::Relaxed,
                Ordering::Relaxed,
            )
            .is_ok()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn failure_streak_warns_once_per_window() {
        let log = FailureLog::new(Duration::from_secs(30));
        assert_eq!(log.failure(), Some(1));
        assert_eq!(log.failure(), None);
        assert_eq!(log.failure(), None);
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(log.failure(), Some(4));
        assert_eq!(log.consecutive(), 4);
        assert_eq!(log.success(), Some(4));
        assert_eq!(log.success(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_reopens_the_window() {
        let log = FailureLog::new(Duration::from_secs(30));
        assert_eq!(log.failure(), Some(1));
        assert_eq!(log.success(), Some(1));
        // A new outage right after recovery warns straight away.
        assert_eq!(log.failure(), Some(1));
        assert_eq!(log.failure(), None);
    }
}
