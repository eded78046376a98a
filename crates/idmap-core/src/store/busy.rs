//! Busy-retry bookkeeping for store contention.
//!
//! A [`BusyTracker`] lives for one unit of store work. Each time the store
//! reports itself busy the tracker hands back the next delay from the
//! [`BusyPolicy`] schedule, escalating a warning once the accumulated wait
//! passes a threshold that grows after every warning.

use std::time::Duration;

use tracing::warn;

use crate::config::BusyPolicy;

/// What to do after a busy report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusyDecision {
    /// Sleep for the given delay, then retry.
    Retry(Duration),
    /// The attempt bound is exhausted.
    GiveUp,
}

/// Per-operation busy state.
#[derive(Debug)]
pub struct BusyTracker<'a> {
    store: &'a str,
    policy: &'a BusyPolicy,
    attempts: u32,
    total: Duration,
    warn_threshold: Duration,
    warnings: u32,
}

impl<'a> BusyTracker<'a> {
    /// Starts tracking for `store` under `policy`.
    #[must_use]
    pub const fn new(store: &'a str, policy: &'a BusyPolicy) -> Self {
        Self {
            store,
            policy,
            attempts: 0,
            total: Duration::ZERO,
            warn_threshold: policy.warn_after,
            warnings: 0,
        }
    }

    /// Records one busy report and decides whether to retry.
    pub fn on_busy(&mut self) -> BusyDecision {
        if self
            .policy
            .max_attempts
            .is_some_and(|max| self.attempts >= max)
        {
            warn!(
                store = %self.store,
                attempts = self.attempts,
                waited_ms = self.total.as_millis(),
                "giving up on busy store"
            );
            return BusyDecision::GiveUp;
        }
        self.attempts += 1;

        if self.total > self.warn_threshold {
            warn!(
                store = %self.store,
                waited_secs = self.warn_threshold.as_secs(),
                "still waiting for busy store"
            );
            self.warnings += 1;
            self.warn_threshold += Duration::from_secs(1);
        }

        let delay = self.policy.delay_for_attempt(self.attempts);
        self.total += delay;
        BusyDecision::Retry(delay)
    }

    /// Busy reports seen so far.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Sum of all delays handed out.
    #[must_use]
    pub const fn total_wait(&self) -> Duration {
        self.total
    }

    /// Warnings logged so far.
    #[must_use]
    pub const fn warnings(&self) -> u32 {
        self.warnings
    }
}

/// Returns `true` when a store error means "locked by someone else, try
/// again".
#[must_use]
pub fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
    )
}
