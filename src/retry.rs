//! Bookkeeping for runs of consecutive connectivity faults.
//!
//! [`FailureTracker`] remembers when the current run of faults began.  Each
//! new fault either earns another attempt after a fixed pause, or, once the
//! run has lasted longer than `max_retry`, tells the caller to give up and
//! report.  Any success ends the run.
//!
//! The pause is constant; there is no exponential back-off.

use std::time::{Duration, Instant};

use crate::config::RetryConfig;

/// What to do after a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait this long, then try again.
    Retry(Duration),
    /// The retry budget is spent.
    GiveUp,
}

#[derive(Debug)]
pub struct FailureTracker {
    config: RetryConfig,
    /// Start of the current run of faults, or `None` after a success.
    failure_started: Option<Instant>,
}

impl FailureTracker {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            failure_started: None,
        }
    }

    /// Record a fault happening now.
    pub fn record_failure(&mut self) -> RetryDecision {
        self.record_failure_at(Instant::now())
    }

    fn record_failure_at(&mut self, now: Instant) -> RetryDecision {
        let started = *self.failure_started.get_or_insert(now);
        if now.saturating_duration_since(started) > self.config.max_retry {
            RetryDecision::GiveUp
        } else {
            RetryDecision::Retry(self.config.retry_wait)
        }
    }

    /// Record a success, ending any run of faults.
    pub fn record_success(&mut self) {
        self.failure_started = None;
    }

    /// How long the current run of faults has lasted, if one is in progress.
    pub fn failing_for(&self) -> Option<Duration> {
        self.failure_started.map(|t| t.elapsed())
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
