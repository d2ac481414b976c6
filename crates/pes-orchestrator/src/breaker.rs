//! Consecutive-failure breaker
//!
//! Counts abandoned iterations in a row. Once the count reaches the
//! threshold the run is terminated instead of burning more iterations on a
//! broken harness. A persisted iteration resets the count.

use std::sync::atomic::{AtomicU32, Ordering};

/// Breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Iterations may keep failing individually
    Closed,
    /// Too many consecutive failures, the run must stop
    Tripped,
}

/// # Example
///
/// ```
/// use pes_orchestrator::{BreakerState, FailureBreaker};
///
/// let breaker = FailureBreaker::new(2);
/// breaker.record_failure();
/// assert_eq!(breaker.record_failure(), BreakerState::Tripped);
///
/// breaker.record_success();
/// assert_eq!(breaker.state(), BreakerState::Closed);
/// ```
#[derive(Debug)]
pub struct FailureBreaker {
    consecutive_failures: AtomicU32,
    threshold: u32,
}

impl FailureBreaker {
    /// `threshold` of 0 disables the breaker
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            threshold,
        }
    }

    pub fn state(&self) -> BreakerState {
        let failures = self.consecutive_failures.load(Ordering::Relaxed);
        if self.threshold > 0 && failures >= self.threshold {
            BreakerState::Tripped
        } else {
            BreakerState::Closed
        }
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    /// Count a failure and report the resulting state
    pub fn record_failure(&self) -> BreakerState {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        self.state()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }
}

impl Default for FailureBreaker {
    fn default() -> Self {
        Self::new(5)
    }
}
