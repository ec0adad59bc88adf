//! Exponential backoff applied between a failure and the next attempt.
//!
//! The wait starts at a floor and doubles on every failure that follows the
//! previous one closely, up to a ceiling. A failure arriving more than twice
//! the current wait after the previous one is treated as a fresh incident and
//! resets the wait to the floor.

use std::time::Duration;

use tokio::time::Instant;

/// Default wait after an isolated failure.
pub const DEFAULT_FLOOR: Duration = Duration::from_secs(1);

/// Default upper bound for the wait.
pub const DEFAULT_CEILING: Duration = Duration::from_secs(300);

/// Backoff state for consecutive failures.
#[derive(Debug, Clone)]
pub struct Backoff {
    floor: Duration,
    ceiling: Duration,
    wait: Duration,
    last_failure: Option<Instant>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_FLOOR, DEFAULT_CEILING)
    }
}

impl Backoff {
    /// Create backoff state with the given bounds.
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        Self {
            floor,
            ceiling,
            wait: floor,
            last_failure: None,
        }
    }

    /// Record a failure at `now`.
    ///
    /// Returns how long to wait before retrying, which is the wait in effect
    /// before this failure was applied.
    pub fn record_failure(&mut self, now: Instant) -> Duration {
        let sleep = self.wait;

        self.wait = match self.last_failure {
            Some(last) if now.saturating_duration_since(last) <= self.wait * 2 => {
                (self.wait * 2).min(self.ceiling)
            }
            _ => self.floor,
        };
        self.last_failure = Some(now);

        sleep
    }

    /// Current wait.
    pub fn current(&self) -> Duration {
        self.wait
    }

    /// Time of the most recent failure.
    pub fn last_failure(&self) -> Option<Instant> {
        self.last_failure
    }
}
