//! Reconnection bookkeeping for one outage.

use std::time::Duration;
use tokio::time::Instant;

/// Fixed delay between reconnection attempts
pub const RECONNECTION_DELAY: Duration = Duration::from_secs(4);

/// What to do after an unexpected disconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after `delay`
    Retry {
        /// Attempt number, starting at 1
        attempt: u32,
        /// Time to wait before connecting
        delay: Duration,
    },
    /// The window has elapsed
    Exhausted {
        /// Attempts made during the outage
        attempts: u32,
    },
}

/// State of an ongoing reconnection
#[derive(Debug, Clone)]
pub struct ReconnectionContext {
    attempt_count: u32,
    first_attempt_at: Instant,
    window: Duration,
    reason: Option<String>,
}

impl ReconnectionContext {
    /// Open a context for an outage that started at `now`
    pub fn start(now: Instant, window: Duration, reason: Option<String>) -> Self {
        Self {
            attempt_count: 0,
            first_attempt_at: now,
            window,
            reason,
        }
    }

    /// Decide whether another attempt fits in the window
    pub fn next_attempt(&mut self, now: Instant) -> RetryDecision {
        if now.saturating_duration_since(self.first_attempt_at) < self.window {
            self.attempt_count += 1;
            RetryDecision::Retry {
                attempt: self.attempt_count,
                delay: RECONNECTION_DELAY,
            }
        } else {
            RetryDecision::Exhausted {
                attempts: self.attempt_count,
            }
        }
    }

    /// Attempts made so far
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Remaining part of the window
    pub fn time_left(&self, now: Instant) -> Duration {
        self.window
            .saturating_sub(now.saturating_duration_since(self.first_attempt_at))
    }

    /// Reason given by the disconnect that opened the outage
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_of_eight_allows_two_attempts() {
        let t0 = Instant::now();
        let mut ctx = ReconnectionContext::start(t0, Duration::from_secs(8), None);

        assert_eq!(
            ctx.next_attempt(t0),
            RetryDecision::Retry {
                attempt: 1,
                delay: RECONNECTION_DELAY
            }
        );
        assert_eq!(
            ctx.next_attempt(t0 + RECONNECTION_DELAY),
            RetryDecision::Retry {
                attempt: 2,
                delay: RECONNECTION_DELAY
            }
        );
        assert_eq!(
            ctx.next_attempt(t0 + RECONNECTION_DELAY * 2),
            RetryDecision::Exhausted { attempts: 2 }
        );
        assert_eq!(ctx.attempt_count(), 2);
    }

    #[test]
    fn test_zero_window_is_exhausted_immediately() {
        let t0 = Instant::now();
        let mut ctx = ReconnectionContext::start(t0, Duration::ZERO, Some("reset".into()));
        assert_eq!(ctx.next_attempt(t0), RetryDecision::Exhausted { attempts: 0 });
        assert_eq!(ctx.reason(), Some("reset"));
    }

    #[test]
    fn test_time_left() {
        let t0 = Instant::now();
        let ctx = ReconnectionContext::start(t0, Duration::from_secs(10), None);
        assert_eq!(ctx.time_left(t0 + Duration::from_secs(3)), Duration::from_secs(7));
        assert_eq!(ctx.time_left(t0 + Duration::from_secs(30)), Duration::ZERO);
    }
}
