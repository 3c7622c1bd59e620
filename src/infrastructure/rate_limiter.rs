//! Sliding-window admission control for broker REST calls.
//!
//! The broker allows 120 calls per rolling 60 seconds; the default limit of
//! 115 leaves a margin of 5. Sell-side calls run at high priority and are
//! admitted past the window and past an active 429 cooldown, with a warning.

use crate::domain::ports::Clock;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Priority {
    /// Exact-match parse; anything unrecognized is treated as `Normal`.
    pub fn parse(s: &str) -> Priority {
        match s {
            "low" => Priority::Low,
            "normal" => Priority::Normal,
            "high" => Priority::High,
            _ => Priority::Normal,
        }
    }
}

struct Window {
    calls: VecDeque<Instant>,
    cooldown_until: Option<Instant>,
}

pub struct RateLimiter {
    limit: usize,
    window: Duration,
    clock: Arc<dyn Clock>,
    inner: Mutex<Window>,
}

impl RateLimiter {
    pub fn new(limit: usize, window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            limit,
            window,
            clock,
            inner: Mutex::new(Window {
                calls: VecDeque::new(),
                cooldown_until: None,
            }),
        }
    }

    /// Whether a call may proceed right now. Never mutates the cooldown.
    pub fn admit(&self, priority: Priority) -> bool {
        let now = self.clock.monotonic();
        let mut inner = self.inner.lock().expect("rate limiter poisoned");

        if let Some(deadline) = inner.cooldown_until {
            if now < deadline {
                if priority == Priority::High {
                    warn!(
                        remaining_secs = (deadline - now).as_secs(),
                        "Rate limiter: admitting HIGH priority call despite active cooldown"
                    );
                    return true;
                }
                return false;
            }
        }

        Self::evict(&mut inner.calls, now, self.window);
        if inner.calls.len() >= self.limit {
            if priority == Priority::High {
                warn!("Rate limiter: window full, admitting HIGH priority call");
                return true;
            }
            return false;
        }

        true
    }

    /// Record one issued call against the window.
    pub fn record(&self) {
        let now = self.clock.monotonic();
        let mut inner = self.inner.lock().expect("rate limiter poisoned");
        inner.calls.push_back(now);
        Self::evict(&mut inner.calls, now, self.window);
    }

    /// Activate the broker-imposed hard cooldown (from a 429 `Retry-After`).
    pub fn cooldown(&self, duration: Duration) {
        let mut inner = self.inner.lock().expect("rate limiter poisoned");
        inner.cooldown_until = Some(self.clock.monotonic() + duration);
        warn!(secs = duration.as_secs(), "Rate limiter: cooldown activated");
    }

    pub fn in_cooldown(&self) -> bool {
        let inner = self.inner.lock().expect("rate limiter poisoned");
        inner
            .cooldown_until
            .is_some_and(|deadline| self.clock.monotonic() < deadline)
    }

    fn evict(calls: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(oldest) = calls.front() {
            if now.duration_since(*oldest) > window {
                calls.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::Clock;

    /// Manually advanced clock shared with the limiter under test.
    pub struct ManualClock {
        base: Instant,
        offset: Mutex<Duration>,
    }

    impl ManualClock {
        pub fn new() -> Self {
            Self {
                base: Instant::now(),
                offset: Mutex::new(Duration::ZERO),
            }
        }

        pub fn advance(&self, d: Duration) {
            *self.offset.lock().unwrap() += d;
        }
    }

    impl Clock for ManualClock {
        fn monotonic(&self) -> Instant {
            self.base + *self.offset.lock().unwrap()
        }

        fn unix_seconds(&self) -> u64 {
            self.offset.lock().unwrap().as_secs()
        }
    }

    fn limiter(limit: usize) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        (
            RateLimiter::new(limit, Duration::from_secs(60), clock.clone()),
            clock,
        )
    }

    #[test]
    fn test_admits_under_limit() {
        let (limiter, _) = limiter(3);
        limiter.record();
        limiter.record();
        assert!(limiter.admit(Priority::Normal));
    }

    #[test]
    fn test_blocks_normal_at_exact_limit_admits_high() {
        let (limiter, _) = limiter(115);
        for _ in 0..115 {
            limiter.record();
        }
        assert!(!limiter.admit(Priority::Normal));
        assert!(!limiter.admit(Priority::Low));
        assert!(limiter.admit(Priority::High));
    }

    #[test]
    fn test_window_eviction_frees_capacity() {
        let (limiter, clock) = limiter(2);
        limiter.record();
        limiter.record();
        assert!(!limiter.admit(Priority::Normal));

        clock.advance(Duration::from_secs(61));
        assert!(limiter.admit(Priority::Normal));
    }

    #[test]
    fn test_cooldown_blocks_normal_admits_high() {
        let (limiter, clock) = limiter(115);
        limiter.cooldown(Duration::from_secs(30));

        assert!(!limiter.admit(Priority::Normal));
        assert!(!limiter.admit(Priority::Low));
        assert!(limiter.admit(Priority::High));

        // High admits never shrink the cooldown, and record() does not touch it.
        limiter.record();
        assert!(limiter.in_cooldown());

        clock.advance(Duration::from_secs(31));
        assert!(limiter.admit(Priority::Normal));
    }

    #[test]
    fn test_unknown_priority_parses_as_normal() {
        assert_eq!(Priority::parse("high"), Priority::High);
        assert_eq!(Priority::parse("low"), Priority::Low);
        assert_eq!(Priority::parse("HIGH"), Priority::Normal);
        assert_eq!(Priority::parse("urgent"), Priority::Normal);
    }
}
