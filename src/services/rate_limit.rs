//! Sliding-window submission rate limiter keyed by client IP.
//!
//! Trim, count and insert happen under one lock so a burst of concurrent
//! submissions from the same IP cannot overshoot the limit.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::services::clock::Clock;

/// The outcome of a rate-limit check, also the source of the
/// X-RateLimit-* response headers.
#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Seconds until the oldest recorded request leaves the window
    pub reset_after_secs: u64,
}

pub struct SlidingWindowRateLimiter {
    limit: usize,
    window: ChronoDuration,
    clock: Arc<dyn Clock>,
    buckets: Mutex<HashMap<IpAddr, Vec<DateTime<Utc>>>>,
}

impl SlidingWindowRateLimiter {
    pub fn new(limit: u32, window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            limit: limit as usize,
            window: ChronoDuration::from_std(window).expect("window out of range"),
            clock,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Check the window for `ip` and record the request if allowed.
    pub fn check_and_record(&self, ip: IpAddr) -> RateLimitDecision {
        let now = self.clock.now();
        let window_start = now - self.window;

        let mut buckets = self.buckets.lock();
        let timestamps = buckets.entry(ip).or_default();
        timestamps.retain(|t| *t > window_start);

        if timestamps.len() >= self.limit {
            let decision = self.decision(false, timestamps, now);
            return decision;
        }

        timestamps.push(now);
        self.decision(true, timestamps, now)
    }

    /// Read the window for `ip` without recording a request.
    pub fn snapshot(&self, ip: IpAddr) -> RateLimitDecision {
        let now = self.clock.now();
        let window_start = now - self.window;

        let mut buckets = self.buckets.lock();
        let timestamps = buckets.entry(ip).or_default();
        timestamps.retain(|t| *t > window_start);
        self.decision(timestamps.len() < self.limit, timestamps, now)
    }

    /// Drop empty buckets to bound memory.
    pub fn cleanup_stale(&self) {
        let window_start = self.clock.now() - self.window;
        self.buckets.lock().retain(|_, timestamps| {
            timestamps.retain(|t| *t > window_start);
            !timestamps.is_empty()
        });
    }

    fn decision(
        &self,
        allowed: bool,
        timestamps: &[DateTime<Utc>],
        now: DateTime<Utc>,
    ) -> RateLimitDecision {
        let remaining = self.limit.saturating_sub(timestamps.len()) as u32;
        let reset_after_secs = timestamps
            .first()
            .map(|oldest| {
                let freed_at = *oldest + self.window;
                (freed_at - now).num_seconds().max(1) as u64
            })
            .unwrap_or(0);
        RateLimitDecision {
            allowed,
            limit: self.limit as u32,
            remaining,
            reset_after_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::clock::ManualClock;

    fn ip() -> IpAddr {
        "10.0.0.1".parse().unwrap()
    }

    fn limiter(limit: u32) -> (Arc<ManualClock>, SlidingWindowRateLimiter) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let limiter =
            SlidingWindowRateLimiter::new(limit, Duration::from_secs(60), clock.clone());
        (clock, limiter)
    }

    #[test]
    fn allows_up_to_limit_then_rejects() {
        let (_clock, limiter) = limiter(3);
        for _ in 0..3 {
            assert!(limiter.check_and_record(ip()).allowed);
        }
        let decision = limiter.check_and_record(ip());
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert!(decision.reset_after_secs >= 1);
    }

    #[test]
    fn window_slides_and_frees_slots() {
        let (clock, limiter) = limiter(2);
        assert!(limiter.check_and_record(ip()).allowed);
        clock.advance(ChronoDuration::seconds(30));
        assert!(limiter.check_and_record(ip()).allowed);
        assert!(!limiter.check_and_record(ip()).allowed);

        // First request leaves the window after 60s total
        clock.advance(ChronoDuration::seconds(31));
        assert!(limiter.check_and_record(ip()).allowed);
    }

    #[test]
    fn ips_are_tracked_independently() {
        let (_clock, limiter) = limiter(1);
        let other: IpAddr = "10.0.0.2".parse().unwrap();
        assert!(limiter.check_and_record(ip()).allowed);
        assert!(limiter.check_and_record(other).allowed);
        assert!(!limiter.check_and_record(ip()).allowed);
    }

    #[test]
    fn snapshot_does_not_consume_a_slot() {
        let (_clock, limiter) = limiter(2);
        for _ in 0..10 {
            assert!(limiter.snapshot(ip()).allowed);
        }
        assert_eq!(limiter.snapshot(ip()).remaining, 2);
        assert!(limiter.check_and_record(ip()).allowed);
        assert_eq!(limiter.snapshot(ip()).remaining, 1);
    }

    #[test]
    fn cleanup_drops_expired_buckets() {
        let (clock, limiter) = limiter(2);
        limiter.check_and_record(ip());
        clock.advance(ChronoDuration::seconds(61));
        limiter.cleanup_stale();
        assert!(limiter.buckets.lock().is_empty());
    }
}
