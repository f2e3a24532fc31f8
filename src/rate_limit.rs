use std::time::Duration;
use tokio::time::Instant;

use crate::config::RateLimitSettings;

// Token bucket for a single client.
// Refill is computed lazily from elapsed time on every check, there is no timer.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_second: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    // Starts full so a new client gets its whole burst
    pub fn new(settings: &RateLimitSettings, now: Instant) -> Self {
        let capacity = f64::from(settings.burst_size);
        Self {
            capacity,
            refill_per_second: settings.refill_per_second,
            tokens: capacity,
            last_refill: now,
        }
    }

    pub fn try_consume(&mut self) -> bool {
        self.try_consume_at(Instant::now())
    }

    pub fn try_consume_at(&mut self, now: Instant) -> bool {
        self.refill(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&mut self, now: Instant) {
        // saturating: a caller-supplied `now` earlier than last_refill adds nothing
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_per_second).min(self.capacity);
        if now > self.last_refill {
            self.last_refill = now;
        }
    }

    /// Current fill level, fractional part included.
    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Time until the next whole token is available.
    pub fn retry_after(&self) -> Duration {
        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.refill_per_second)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(requests_per_minute: u32, burst_size: u32) -> RateLimitSettings {
        RateLimitSettings::new(requests_per_minute, burst_size, Duration::from_secs(300)).unwrap()
    }

    #[test]
    fn test_burst_then_deny() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(&settings(60, 5), start);

        for i in 0..5 {
            let now = start + Duration::from_millis(i * 10);
            assert!(bucket.try_consume_at(now), "request {} should be admitted", i + 1);
        }

        // The 6th request should be rejected
        assert!(!bucket.try_consume_at(start + Duration::from_millis(50)));
    }

    #[test]
    fn test_one_more_after_one_second() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(&settings(60, 5), start);

        for _ in 0..5 {
            assert!(bucket.try_consume_at(start));
        }
        assert!(!bucket.try_consume_at(start + Duration::from_millis(500)));

        let later = start + Duration::from_secs(1);
        assert!(bucket.try_consume_at(later));
        assert!(!bucket.try_consume_at(later));
    }

    #[test]
    fn test_fractional_tokens_preserved() {
        let start = Instant::now();
        // 30 rpm -> half a token per second
        let mut bucket = TokenBucket::new(&settings(30, 1), start);
        assert!(bucket.try_consume_at(start));

        // Each one-second gap adds half a token; they only add up to one if nothing is truncated
        assert!(!bucket.try_consume_at(start + Duration::from_secs(1)));
        assert!((bucket.tokens() - 0.5).abs() < 1e-9);
        assert!(bucket.try_consume_at(start + Duration::from_secs(2)));
    }

    #[test]
    fn test_tokens_clamped_to_capacity() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(&settings(600, 3), start);

        bucket.try_consume_at(start + Duration::from_secs(3600));
        assert!(bucket.tokens() <= bucket.capacity());
        assert!((bucket.tokens() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_denied_check_does_not_go_negative() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(&settings(60, 1), start);
        assert!(bucket.try_consume_at(start));

        for _ in 0..10 {
            assert!(!bucket.try_consume_at(start));
        }
        assert!(bucket.tokens() >= 0.0);
    }

    #[test]
    fn test_retry_after() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(&settings(60, 1), start);
        assert_eq!(bucket.retry_after(), Duration::ZERO);

        bucket.try_consume_at(start);
        let wait = bucket.retry_after();
        assert!(wait > Duration::from_millis(990) && wait <= Duration::from_secs(1));
    }

    #[test]
    fn test_long_window_converges_to_rate() {
        // 120 rpm with a burst of 10, hammered every 100ms for 10 minutes
        let start = Instant::now();
        let mut bucket = TokenBucket::new(&settings(120, 10), start);
        let mut admitted = 0u32;

        for tick in 0..6000u64 {
            if bucket.try_consume_at(start + Duration::from_millis(tick * 100)) {
                admitted += 1;
            }
        }

        // burst + 10 minutes of steady state
        let expected = 10.0 + 120.0 * 10.0;
        assert!((f64::from(admitted) - expected).abs() <= 2.0, "admitted {}", admitted);
    }

    #[test]
    fn test_rate_independent_of_arrival_pattern() {
        // Irregular arrivals: bursts of 20 requests every 7 seconds
        let start = Instant::now();
        let mut bucket = TokenBucket::new(&settings(60, 5), start);
        let mut admitted = 0u32;

        for round in 0..100u64 {
            let now = start + Duration::from_secs(round * 7);
            for _ in 0..20 {
                if bucket.try_consume_at(now) {
                    admitted += 1;
                }
            }
        }

        // Capacity caps each 7s gap at 5 tokens, so every round admits exactly 5
        assert_eq!(admitted, 500);
    }
}
