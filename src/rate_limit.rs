//! Token-bucket rate limiting toward the embedding provider.
//!
//! One [`RateLimiter`] is shared by every pipeline worker, so the request
//! rate holds no matter how many workers run. Waiters reserve a slot under
//! the lock and sleep outside it; the bucket balance may go negative, which
//! queues later callers behind earlier ones.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub struct RateLimiter {
    /// `None` means unlimited.
    bucket: Option<Mutex<Bucket>>,
}

struct Bucket {
    tokens_per_second: f64,
    max_tokens: f64,
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.tokens_per_second).min(self.max_tokens);
        self.last_refill = now;
    }

    /// Take one token and return how long the caller must wait for it.
    fn reserve(&mut self, now: Instant) -> Duration {
        self.refill(now);
        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.tokens_per_second)
        }
    }
}

impl RateLimiter {
    /// `requests_per_second <= 0` disables limiting. `burst` is clamped to at least 1.
    pub fn new(requests_per_second: f64, burst: u32) -> Self {
        if requests_per_second <= 0.0 {
            return Self::unlimited();
        }
        let max_tokens = f64::from(burst.max(1));
        Self {
            bucket: Some(Mutex::new(Bucket {
                tokens_per_second: requests_per_second,
                max_tokens,
                tokens: max_tokens,
                last_refill: Instant::now(),
            })),
        }
    }

    pub fn unlimited() -> Self {
        Self { bucket: None }
    }

    pub fn is_limited(&self) -> bool {
        self.bucket.is_some()
    }

    /// Wait until one request may be sent.
    pub async fn acquire(&self) {
        let Some(bucket) = &self.bucket else {
            return;
        };
        let wait = bucket.lock().reserve(Instant::now());
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservations_queue_behind_each_other() {
        let start = Instant::now();
        let mut b = Bucket {
            tokens_per_second: 10.0,
            max_tokens: 2.0,
            tokens: 2.0,
            last_refill: start,
        };
        assert_eq!(b.reserve(start), Duration::ZERO);
        assert_eq!(b.reserve(start), Duration::ZERO);
        let third = b.reserve(start);
        let fourth = b.reserve(start);
        assert!((third.as_secs_f64() - 0.1).abs() < 1e-9);
        assert!((fourth.as_secs_f64() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn refill_is_capped_at_burst() {
        let start = Instant::now();
        let mut b = Bucket {
            tokens_per_second: 100.0,
            max_tokens: 3.0,
            tokens: 0.0,
            last_refill: start,
        };
        b.refill(start + Duration::from_secs(10));
        assert!((b.tokens - 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn limiter_spaces_requests() {
        let limiter = RateLimiter::new(50.0, 1);
        assert!(limiter.is_limited());
        let start = Instant::now();
        for _ in 0..4 {
            limiter.acquire().await;
        }
        // First is free, the next three wait ~20ms each.
        assert!(start.elapsed() >= Duration::from_millis(55));
    }

    #[tokio::test]
    async fn zero_rate_is_unlimited() {
        let limiter = RateLimiter::new(0.0, 5);
        assert!(!limiter.is_limited());
        limiter.acquire().await;
    }
}
