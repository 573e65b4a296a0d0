use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Time until the next token is available; zero when one already is.
    pub retry_after: Duration,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket per key. Used both to pace calls to the generation provider
/// and to throttle submissions per user.
#[derive(Debug)]
pub struct RateLimiter {
    per_minute: u32,
    burst: u32,
    buckets: Mutex<HashMap<String, BucketState>>,
}

impl RateLimiter {
    pub fn new(per_minute: u32, burst: u32) -> Self {
        Self {
            per_minute: per_minute.max(1),
            burst: burst.max(1),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub async fn check(&self, key: &str) -> RateLimitDecision {
        let now = Instant::now();
        let refill_per_sec = f64::from(self.per_minute) / 60.0;
        let capacity = f64::from(self.burst);

        let mut guard = self.buckets.lock().await;
        let bucket = guard.entry(key.to_string()).or_insert(BucketState {
            tokens: capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            let restored = elapsed * refill_per_sec;
            bucket.tokens = (bucket.tokens + restored).min(capacity);
            bucket.last_refill = now;
        }

        let allowed = bucket.tokens >= 1.0;
        if allowed {
            bucket.tokens -= 1.0;
        }

        let remaining = bucket.tokens.floor().max(0.0) as u32;
        let deficit = (1.0 - bucket.tokens).max(0.0);
        let retry_after = if deficit <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(deficit / refill_per_sec)
        };

        RateLimitDecision {
            allowed,
            limit: self.per_minute,
            remaining,
            retry_after,
        }
    }

    /// Waits until a token for `key` is available and takes it.
    pub async fn acquire(&self, key: &str) {
        loop {
            let decision = self.check(key).await;
            if decision.allowed {
                return;
            }
            tokio::time::sleep(decision.retry_after.max(Duration::from_millis(10))).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::RateLimiter;

    #[tokio::test]
    async fn burst_is_spent_then_denied() {
        let limiter = RateLimiter::new(60, 2);
        assert!(limiter.check("user-1").await.allowed);
        assert!(limiter.check("user-1").await.allowed);
        let denied = limiter.check("user-1").await;
        assert!(!denied.allowed);
        assert!(denied.retry_after > Duration::ZERO);
        assert!(denied.retry_after <= Duration::from_secs(1));

        assert!(limiter.check("user-2").await.allowed);
    }

    #[tokio::test]
    async fn acquire_waits_for_refill() {
        // 6000/min refills one token every 10ms.
        let limiter = RateLimiter::new(6000, 1);
        limiter.acquire("provider").await;
        let started = std::time::Instant::now();
        limiter.acquire("provider").await;
        assert!(started.elapsed() >= Duration::from_millis(5));
    }
}
