//! Per-provider token buckets, shared across concurrent queries

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self { capacity, tokens: capacity, refill_per_sec, last_refill: Instant::now() }
    }

    fn try_take(&mut self, cost: f64, now: Instant) -> bool {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
        if self.tokens >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }
}

/// Polite rate limiting: one bucket per (provider) key, mutated under a
/// short critical section.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, TokenBucket>>,
    default_capacity: f64,
    default_refill_per_sec: f64,
}

impl RateLimiter {
    pub fn new(default_capacity: f64, default_refill_per_sec: f64) -> Self {
        Self { buckets: Mutex::new(HashMap::new()), default_capacity, default_refill_per_sec }
    }

    /// Take `cost` tokens from the provider's bucket if available
    pub fn reserve(&self, provider: &str, cost: f64) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("rate limiter poisoned");
        let bucket = buckets
            .entry(provider.to_string())
            .or_insert_with(|| TokenBucket::new(self.default_capacity, self.default_refill_per_sec));
        bucket.try_take(cost, now)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        // 10 requests burst, 5/sec steady-state per provider
        Self::new(10.0, 5.0)
    }
}
