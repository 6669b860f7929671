use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Token-bucket rate limiter keyed by string (user ID, IP, ...).
pub struct RateLimiter {
    buckets: DashMap<String, Bucket>,
    burst: u32,
    refill_per_sec: f64,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// `burst` is the bucket size; one token comes back every `per_seconds`.
    pub fn new(burst: u32, per_seconds: f64) -> Self {
        Self {
            buckets: DashMap::new(),
            burst,
            refill_per_sec: 1.0 / per_seconds,
        }
    }

    /// Take one token for `key`. Returns false when the bucket is empty.
    pub fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut bucket = self.buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: self.burst as f64,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.burst as f64);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Drop the bucket for a key that will not be seen again (disconnects).
    pub fn forget(&self, key: &str) {
        self.buckets.remove(key);
    }

    /// Remove buckets untouched for longer than `idle`. Returns how many went.
    pub fn cleanup(&self, idle: Duration) -> usize {
        let before = self.buckets.len();
        let cutoff = Instant::now().checked_sub(idle);
        self.buckets.retain(|_, b| match cutoff {
            Some(cutoff) => b.last_refill > cutoff,
            None => true,
        });
        before - self.buckets.len()
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}
