use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::warn;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    /// The token bucket for this key is empty. `retry_after` is how long
    /// until one token will have accrued.
    #[error("token bucket empty for key `{key}`, retry after {retry_after:?}")]
    Exhausted { key: String, retry_after: Duration },
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Bucket capacity: the largest burst a cold key can spend at once.
    pub capacity: f64,
    /// Continuous refill rate, expressed per minute.
    pub refill_per_minute: f64,
}

impl RateLimitConfig {
    pub fn new(capacity: f64, refill_per_minute: f64) -> Self {
        Self {
            capacity,
            refill_per_minute,
        }
    }

    fn tokens_per_second(&self) -> f64 {
        self.refill_per_minute / 60.0
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 10.0,
            refill_per_minute: 10.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Bucket (per-key state)
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    /// Accrue tokens for the time elapsed since the last refill, capped
    /// at capacity. Refill is continuous: fractions count.
    fn refill(&mut self, tokens_per_second: f64, capacity: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * tokens_per_second).min(capacity);
        self.last_refill = now;
    }

    fn try_consume(&mut self, tokens_per_second: f64, capacity: f64) -> Result<(), Duration> {
        self.refill(tokens_per_second, capacity);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(deficit / tokens_per_second))
        }
    }
}

// ---------------------------------------------------------------------------
// RateLimiter
// ---------------------------------------------------------------------------

/// Token-bucket limiter with independent per-key buckets. A key's first
/// appearance creates a full bucket.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<String, TokenBucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    /// Take one token for `key`, or report how long until one accrues.
    pub fn acquire(&self, key: &str) -> Result<(), RateLimitError> {
        let mut bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::new(self.config.capacity));

        match bucket.try_consume(self.config.tokens_per_second(), self.config.capacity) {
            Ok(()) => Ok(()),
            Err(retry_after) => {
                warn!(key, ?retry_after, "token bucket exhausted");
                Err(RateLimitError::Exhausted {
                    key: key.to_string(),
                    retry_after,
                })
            }
        }
    }

    /// Approximate tokens currently available for `key`, refill included.
    pub fn remaining(&self, key: &str) -> f64 {
        match self.buckets.get(key) {
            Some(bucket) => {
                let elapsed = bucket.last_refill.elapsed().as_secs_f64();
                (bucket.tokens + elapsed * self.config.tokens_per_second())
                    .min(self.config.capacity)
            }
            None => self.config.capacity,
        }
    }
}
