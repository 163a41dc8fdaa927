use dashmap::DashMap;
use tracing::debug;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, Preflight};
use crate::rate_limiter::{RateLimitConfig, RateLimiter};

// ---------------------------------------------------------------------------
// ResilienceGovernor
// ---------------------------------------------------------------------------

/// Admission control for outbound calls, keyed by service.
///
/// The contract is two synchronous calls around every dispatch:
/// [`admit`](Self::admit) before, [`record`](Self::record) after. A `false`
/// from `admit` is not an error; the caller parks the work and retries
/// later. Circuit state takes precedence over the token bucket, and a
/// half-open recovery probe bypasses the bucket entirely.
pub struct ResilienceGovernor {
    breaker_config: CircuitBreakerConfig,
    breakers: DashMap<String, CircuitBreaker>,
    limiter: RateLimiter,
}

impl ResilienceGovernor {
    pub fn new(breaker_config: CircuitBreakerConfig, limit_config: RateLimitConfig) -> Self {
        Self {
            breaker_config,
            breakers: DashMap::new(),
            limiter: RateLimiter::new(limit_config),
        }
    }

    /// May a call to `service_key` go out right now?
    pub fn admit(&self, service_key: &str) -> bool {
        let mut breaker = self
            .breakers
            .entry(service_key.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.breaker_config.clone()));

        match breaker.preflight() {
            Preflight::Probe => {
                debug!(service_key, "admitting half-open recovery probe");
                true
            }
            Preflight::Refused { retry_after } => {
                debug!(service_key, ?retry_after, "admission refused by circuit");
                false
            }
            Preflight::Proceed => {
                drop(breaker);
                self.limiter.acquire(service_key).is_ok()
            }
        }
    }

    /// Report the outcome of a call that `admit` let through.
    pub fn record(&self, service_key: &str, success: bool) {
        let mut breaker = self
            .breakers
            .entry(service_key.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.breaker_config.clone()));
        breaker.record(success);
    }

    /// Current circuit state for `service_key`. Unknown keys are closed.
    pub fn circuit_state(&self, service_key: &str) -> CircuitState {
        self.breakers
            .get(service_key)
            .map(|b| b.state())
            .unwrap_or(CircuitState::Closed)
    }

    /// Approximate tokens left in `service_key`'s bucket.
    pub fn tokens_remaining(&self, service_key: &str) -> f64 {
        self.limiter.remaining(service_key)
    }

    /// Force `service_key`'s circuit back to closed. The token bucket is
    /// left to refill on its own.
    pub fn reset_circuit(&self, service_key: &str) {
        if let Some(mut breaker) = self.breakers.get_mut(service_key) {
            breaker.reset();
        }
    }
}
