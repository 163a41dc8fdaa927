//! Admission control for outbound worker calls.
//!
//! Every call the orchestrator makes to a worker service passes through a
//! [`governor::ResilienceGovernor`] keyed by service. The governor combines:
//! - A per-key circuit breaker (closed / open / half-open with a single
//!   recovery probe)
//! - A per-key token bucket with continuous refill
//! - An exponential backoff policy for callers that were refused
//!
//! Admission refusal is ordinary flow control, not an error: `admit`
//! returns `false` and the caller retries later.

pub mod backoff;
pub mod circuit_breaker;
pub mod governor;
pub mod rate_limiter;
