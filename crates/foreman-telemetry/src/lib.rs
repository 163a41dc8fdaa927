//! Observability for foreman services.
//!
//! Structured logging via the `tracing` ecosystem and a thread-safe
//! metrics registry with Prometheus text export. The registry is an
//! ordinary value: construct one per orchestrator and pass it in, so
//! independent orchestrators in one process never share counters.

pub mod logging;
pub mod metrics;
