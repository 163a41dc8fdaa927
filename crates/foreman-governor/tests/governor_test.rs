//! Admission semantics across the breaker + bucket composition: circuit
//! state wins, probes bypass the bucket, and refusal is a plain `false`.

use std::thread::sleep;
use std::time::Duration;

use foreman_governor::circuit_breaker::{CircuitBreakerConfig, CircuitState};
use foreman_governor::governor::ResilienceGovernor;
use foreman_governor::rate_limiter::RateLimitConfig;

fn fast_breaker() -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold: 3,
        failure_window: Duration::from_secs(5),
        recovery_timeout: Duration::from_millis(50),
    }
}

/// A bucket so large the breaker is the only thing that can refuse.
fn open_bucket() -> RateLimitConfig {
    RateLimitConfig::new(1_000.0, 60_000.0)
}

#[test]
fn failures_trip_the_circuit_and_admission_stops() {
    let governor = ResilienceGovernor::new(fast_breaker(), open_bucket());

    for _ in 0..3 {
        assert!(governor.admit("svc"));
        governor.record("svc", false);
    }
    assert_eq!(governor.circuit_state("svc"), CircuitState::Open);
    assert!(!governor.admit("svc"));
}

#[test]
fn recovery_probe_success_restores_admission() {
    let governor = ResilienceGovernor::new(fast_breaker(), open_bucket());
    for _ in 0..3 {
        governor.record("svc", false);
    }
    assert!(!governor.admit("svc"));

    sleep(Duration::from_millis(70));

    // Exactly one probe while half-open.
    assert!(governor.admit("svc"));
    assert_eq!(governor.circuit_state("svc"), CircuitState::HalfOpen);
    assert!(!governor.admit("svc"));

    governor.record("svc", true);
    assert_eq!(governor.circuit_state("svc"), CircuitState::Closed);
    assert!(governor.admit("svc"));
}

#[test]
fn failed_probe_reopens_the_circuit() {
    let governor = ResilienceGovernor::new(fast_breaker(), open_bucket());
    for _ in 0..3 {
        governor.record("svc", false);
    }
    sleep(Duration::from_millis(70));
    assert!(governor.admit("svc"));

    governor.record("svc", false);
    assert_eq!(governor.circuit_state("svc"), CircuitState::Open);
    assert!(!governor.admit("svc"));
}

#[test]
fn probe_bypasses_an_empty_token_bucket() {
    // One token per hour: after the first spend the bucket stays empty
    // for the whole test.
    let governor = ResilienceGovernor::new(fast_breaker(), RateLimitConfig::new(1.0, 1.0 / 60.0));

    assert!(governor.admit("svc"));
    assert!(!governor.admit("svc"), "bucket should now be empty");

    for _ in 0..3 {
        governor.record("svc", false);
    }
    sleep(Duration::from_millis(70));

    // Circuit recovery outranks the empty bucket.
    assert!(governor.admit("svc"));
    governor.record("svc", true);
    assert_eq!(governor.circuit_state("svc"), CircuitState::Closed);

    // Closed again: the bucket is back in charge, and it is empty.
    assert!(!governor.admit("svc"));
}

#[test]
fn closed_circuit_defers_to_the_bucket() {
    let governor = ResilienceGovernor::new(fast_breaker(), RateLimitConfig::new(2.0, 1.0));
    assert!(governor.admit("svc"));
    assert!(governor.admit("svc"));
    assert!(!governor.admit("svc"));
    assert_eq!(governor.circuit_state("svc"), CircuitState::Closed);
}

#[test]
fn service_keys_are_isolated() {
    let governor = ResilienceGovernor::new(fast_breaker(), open_bucket());
    for _ in 0..3 {
        governor.record("broken", false);
    }
    assert!(!governor.admit("broken"));
    assert!(governor.admit("healthy"));
    assert_eq!(governor.circuit_state("healthy"), CircuitState::Closed);
}

#[test]
fn reset_circuit_reinstates_admission() {
    let governor = ResilienceGovernor::new(fast_breaker(), open_bucket());
    for _ in 0..3 {
        governor.record("svc", false);
    }
    assert!(!governor.admit("svc"));

    governor.reset_circuit("svc");
    assert_eq!(governor.circuit_state("svc"), CircuitState::Closed);
    assert!(governor.admit("svc"));
}

#[test]
fn unknown_keys_start_closed_with_a_full_bucket() {
    let governor = ResilienceGovernor::new(fast_breaker(), RateLimitConfig::new(4.0, 1.0));
    assert_eq!(governor.circuit_state("fresh"), CircuitState::Closed);
    assert_eq!(governor.tokens_remaining("fresh"), 4.0);
    assert!(governor.admit("fresh"));
}
