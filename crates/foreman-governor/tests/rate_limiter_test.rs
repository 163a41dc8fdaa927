use std::thread::sleep;
use std::time::Duration;

use foreman_governor::rate_limiter::{RateLimitConfig, RateLimitError, RateLimiter};

#[test]
fn a_full_bucket_admits_exactly_capacity_calls() {
    let limiter = RateLimiter::new(RateLimitConfig::new(3.0, 1.0));
    for i in 0..3 {
        assert!(limiter.acquire("svc").is_ok(), "call {i} should be admitted");
    }
    // Capacity + 1 must refuse.
    let err = limiter.acquire("svc").unwrap_err();
    match err {
        RateLimitError::Exhausted { key, retry_after } => {
            assert_eq!(key, "svc");
            assert!(retry_after > Duration::ZERO);
        }
    }
}

#[test]
fn refill_admits_one_more_after_the_interval() {
    // 6000 per minute = one token every 10ms.
    let limiter = RateLimiter::new(RateLimitConfig::new(1.0, 6_000.0));
    assert!(limiter.acquire("svc").is_ok());
    assert!(limiter.acquire("svc").is_err());

    sleep(Duration::from_millis(30));
    assert!(limiter.acquire("svc").is_ok());
}

#[test]
fn refill_is_continuous_not_stepped() {
    let limiter = RateLimiter::new(RateLimitConfig::new(2.0, 6_000.0));
    assert!(limiter.acquire("svc").is_ok());
    assert!(limiter.acquire("svc").is_ok());

    // Partial accrual shows up in `remaining` before a full token exists.
    sleep(Duration::from_millis(5));
    let partial = limiter.remaining("svc");
    assert!(partial > 0.0 && partial < 2.0, "got {partial}");
}

#[test]
fn keys_have_independent_buckets() {
    let limiter = RateLimiter::new(RateLimitConfig::new(1.0, 1.0));
    assert!(limiter.acquire("a").is_ok());
    assert!(limiter.acquire("a").is_err());
    // Key "b" is untouched by "a"'s spending.
    assert!(limiter.acquire("b").is_ok());
}

#[test]
fn unknown_keys_report_a_full_bucket() {
    let limiter = RateLimiter::new(RateLimitConfig::new(7.0, 1.0));
    assert_eq!(limiter.remaining("never-seen"), 7.0);
}

#[test]
fn retry_after_reflects_the_refill_rate() {
    // 60 per minute = one token per second.
    let limiter = RateLimiter::new(RateLimitConfig::new(1.0, 60.0));
    assert!(limiter.acquire("svc").is_ok());
    match limiter.acquire("svc").unwrap_err() {
        RateLimitError::Exhausted { retry_after, .. } => {
            assert!(retry_after <= Duration::from_secs(1));
            assert!(retry_after >= Duration::from_millis(800));
        }
    }
}
