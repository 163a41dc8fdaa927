use std::time::{Duration, Instant};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation; calls pass through to the token bucket.
    Closed,
    /// Too many recent failures; calls are refused without dispatch.
    Open,
    /// Recovery test; exactly one probe call is allowed through.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures within one window that open the circuit.
    pub failure_threshold: u32,
    /// Length of the rolling failure-counting window. The count resets
    /// only when the window expires; successes do not clear it.
    pub failure_window: Duration,
    /// How long an open circuit waits before admitting a probe.
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

// ---------------------------------------------------------------------------
// Preflight
// ---------------------------------------------------------------------------

/// Outcome of asking the breaker whether a call may go out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preflight {
    /// Circuit closed: the call may proceed, subject to rate limiting.
    Proceed,
    /// Circuit half-open: this call is the recovery probe. Probes bypass
    /// the token bucket.
    Probe,
    /// Refused. `retry_after` is zero while a probe is outstanding.
    Refused { retry_after: Duration },
}

// ---------------------------------------------------------------------------
// CircuitBreaker
// ---------------------------------------------------------------------------

/// Breaker state for one service key. The four legal transitions:
///
/// - closed -> open       (failure threshold reached within the window)
/// - open -> half_open    (recovery timeout elapsed, probe admitted)
/// - half_open -> closed  (probe succeeded)
/// - half_open -> open    (probe failed, recovery timer restarts)
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    window_failures: u32,
    window_start: Option<Instant>,
    opened_at: Option<Instant>,
    probe_outstanding: bool,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            window_failures: 0,
            window_start: None,
            opened_at: None,
            probe_outstanding: false,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Failures counted in the current window; zero once the window has
    /// expired.
    pub fn window_failures(&self) -> u32 {
        let expired = self
            .window_start
            .map(|t| t.elapsed() >= self.config.failure_window)
            .unwrap_or(true);
        if expired {
            0
        } else {
            self.window_failures
        }
    }

    /// Decide whether a call may go out right now.
    pub fn preflight(&mut self) -> Preflight {
        match self.state {
            CircuitState::Closed => Preflight::Proceed,
            CircuitState::Open => {
                let elapsed = self
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.recovery_timeout {
                    info!("circuit transitioning open -> half_open, admitting probe");
                    self.state = CircuitState::HalfOpen;
                    self.probe_outstanding = true;
                    Preflight::Probe
                } else {
                    Preflight::Refused {
                        retry_after: self.config.recovery_timeout - elapsed,
                    }
                }
            }
            CircuitState::HalfOpen => {
                if self.probe_outstanding {
                    Preflight::Refused {
                        retry_after: Duration::ZERO,
                    }
                } else {
                    // Probe slot is free again (its outcome was recorded
                    // without a transition, which record() prevents, or the
                    // breaker was reset). Hand it out.
                    self.probe_outstanding = true;
                    Preflight::Probe
                }
            }
        }
    }

    /// Record the outcome of a call admitted by [`preflight`](Self::preflight).
    pub fn record(&mut self, success: bool) {
        match self.state {
            CircuitState::HalfOpen => {
                self.probe_outstanding = false;
                if success {
                    info!("circuit transitioning half_open -> closed");
                    self.state = CircuitState::Closed;
                    self.window_failures = 0;
                    self.window_start = None;
                    self.opened_at = None;
                } else {
                    warn!("circuit transitioning half_open -> open, probe failed");
                    self.state = CircuitState::Open;
                    self.opened_at = Some(Instant::now());
                }
            }
            CircuitState::Closed => {
                if success {
                    // Successes do not clear the window; only expiry does.
                    return;
                }
                let now = Instant::now();
                let expired = self
                    .window_start
                    .map(|t| now.duration_since(t) >= self.config.failure_window)
                    .unwrap_or(true);
                if expired {
                    self.window_start = Some(now);
                    self.window_failures = 1;
                } else {
                    self.window_failures += 1;
                }
                if self.window_failures >= self.config.failure_threshold {
                    warn!(
                        failures = self.window_failures,
                        "circuit transitioning closed -> open"
                    );
                    self.state = CircuitState::Open;
                    self.opened_at = Some(now);
                    self.probe_outstanding = false;
                }
            }
            CircuitState::Open => {
                // Late result from a call admitted before the circuit
                // opened. The open timer stands.
            }
        }
    }

    /// Force the breaker back to closed with a clean window.
    pub fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.window_failures = 0;
        self.window_start = None;
        self.opened_at = None;
        self.probe_outstanding = false;
    }
}
