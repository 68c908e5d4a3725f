//! Process-wide circuit breaker around engine execution.
//!
//! After `fail_max` consecutive failed executions the circuit opens and
//! every run is rejected without touching the engine. Once `reset_timeout`
//! has passed the circuit is half-open: the next execution decides whether
//! it closes again or re-opens.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub fail_max: u32,
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            fail_max: 3,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

/// Gate in front of the execution engine.
pub trait CircuitBreaker: Send + Sync {
    /// `false` when the call must be rejected without running.
    fn allow(&self) -> bool;
    fn record_success(&self);
    fn record_failure(&self);
    /// The admitted call ended without a verdict (timeout, stop, panic).
    /// Frees a half-open trial slot without counting a failure.
    fn release(&self);
    fn state(&self) -> CircuitState;
}

#[derive(Debug)]
struct BreakerState {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// A half-open trial call is running; everyone else is rejected.
    trial_in_flight: bool,
}

/// Consecutive-failure breaker.
#[derive(Debug)]
pub struct ConsecutiveFailureBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl ConsecutiveFailureBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        tracing::info!(
            fail_max = config.fail_max,
            reset_timeout_secs = config.reset_timeout.as_secs(),
            "Circuit breaker enabled"
        );
        Self {
            config,
            inner: Mutex::new(BreakerState {
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut BreakerState) -> R) -> R {
        match self.inner.lock() {
            Ok(mut guard) => f(&mut *guard),
            Err(poisoned) => f(&mut *poisoned.into_inner()),
        }
    }

    fn state_of(&self, s: &BreakerState) -> CircuitState {
        match s.opened_at {
            None => CircuitState::Closed,
            Some(at) if at.elapsed() >= self.config.reset_timeout => CircuitState::HalfOpen,
            Some(_) => CircuitState::Open,
        }
    }
}

impl Default for ConsecutiveFailureBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreaker for ConsecutiveFailureBreaker {
    fn allow(&self) -> bool {
        self.with_state(|s| match self.state_of(s) {
            CircuitState::Open => false,
            CircuitState::HalfOpen if s.trial_in_flight => false,
            CircuitState::HalfOpen => {
                tracing::info!("Circuit breaker half-open, allowing trial execution");
                s.trial_in_flight = true;
                true
            }
            CircuitState::Closed => true,
        })
    }

    fn record_success(&self) {
        self.with_state(|s| {
            if s.opened_at.is_some() {
                tracing::info!("Circuit breaker closed");
            }
            s.consecutive_failures = 0;
            s.opened_at = None;
            s.trial_in_flight = false;
        })
    }

    fn record_failure(&self) {
        self.with_state(|s| {
            let was_half_open = self.state_of(s) == CircuitState::HalfOpen;
            s.consecutive_failures = s.consecutive_failures.saturating_add(1);
            if was_half_open || s.consecutive_failures >= self.config.fail_max {
                if s.opened_at.is_none() || was_half_open {
                    tracing::warn!(
                        consecutive_failures = s.consecutive_failures,
                        reset_timeout_secs = self.config.reset_timeout.as_secs(),
                        "Circuit breaker opened"
                    );
                }
                s.opened_at = Some(Instant::now());
            }
            s.trial_in_flight = false;
        })
    }

    fn release(&self) {
        self.with_state(|s| s.trial_in_flight = false)
    }

    fn state(&self) -> CircuitState {
        self.with_state(|s| self.state_of(s))
    }
}

/// Used when the breaker is disabled by configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopBreaker;

impl CircuitBreaker for NoopBreaker {
    fn allow(&self) -> bool {
        true
    }

    fn record_success(&self) {}

    fn record_failure(&self) {}

    fn release(&self) {}

    fn state(&self) -> CircuitState {
        CircuitState::Closed
    }
}
