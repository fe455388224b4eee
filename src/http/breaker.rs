//! Circuit breaker guarding outbound calls to a named service
//!
//! Per-service failure/recovery state machine. A breaker in OPEN rejects
//! every call until `recovery_timeout` has elapsed, then lets a probe
//! through in HALF_OPEN; enough consecutive successes close it again.

use crate::error::{FlowError, Result};
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Failing; reject requests
    Open,
    /// Testing whether the service recovered
    HalfOpen,
}

/// Configuration for a circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures before opening
    pub failure_threshold: u32,
    /// How long to wait before probing again
    pub recovery_timeout: Duration,
    /// Consecutive successes needed to close the circuit
    pub success_threshold: u32,
    /// Per-call timeout; a timeout counts as a failure
    pub request_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 3,
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
}

/// Circuit breaker for a single named downstream service.
#[derive(Debug)]
pub struct CircuitBreaker {
    service: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            service: service.into(),
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
            }),
        }
    }

    /// Current state, transitioning OPEN -> HALF_OPEN if the recovery window
    /// has elapsed.
    pub fn state(&self) -> CircuitState {
        let mut guard = self.state.lock().expect("breaker lock poisoned");
        self.maybe_probe(&mut guard);
        guard.state
    }

    /// Execute `operation` under the breaker.
    ///
    /// Rejects immediately with [`FlowError::CircuitOpen`] while OPEN; wraps
    /// the call in `request_timeout` and records the outcome.
    pub async fn call<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        {
            let mut guard = self.state.lock().expect("breaker lock poisoned");
            self.maybe_probe(&mut guard);
            if guard.state == CircuitState::Open {
                return Err(FlowError::CircuitOpen {
                    service: self.service.clone(),
                });
            }
        }

        match tokio::time::timeout(self.config.request_timeout, operation()).await {
            Ok(Ok(value)) => {
                self.record_success();
                Ok(value)
            }
            Ok(Err(e)) => {
                self.record_failure();
                Err(e)
            }
            Err(_) => {
                self.record_failure();
                Err(FlowError::Timeout(format!(
                    "request to service '{}' timed out after {}s",
                    self.service,
                    self.config.request_timeout.as_secs()
                )))
            }
        }
    }

    fn maybe_probe(&self, guard: &mut BreakerState) {
        if guard.state == CircuitState::Open {
            let elapsed = guard
                .opened_at
                .map(|t| t.elapsed() >= self.config.recovery_timeout)
                .unwrap_or(true);
            if elapsed {
                guard.state = CircuitState::HalfOpen;
                guard.success_count = 0;
                info!(service = %self.service, "circuit breaker transitioning to HALF_OPEN");
            }
        }
    }

    fn record_success(&self) {
        let mut guard = self.state.lock().expect("breaker lock poisoned");
        match guard.state {
            CircuitState::HalfOpen => {
                guard.success_count += 1;
                if guard.success_count >= self.config.success_threshold {
                    guard.state = CircuitState::Closed;
                    guard.failure_count = 0;
                    guard.opened_at = None;
                    info!(service = %self.service, "circuit breaker CLOSED, service recovered");
                }
            }
            _ => {
                // Successes decay the failure counter toward zero
                guard.failure_count = guard.failure_count.saturating_sub(1);
            }
        }
    }

    fn record_failure(&self) {
        let mut guard = self.state.lock().expect("breaker lock poisoned");
        guard.failure_count += 1;
        match guard.state {
            CircuitState::HalfOpen => {
                guard.state = CircuitState::Open;
                guard.opened_at = Some(Instant::now());
                warn!(service = %self.service, "circuit breaker re-OPENED during recovery probe");
            }
            CircuitState::Closed => {
                if guard.failure_count >= self.config.failure_threshold {
                    guard.state = CircuitState::Open;
                    guard.opened_at = Some(Instant::now());
                    warn!(
                        service = %self.service,
                        failures = guard.failure_count,
                        "circuit breaker OPEN"
                    );
                } else {
                    debug!(
                        service = %self.service,
                        failures = guard.failure_count,
                        "circuit breaker recorded failure"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }
}
