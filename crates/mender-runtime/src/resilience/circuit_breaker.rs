//! Circuit breaker to prevent hammering a failing dependency.
//!
//! Each guarded dependency client owns its own breaker. When calls fail
//! repeatedly the circuit opens and subsequent calls are rejected without
//! touching the dependency until the reset timeout has elapsed.

use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures before opening the circuit
    pub failure_threshold: u32,

    /// Time the circuit stays open before a trial call is let through
    #[serde(with = "crate::config::duration_str")]
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

/// State of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation
    Closed,

    /// Calls are rejected until the reset timeout elapses
    Open { opened_at: Instant },

    /// Next call is a trial; its outcome decides the next state
    HalfOpen,
}

/// Rejection returned while the circuit is open.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{service} is temporarily unavailable (circuit open); try again in {retry_in_secs} seconds")]
pub struct CircuitOpenError {
    /// Guarded dependency
    pub service: String,

    /// Whole seconds until a trial call will be allowed
    pub retry_in_secs: u64,
}

impl CircuitOpenError {
    /// Remaining wait as a duration.
    pub fn retry_after(&self) -> Duration {
        Duration::from_secs(self.retry_in_secs)
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
}

/// Three-state circuit breaker for one dependency.
pub struct CircuitBreaker {
    service: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a new, closed circuit breaker.
    pub fn new(service: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            service: service.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
            }),
        }
    }

    /// Name of the guarded dependency.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Ask permission to call the dependency.
    ///
    /// Rejects while open. Once the reset timeout has elapsed the circuit
    /// moves to half-open and the call is let through as a trial.
    pub fn try_acquire(&self) -> Result<(), CircuitOpenError> {
        let mut inner = self.inner.lock();
        if let CircuitState::Open { opened_at } = inner.state {
            let reopens_at = opened_at + self.config.reset_timeout;
            let now = Instant::now();
            if now >= reopens_at {
                inner.state = CircuitState::HalfOpen;
                tracing::info!(service = %self.service, "Circuit transitioning to half-open for recovery test");
            } else {
                let remaining = reopens_at.saturating_duration_since(now);
                return Err(CircuitOpenError {
                    service: self.service.clone(),
                    retry_in_secs: remaining.as_millis().div_ceil(1000) as u64,
                });
            }
        }
        Ok(())
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                tracing::info!(service = %self.service, "Circuit closed after successful recovery");
            }
            CircuitState::Closed => {
                // Only consecutive failures count
                inner.failure_count = 0;
            }
            CircuitState::Open { .. } => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        let failures = inner.failure_count;

        match inner.state {
            CircuitState::Closed if failures >= self.config.failure_threshold => {
                inner.state = CircuitState::Open {
                    opened_at: Instant::now(),
                };
                tracing::warn!(
                    service = %self.service,
                    failures,
                    "Circuit opened after repeated failures"
                );
            }
            CircuitState::HalfOpen if failures >= self.config.failure_threshold => {
                inner.state = CircuitState::Open {
                    opened_at: Instant::now(),
                };
                tracing::warn!(
                    service = %self.service,
                    failures,
                    "Circuit reopened after failed recovery attempt"
                );
            }
            _ => {}
        }
    }

    /// Run `call` through the breaker.
    ///
    /// Rejected calls never invoke `call`. The outcome of an admitted call
    /// is recorded before it is returned.
    pub async fn call<T, E, F, Fut>(&self, call: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitOpenError>,
    {
        self.try_acquire()?;

        match call().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(err)
            }
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Failures counted since the last reset.
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// Whether calls are currently being rejected.
    ///
    /// Unlike [`try_acquire`](Self::try_acquire) this never changes state.
    pub fn is_open(&self) -> bool {
        match self.inner.lock().state {
            CircuitState::Open { opened_at } => opened_at.elapsed() < self.config.reset_timeout,
            _ => false,
        }
    }

    /// Force the circuit closed.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new("default", CircuitBreakerConfig::default())
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CircuitBreaker")
            .field("service", &self.service)
            .field("state", &inner.state)
            .field("failure_count", &inner.failure_count)
            .finish()
    }
}
