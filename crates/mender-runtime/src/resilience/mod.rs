//! Resilience patterns for mender-runtime.
//!
//! This module provides:
//! - Circuit breaker to stop calling a failing dependency
//! - Self-healing retry loop driven by failure classification
//! - Recovery outcome metrics

mod circuit_breaker;
mod healer;
mod metrics;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitOpenError, CircuitState};
pub use healer::{
    report_of, Fallback, HealHook, HealingOptions, HealingResult, RetryHook, SelfHealer,
};
pub use metrics::{
    CategoryStats, MetricsRecorder, RecoveryMetric, RecoveryStats, DEFAULT_METRICS_CAPACITY,
};
