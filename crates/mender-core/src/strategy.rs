//! Recovery strategies and backoff arithmetic.
//!
//! The strategy table maps each [`ErrorCategory`] to its retry budget and
//! backoff shape. It is built once at startup and never mutated; lookups
//! return copies.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::category::ErrorCategory;

/// Upper bound on any computed backoff delay.
pub const MAX_BACKOFF: Duration = Duration::from_millis(30_000);

/// Maximum extra delay added by jitter, as a fraction of the base delay.
pub const JITTER_FRACTION: f64 = 0.3;

/// Retry parameters for one failure category.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RecoveryStrategy {
    /// Retries after the initial attempt
    pub max_retries: u32,

    /// Delay before the first retry, in milliseconds
    pub base_delay_ms: u64,

    /// Growth factor per retry (>= 1.0)
    pub backoff_multiplier: f64,

    /// Add up to 30% random extra delay
    pub use_jitter: bool,

    /// Whether this category is worth retrying at all
    pub should_retry: bool,
}

impl RecoveryStrategy {
    /// Backoff before retry `attempt` (1-based), without jitter.
    ///
    /// The exponent is `attempt - 1`, so the first retry waits exactly
    /// `base_delay_ms`. The result is clamped to `cap`.
    pub fn base_delay(&self, attempt: u32, cap: Duration) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let multiplier = self.backoff_multiplier.max(1.0);
        let millis = self.base_delay_ms as f64 * multiplier.powi(exponent);
        clamp_millis(millis, cap)
    }

    /// Backoff before retry `attempt` with jitter applied.
    ///
    /// `jitter_sample` is a uniform sample in `[0, 1)`; it is ignored when
    /// `use_jitter` is false.
    pub fn delay_for_attempt(&self, attempt: u32, jitter_sample: f64, cap: Duration) -> Duration {
        let base = self.base_delay(attempt, cap);
        if !self.use_jitter {
            return base;
        }
        let sample = jitter_sample.clamp(0.0, 1.0);
        let millis = base.as_millis() as f64;
        clamp_millis(millis + millis * JITTER_FRACTION * sample, cap)
    }

    /// Total attempts (initial call plus retries) this strategy allows.
    pub fn total_attempts(&self) -> u32 {
        if self.should_retry {
            self.max_retries.saturating_add(1)
        } else {
            1
        }
    }
}

fn clamp_millis(millis: f64, cap: Duration) -> Duration {
    if !millis.is_finite() {
        return cap;
    }
    let capped = millis.clamp(0.0, cap.as_millis() as f64);
    Duration::from_millis(capped.round() as u64)
}

/// The default strategy for a category.
pub fn default_strategy(category: ErrorCategory) -> RecoveryStrategy {
    let (max_retries, base_delay_ms, backoff_multiplier, use_jitter, should_retry) = match category
    {
        ErrorCategory::Network => (3, 1000, 2.0, true, true),
        ErrorCategory::Auth => (2, 500, 1.5, false, true),
        ErrorCategory::RateLimit => (5, 1000, 1.0, false, true),
        ErrorCategory::Timeout => (2, 2000, 2.0, true, true),
        ErrorCategory::Parsing => (0, 0, 1.0, false, false),
        ErrorCategory::Skill => (2, 0, 1.0, false, true),
        ErrorCategory::External => (3, 1000, 2.0, true, true),
        ErrorCategory::Validation => (0, 0, 1.0, false, false),
        ErrorCategory::Unknown => (1, 1000, 2.0, true, true),
    };

    RecoveryStrategy {
        max_retries,
        base_delay_ms,
        backoff_multiplier,
        use_jitter,
        should_retry,
    }
}

/// Immutable category → strategy mapping.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyTable {
    strategies: BTreeMap<ErrorCategory, RecoveryStrategy>,
}

impl StrategyTable {
    /// Build a table with overrides applied on top of the defaults.
    ///
    /// Categories missing from `overrides` keep their default strategy.
    pub fn with_overrides(overrides: &BTreeMap<ErrorCategory, RecoveryStrategy>) -> Self {
        let strategies = ErrorCategory::ALL
            .into_iter()
            .map(|category| {
                let strategy = overrides
                    .get(&category)
                    .copied()
                    .unwrap_or_else(|| default_strategy(category));
                (category, strategy)
            })
            .collect();

        Self { strategies }
    }

    /// Strategy for a category (always a copy).
    pub fn get(&self, category: ErrorCategory) -> RecoveryStrategy {
        self.strategies
            .get(&category)
            .copied()
            .unwrap_or_else(|| default_strategy(category))
    }

    /// Iterate over all entries in category order.
    pub fn iter(&self) -> impl Iterator<Item = (ErrorCategory, RecoveryStrategy)> + '_ {
        self.strategies.iter().map(|(c, s)| (*c, *s))
    }
}

impl Default for StrategyTable {
    fn default() -> Self {
        Self::with_overrides(&BTreeMap::new())
    }
}
