//! # mender-core
//!
//! Deterministic failure classification and recovery planning.
//!
//! This crate answers, without doing any I/O:
//! - What kind of failure is this?
//! - Is it worth retrying, and how long should we wait?
//! - How healthy is the system, given per-service probe results?
//!
//! ## Key Guarantees
//!
//! 1. **Deterministic**: the same error text always lands in the same category
//! 2. **Exactly one category**: `Unknown` is the fallback, never "no answer"
//! 3. **Immutable strategies**: the table is built once; lookups return copies
//!
//! ## Example
//!
//! ```rust
//! use mender_core::{ErrorCategory, ErrorClassifier, ErrorReport};
//!
//! let classifier = ErrorClassifier::new();
//! let report = ErrorReport::new("connect ECONNREFUSED 127.0.0.1:11434");
//!
//! let category = classifier.classify(&report, Some("ollama chat"));
//! assert_eq!(category, ErrorCategory::Network);
//!
//! let strategy = classifier.strategy(category);
//! assert_eq!(strategy.max_retries, 3);
//! ```

pub mod category;
pub mod classifier;
pub mod fault;
pub mod health;
pub mod strategy;

// Re-export main types at crate root
pub use category::{ErrorCategory, ParseCategoryError};
pub use classifier::{retry_after_from_message, ErrorClassifier};
pub use fault::{BoxError, ErrorReport, Fault};
pub use health::{HealthReport, HealthStatus, ServiceStatus};
pub use strategy::{
    default_strategy, RecoveryStrategy, StrategyTable, JITTER_FRACTION, MAX_BACKOFF,
};
