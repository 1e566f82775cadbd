//! Failure classification.
//!
//! Classification runs over one lowercased text blob built from the error
//! message, its source chain and an optional caller context. Each category
//! has an ordered pattern set; categories are tried in priority order and
//! the first match wins.

use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::category::ErrorCategory;
use crate::fault::{ErrorReport, Fault};
use crate::strategy::{RecoveryStrategy, StrategyTable};

lazy_static! {
    // =========================================================================
    // CATEGORY PATTERNS (priority order)
    // =========================================================================

    static ref NETWORK_PATTERNS: Vec<Regex> = compile(&[
        r"econnrefused",
        r"enotfound",
        r"etimedout",
        r"econnreset",
        r"network\s+error",
        r"connection\s+(refused|reset|timeout|timed?\s*out)",
        r"fetch\s+failed",
        r"socket\s+hang\s+up",
    ]);

    static ref AUTH_PATTERNS: Vec<Regex> = compile(&[
        r"401\s+unauthorized",
        r"403\s+forbidden",
        r"authentication\s+(failed|error)",
        r"invalid\s+(token|credentials)",
        r"token\s+expired",
        r"unauthorized",
        r"permission\s+denied",
    ]);

    static ref RATE_LIMIT_PATTERNS: Vec<Regex> = compile(&[
        r"429\s+too\s+many\s+requests",
        r"rate\s+limit",
        r"too\s+many\s+requests",
        r"retry-?after",
        r"rate\s+limited",
    ]);

    static ref TIMEOUT_PATTERNS: Vec<Regex> = compile(&[
        r"timeout",
        r"timed?\s*out",
        r"took\s+too\s+long",
        r"request\s+timeout",
        r"abort",
    ]);

    static ref PARSING_PATTERNS: Vec<Regex> = compile(&[
        r"json\.parse",
        r"unexpected\s+token",
        r"invalid\s+json",
        r"syntax\s+error",
        r"cannot\s+parse",
        r"parse\s+(error|failed)",
    ]);

    static ref SKILL_PATTERNS: Vec<Regex> = compile(&[
        r"skill\s+not\s+found",
        r"skill\s+error",
        r"handler\s+failed",
        r"skill\s+execution",
    ]);

    static ref EXTERNAL_PATTERNS: Vec<Regex> = compile(&[
        r"ollama",
        r"comfyui",
        r"discord\s+api",
        r"external\s+service",
        r"api\s+error",
    ]);

    static ref VALIDATION_PATTERNS: Vec<Regex> = compile(&[
        r"invalid\s+(input|argument|param)",
        r"validation\s+failed",
        r"required\s+field",
        r"must\s+be\s+(string|number|boolean)",
        r"invalid\s+format",
    ]);

    // =========================================================================
    // RETRY-AFTER HINTS
    // =========================================================================

    /// "retry-after: 30", "Retry-After 30"
    static ref RETRY_AFTER_HEADER: Regex =
        Regex::new(r"(?i)retry-?after\s*[:\s]*(\d+)").unwrap();

    /// "try again in 30 seconds"
    static ref RETRY_AFTER_SECONDS: Regex =
        Regex::new(r"(?i)(\d+)\s*seconds?").unwrap();
}

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(&format!("(?i){p}")).unwrap())
        .collect()
}

/// Pattern set for a category, or `None` for `Unknown`.
fn patterns_for(category: ErrorCategory) -> Option<&'static [Regex]> {
    let patterns: &'static Vec<Regex> = match category {
        ErrorCategory::Network => &*NETWORK_PATTERNS,
        ErrorCategory::Auth => &*AUTH_PATTERNS,
        ErrorCategory::RateLimit => &*RATE_LIMIT_PATTERNS,
        ErrorCategory::Timeout => &*TIMEOUT_PATTERNS,
        ErrorCategory::Parsing => &*PARSING_PATTERNS,
        ErrorCategory::Skill => &*SKILL_PATTERNS,
        ErrorCategory::External => &*EXTERNAL_PATTERNS,
        ErrorCategory::Validation => &*VALIDATION_PATTERNS,
        ErrorCategory::Unknown => return None,
    };
    Some(patterns.as_slice())
}

/// Maps failures to categories and categories to recovery strategies.
#[derive(Debug, Clone, Default)]
pub struct ErrorClassifier {
    strategies: StrategyTable,
}

impl ErrorClassifier {
    /// Create a classifier backed by the default strategy table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a classifier with a custom strategy table.
    pub fn with_strategies(strategies: StrategyTable) -> Self {
        Self { strategies }
    }

    /// Create a classifier whose table applies `overrides` to the defaults.
    pub fn with_overrides(overrides: &BTreeMap<ErrorCategory, RecoveryStrategy>) -> Self {
        Self::with_strategies(StrategyTable::with_overrides(overrides))
    }

    /// Assign exactly one category to a failure.
    pub fn classify(&self, report: &ErrorReport, context: Option<&str>) -> ErrorCategory {
        let combined = format!(
            "{} {} {}",
            report.message,
            report.stack.as_deref().unwrap_or(""),
            context.unwrap_or("")
        )
        .to_lowercase();

        for category in ErrorCategory::ALL {
            let Some(patterns) = patterns_for(category) else {
                continue;
            };
            if patterns.iter().any(|p| p.is_match(&combined)) {
                return category;
            }
        }

        let message = report.message.as_str();
        if message.contains("fetch failed") || message.contains("ECONNREFUSED") {
            return ErrorCategory::Network;
        }

        if message.contains("timeout") || report.aborted {
            return ErrorCategory::Timeout;
        }

        if message.contains("JSON") || message.contains("parse") {
            return ErrorCategory::Parsing;
        }

        ErrorCategory::Unknown
    }

    /// Classify once and produce a typed [`Fault`].
    pub fn to_fault(&self, report: &ErrorReport, context: Option<&str>) -> Fault {
        let kind = self.classify(report, context);
        tracing::debug!(category = %kind, message = %report.message, "Classified failure");
        Fault::new(kind, report.message.clone()).with_retry_after(self.retry_after(report))
    }

    /// Strategy for a category (a copy, never a shared reference).
    pub fn strategy(&self, category: ErrorCategory) -> RecoveryStrategy {
        self.strategies.get(category)
    }

    /// The strategy table this classifier hands out.
    pub fn strategies(&self) -> &StrategyTable {
        &self.strategies
    }

    /// Explicit wait hint for a failure.
    ///
    /// A structured hint on the report wins; otherwise the message text is
    /// searched for "retry-after: N" and then "N seconds".
    pub fn retry_after(&self, report: &ErrorReport) -> Option<Duration> {
        report
            .retry_after
            .or_else(|| retry_after_from_message(&report.message))
    }
}

/// Extract a wait hint (in whole seconds) from free text.
pub fn retry_after_from_message(message: &str) -> Option<Duration> {
    let seconds = RETRY_AFTER_HEADER
        .captures(message)
        .or_else(|| RETRY_AFTER_SECONDS.captures(message))
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u64>().ok())?;

    Some(Duration::from_secs(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn classify(message: &str) -> ErrorCategory {
        ErrorClassifier::new().classify(&ErrorReport::new(message), None)
    }

    #[test]
    fn test_network_errors() {
        assert_eq!(classify("connect ECONNREFUSED 127.0.0.1:11434"), ErrorCategory::Network);
        assert_eq!(classify("getaddrinfo ENOTFOUND comfyui.local"), ErrorCategory::Network);
        assert_eq!(classify("socket hang up"), ErrorCategory::Network);
        assert_eq!(classify("Connection reset by peer"), ErrorCategory::Network);
    }

    #[test]
    fn test_auth_errors() {
        assert_eq!(classify("401 Unauthorized"), ErrorCategory::Auth);
        assert_eq!(classify("Invalid token supplied"), ErrorCategory::Auth);
        assert_eq!(classify("permission denied for channel"), ErrorCategory::Auth);
    }

    #[test]
    fn test_rate_limit_errors() {
        assert_eq!(classify("429 Too Many Requests"), ErrorCategory::RateLimit);
        assert_eq!(classify("You are being rate limited"), ErrorCategory::RateLimit);
    }

    #[test]
    fn test_timeout_errors() {
        assert_eq!(classify("Request timed out after 5000ms"), ErrorCategory::Timeout);
        assert_eq!(classify("The operation was aborted"), ErrorCategory::Timeout);
    }

    #[test]
    fn test_parsing_errors() {
        assert_eq!(classify("Unexpected token < in JSON at position 0"), ErrorCategory::Parsing);
        assert_eq!(classify("invalid json body"), ErrorCategory::Parsing);
    }

    #[test]
    fn test_skill_errors() {
        assert_eq!(classify("Skill not found: weather"), ErrorCategory::Skill);
        assert_eq!(classify("calendar handler failed"), ErrorCategory::Skill);
    }

    #[test]
    fn test_external_errors() {
        assert_eq!(classify("Ollama error 500: model not loaded"), ErrorCategory::External);
        assert_eq!(classify("Discord API returned 500"), ErrorCategory::External);
    }

    #[test]
    fn test_validation_errors() {
        assert_eq!(classify("invalid input: date"), ErrorCategory::Validation);
        assert_eq!(classify("title must be string"), ErrorCategory::Validation);
    }

    #[test]
    fn test_priority_order_network_before_timeout() {
        // Matches both network ("etimedout") and timeout ("timed out").
        assert_eq!(classify("connect ETIMEDOUT, request timed out"), ErrorCategory::Network);
    }

    #[test]
    fn test_unknown_fallback() {
        assert_eq!(classify("something odd happened"), ErrorCategory::Unknown);
    }

    #[test]
    fn test_context_participates_in_matching() {
        let classifier = ErrorClassifier::new();
        let report = ErrorReport::new("boom");
        assert_eq!(classifier.classify(&report, Some("calendar skill error")), ErrorCategory::Skill);
        assert_eq!(classifier.classify(&report, None), ErrorCategory::Unknown);
    }

    #[test]
    fn test_stack_participates_in_matching() {
        let report = ErrorReport::new("request failed").with_stack("connection refused");
        assert_eq!(ErrorClassifier::new().classify(&report, None), ErrorCategory::Network);
    }

    #[test]
    fn test_abort_flag_falls_back_to_timeout() {
        let report = ErrorReport::new("deadline elapsed").aborted();
        assert_eq!(ErrorClassifier::new().classify(&report, None), ErrorCategory::Timeout);
    }

    #[test]
    fn test_strategy_is_a_copy() {
        let classifier = ErrorClassifier::new();
        let mut strategy = classifier.strategy(ErrorCategory::Auth);
        strategy.max_retries = 42;
        assert_eq!(classifier.strategy(ErrorCategory::Auth).max_retries, 2);
    }

    #[test]
    fn test_retry_after_from_text() {
        assert_eq!(
            retry_after_from_message("429: retry-after: 12"),
            Some(Duration::from_secs(12))
        );
        assert_eq!(
            retry_after_from_message("Rate limited, try again in 3 seconds"),
            Some(Duration::from_secs(3))
        );
        assert_eq!(retry_after_from_message("rate limit"), None);
    }

    #[test]
    fn test_structured_retry_after_wins() {
        let report = ErrorReport::new("retry-after: 12").with_retry_after(Duration::from_millis(250));
        assert_eq!(
            ErrorClassifier::new().retry_after(&report),
            Some(Duration::from_millis(250))
        );
    }

    #[test]
    fn test_to_fault_carries_kind_and_hint() {
        let fault = ErrorClassifier::new()
            .to_fault(&ErrorReport::new("rate limit hit, retry-after: 4"), None);
        assert_eq!(fault.kind, ErrorCategory::RateLimit);
        assert_eq!(fault.retry_after, Some(Duration::from_secs(4)));
    }

    proptest! {
        #[test]
        fn prop_network_wins_regardless_of_context(context in "[ -~]{0,64}") {
            let classifier = ErrorClassifier::new();
            let report = ErrorReport::new("connect ECONNREFUSED 127.0.0.1:8188");
            prop_assert_eq!(classifier.classify(&report, Some(&context)), ErrorCategory::Network);
        }

        #[test]
        fn prop_classification_is_deterministic(message in "[ -~]{0,80}") {
            let classifier = ErrorClassifier::new();
            let report = ErrorReport::new(message);
            prop_assert_eq!(
                classifier.classify(&report, None),
                classifier.classify(&report, None)
            );
        }
    }
}
