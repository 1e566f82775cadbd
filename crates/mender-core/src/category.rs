//! Failure categories.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// The closed set of failure kinds a fault can be classified into.
///
/// Declaration order is the classification priority order, with
/// `Unknown` last as the unmatched fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Connection refused/reset, DNS failures, socket hang-ups
    Network,

    /// Rejected or expired credentials
    Auth,

    /// The dependency asked us to slow down
    RateLimit,

    /// The call did not finish in time or was aborted
    Timeout,

    /// Malformed payloads; retrying cannot help
    Parsing,

    /// Internal handler (skill) failures
    Skill,

    /// A named external service reported an error
    External,

    /// Malformed caller input; retrying cannot help
    Validation,

    /// Nothing matched
    Unknown,
}

impl ErrorCategory {
    /// All categories in classification priority order.
    pub const ALL: [ErrorCategory; 9] = [
        ErrorCategory::Network,
        ErrorCategory::Auth,
        ErrorCategory::RateLimit,
        ErrorCategory::Timeout,
        ErrorCategory::Parsing,
        ErrorCategory::Skill,
        ErrorCategory::External,
        ErrorCategory::Validation,
        ErrorCategory::Unknown,
    ];

    /// Stable snake_case name, as used in config files and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Auth => "auth",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Parsing => "parsing",
            ErrorCategory::Skill => "skill",
            ErrorCategory::External => "external",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Unknown => "unknown",
        }
    }

    /// Whether faults of this kind are permanent (never retried by default).
    pub fn is_permanent(&self) -> bool {
        matches!(self, ErrorCategory::Parsing | ErrorCategory::Validation)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when parsing an unrecognised category name.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown error category: '{0}'")]
pub struct ParseCategoryError(pub String);

impl FromStr for ErrorCategory {
    type Err = ParseCategoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        ErrorCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == normalized)
            .ok_or_else(|| ParseCategoryError(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trips_through_str() {
        for category in ErrorCategory::ALL {
            assert_eq!(category.as_str().parse::<ErrorCategory>(), Ok(category));
        }
    }

    #[test]
    fn test_parse_accepts_hyphenated_names() {
        assert_eq!("rate-limit".parse(), Ok(ErrorCategory::RateLimit));
        assert_eq!(" Timeout ".parse(), Ok(ErrorCategory::Timeout));
        assert!("bogus".parse::<ErrorCategory>().is_err());
    }

    #[test]
    fn test_serde_uses_snake_case() {
        let json = serde_json::to_string(&ErrorCategory::RateLimit).unwrap();
        assert_eq!(json, "\"rate_limit\"");
    }

    #[test]
    fn test_only_parsing_and_validation_are_permanent() {
        let permanent: Vec<_> = ErrorCategory::ALL
            .into_iter()
            .filter(ErrorCategory::is_permanent)
            .collect();
        assert_eq!(permanent, vec![ErrorCategory::Parsing, ErrorCategory::Validation]);
    }
}
