//! Raw failure reports and classified faults.
//!
//! An [`ErrorReport`] is the text-level view of something that went wrong:
//! message, source chain and a few structured hints. The classifier turns
//! it into a [`Fault`] exactly once, at the boundary; everything downstream
//! works with the typed category instead of re-reading the text.

use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use crate::category::ErrorCategory;

/// Boxed underlying error carried by a [`Fault`].
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Text-level description of a failure, before classification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorReport {
    /// Top-level error message
    pub message: String,

    /// Source chain rendered as text (the "stack")
    pub stack: Option<String>,

    /// Whether the failure was an abort (deadline elapsed, request cancelled)
    pub aborted: bool,

    /// Wait hint supplied by the dependency itself (e.g. `Retry-After`)
    pub retry_after: Option<Duration>,
}

impl ErrorReport {
    /// Create a report from a bare message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    /// Build a report from any error, rendering its source chain as the stack.
    pub fn from_error(err: &(dyn StdError + 'static)) -> Self {
        let mut sources = Vec::new();
        let mut current = err.source();
        while let Some(source) = current {
            sources.push(source.to_string());
            current = source.source();
        }

        Self {
            message: err.to_string(),
            stack: if sources.is_empty() {
                None
            } else {
                Some(sources.join("\n"))
            },
            aborted: false,
            retry_after: None,
        }
    }

    /// Attach a source chain.
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Mark the failure as an abort.
    pub fn aborted(mut self) -> Self {
        self.aborted = true;
        self
    }

    /// Attach a structured retry-after hint.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

impl From<&str> for ErrorReport {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for ErrorReport {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

/// A classified failure.
pub struct Fault {
    /// Category assigned by the classifier
    pub kind: ErrorCategory,

    /// Human-readable message of the original error
    pub message: String,

    /// Explicit wait hint, if the failure carried one
    pub retry_after: Option<Duration>,

    /// The original error, when one was available
    pub cause: Option<BoxError>,
}

impl Fault {
    /// Create a fault without an underlying cause.
    pub fn new(kind: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
            cause: None,
        }
    }

    /// Attach the original error.
    pub fn with_cause(mut self, cause: impl Into<BoxError>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// Attach a retry-after hint.
    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    /// Whether the category allows local retries by default.
    pub fn is_transient(&self) -> bool {
        !self.kind.is_permanent()
    }
}

impl fmt::Debug for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fault")
            .field("kind", &self.kind)
            .field("message", &self.message)
            .field("retry_after", &self.retry_after)
            .field("has_cause", &self.cause.is_some())
            .finish()
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

impl StdError for Fault {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn StdError + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use thiserror::Error;

    #[derive(Error, Debug)]
    #[error("request failed")]
    struct Outer {
        #[source]
        inner: Inner,
    }

    #[derive(Error, Debug)]
    #[error("connection refused")]
    struct Inner;

    #[test]
    fn test_report_renders_source_chain() {
        let err = Outer { inner: Inner };
        let report = ErrorReport::from_error(&err);

        assert_eq!(report.message, "request failed");
        assert_eq!(report.stack.as_deref(), Some("connection refused"));
        assert!(!report.aborted);
    }

    #[test]
    fn test_report_without_sources_has_no_stack() {
        let report = ErrorReport::from_error(&Inner);
        assert!(report.stack.is_none());
    }

    #[test]
    fn test_fault_exposes_cause_as_source() {
        let fault = Fault::new(ErrorCategory::Network, "request failed")
            .with_cause(Outer { inner: Inner });

        let source = fault.source().expect("cause should be exposed");
        assert_eq!(source.to_string(), "request failed");
        assert_eq!(fault.to_string(), "[network] request failed");
    }

    #[test]
    fn test_transient_follows_category() {
        assert!(Fault::new(ErrorCategory::Timeout, "slow").is_transient());
        assert!(!Fault::new(ErrorCategory::Validation, "bad").is_transient());
    }
}
