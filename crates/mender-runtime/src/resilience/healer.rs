//! Self-healing execution.
//!
//! [`SelfHealer::execute_with_healing`] runs a fallible async operation,
//! classifies the first failure once, then retries according to the
//! category's [`RecoveryStrategy`](mender_core::RecoveryStrategy). When
//! retries are exhausted an optional fallback gets one shot. Every outcome
//! past the first attempt lands in the [`MetricsRecorder`].

use futures::future::BoxFuture;
use mender_core::{ErrorCategory, ErrorClassifier, ErrorReport, Fault, MAX_BACKOFF};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::metrics::{MetricsRecorder, RecoveryMetric, RecoveryStats};
use crate::providers::ProviderError;

/// Fallback producer, invoked at most once after retries are exhausted.
pub type Fallback<T> = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<T>> + Send>;

/// Observer called before each retry with the most recent fault (the
/// initial failure before the first retry, then the latest retry's), the
/// retry number (1-based) and the category of the first failure.
pub type RetryHook = Box<dyn Fn(&Fault, u32, ErrorCategory) + Send + Sync>;

/// Observer called once a retry succeeds, with the initial fault that was
/// healed, its category and the total attempts consumed.
pub type HealHook = Box<dyn Fn(&Fault, ErrorCategory, u32) + Send + Sync>;

/// Per-call options for [`SelfHealer::execute_with_healing`].
pub struct HealingOptions<T> {
    /// Extra text folded into classification (e.g. "skill execution: weather")
    pub context: Option<String>,
    pub fallback: Option<Fallback<T>>,
    pub on_retry: Option<RetryHook>,
    pub on_heal: Option<HealHook>,
}

impl<T> Default for HealingOptions<T> {
    fn default() -> Self {
        Self {
            context: None,
            fallback: None,
            on_retry: None,
            on_heal: None,
        }
    }
}

impl<T> HealingOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the classification context.
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Set the fallback producer.
    pub fn fallback<F, Fut>(mut self, fallback: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: 'static,
    {
        self.fallback = Some(Box::new(move || Box::pin(fallback())));
        self
    }

    pub fn on_retry<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Fault, u32, ErrorCategory) + Send + Sync + 'static,
    {
        self.on_retry = Some(Box::new(hook));
        self
    }

    pub fn on_heal<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Fault, ErrorCategory, u32) + Send + Sync + 'static,
    {
        self.on_heal = Some(Box::new(hook));
        self
    }
}

/// Outcome of a healed call.
#[derive(Debug)]
pub struct HealingResult<T> {
    pub success: bool,
    pub data: Option<T>,

    /// Last fault seen, when the call failed
    pub error: Option<Fault>,

    /// Category of the first failure, when there was one
    pub category: Option<ErrorCategory>,

    /// Attempts consumed, including the initial call (>= 1)
    pub attempts: u32,

    /// True only when success came from a retry or the fallback
    pub healed: bool,
}

impl<T> HealingResult<T> {
    fn succeeded(data: T, attempts: u32, healed: bool, category: Option<ErrorCategory>) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            category,
            attempts,
            healed,
        }
    }

    fn failed(error: Fault, category: ErrorCategory, attempts: u32) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            category: Some(category),
            attempts,
            healed: false,
        }
    }

    /// Collapse into a plain `Result`.
    pub fn into_result(self) -> Result<T, Fault> {
        match self.data {
            Some(data) => Ok(data),
            None => Err(self
                .error
                .unwrap_or_else(|| Fault::new(ErrorCategory::Unknown, "operation failed"))),
        }
    }
}

/// Retry/fallback orchestrator.
#[derive(Debug, Clone)]
pub struct SelfHealer {
    classifier: Arc<ErrorClassifier>,
    metrics: Arc<MetricsRecorder>,
    max_delay: Duration,
}

impl Default for SelfHealer {
    fn default() -> Self {
        Self::new(
            Arc::new(ErrorClassifier::new()),
            Arc::new(MetricsRecorder::default()),
        )
    }
}

impl SelfHealer {
    pub fn new(classifier: Arc<ErrorClassifier>, metrics: Arc<MetricsRecorder>) -> Self {
        Self {
            classifier,
            metrics,
            max_delay: MAX_BACKOFF,
        }
    }

    /// Cap on any single backoff wait.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    /// Classify an error the way the retry loop would.
    pub fn classify(&self, err: &anyhow::Error, context: Option<&str>) -> ErrorCategory {
        self.classifier.classify(&report_of(err), context)
    }

    /// Run `operation`, retrying and falling back according to the
    /// category of its first failure.
    pub async fn execute_with_healing<T, F, Fut>(
        &self,
        mut operation: F,
        options: HealingOptions<T>,
    ) -> HealingResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let HealingOptions {
            context,
            fallback,
            on_retry,
            on_heal,
        } = options;
        let context = context.as_deref();

        let first_error = match operation().await {
            Ok(data) => return HealingResult::succeeded(data, 1, false, None),
            Err(err) => err,
        };

        let report = report_of(&first_error);
        let category = self.classifier.classify(&report, context);
        let strategy = self.classifier.strategy(category);
        let initial_fault = self.fault(category, &report, first_error);

        if !strategy.should_retry {
            tracing::debug!(%category, error = %initial_fault.message, "Failure is not retryable");
            self.metrics.record(category, false, 1);
            return HealingResult::failed(initial_fault, category, 1);
        }

        // Faults from retries; the initial one stays intact for `on_heal`
        let mut retry_fault: Option<Fault> = None;
        // Wait hint from a failed retry, applied to the next wait only
        let mut hint: Option<Duration> = None;

        for attempt in 1..=strategy.max_retries {
            let latest = retry_fault.as_ref().unwrap_or(&initial_fault);
            if let Some(hook) = &on_retry {
                hook(latest, attempt, category);
            }

            let delay = hint.take().unwrap_or_else(|| {
                strategy.delay_for_attempt(attempt, rand::random::<f64>(), self.max_delay)
            });
            tracing::warn!(
                %category,
                attempt,
                max_retries = strategy.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %latest.message,
                "Retrying after failure"
            );
            tokio::time::sleep(delay).await;

            match operation().await {
                Ok(data) => {
                    let attempts = attempt + 1;
                    if let Some(hook) = &on_heal {
                        hook(&initial_fault, category, attempts);
                    }
                    tracing::info!(%category, attempts, "Recovered after retry");
                    self.metrics.record(category, true, attempts);
                    return HealingResult::succeeded(data, attempts, true, Some(category));
                }
                Err(err) => {
                    let report = report_of(&err);
                    let fault = self.fault(category, &report, err);
                    // Only waits still ahead of us can use the hint
                    if attempt < strategy.max_retries {
                        hint = retry_hint(category, &fault);
                    }
                    retry_fault = Some(fault);
                }
            }
        }

        let attempts = strategy.max_retries + 1;
        let last_fault = retry_fault.unwrap_or(initial_fault);

        if let Some(fallback) = fallback {
            tracing::info!(%category, attempts, "Retries exhausted, trying fallback");
            match fallback().await {
                Ok(data) => {
                    self.metrics.record(category, true, attempts);
                    return HealingResult::succeeded(data, attempts, true, Some(category));
                }
                Err(err) => {
                    tracing::warn!(%category, error = %err, "Fallback failed");
                }
            }
        }

        tracing::error!(%category, attempts, error = %last_fault.message, "Recovery failed");
        self.metrics.record(category, false, attempts);
        HealingResult::failed(last_fault, category, attempts)
    }

    /// Per-category total/success/rate.
    pub fn recovery_stats(&self) -> RecoveryStats {
        self.metrics.recovery_stats()
    }

    /// Snapshot of recorded outcomes, oldest first.
    pub fn metrics(&self) -> Vec<RecoveryMetric> {
        self.metrics.metrics()
    }

    pub fn recorder(&self) -> &Arc<MetricsRecorder> {
        &self.metrics
    }

    fn fault(&self, category: ErrorCategory, report: &ErrorReport, err: anyhow::Error) -> Fault {
        Fault::new(category, report.message.clone())
            .with_retry_after(self.classifier.retry_after(report))
            .with_cause(err)
    }
}

fn retry_hint(category: ErrorCategory, fault: &Fault) -> Option<Duration> {
    if category == ErrorCategory::RateLimit {
        fault.retry_after
    } else {
        None
    }
}

/// Text-level view of an `anyhow` error chain.
///
/// The top-level message becomes the report message and the remaining
/// chain becomes the stack. Deadline and request timeouts anywhere in the
/// chain mark the report as aborted; a rate-limit rejection contributes its
/// structured retry-after hint.
pub fn report_of(err: &anyhow::Error) -> ErrorReport {
    let mut report = ErrorReport::new(err.to_string());

    let sources: Vec<String> = err.chain().skip(1).map(|e| e.to_string()).collect();
    if !sources.is_empty() {
        report.stack = Some(sources.join("\n"));
    }

    for cause in err.chain() {
        if cause.is::<tokio::time::error::Elapsed>() {
            report.aborted = true;
        } else if let Some(http) = cause.downcast_ref::<reqwest::Error>() {
            if http.is_timeout() {
                report.aborted = true;
            }
        } else if let Some(provider) = cause.downcast_ref::<ProviderError>() {
            match provider {
                ProviderError::Timeout { .. } => report.aborted = true,
                ProviderError::RateLimited {
                    retry_after: Some(wait),
                    ..
                } => report.retry_after = Some(*wait),
                _ => {}
            }
        }
    }

    report
}
