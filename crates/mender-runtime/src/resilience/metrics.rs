//! Recovery outcome metrics.
//!
//! A bounded ring of [`RecoveryMetric`] entries, oldest evicted first, with
//! per-category success-rate aggregation on read.

use chrono::{DateTime, Utc};
use mender_core::ErrorCategory;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// Default number of outcomes kept.
pub const DEFAULT_METRICS_CAPACITY: usize = 1000;

/// One recovery outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryMetric {
    /// Category of the first failure
    pub category: ErrorCategory,

    /// When the outcome was recorded
    pub timestamp: DateTime<Utc>,

    /// Whether the call eventually produced a value
    pub success: bool,

    /// Attempts consumed, including the initial call
    pub attempts: u32,
}

/// Per-category aggregate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryStats {
    pub total: u64,
    pub success: u64,

    /// `success / total`, or 0.0 when nothing was recorded
    pub rate: f64,
}

/// Aggregates for every category, zeroed where nothing was recorded.
pub type RecoveryStats = BTreeMap<ErrorCategory, CategoryStats>;

/// Bounded buffer of recovery outcomes.
pub struct MetricsRecorder {
    capacity: usize,
    entries: Mutex<VecDeque<RecoveryMetric>>,
}

impl MetricsRecorder {
    /// Create a recorder keeping at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Append an outcome, truncating the oldest entries past capacity.
    pub fn record(&self, category: ErrorCategory, success: bool, attempts: u32) {
        let metric = RecoveryMetric {
            category,
            timestamp: Utc::now(),
            success,
            attempts,
        };

        let mut entries = self.entries.lock();
        entries.push_back(metric);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    /// Copy of the buffer, oldest first.
    pub fn metrics(&self) -> Vec<RecoveryMetric> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Number of buffered outcomes.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of buffered outcomes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Per-category total/success/rate over the current buffer.
    pub fn recovery_stats(&self) -> RecoveryStats {
        let mut stats: RecoveryStats = ErrorCategory::ALL
            .into_iter()
            .map(|c| (c, CategoryStats::default()))
            .collect();

        for metric in self.entries.lock().iter() {
            let entry = stats.entry(metric.category).or_default();
            entry.total += 1;
            if metric.success {
                entry.success += 1;
            }
        }

        for entry in stats.values_mut() {
            if entry.total > 0 {
                entry.rate = entry.success as f64 / entry.total as f64;
            }
        }

        stats
    }

    /// Drop every buffered outcome.
    pub fn reset(&self) {
        self.entries.lock().clear();
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new(DEFAULT_METRICS_CAPACITY)
    }
}

impl std::fmt::Debug for MetricsRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRecorder")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_cover_every_category() {
        let recorder = MetricsRecorder::default();
        let stats = recorder.recovery_stats();

        assert_eq!(stats.len(), ErrorCategory::ALL.len());
        assert!(stats.values().all(|s| s.total == 0 && s.rate == 0.0));
    }

    #[test]
    fn test_success_rate_per_category() {
        let recorder = MetricsRecorder::default();
        recorder.record(ErrorCategory::Network, true, 2);
        recorder.record(ErrorCategory::Network, false, 4);
        recorder.record(ErrorCategory::Network, true, 3);
        recorder.record(ErrorCategory::Parsing, false, 1);

        let stats = recorder.recovery_stats();
        let network = stats[&ErrorCategory::Network];
        assert_eq!(network.total, 3);
        assert_eq!(network.success, 2);
        assert!((network.rate - 2.0 / 3.0).abs() < f64::EPSILON);

        let parsing = stats[&ErrorCategory::Parsing];
        assert_eq!(parsing.total, 1);
        assert_eq!(parsing.rate, 0.0);
    }

    #[test]
    fn test_buffer_truncates_oldest_first() {
        let recorder = MetricsRecorder::new(3);
        recorder.record(ErrorCategory::Auth, false, 3);
        recorder.record(ErrorCategory::Network, true, 2);
        recorder.record(ErrorCategory::Network, true, 2);
        recorder.record(ErrorCategory::Timeout, true, 2);

        let metrics = recorder.metrics();
        assert_eq!(metrics.len(), 3);
        assert_eq!(metrics[0].category, ErrorCategory::Network);
        assert_eq!(metrics[2].category, ErrorCategory::Timeout);
        assert_eq!(recorder.recovery_stats()[&ErrorCategory::Auth].total, 0);
    }

    #[test]
    fn test_default_capacity() {
        let recorder = MetricsRecorder::default();
        for _ in 0..(DEFAULT_METRICS_CAPACITY + 25) {
            recorder.record(ErrorCategory::Unknown, true, 2);
        }
        assert_eq!(recorder.len(), DEFAULT_METRICS_CAPACITY);
    }

    #[test]
    fn test_stats_read_is_idempotent() {
        let recorder = MetricsRecorder::default();
        recorder.record(ErrorCategory::External, true, 2);
        recorder.record(ErrorCategory::External, false, 4);

        assert_eq!(recorder.recovery_stats(), recorder.recovery_stats());
        assert_eq!(recorder.len(), 2);
    }

    #[test]
    fn test_reset() {
        let recorder = MetricsRecorder::default();
        recorder.record(ErrorCategory::Skill, true, 2);
        recorder.reset();
        assert!(recorder.is_empty());
    }
}
