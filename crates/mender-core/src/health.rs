//! Health value types and aggregation.
//!
//! These are the serialized shapes handed to liveness/readiness endpoints.
//! Timestamps serialize as epoch milliseconds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Liveness of a single dependency (or of the whole system).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl ServiceStatus {
    /// Aggregate per-service statuses.
    ///
    /// `Unhealthy` if any service is unhealthy, else `Degraded` if any is
    /// degraded, else `Healthy`. `Unknown` entries do not pull the result down.
    pub fn aggregate<I>(statuses: I) -> ServiceStatus
    where
        I: IntoIterator<Item = ServiceStatus>,
    {
        let mut overall = ServiceStatus::Healthy;
        for status in statuses {
            match status {
                ServiceStatus::Unhealthy => return ServiceStatus::Unhealthy,
                ServiceStatus::Degraded => overall = ServiceStatus::Degraded,
                ServiceStatus::Healthy | ServiceStatus::Unknown => {}
            }
        }
        overall
    }

    /// Whether a call to a dependency in this state is worth attempting.
    pub fn is_usable(&self) -> bool {
        matches!(self, ServiceStatus::Healthy | ServiceStatus::Degraded)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Healthy => "healthy",
            ServiceStatus::Degraded => "degraded",
            ServiceStatus::Unhealthy => "unhealthy",
            ServiceStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of the most recent probe of one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    /// Service name (e.g. "ollama")
    pub service: String,

    /// Probe outcome
    pub status: ServiceStatus,

    /// Round-trip time of the probe, when the service answered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,

    /// When the probe ran (epoch millis on the wire)
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_checked: DateTime<Utc>,

    /// Failure detail ("HTTP 500", connection error text)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthStatus {
    /// Placeholder for a service that has never been probed.
    pub fn unknown(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            status: ServiceStatus::Unknown,
            response_time_ms: None,
            last_checked: DateTime::<Utc>::UNIX_EPOCH,
            error: None,
        }
    }

    /// The service answered with a success status.
    pub fn healthy(service: impl Into<String>, response_time_ms: u64) -> Self {
        Self {
            service: service.into(),
            status: ServiceStatus::Healthy,
            response_time_ms: Some(response_time_ms),
            last_checked: Utc::now(),
            error: None,
        }
    }

    /// The service answered, but not with a success status.
    pub fn degraded(service: impl Into<String>, response_time_ms: u64, http_status: u16) -> Self {
        Self {
            service: service.into(),
            status: ServiceStatus::Degraded,
            response_time_ms: Some(response_time_ms),
            last_checked: Utc::now(),
            error: Some(format!("HTTP {http_status}")),
        }
    }

    /// The service could not be reached.
    pub fn unhealthy(service: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            status: ServiceStatus::Unhealthy,
            response_time_ms: None,
            last_checked: Utc::now(),
            error: Some(error.into()),
        }
    }
}

/// Aggregated health of every configured dependency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub overall: ServiceStatus,
    pub services: Vec<HealthStatus>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

impl HealthReport {
    /// Build a report, computing the overall status from `services`.
    pub fn from_services(services: Vec<HealthStatus>) -> Self {
        let overall = ServiceStatus::aggregate(services.iter().map(|s| s.status));
        Self {
            overall,
            services,
            timestamp: Utc::now(),
        }
    }

    /// Readiness: anything short of unhealthy can take traffic.
    pub fn is_ready(&self) -> bool {
        self.overall != ServiceStatus::Unhealthy
    }

    /// Status of a single service, if it is part of the report.
    pub fn service(&self, name: &str) -> Option<&HealthStatus> {
        self.services.iter().find(|s| s.service == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_prefers_worst_status() {
        use ServiceStatus::*;
        assert_eq!(ServiceStatus::aggregate([Healthy, Healthy]), Healthy);
        assert_eq!(ServiceStatus::aggregate([Healthy, Degraded]), Degraded);
        assert_eq!(ServiceStatus::aggregate([Degraded, Unhealthy, Healthy]), Unhealthy);
        assert_eq!(ServiceStatus::aggregate([Unknown, Healthy]), Healthy);
        assert_eq!(ServiceStatus::aggregate(std::iter::empty()), Healthy);
    }

    #[test]
    fn test_report_readiness() {
        let report = HealthReport::from_services(vec![
            HealthStatus::healthy("ollama", 50),
            HealthStatus::degraded("comfyui", 12, 500),
        ]);
        assert_eq!(report.overall, ServiceStatus::Degraded);
        assert!(report.is_ready());
        assert_eq!(report.service("comfyui").and_then(|s| s.error.as_deref()), Some("HTTP 500"));

        let report = HealthReport::from_services(vec![
            HealthStatus::healthy("ollama", 50),
            HealthStatus::unhealthy("comfyui", "connection refused"),
        ]);
        assert_eq!(report.overall, ServiceStatus::Unhealthy);
        assert!(!report.is_ready());
    }

    #[test]
    fn test_status_serializes_camel_case_with_millis() {
        let mut status = HealthStatus::healthy("ollama", 42);
        status.last_checked = DateTime::<Utc>::from_timestamp_millis(1_700_000_000_123).unwrap();

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["service"], "ollama");
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["responseTimeMs"], 42);
        assert_eq!(json["lastChecked"], 1_700_000_000_123i64);
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_usable_statuses() {
        assert!(ServiceStatus::Healthy.is_usable());
        assert!(ServiceStatus::Degraded.is_usable());
        assert!(!ServiceStatus::Unhealthy.is_usable());
        assert!(!ServiceStatus::Unknown.is_usable());
    }
}
