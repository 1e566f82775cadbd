//! Dependency health monitoring.
//!
//! [`HealthMonitor`] keeps the last probe result per service and only
//! re-probes once it is older than the refresh interval, or when forced.
//! Probes are bounded by a timeout; an answer with a non-success status
//! counts as degraded, no answer at all as unhealthy.

use async_trait::async_trait;
use mender_core::{HealthReport, HealthStatus, ServiceStatus};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Health monitoring settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Age after which a cached status is re-probed
    #[serde(with = "crate::config::duration_str")]
    pub refresh_interval: Duration,

    /// Deadline for a single probe
    #[serde(with = "crate::config::duration_str")]
    pub probe_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

/// Raw result of one probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The service answered with this HTTP status
    Responded { status: u16 },

    /// The service could not be reached
    Failed { message: String },
}

/// A liveness probe for one named service.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Service name the result is filed under.
    fn service(&self) -> &str;

    /// Run the probe. Implementations bound their own duration.
    async fn probe(&self) -> ProbeOutcome;
}

/// `GET` probe against a fixed URL.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    service: String,
    url: String,
    http: reqwest::Client,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(
        service: impl Into<String>,
        url: impl Into<String>,
        http: reqwest::Client,
        timeout: Duration,
    ) -> Self {
        Self {
            service: service.into(),
            url: url.into(),
            http,
            timeout,
        }
    }

    /// Probe for an Ollama server (`GET /api/tags`).
    pub fn ollama(base_url: &str, http: reqwest::Client, timeout: Duration) -> Self {
        let url = format!("{}/api/tags", base_url.trim_end_matches('/'));
        Self::new("ollama", url, http, timeout)
    }

    /// Probe for a ComfyUI server (`GET /system_stats`).
    pub fn comfyui(base_url: &str, http: reqwest::Client, timeout: Duration) -> Self {
        let url = format!("{}/system_stats", base_url.trim_end_matches('/'));
        Self::new("comfyui", url, http, timeout)
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    fn service(&self) -> &str {
        &self.service
    }

    async fn probe(&self) -> ProbeOutcome {
        match self.http.get(&self.url).timeout(self.timeout).send().await {
            Ok(response) => ProbeOutcome::Responded {
                status: response.status().as_u16(),
            },
            Err(e) if e.is_timeout() => ProbeOutcome::Failed {
                message: format!("Health check timed out after {}ms", self.timeout.as_millis()),
            },
            Err(e) => ProbeOutcome::Failed {
                message: e.to_string(),
            },
        }
    }
}

/// Answer to "should I even try calling this service?".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Readiness {
    /// True when the service is healthy or degraded
    pub healthy: bool,
    pub status: ServiceStatus,
}

#[derive(Debug, Clone)]
struct CachedStatus {
    status: HealthStatus,
    checked_at: Instant,
}

/// Cached health of every registered dependency.
pub struct HealthMonitor {
    probes: Vec<Arc<dyn HealthProbe>>,
    refresh_interval: Duration,
    cache: RwLock<HashMap<String, CachedStatus>>,
}

impl HealthMonitor {
    /// Create a monitor with no probes.
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            probes: Vec::new(),
            refresh_interval: config.refresh_interval,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Monitor for the Ollama and ComfyUI servers at the given URLs.
    pub fn for_services(
        config: &HealthConfig,
        http: reqwest::Client,
        ollama_url: &str,
        comfyui_url: &str,
    ) -> Self {
        Self::new(config)
            .with_probe(HttpProbe::ollama(ollama_url, http.clone(), config.probe_timeout))
            .with_probe(HttpProbe::comfyui(comfyui_url, http, config.probe_timeout))
    }

    /// Register a probe. A later probe for the same service replaces it.
    pub fn with_probe(mut self, probe: impl HealthProbe + 'static) -> Self {
        self.register(Arc::new(probe));
        self
    }

    /// Register a shared probe. A later probe for the same service replaces it.
    pub fn register(&mut self, probe: Arc<dyn HealthProbe>) {
        self.probes.retain(|p| p.service() != probe.service());
        self.probes.push(probe);
    }

    /// Registered service names, in registration order.
    pub fn services(&self) -> Vec<&str> {
        self.probes.iter().map(|p| p.service()).collect()
    }

    /// Status of `service`, from cache when fresh unless `force` is set.
    pub async fn check(&self, service: &str, force: bool) -> HealthStatus {
        if !force {
            if let Some(cached) = self.fresh(service) {
                return cached;
            }
        }

        let Some(probe) = self.probes.iter().find(|p| p.service() == service) else {
            let mut status = HealthStatus::unknown(service);
            status.error = Some(format!("no health probe registered for {service}"));
            return status;
        };

        let started = Instant::now();
        let outcome = probe.probe().await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let status = match outcome {
            ProbeOutcome::Responded { status } if (200..300).contains(&status) => {
                HealthStatus::healthy(service, elapsed_ms)
            }
            ProbeOutcome::Responded { status } => {
                tracing::warn!(service, http_status = status, "Service degraded");
                HealthStatus::degraded(service, elapsed_ms, status)
            }
            ProbeOutcome::Failed { message } => {
                tracing::error!(service, error = %message, "Service unreachable");
                HealthStatus::unhealthy(service, message)
            }
        };

        self.cache.write().insert(
            service.to_string(),
            CachedStatus {
                status: status.clone(),
                checked_at: Instant::now(),
            },
        );

        status
    }

    pub async fn check_ollama(&self, force: bool) -> HealthStatus {
        self.check("ollama", force).await
    }

    pub async fn check_comfyui(&self, force: bool) -> HealthStatus {
        self.check("comfyui", force).await
    }

    /// Check every registered service concurrently and aggregate.
    pub async fn overall_health(&self, force: bool) -> HealthReport {
        let checks = self.probes.iter().map(|p| self.check(p.service(), force));
        let services = futures::future::join_all(checks).await;
        HealthReport::from_services(services)
    }

    /// Last known status of `service` without probing.
    pub fn cached_status(&self, service: &str) -> HealthStatus {
        self.cache
            .read()
            .get(service)
            .map(|c| c.status.clone())
            .unwrap_or_else(|| HealthStatus::unknown(service))
    }

    /// Gate for callers about to use `service`.
    pub async fn check_health_before_execute(&self, service: &str) -> Readiness {
        let status = self.check(service, false).await.status;
        Readiness {
            healthy: status.is_usable(),
            status,
        }
    }

    /// Drop every cached status.
    pub fn invalidate(&self) {
        self.cache.write().clear();
    }

    fn fresh(&self, service: &str) -> Option<HealthStatus> {
        let cache = self.cache.read();
        let cached = cache.get(service)?;
        let usable = cached.status.status != ServiceStatus::Unknown
            && cached.checked_at.elapsed() < self.refresh_interval;
        usable.then(|| cached.status.clone())
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(&HealthConfig::default())
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("services", &self.services())
            .field("refresh_interval", &self.refresh_interval)
            .finish()
    }
}
