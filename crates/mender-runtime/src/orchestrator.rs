//! Resilience hub.
//!
//! [`Resilience`] wires the self-healer, the health monitor and both
//! generation clients from one [`RuntimeConfig`]. Callers go through it
//! instead of touching the clients directly:
//! - `ask` health-gates and heals a text completion
//! - `render_image` health-gates an image generation
//! - `run_handler` heals arbitrary internal handler code

use mender_core::{ErrorClassifier, Fault, ServiceStatus};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

use crate::cache::ArtifactCache;
use crate::config::{ConfigError, RuntimeConfig};
use crate::health::{HealthMonitor, HealthProbe, HttpProbe};
use crate::providers::{
    ChatMessage, ComfyUiClient, ImageGenerator, ImageResult, OllamaClient, ProviderError,
    TextGenerator,
};
use crate::resilience::{HealingOptions, HealingResult, MetricsRecorder, SelfHealer};

/// Errors from the resilience hub.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Provider not configured: {0}")]
    ProviderNotConfigured(String),

    #[error("{service} is {status}; skipping call")]
    ServiceUnavailable {
        service: String,
        status: ServiceStatus,
    },

    #[error("Recovery failed: {0}")]
    RecoveryFailed(#[source] Fault),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Entry point for resilient calls to the external services.
pub struct Resilience {
    healer: SelfHealer,
    health: HealthMonitor,
    text: Arc<dyn TextGenerator>,
    images: Arc<dyn ImageGenerator>,
}

impl Resilience {
    /// Build everything from configuration with HTTP clients and probes.
    pub fn from_config(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        ResilienceBuilder::new().config(config).build()
    }

    pub fn builder() -> ResilienceBuilder {
        ResilienceBuilder::new()
    }

    pub fn healer(&self) -> &SelfHealer {
        &self.healer
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    /// Text completion, skipped while the text service is unhealthy.
    pub async fn ask(&self, messages: Vec<ChatMessage>) -> Result<String, RuntimeError> {
        let service = self.text.name().to_string();
        self.gate(&service).await?;

        let text = Arc::clone(&self.text);
        let operation = move || {
            let text = Arc::clone(&text);
            let messages = messages.clone();
            async move { text.chat(messages).await.map_err(anyhow::Error::from) }
        };

        let options = HealingOptions::new().context(format!("{service} chat"));
        self.healer
            .execute_with_healing(operation, options)
            .await
            .into_result()
            .map_err(RuntimeError::RecoveryFailed)
    }

    /// Image generation, skipped while the image service is unhealthy.
    pub async fn render_image(&self, prompt: &str, user: &str) -> ImageResult {
        let service = self.images.name().to_string();
        if let Err(err) = self.gate(&service).await {
            return ImageResult::failed(err.to_string());
        }
        self.images.generate_image(prompt, user).await
    }

    /// Run internal handler code with healing.
    ///
    /// Retries and recoveries are logged under the handler's name. When
    /// `fallback` is given it is returned once retries are exhausted.
    pub async fn run_handler<T, F, Fut>(
        &self,
        name: &str,
        operation: F,
        fallback: Option<T>,
    ) -> HealingResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
        T: Send + 'static,
    {
        let retry_name = name.to_string();
        let heal_name = name.to_string();

        let mut options = HealingOptions::new()
            .context(format!("skill execution: {name}"))
            .on_retry(move |fault, attempt, category| {
                tracing::warn!(handler = %retry_name, %category, attempt, error = %fault.message, "Retrying handler");
            })
            .on_heal(move |fault, category, attempts| {
                tracing::info!(handler = %heal_name, %category, attempts, error = %fault.message, "Handler recovered");
            });

        if let Some(value) = fallback {
            options = options.fallback(move || async move { Ok(value) });
        }

        self.healer.execute_with_healing(operation, options).await
    }

    async fn gate(&self, service: &str) -> Result<(), RuntimeError> {
        let readiness = self.health.check_health_before_execute(service).await;
        if readiness.status == ServiceStatus::Unhealthy {
            tracing::warn!(service, "Skipping call to unhealthy service");
            return Err(RuntimeError::ServiceUnavailable {
                service: service.to_string(),
                status: readiness.status,
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for Resilience {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resilience")
            .field("healer", &self.healer)
            .field("health", &self.health)
            .field("text", &self.text.name())
            .field("images", &self.images.name())
            .finish()
    }
}

/// Builder for [`Resilience`].
pub struct ResilienceBuilder {
    config: RuntimeConfig,
    text: Option<Arc<dyn TextGenerator>>,
    images: Option<Arc<dyn ImageGenerator>>,
    probes: Vec<Arc<dyn HealthProbe>>,
}

impl ResilienceBuilder {
    /// Create a new builder with default configuration.
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
            text: None,
            images: None,
            probes: Vec::new(),
        }
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a custom text backend instead of the configured Ollama client.
    pub fn text_generator(mut self, text: Arc<dyn TextGenerator>) -> Self {
        self.text = Some(text);
        self
    }

    /// Use a custom image backend instead of the configured ComfyUI client.
    pub fn image_generator(mut self, images: Arc<dyn ImageGenerator>) -> Self {
        self.images = Some(images);
        self
    }

    /// Use custom health probes instead of HTTP probes of the configured URLs.
    pub fn probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probes.push(probe);
        self
    }

    /// Build the hub.
    pub fn build(self) -> Result<Resilience, RuntimeError> {
        let config = self.config;

        let classifier = Arc::new(ErrorClassifier::with_strategies(config.strategy_table()));
        let metrics = Arc::new(MetricsRecorder::new(config.healer.metrics_capacity));
        let healer = SelfHealer::new(classifier, metrics).with_max_delay(config.healer.max_delay);

        let mut health = HealthMonitor::new(&config.health);
        if self.probes.is_empty() {
            let http = reqwest::Client::builder()
                .build()
                .map_err(|e| RuntimeError::ProviderNotConfigured(format!("health HTTP client: {e}")))?;
            health.register(Arc::new(HttpProbe::ollama(
                &config.ollama.url,
                http.clone(),
                config.health.probe_timeout,
            )));
            health.register(Arc::new(HttpProbe::comfyui(
                &config.comfyui.url,
                http,
                config.health.probe_timeout,
            )));
        } else {
            for probe in self.probes {
                health.register(probe);
            }
        }

        let text = match self.text {
            Some(text) => text,
            None => Arc::new(OllamaClient::new(
                config.ollama.clone(),
                config.circuit_breaker.clone(),
            )?),
        };

        let images = match self.images {
            Some(images) => images,
            None => {
                let cache = Arc::new(ArtifactCache::new(
                    config.artifact_cache.max_entries,
                    config.artifact_cache.ttl,
                ));
                Arc::new(
                    ComfyUiClient::new(config.comfyui.clone())?
                        .with_breaker(config.circuit_breaker.clone())
                        .with_quota(config.image_quota.clone())
                        .with_cache(cache),
                )
            }
        };

        tracing::debug!(
            text = text.name(),
            images = images.name(),
            services = ?health.services(),
            "Resilience hub ready"
        );

        Ok(Resilience {
            healer,
            health,
            text,
            images,
        })
    }
}

impl Default for ResilienceBuilder {
    fn default() -> Self {
        Self::new()
    }
}
