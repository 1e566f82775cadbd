//! # mender-runtime
//!
//! Async resilience layer for services that call a local text model
//! (Ollama) and a local image pipeline (ComfyUI).
//!
//! Classification and strategy selection live in `mender-core` and are
//! fully deterministic. This crate adds everything that waits or talks
//! to the network:
//!
//! - [`SelfHealer`]: retries, backoff and fallbacks driven by failure category
//! - [`CircuitBreaker`]: stops calling a dependency after repeated failures
//! - [`HealthMonitor`]: cached health probes and readiness gating
//! - [`MetricsRecorder`]: bounded history of recovery outcomes
//! - [`Resilience`]: the hub that wires all of the above to the clients
//!
//! ## Example
//!
//! ```rust,ignore
//! use mender_runtime::{ChatMessage, Resilience, RuntimeConfig};
//!
//! let resilience = Resilience::from_config(RuntimeConfig::load(None)?)?;
//!
//! let reply = resilience.ask(vec![ChatMessage::user("hello")]).await?;
//! let image = resilience.render_image("a red fox in snow", "user-42").await;
//! ```

pub mod cache;
pub mod config;
pub mod health;
pub mod orchestrator;
pub mod providers;
pub mod resilience;

pub use cache::{ArtifactCache, CachedArtifact, DEFAULT_ARTIFACT_TTL};
pub use config::{ArtifactCacheConfig, ConfigError, HealerConfig, RuntimeConfig};
pub use health::{HealthConfig, HealthMonitor, HealthProbe, HttpProbe, ProbeOutcome, Readiness};
pub use orchestrator::{Resilience, ResilienceBuilder, RuntimeError};
pub use providers::{
    ChatMessage, ComfyUiClient, ComfyUiConfig, ImageGenerator, ImageQuota, ImageQuotaConfig,
    ImageResult, OllamaClient, OllamaConfig, ProviderError, TextGenerator,
};
pub use resilience::{
    report_of, CircuitBreaker, CircuitBreakerConfig, CircuitOpenError, CircuitState,
    HealingOptions, HealingResult, MetricsRecorder, RecoveryMetric, RecoveryStats, SelfHealer,
};
