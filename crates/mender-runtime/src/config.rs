//! Runtime configuration.
//!
//! Configuration is YAML or JSON, validated against
//! `schema/runtime-config.schema.json` before it is deserialized, then
//! overridden from the environment (`OLLAMA_URL`, `OLLAMA_MODEL`,
//! `COMFYUI_URL`). Durations are human-readable strings ("30s", "5m").

use mender_core::{ErrorCategory, RecoveryStrategy, StrategyTable, MAX_BACKOFF};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

use crate::cache::DEFAULT_ARTIFACT_TTL;
use crate::health::HealthConfig;
use crate::providers::{ComfyUiConfig, ImageQuotaConfig, OllamaConfig};
use crate::resilience::{CircuitBreakerConfig, DEFAULT_METRICS_CAPACITY};

/// Embedded configuration schema (loaded at compile time).
const CONFIG_SCHEMA_JSON: &str = include_str!("../schema/runtime-config.schema.json");

/// Compiled JSON Schema validator (initialized once, reused).
static COMPILED_SCHEMA: OnceLock<Result<jsonschema::Validator, String>> = OnceLock::new();

/// Errors that can occur when loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Failed to load schema: {0}")]
    SchemaError(String),

    #[error("Config validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),
}

/// Healer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealerConfig {
    /// Cap on any single backoff wait
    #[serde(with = "duration_str")]
    pub max_delay: Duration,

    /// Recovery outcomes kept for stats
    pub metrics_capacity: usize,
}

impl Default for HealerConfig {
    fn default() -> Self {
        Self {
            max_delay: MAX_BACKOFF,
            metrics_capacity: DEFAULT_METRICS_CAPACITY,
        }
    }
}

/// Degraded-mode artifact cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactCacheConfig {
    #[serde(with = "duration_str")]
    pub ttl: Duration,
    pub max_entries: u64,
}

impl Default for ArtifactCacheConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_ARTIFACT_TTL,
            max_entries: 256,
        }
    }
}

/// Complete runtime configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub ollama: OllamaConfig,
    pub comfyui: ComfyUiConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub health: HealthConfig,
    pub healer: HealerConfig,
    pub artifact_cache: ArtifactCacheConfig,
    pub image_quota: ImageQuotaConfig,

    /// Per-category replacements for the default strategy table
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub strategies: BTreeMap<ErrorCategory, RecoveryStrategy>,
}

impl RuntimeConfig {
    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let value: serde_json::Value = serde_yaml::from_str(yaml)?;
        Self::from_value(value)
    }

    /// Parse configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        Self::from_value(value)
    }

    /// Parse a configuration file; `.json` files are JSON, anything else YAML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&contents),
            _ => Self::from_yaml(&contents),
        }
    }

    /// Load a file (or defaults) and apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.with_env_overrides(|name| std::env::var(name).ok())
    }

    /// Apply `OLLAMA_URL`, `OLLAMA_MODEL` and `COMFYUI_URL` from `lookup`.
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut errors = Vec::new();

        if let Some(url) = lookup("OLLAMA_URL") {
            match check_url("OLLAMA_URL", &url) {
                Ok(()) => self.ollama.url = url,
                Err(e) => errors.push(e),
            }
        }
        if let Some(model) = lookup("OLLAMA_MODEL").filter(|m| !m.trim().is_empty()) {
            self.ollama.model = model;
        }
        if let Some(url) = lookup("COMFYUI_URL") {
            match check_url("COMFYUI_URL", &url) {
                Ok(()) => self.comfyui.url = url,
                Err(e) => errors.push(e),
            }
        }

        if errors.is_empty() {
            Ok(self)
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Default strategy table with this config's overrides applied.
    pub fn strategy_table(&self) -> StrategyTable {
        StrategyTable::with_overrides(&self.strategies)
    }

    fn from_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        // An empty document means "all defaults"
        if value.is_null() {
            return Ok(Self::default());
        }
        validate_config_schema(&value)?;
        Ok(serde_json::from_value(value)?)
    }
}

fn check_url(name: &str, url: &str) -> Result<(), String> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(format!("{name} must be an http(s) URL, got {url:?}"))
    }
}

/// Get or initialize the compiled schema validator.
fn get_validator() -> Result<&'static jsonschema::Validator, ConfigError> {
    let result = COMPILED_SCHEMA.get_or_init(|| {
        let schema_value: serde_json::Value = match serde_json::from_str(CONFIG_SCHEMA_JSON) {
            Ok(v) => v,
            Err(e) => return Err(format!("Invalid schema JSON: {}", e)),
        };

        match jsonschema::options().build(&schema_value) {
            Ok(v) => Ok(v),
            Err(e) => Err(format!("Failed to compile schema: {}", e)),
        }
    });

    match result {
        Ok(v) => Ok(v),
        Err(e) => Err(ConfigError::SchemaError(e.clone())),
    }
}

/// Validate a configuration document against the schema.
pub fn validate_config_schema(value: &serde_json::Value) -> Result<(), ConfigError> {
    let validator = get_validator()?;

    let errors: Vec<String> = validator
        .iter_errors(value)
        .map(|e| format!("{} at {}", e, e.instance_path))
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Validation(errors))
    }
}

/// Serde adapter for human-readable durations ("30s", "5m", "1h 30m").
pub mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}
