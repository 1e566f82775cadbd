//! Clients for the external generation services.
//!
//! Two slow, flaky local dependencies sit behind these traits: a text
//! generator (Ollama) and an image generator (ComfyUI). Each client owns
//! its own [`CircuitBreaker`](crate::resilience::CircuitBreaker).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::resilience::CircuitOpenError;

mod comfyui;
mod ollama;

pub use comfyui::{ComfyUiClient, ComfyUiConfig, ImageQuota, ImageQuotaConfig};
pub use ollama::{OllamaClient, OllamaConfig, SYSTEM_PROMPT};

/// Errors from the generation services.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("{service} request failed: {message}")]
    Http { service: String, message: String },

    #[error("{service} rate limited")]
    RateLimited {
        service: String,
        retry_after: Option<Duration>,
    },

    #[error("{service} error {status}: {body}")]
    Api {
        service: String,
        status: u16,
        body: String,
    },

    #[error("{service} response parse error: {message}")]
    Parse { service: String, message: String },

    #[error("{service} request timed out after {}ms", .timeout.as_millis())]
    Timeout { service: String, timeout: Duration },

    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),
}

impl ProviderError {
    /// Map a transport error, distinguishing timeouts.
    ///
    /// reqwest's own message omits the cause ("error sending request for
    /// url"), so the whole source chain is folded into `message`.
    pub(crate) fn from_reqwest(service: &str, timeout: Duration, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout {
                service: service.to_string(),
                timeout,
            }
        } else {
            ProviderError::Http {
                service: service.to_string(),
                message: error_chain(&err),
            }
        }
    }
}

/// `err` and its sources joined with ": ", skipping causes already quoted.
fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}

/// A chat message for text generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role: "system", "user", or "assistant"
    pub role: String,

    /// Message content
    pub content: String,
}

impl ChatMessage {
    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Outcome of an image generation request.
///
/// Generation failures are reported in-band rather than as errors so a
/// caller can render `error` to the user directly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageResult {
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Served from the artifact cache instead of a fresh generation
    #[serde(default)]
    pub degraded: bool,
}

impl ImageResult {
    pub fn generated(image_url: impl Into<String>) -> Self {
        Self {
            success: true,
            image_url: Some(image_url.into()),
            error: None,
            degraded: false,
        }
    }

    pub fn cached(image_url: impl Into<String>) -> Self {
        Self {
            success: true,
            image_url: Some(image_url.into()),
            error: None,
            degraded: true,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            image_url: None,
            error: Some(error.into()),
            degraded: false,
        }
    }
}

/// Text generation backend.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Run a non-streaming chat completion and return the reply text.
    async fn chat(&self, messages: Vec<ChatMessage>) -> Result<String, ProviderError>;

    /// Check if the service answers.
    async fn health_check(&self) -> bool;

    /// Service name for health and logging.
    fn name(&self) -> &str;
}

/// Image generation backend.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    /// Generate one image for `user`.
    async fn generate_image(&self, prompt: &str, user: &str) -> ImageResult;

    /// Check if the service answers.
    async fn health_check(&self) -> bool;

    /// Service name for health and logging.
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Error, Debug)]
    #[error("error sending request for url (http://127.0.0.1:9/api/chat)")]
    struct Outer(#[source] Inner);

    #[derive(Error, Debug)]
    #[error("tcp connect error")]
    struct Inner(#[source] std::io::Error);

    #[test]
    fn test_error_chain_includes_causes() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "Connection refused (os error 111)");
        let message = error_chain(&Outer(Inner(refused)));
        assert_eq!(
            message,
            "error sending request for url (http://127.0.0.1:9/api/chat): tcp connect error: Connection refused (os error 111)"
        );
    }

    #[test]
    fn test_chat_message_creation() {
        let system = ChatMessage::system("You are a helpful assistant.");
        assert_eq!(system.role, "system");

        let user = ChatMessage::user("Hello!");
        assert_eq!(user.role, "user");

        let assistant = ChatMessage::assistant("Hi there!");
        assert_eq!(assistant.role, "assistant");
    }

    #[test]
    fn test_error_messages_classify_as_expected() {
        use mender_core::{ErrorCategory, ErrorClassifier, ErrorReport};

        let classifier = ErrorClassifier::new();
        let classify = |err: ProviderError| classifier.classify(&ErrorReport::new(err.to_string()), None);

        let timeout = ProviderError::Timeout {
            service: "Ollama".to_string(),
            timeout: Duration::from_secs(60),
        };
        assert_eq!(timeout.to_string(), "Ollama request timed out after 60000ms");
        assert_eq!(classify(timeout), ErrorCategory::Timeout);

        let api = ProviderError::Api {
            service: "Ollama".to_string(),
            status: 500,
            body: "model not loaded".to_string(),
        };
        assert_eq!(api.to_string(), "Ollama error 500: model not loaded");
        assert_eq!(classify(api), ErrorCategory::External);

        let limited = ProviderError::RateLimited {
            service: "Ollama".to_string(),
            retry_after: None,
        };
        assert_eq!(classify(limited), ErrorCategory::RateLimit);
    }

    #[test]
    fn test_image_result_serializes_camel_case() {
        let json = serde_json::to_value(ImageResult::cached("http://img/1")).unwrap();
        assert_eq!(json["imageUrl"], "http://img/1");
        assert_eq!(json["degraded"], true);
        assert!(json.get("error").is_none());
    }
}
