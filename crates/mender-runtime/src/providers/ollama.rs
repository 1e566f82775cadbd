//! Ollama text generation client.
//!
//! Non-streaming chat against `POST /api/chat`, guarded by the client's own
//! circuit breaker. Liveness is `GET /api/tags`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{ChatMessage, ProviderError, TextGenerator};
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig};

const SERVICE: &str = "Ollama";

/// System prompt prepended by [`OllamaClient::send_message`].
pub const SYSTEM_PROMPT: &str = "You are a friendly chatbot in a small community server. \
Answer briefly and naturally, like an ordinary conversation.";

/// Reply used when the model returns no content.
const EMPTY_REPLY: &str = "No response from model";

/// Ollama connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    pub url: String,
    pub model: String,

    /// Per-request deadline
    #[serde(with = "crate::config::duration_str")]
    pub timeout: Duration,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:11434".to_string(),
            model: "llama3.2".to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    options: ChatOptions,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    num_predict: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    message: Option<ResponseMessage>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
}

/// Client for a local Ollama server.
pub struct OllamaClient {
    config: OllamaConfig,
    base_url: String,
    http: reqwest::Client,
    breaker: CircuitBreaker,
}

impl std::fmt::Debug for OllamaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OllamaClient")
            .field("base_url", &self.base_url)
            .field("model", &self.config.model)
            .field("breaker", &self.breaker)
            .finish()
    }
}

impl OllamaClient {
    /// Create a client with its own circuit breaker.
    pub fn new(config: OllamaConfig, breaker: CircuitBreakerConfig) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProviderError::NotConfigured(format!("Ollama HTTP client: {e}")))?;

        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            config,
            http,
            breaker: CircuitBreaker::new("ollama", breaker),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Ask a single question under the fixed system prompt.
    pub async fn send_message(&self, message: &str) -> Result<String, ProviderError> {
        let messages = [ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(message)];
        let options = ChatOptions {
            num_predict: 1500,
            temperature: 0.5,
            top_p: Some(0.9),
        };
        self.breaker.call(|| self.complete(&messages, options)).await
    }

    /// Run a chat completion over a full message history.
    pub async fn chat(&self, messages: &[ChatMessage]) -> Result<String, ProviderError> {
        let options = ChatOptions {
            num_predict: 1500,
            temperature: 0.7,
            top_p: None,
        };
        self.breaker.call(|| self.complete(messages, options)).await
    }

    /// Whether the server answers `GET /api/tags` with a success status.
    pub async fn health_check(&self) -> bool {
        match self.http.get(format!("{}/api/tags", self.base_url)).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: ChatOptions,
    ) -> Result<String, ProviderError> {
        let request = ChatRequest {
            model: &self.config.model,
            messages,
            stream: false,
            options,
        };

        let response = self
            .http
            .post(format!("{}/api/chat", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(SERVICE, self.config.timeout, e))?;

        let status = response.status();

        if status == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(ProviderError::RateLimited {
                service: SERVICE.to_string(),
                retry_after,
            });
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                service: SERVICE.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        let body: ChatResponse = response.json().await.map_err(|e| ProviderError::Parse {
            service: SERVICE.to_string(),
            message: e.to_string(),
        })?;

        let content = body
            .message
            .map(|m| m.content)
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| EMPTY_REPLY.to_string());

        tracing::debug!(model = %self.config.model, chars = content.len(), "Ollama replied");
        Ok(content)
    }
}

#[async_trait]
impl TextGenerator for OllamaClient {
    async fn chat(&self, messages: Vec<ChatMessage>) -> Result<String, ProviderError> {
        OllamaClient::chat(self, &messages).await
    }

    async fn health_check(&self) -> bool {
        OllamaClient::health_check(self).await
    }

    fn name(&self) -> &str {
        "ollama"
    }
}
