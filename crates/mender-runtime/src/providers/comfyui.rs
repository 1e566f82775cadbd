//! ComfyUI image generation client.
//!
//! One generation is: breaker admission, liveness check, per-user quota,
//! workflow submission (primary, then a simpler alternate), and polling the
//! prompt history until an output image appears. When generation fails the
//! last artifact produced for the same prompt is served instead, if it is
//! still fresh.

use async_trait::async_trait;
use backon::{ConstantBuilder, Retryable};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::{ImageGenerator, ImageResult, ProviderError};
use crate::cache::ArtifactCache;
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState};

const SERVICE: &str = "ComfyUI";

/// Bound on the liveness check made before each generation.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on a single workflow submission.
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(30);

/// ComfyUI connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComfyUiConfig {
    pub url: String,

    /// Wait between history polls
    #[serde(with = "crate::config::duration_str")]
    pub poll_interval: Duration,

    /// Polls before giving up on a submitted prompt
    pub max_polls: u32,
}

impl Default for ComfyUiConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8188".to_string(),
            poll_interval: Duration::from_secs(2),
            max_polls: 60,
        }
    }
}

/// Per-user image quota settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageQuotaConfig {
    pub max_per_user: u32,

    #[serde(with = "crate::config::duration_str")]
    pub window: Duration,
}

impl Default for ImageQuotaConfig {
    fn default() -> Self {
        Self {
            max_per_user: 5,
            window: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct QuotaWindow {
    used: u32,
    resets_at: Instant,
}

/// Fixed-window generation quota per user.
///
/// A user's window opens on their first request and lasts `window`.
#[derive(Debug)]
pub struct ImageQuota {
    config: ImageQuotaConfig,
    windows: Mutex<HashMap<String, QuotaWindow>>,
}

impl ImageQuota {
    pub fn new(config: ImageQuotaConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Consume one generation for `user`; false once the quota is used up.
    pub fn try_acquire(&self, user: &str) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock();

        match windows.get_mut(user) {
            Some(window) if now <= window.resets_at => {
                if window.used >= self.config.max_per_user {
                    return false;
                }
                window.used += 1;
                true
            }
            _ => {
                windows.insert(
                    user.to_string(),
                    QuotaWindow {
                        used: 1,
                        resets_at: now + self.config.window,
                    },
                );
                true
            }
        }
    }

    /// Generations `user` has left in the current window.
    pub fn remaining(&self, user: &str) -> u32 {
        match self.windows.lock().get(user) {
            Some(window) if Instant::now() <= window.resets_at => {
                self.config.max_per_user.saturating_sub(window.used)
            }
            _ => self.config.max_per_user,
        }
    }

    /// Time until `user`'s window resets, if one is open.
    pub fn resets_in(&self, user: &str) -> Option<Duration> {
        let windows = self.windows.lock();
        let window = windows.get(user)?;
        let now = Instant::now();
        (now <= window.resets_at).then(|| window.resets_at.saturating_duration_since(now))
    }

    fn exceeded_message(&self, user: &str) -> String {
        let minutes = self
            .resets_in(user)
            .map(|d| d.as_millis().div_ceil(60_000) as u64)
            .unwrap_or_else(|| self.config.window.as_secs().div_ceil(60));
        format!(
            "Rate limit exceeded. You can generate {} images per window; try again in {} minutes",
            self.config.max_per_user, minutes
        )
    }
}

impl Default for ImageQuota {
    fn default() -> Self {
        Self::new(ImageQuotaConfig::default())
    }
}

#[derive(Debug, Deserialize)]
struct PromptAccepted {
    prompt_id: String,
}

/// Prompt history has no output image yet.
#[derive(Debug)]
struct NotReady;

/// Client for a local ComfyUI server.
pub struct ComfyUiClient {
    config: ComfyUiConfig,
    base_url: String,
    http: reqwest::Client,
    breaker: CircuitBreaker,
    quota: ImageQuota,
    cache: Arc<ArtifactCache>,
}

impl std::fmt::Debug for ComfyUiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComfyUiClient")
            .field("base_url", &self.base_url)
            .field("breaker", &self.breaker)
            .finish()
    }
}

impl ComfyUiClient {
    /// Create a client with default breaker, quota and artifact cache.
    pub fn new(config: ComfyUiConfig) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| ProviderError::NotConfigured(format!("ComfyUI HTTP client: {e}")))?;

        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            config,
            http,
            breaker: CircuitBreaker::new("comfyui", CircuitBreakerConfig::default()),
            quota: ImageQuota::default(),
            cache: Arc::new(ArtifactCache::default()),
        })
    }

    pub fn with_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker = CircuitBreaker::new("comfyui", config);
        self
    }

    pub fn with_quota(mut self, config: ImageQuotaConfig) -> Self {
        self.quota = ImageQuota::new(config);
        self
    }

    /// Share an artifact cache with other components.
    pub fn with_cache(mut self, cache: Arc<ArtifactCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn cache(&self) -> &Arc<ArtifactCache> {
        &self.cache
    }

    /// Generations `user` has left in the current quota window.
    pub fn remaining_quota(&self, user: &str) -> u32 {
        self.quota.remaining(user)
    }

    /// Consume one unit of `user`'s quota.
    pub fn check_quota(&self, user: &str) -> bool {
        self.quota.try_acquire(user)
    }

    /// Whether the server answers `GET /system_stats` with a success status.
    pub async fn health_check(&self) -> bool {
        match self
            .http
            .get(format!("{}/system_stats", self.base_url))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    /// Generate one image for `user`.
    pub async fn generate_image(&self, prompt: &str, user: &str) -> ImageResult {
        if let Err(open) = self.breaker.try_acquire() {
            return self.degrade(prompt, open.to_string()).await;
        }

        if !self.health_check().await {
            self.breaker.record_failure();
            return ImageResult::failed(format!(
                "ComfyUI is not available. Check that ComfyUI is running at {}",
                self.base_url
            ));
        }

        if !self.quota.try_acquire(user) {
            tracing::debug!(user, "Image quota exhausted");
            // The liveness check passed, which settles a half-open trial
            if matches!(self.breaker.state(), CircuitState::HalfOpen) {
                self.breaker.record_success();
            }
            return ImageResult::failed(self.quota.exceeded_message(user));
        }

        match self.generate(prompt).await {
            Ok(url) => {
                self.breaker.record_success();
                self.cache.insert(prompt, url.clone()).await;
                ImageResult::generated(url)
            }
            Err(message) => {
                self.breaker.record_failure();
                self.degrade(prompt, message).await
            }
        }
    }

    async fn generate(&self, prompt: &str) -> Result<String, String> {
        let primary = self
            .submit(primary_workflow(prompt))
            .await
            .map_err(|e| format!("Failed to generate image: {e}"))?;

        let accepted = match primary {
            Ok(accepted) => accepted,
            Err(primary_status) => {
                tracing::warn!(status = primary_status, "Primary workflow rejected, trying alternate");
                self.submit(alternate_workflow(prompt))
                    .await
                    .map_err(|e| format!("Failed to generate image: {e}"))?
                    .map_err(|alternate_status| {
                        format!(
                            "Both image generation attempts failed. Primary: {primary_status}, alternate: {alternate_status}"
                        )
                    })?
            }
        };

        self.wait_for_completion(&accepted.prompt_id)
            .await
            .map_err(|e| format!("Failed to generate image: {e}"))
    }

    /// Submit a workflow. The inner `Err` carries a rejecting HTTP status.
    async fn submit(&self, workflow: JsonValue) -> Result<Result<PromptAccepted, u16>, ProviderError> {
        let response = self
            .http
            .post(format!("{}/prompt", self.base_url))
            .timeout(SUBMIT_TIMEOUT)
            .json(&json!({ "prompt": workflow }))
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(SERVICE, SUBMIT_TIMEOUT, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::debug!(status = status.as_u16(), body = %body, "ComfyUI rejected workflow");
            return Ok(Err(status.as_u16()));
        }

        let accepted = response
            .json::<PromptAccepted>()
            .await
            .map_err(|e| ProviderError::Parse {
                service: SERVICE.to_string(),
                message: e.to_string(),
            })?;
        Ok(Ok(accepted))
    }

    /// Poll the prompt history until an output image appears.
    async fn wait_for_completion(&self, prompt_id: &str) -> Result<String, ProviderError> {
        let polls = self.config.max_polls.max(1);
        tokio::time::sleep(self.config.poll_interval).await;

        let backoff = ConstantBuilder::default()
            .with_delay(self.config.poll_interval)
            .with_max_times((polls - 1) as usize);

        (|| self.poll_history(prompt_id))
            .retry(backoff)
            .sleep(tokio::time::sleep)
            .await
            .map_err(|NotReady| ProviderError::Timeout {
                service: SERVICE.to_string(),
                timeout: self.config.poll_interval * polls,
            })
    }

    async fn poll_history(&self, prompt_id: &str) -> Result<String, NotReady> {
        let response = self
            .http
            .get(format!("{}/history/{}", self.base_url, prompt_id))
            .send()
            .await
            .map_err(|_| NotReady)?;

        if !response.status().is_success() {
            return Err(NotReady);
        }

        let history: JsonValue = response.json().await.map_err(|_| NotReady)?;
        self.image_url(&history, prompt_id).ok_or(NotReady)
    }

    /// URL of the first output node that produced images.
    fn image_url(&self, history: &JsonValue, prompt_id: &str) -> Option<String> {
        let outputs = history.get(prompt_id)?.get("outputs")?.as_object()?;
        outputs.values().find_map(|node| {
            let image = node.get("images")?.as_array()?.first()?;
            let filename = image.get("filename")?.as_str()?;
            let subfolder = image.get("subfolder").and_then(JsonValue::as_str).unwrap_or("");
            Some(format!(
                "{}/view?filename={}&subfolder={}",
                self.base_url, filename, subfolder
            ))
        })
    }

    async fn degrade(&self, prompt: &str, error: String) -> ImageResult {
        match self.cache.get(prompt).await {
            Some(artifact) => {
                tracing::warn!(error = %error, "Serving cached image in degraded mode");
                ImageResult::cached(artifact.url)
            }
            None => ImageResult::failed(error),
        }
    }
}

#[async_trait]
impl ImageGenerator for ComfyUiClient {
    async fn generate_image(&self, prompt: &str, user: &str) -> ImageResult {
        ComfyUiClient::generate_image(self, prompt, user).await
    }

    async fn health_check(&self) -> bool {
        ComfyUiClient::health_check(self).await
    }

    fn name(&self) -> &str {
        "comfyui"
    }
}

fn seed() -> u64 {
    rand::thread_rng().gen_range(0..1_000_000_000)
}

/// SD 1.5 text-to-image graph, 512x512, 15 euler steps.
fn primary_workflow(prompt: &str) -> JsonValue {
    json!({
        "3": {
            "inputs": {
                "seed": seed(),
                "steps": 15,
                "cfg": 7,
                "sampler_name": "euler",
                "scheduler": "normal",
                "positive": ["5", 0],
                "negative": ["6", 0],
                "latent_image": ["7", 0],
                "denoise": 1.0,
                "model": ["4", 0]
            },
            "class_type": "KSampler"
        },
        "4": {
            "inputs": { "ckpt_name": "v1-5-pruned-emaonly.safetensors" },
            "class_type": "CheckpointLoaderSimple"
        },
        "5": {
            "inputs": { "text": prompt, "clip": ["4", 1] },
            "class_type": "CLIPTextEncode"
        },
        "6": {
            "inputs": {
                "text": "low quality, blurry, distorted, ugly, text, watermark",
                "clip": ["4", 1]
            },
            "class_type": "CLIPTextEncode"
        },
        "7": {
            "inputs": { "width": 512, "height": 512, "batch_size": 1 },
            "class_type": "EmptyLatentImage"
        },
        "8": {
            "inputs": { "samples": ["3", 0], "vae": ["4", 2] },
            "class_type": "VAEDecode"
        },
        "9": {
            "inputs": { "filename_prefix": "mender", "images": ["8", 0] },
            "class_type": "SaveImage"
        }
    })
}

/// Smaller graph against a generic checkpoint config.
fn alternate_workflow(prompt: &str) -> JsonValue {
    json!({
        "1": {
            "inputs": { "text": prompt, "clip": ["2", 0] },
            "class_type": "CLIPTextEncode"
        },
        "2": {
            "inputs": { "ckpt_name": "sd15_default.yaml" },
            "class_type": "CheckpointLoader"
        },
        "3": {
            "inputs": {
                "seed": seed(),
                "steps": 15,
                "cfg": 7,
                "sampler_name": "euler",
                "scheduler": "normal",
                "positive": ["1", 0],
                "negative": ["1", 0],
                "model": ["2", 0],
                "vae": ["2", 1]
            },
            "class_type": "KSampler"
        },
        "4": {
            "inputs": { "samples": ["3", 0], "vae": ["2", 1] },
            "class_type": "VAEDecode"
        },
        "5": {
            "inputs": { "filename_prefix": "mender_fallback", "images": ["4", 0] },
            "class_type": "SaveImage"
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_config(server: &MockServer) -> ComfyUiConfig {
        ComfyUiConfig {
            url: server.uri(),
            poll_interval: Duration::from_millis(10),
            max_polls: 3,
        }
    }

    async fn mount_health(server: &MockServer, status: u16) {
        Mock::given(method("GET"))
            .and(path("/system_stats"))
            .respond_with(ResponseTemplate::new(status))
            .mount(server)
            .await;
    }

    async fn mount_history(server: &MockServer, prompt_id: &str, filename: &str) {
        Mock::given(method("GET"))
            .and(path(format!("/history/{prompt_id}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                prompt_id: {
                    "outputs": {
                        "9": {
                            "images": [
                                { "filename": filename, "subfolder": "", "type": "output" }
                            ]
                        }
                    }
                }
            })))
            .mount(server)
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_window() {
        let quota = ImageQuota::new(ImageQuotaConfig {
            max_per_user: 2,
            window: Duration::from_secs(3600),
        });

        assert_eq!(quota.remaining("ada"), 2);
        assert!(quota.try_acquire("ada"));
        assert!(quota.try_acquire("ada"));
        assert!(!quota.try_acquire("ada"));
        assert_eq!(quota.remaining("ada"), 0);
        assert_eq!(quota.remaining("grace"), 2);

        tokio::time::advance(Duration::from_secs(30 * 60)).await;
        assert!(quota.exceeded_message("ada").contains("30 minutes"));

        tokio::time::advance(Duration::from_secs(31 * 60)).await;
        assert_eq!(quota.remaining("ada"), 2);
        assert!(quota.try_acquire("ada"));
        assert_eq!(quota.remaining("ada"), 1);
    }

    #[test]
    fn test_workflows_save_images() {
        let primary = primary_workflow("a lighthouse");
        assert_eq!(primary["5"]["inputs"]["text"], "a lighthouse");
        assert_eq!(primary["4"]["inputs"]["ckpt_name"], "v1-5-pruned-emaonly.safetensors");
        assert_eq!(primary["9"]["class_type"], "SaveImage");

        let alternate = alternate_workflow("a lighthouse");
        assert_eq!(alternate["1"]["inputs"]["text"], "a lighthouse");
        assert_eq!(alternate["5"]["inputs"]["filename_prefix"], "mender_fallback");
    }

    #[tokio::test]
    async fn test_generate_image_end_to_end() {
        let server = MockServer::start().await;
        mount_health(&server, 200).await;
        Mock::given(method("POST"))
            .and(path("/prompt"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "prompt_id": "abc" })))
            .expect(1)
            .mount(&server)
            .await;
        mount_history(&server, "abc", "mender_00001_.png").await;

        let client = ComfyUiClient::new(fast_config(&server)).unwrap();
        let result = client.generate_image("a lighthouse", "ada").await;

        assert!(result.success, "{result:?}");
        assert!(!result.degraded);
        assert_eq!(
            result.image_url,
            Some(format!("{}/view?filename=mender_00001_.png&subfolder=", server.uri()))
        );
        assert_eq!(client.remaining_quota("ada"), 4);
        assert!(client.cache().get("a lighthouse").await.is_some());
    }

    #[tokio::test]
    async fn test_alternate_workflow_after_rejection() {
        let server = MockServer::start().await;
        mount_health(&server, 200).await;
        Mock::given(method("POST"))
            .and(path("/prompt"))
            .and(body_partial_json(json!({
                "prompt": { "4": { "class_type": "CheckpointLoaderSimple" } }
            })))
            .respond_with(ResponseTemplate::new(500).set_body_string("missing checkpoint"))
            .with_priority(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/prompt"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "prompt_id": "alt" })))
            .expect(1)
            .mount(&server)
            .await;
        mount_history(&server, "alt", "mender_fallback_00001_.png").await;

        let client = ComfyUiClient::new(fast_config(&server)).unwrap();
        let result = client.generate_image("a lighthouse", "ada").await;

        assert!(result.success, "{result:?}");
        assert!(result.image_url.unwrap().contains("mender_fallback_00001_.png"));
    }

    #[tokio::test]
    async fn test_both_workflows_rejected_serves_cached_artifact() {
        let server = MockServer::start().await;
        mount_health(&server, 200).await;
        Mock::given(method("POST"))
            .and(path("/prompt"))
            .respond_with(ResponseTemplate::new(500))
            .expect(4)
            .mount(&server)
            .await;

        let client = ComfyUiClient::new(fast_config(&server)).unwrap();

        let result = client.generate_image("a lighthouse", "ada").await;
        assert!(!result.success);
        let error = result.error.unwrap();
        assert!(error.contains("Both image generation attempts failed"), "{error}");
        assert!(error.contains("Primary: 500, alternate: 500"), "{error}");

        client.cache().insert("A Lighthouse", "http://img/cached.png").await;
        let result = client.generate_image("a lighthouse", "grace").await;
        assert!(result.success);
        assert!(result.degraded);
        assert_eq!(result.image_url.as_deref(), Some("http://img/cached.png"));
    }

    #[tokio::test]
    async fn test_quota_exhaustion_skips_submission() {
        let server = MockServer::start().await;
        mount_health(&server, 200).await;
        Mock::given(method("POST"))
            .and(path("/prompt"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "prompt_id": "q1" })))
            .expect(1)
            .mount(&server)
            .await;
        mount_history(&server, "q1", "mender_00002_.png").await;

        let client = ComfyUiClient::new(fast_config(&server))
            .unwrap()
            .with_quota(ImageQuotaConfig {
                max_per_user: 1,
                window: Duration::from_secs(3600),
            });

        assert!(client.generate_image("a fox", "ada").await.success);

        let result = client.generate_image("a fox", "ada").await;
        assert!(!result.success);
        assert!(result.error.unwrap().starts_with("Rate limit exceeded"));
    }

    #[tokio::test]
    async fn test_quota_rejection_settles_half_open_circuit() {
        let server = MockServer::start().await;
        mount_health(&server, 200).await;

        let client = ComfyUiClient::new(fast_config(&server))
            .unwrap()
            .with_breaker(CircuitBreakerConfig {
                failure_threshold: 1,
                reset_timeout: Duration::from_millis(20),
            })
            .with_quota(ImageQuotaConfig {
                max_per_user: 1,
                window: Duration::from_secs(3600),
            });

        assert!(client.check_quota("ada"));
        client.breaker().record_failure();
        assert!(client.breaker().is_open());
        tokio::time::sleep(Duration::from_millis(40)).await;

        let result = client.generate_image("a fox", "ada").await;
        assert!(result.error.unwrap().starts_with("Rate limit exceeded"));
        assert_eq!(client.breaker().state(), CircuitState::Closed);
        assert_eq!(client.breaker().failure_count(), 0);
    }

    #[tokio::test]
    async fn test_unhealthy_server_opens_circuit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/system_stats"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let client = ComfyUiClient::new(fast_config(&server)).unwrap();
        for user in ["a", "b", "c"] {
            let result = client.generate_image("a fox", user).await;
            assert!(result.error.unwrap().contains("not available"));
        }

        let result = client.generate_image("a fox", "d").await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("circuit open"));
        assert_eq!(client.remaining_quota("a"), 5);
    }

    #[tokio::test]
    async fn test_polling_gives_up() {
        let server = MockServer::start().await;
        mount_health(&server, 200).await;
        Mock::given(method("POST"))
            .and(path("/prompt"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "prompt_id": "slow" })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/history/slow"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(3)
            .mount(&server)
            .await;

        let client = ComfyUiClient::new(fast_config(&server)).unwrap();
        let result = client.generate_image("a fox", "ada").await;

        assert!(!result.success);
        assert!(result.error.unwrap().contains("timed out"));
        assert_eq!(client.breaker().failure_count(), 1);
    }
}
