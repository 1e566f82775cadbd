//! Degraded-mode artifact cache.
//!
//! Remembers the last successful artifact per prompt so a generation
//! client can serve it when both its primary and alternate paths fail.
//! Entries are valid for a short window (5 minutes by default).

use chrono::{DateTime, Utc};
use moka::future::Cache;
use std::time::Duration;
use tokio::time::Instant;

/// Default validity window of a cached artifact.
pub const DEFAULT_ARTIFACT_TTL: Duration = Duration::from_secs(5 * 60);

/// A previously generated artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedArtifact {
    pub url: String,

    /// Wall-clock time the artifact was produced
    pub timestamp: DateTime<Utc>,

    stored_at: Instant,
}

/// Prompt-keyed cache of generated artifacts using moka.
pub struct ArtifactCache {
    cache: Cache<String, CachedArtifact>,
    ttl: Duration,
}

impl ArtifactCache {
    /// Create a new cache with the given configuration.
    pub fn new(max_entries: u64, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(ttl)
            .build();

        Self { cache, ttl }
    }

    /// Artifact for `prompt`, if one was stored within the validity window.
    pub async fn get(&self, prompt: &str) -> Option<CachedArtifact> {
        let key = cache_key(prompt);
        let artifact = self.cache.get(&key).await?;

        if artifact.stored_at.elapsed() > self.ttl {
            self.cache.invalidate(&key).await;
            return None;
        }

        tracing::debug!(prompt = %key, "Artifact cache hit");
        Some(artifact)
    }

    /// Remember a successful artifact for `prompt`.
    pub async fn insert(&self, prompt: &str, url: impl Into<String>) {
        let artifact = CachedArtifact {
            url: url.into(),
            timestamp: Utc::now(),
            stored_at: Instant::now(),
        };
        self.cache.insert(cache_key(prompt), artifact).await;
    }

    /// Clear the cache.
    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

impl Default for ArtifactCache {
    fn default() -> Self {
        Self::new(256, DEFAULT_ARTIFACT_TTL)
    }
}

impl std::fmt::Debug for ArtifactCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactCache")
            .field("ttl", &self.ttl)
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}

/// Prompts differing only in case or surrounding whitespace share an entry.
fn cache_key(prompt: &str) -> String {
    prompt.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cache_roundtrip() {
        let cache = ArtifactCache::default();
        assert!(cache.get("a red fox").await.is_none());

        cache.insert("a red fox", "http://localhost:8188/view?filename=fox.png&subfolder=").await;

        let hit = cache.get("a red fox").await.unwrap();
        assert!(hit.url.ends_with("filename=fox.png&subfolder="));
    }

    #[tokio::test]
    async fn test_keys_are_normalized() {
        let cache = ArtifactCache::default();
        cache.insert("  A Red Fox ", "http://img/1").await;

        assert_eq!(cache.get("a red fox").await.map(|a| a.url), Some("http://img/1".to_string()));
        assert!(cache.get("a blue fox").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_window() {
        let cache = ArtifactCache::default();
        cache.insert("lighthouse", "http://img/2").await;

        tokio::time::advance(Duration::from_secs(4 * 60)).await;
        assert!(cache.get("lighthouse").await.is_some());

        tokio::time::advance(Duration::from_secs(2 * 60)).await;
        assert!(cache.get("lighthouse").await.is_none());
    }

    #[tokio::test]
    async fn test_invalidate_all() {
        let cache = ArtifactCache::default();
        cache.insert("mountain", "http://img/3").await;
        cache.invalidate_all();
        assert!(cache.get("mountain").await.is_none());
    }
}
