//! Embedding client: process-wide cache, bounded provider concurrency,
//! retry with exponential backoff.
//!
//! The cache is keyed purely by text content (SHA-256), so it is shared
//! across sessions and survives session eviction. Only provider-bound work
//! is gated by the semaphore; cache hits bypass it entirely.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use moka::sync::Cache;
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::provider::{ModelProvider, ProviderError};

pub struct EmbeddingClient {
    provider: Arc<dyn ModelProvider>,
    cache: Cache<String, Arc<Vec<f32>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    semaphore: Arc<Semaphore>,
    max_retries: u32,
}

impl EmbeddingClient {
    pub fn new(provider: Arc<dyn ModelProvider>, config: &AppConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.embed_cache_max_mb * 1024 * 1024)
            .weigher(|key: &String, value: &Arc<Vec<f32>>| {
                (key.len() + value.len() * std::mem::size_of::<f32>()) as u32
            })
            .time_to_idle(Duration::from_secs(config.embed_cache_minutes * 60))
            .build();

        Self {
            provider,
            cache,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_requests.max(1))),
            max_retries: config.embed_max_retries,
        }
    }

    /// Cache key for a text: `emb_` + SHA-256 hex of the UTF-8 bytes.
    pub fn cache_key(text: &str) -> String {
        let digest = Sha256::digest(text.as_bytes());
        format!("emb_{:x}", digest)
    }

    /// Process-wide `(hits, misses)` counters. Both are monotonic.
    pub fn cache_stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    /// Embed a single text, consulting the cache first. Provider calls are
    /// limited by the concurrency semaphore and retried on throttling and
    /// transport failures with `2^attempt` second backoff.
    pub async fn embed(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> AppResult<Arc<Vec<f32>>> {
        let key = Self::cache_key(text);

        if let Some(cached) = self.cache.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(cached);
        }

        let permit = tokio::select! {
            _ = cancel.cancelled() => return Err(AppError::Cancelled),
            permit = self.semaphore.clone().acquire_owned() => {
                permit.map_err(|_| AppError::Internal(anyhow::anyhow!("embedding semaphore closed")))?
            }
        };

        // Another caller may have populated the cache while we waited.
        if let Some(cached) = self.cache.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(cached);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let _permit = permit;
        let mut attempt = 0u32;
        loop {
            match self.provider.embed(text, cancel).await {
                Ok(values) => {
                    let embedding = Arc::new(values);
                    self.cache.insert(key, embedding.clone());
                    return Ok(embedding);
                }
                Err(ProviderError::Cancelled) => return Err(AppError::Cancelled),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let delay = Duration::from_secs(1u64 << attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        delay_secs = delay.as_secs(),
                        error = %e,
                        "embedding call failed, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(AppError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Embed a batch of texts concurrently (still bounded by the semaphore).
    ///
    /// The returned vector is aligned to the input: failed slots are `None`.
    /// Calls `on_progress` with the running completed count as each input
    /// finishes. Fails outright only when every input fails (or on
    /// cancellation).
    pub async fn embed_batch(
        &self,
        texts: &[String],
        cancel: &CancellationToken,
        on_progress: impl Fn(usize) + Send + Sync,
    ) -> AppResult<Vec<Option<Arc<Vec<f32>>>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let completed = AtomicUsize::new(0);
        let tasks = texts.iter().enumerate().map(|(i, text)| {
            let completed = &completed;
            let on_progress = &on_progress;
            async move {
                let result = self.embed(text, cancel).await;
                let count = completed.fetch_add(1, Ordering::Relaxed) + 1;
                on_progress(count);
                (i, result)
            }
        });

        let results = futures_util::future::join_all(tasks).await;

        let mut embeddings: Vec<Option<Arc<Vec<f32>>>> = vec![None; texts.len()];
        let mut succeeded = 0usize;
        let mut last_error: Option<AppError> = None;

        for (i, result) in results {
            match result {
                Ok(embedding) => {
                    embeddings[i] = Some(embedding);
                    succeeded += 1;
                }
                Err(AppError::Cancelled) => return Err(AppError::Cancelled),
                Err(e) => {
                    debug!(index = i, error = %e, "batch embedding slot failed");
                    last_error = Some(e);
                }
            }
        }

        if succeeded == 0 {
            return Err(last_error
                .unwrap_or_else(|| AppError::Provider("all embeddings failed".to_string())));
        }

        Ok(embeddings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::StubProvider;

    fn client_with(provider: StubProvider) -> EmbeddingClient {
        let mut config = AppConfig::for_tests();
        config.embed_max_retries = 2;
        EmbeddingClient::new(Arc::new(provider), &config)
    }

    #[test]
    fn cache_key_is_prefixed_sha256() {
        let key = EmbeddingClient::cache_key("hello");
        assert!(key.starts_with("emb_"));
        assert_eq!(key.len(), 4 + 64);
        assert_eq!(key, EmbeddingClient::cache_key("hello"));
        assert_ne!(key, EmbeddingClient::cache_key("hello!"));
    }

    #[tokio::test]
    async fn embed_caches_and_counts_hits() {
        let client = client_with(StubProvider::new(8));
        let cancel = CancellationToken::new();

        let first = client.embed("some text", &cancel).await.unwrap();
        let second = client.embed("some text", &cancel).await.unwrap();
        assert_eq!(*first, *second);

        let (hits, misses) = client.cache_stats();
        assert_eq!(hits, 1);
        assert_eq!(misses, 1);
    }

    #[tokio::test]
    async fn embed_retries_transient_failures() {
        let provider = StubProvider::new(8).failing_embeds(1);
        let client = client_with(provider);
        let cancel = CancellationToken::new();

        // First attempt fails with a retryable error, second succeeds after
        // a 1s backoff; pause time so the test is instant.
        tokio::time::pause();
        let embedding = client.embed("retry me", &cancel).await.unwrap();
        assert_eq!(embedding.len(), 8);
    }

    #[tokio::test]
    async fn embed_does_not_retry_client_errors() {
        let provider = StubProvider::new(8).failing_embeds_with(10, || ProviderError::Provider {
            status: 400,
            body: "bad".into(),
        });
        let client = client_with(provider);
        let cancel = CancellationToken::new();

        let err = client.embed("nope", &cancel).await.unwrap_err();
        assert!(matches!(err, AppError::Provider(_)));
    }

    #[tokio::test]
    async fn embed_gives_up_after_max_retries() {
        let provider = StubProvider::new(8).failing_embeds(100);
        let client = client_with(provider);
        let cancel = CancellationToken::new();

        tokio::time::pause();
        let err = client.embed("always failing", &cancel).await.unwrap_err();
        assert!(matches!(err, AppError::ProviderUnavailable(_)));
    }

    #[tokio::test]
    async fn embed_respects_cancellation() {
        let client = client_with(StubProvider::new(8));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = client.embed("cancelled", &cancel).await.unwrap_err();
        assert!(matches!(err, AppError::Cancelled));
    }

    #[tokio::test]
    async fn batch_aligns_results_and_reports_progress() {
        let client = client_with(StubProvider::new(8));
        let cancel = CancellationToken::new();
        let texts: Vec<String> = (0..5).map(|i| format!("text {i}")).collect();

        let progress = AtomicUsize::new(0);
        let results = client
            .embed_batch(&texts, &cancel, |count| {
                progress.fetch_max(count, Ordering::Relaxed);
            })
            .await
            .unwrap();

        assert_eq!(results.len(), 5);
        assert!(results.iter().all(|r| r.is_some()));
        assert_eq!(progress.load(Ordering::Relaxed), 5);
    }

    #[tokio::test]
    async fn batch_returns_partial_results_on_partial_failure() {
        // The stub fails calls for texts containing the marker substring.
        let provider = StubProvider::new(8).failing_texts_containing("poison");
        let client = client_with(provider);
        let cancel = CancellationToken::new();

        let texts = vec![
            "good one".to_string(),
            "poison pill".to_string(),
            "good two".to_string(),
        ];
        let results = client.embed_batch(&texts, &cancel, |_| {}).await.unwrap();
        assert!(results[0].is_some());
        assert!(results[1].is_none());
        assert!(results[2].is_some());
    }

    #[tokio::test]
    async fn batch_fails_when_all_slots_fail() {
        let provider = StubProvider::new(8).failing_texts_containing("poison");
        let client = client_with(provider);
        let cancel = CancellationToken::new();

        let texts = vec!["poison a".to_string(), "poison b".to_string()];
        let err = client.embed_batch(&texts, &cancel, |_| {}).await.unwrap_err();
        assert!(matches!(err, AppError::Provider(_)));
    }

    #[tokio::test]
    async fn batch_of_empty_input_is_empty() {
        let client = client_with(StubProvider::new(8));
        let cancel = CancellationToken::new();
        let results = client.embed_batch(&[], &cancel, |_| {}).await.unwrap();
        assert!(results.is_empty());
    }
}
