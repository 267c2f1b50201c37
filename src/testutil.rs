//! Test doubles shared across module tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::provider::{
    GenerationEvent, GenerationOptions, GenerationStream, ModelProvider, ProviderError,
    ProviderResult, TokenUsage,
};

type ErrorFactory = Arc<dyn Fn() -> ProviderError + Send + Sync>;

/// Deterministic in-process provider: embeddings derived from the text's
/// SHA-256 (same text, same vector), with per-behavior failure switches so
/// tests can break exactly one provider operation at a time.
pub struct StubProvider {
    dimension: usize,
    fixed_embeddings: Arc<Mutex<HashMap<String, Vec<f32>>>>,
    embed_failures_remaining: Arc<AtomicUsize>,
    embed_error: ErrorFactory,
    failing_marker: Arc<Mutex<Option<String>>>,
    embed_delay: Option<Duration>,
    generation_text: String,
    generate_fails: bool,
    generate_stream_fails: bool,
}

impl StubProvider {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            fixed_embeddings: Arc::new(Mutex::new(HashMap::new())),
            embed_failures_remaining: Arc::new(AtomicUsize::new(0)),
            embed_error: Arc::new(|| ProviderError::Unavailable { status: 503 }),
            failing_marker: Arc::new(Mutex::new(None)),
            embed_delay: None,
            generation_text: "stub generated answer".to_string(),
            generate_fails: false,
            generate_stream_fails: false,
        }
    }

    /// A second handle onto the same stub state (shared counters and maps).
    pub fn clone_stub(&self) -> Self {
        Self {
            dimension: self.dimension,
            fixed_embeddings: self.fixed_embeddings.clone(),
            embed_failures_remaining: self.embed_failures_remaining.clone(),
            embed_error: self.embed_error.clone(),
            failing_marker: self.failing_marker.clone(),
            embed_delay: self.embed_delay,
            generation_text: self.generation_text.clone(),
            generate_fails: self.generate_fails,
            generate_stream_fails: self.generate_stream_fails,
        }
    }

    /// Pin the embedding returned for an exact text.
    pub fn with_fixed_embedding(self, text: &str, embedding: Vec<f32>) -> Self {
        self.fixed_embeddings
            .lock()
            .insert(text.to_string(), embedding);
        self
    }

    /// Fail the first `count` embed calls with a retryable 503.
    pub fn failing_embeds(self, count: usize) -> Self {
        self.embed_failures_remaining.store(count, Ordering::Relaxed);
        self
    }

    /// Fail the first `count` embed calls with a custom error.
    pub fn failing_embeds_with(
        mut self,
        count: usize,
        factory: impl Fn() -> ProviderError + Send + Sync + 'static,
    ) -> Self {
        self.embed_failures_remaining.store(count, Ordering::Relaxed);
        self.embed_error = Arc::new(factory);
        self
    }

    /// Fail every embed call whose text contains `marker`.
    pub fn failing_texts_containing(self, marker: &str) -> Self {
        *self.failing_marker.lock() = Some(marker.to_string());
        self
    }

    /// Delay every embed call, for cancellation tests.
    pub fn with_embed_delay(mut self, delay: Duration) -> Self {
        self.embed_delay = Some(delay);
        self
    }

    pub fn with_generation_text(mut self, text: &str) -> Self {
        self.generation_text = text.to_string();
        self
    }

    /// Break the non-streaming generation endpoint.
    pub fn failing_generation(mut self) -> Self {
        self.generate_fails = true;
        self
    }

    /// Break the streaming generation endpoint.
    pub fn failing_generation_stream(mut self) -> Self {
        self.generate_stream_fails = true;
        self
    }

    /// The deterministic embedding this stub produces for a text.
    pub fn embedding_for(&self, text: &str) -> Vec<f32> {
        if let Some(fixed) = self.fixed_embeddings.lock().get(text) {
            return fixed.clone();
        }
        let digest = Sha256::digest(text.as_bytes());
        let raw: Vec<f32> = (0..self.dimension)
            .map(|i| digest[i % digest.len()] as f32 / 255.0 - 0.5)
            .collect();
        let norm = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm < f32::EPSILON {
            return raw;
        }
        raw.into_iter().map(|x| x / norm).collect()
    }
}

#[async_trait]
impl ModelProvider for StubProvider {
    async fn embed(&self, text: &str, cancel: &CancellationToken) -> ProviderResult<Vec<f32>> {
        if let Some(delay) = self.embed_delay {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }

        if let Some(marker) = self.failing_marker.lock().as_deref() {
            if text.contains(marker) {
                return Err(ProviderError::Provider {
                    status: 400,
                    body: format!("stub rejects text containing {marker:?}"),
                });
            }
        }

        let remaining = self.embed_failures_remaining.load(Ordering::Relaxed);
        if remaining > 0 {
            self.embed_failures_remaining
                .store(remaining - 1, Ordering::Relaxed);
            return Err((self.embed_error)());
        }

        Ok(self.embedding_for(text))
    }

    async fn generate(
        &self,
        _prompt: &str,
        _options: GenerationOptions,
        cancel: &CancellationToken,
    ) -> ProviderResult<String> {
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        if self.generate_fails {
            return Err(ProviderError::Unavailable { status: 503 });
        }
        Ok(self.generation_text.clone())
    }

    async fn generate_stream(
        &self,
        _prompt: &str,
        _options: GenerationOptions,
        cancel: &CancellationToken,
    ) -> ProviderResult<GenerationStream> {
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        if self.generate_stream_fails {
            return Err(ProviderError::Unavailable { status: 503 });
        }

        // Split the canned answer into two fragments and append usage
        // metadata, mimicking the real streaming shape.
        let text = self.generation_text.clone();
        let (tx, rx) = tokio::sync::mpsc::channel(8);
        tokio::spawn(async move {
            let middle = text.len() / 2;
            let split_at = (0..=middle)
                .rev()
                .find(|&i| text.is_char_boundary(i))
                .unwrap_or(0);
            let (first, second) = text.split_at(split_at);
            for fragment in [first, second] {
                if !fragment.is_empty() {
                    let _ = tx
                        .send(Ok(GenerationEvent::Fragment(fragment.to_string())))
                        .await;
                }
            }
            let _ = tx
                .send(Ok(GenerationEvent::Usage(TokenUsage {
                    prompt_tokens: 10,
                    candidate_tokens: 5,
                    total_tokens: 15,
                })))
                .await;
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
