//! Model provider abstraction and the Gemini HTTP implementation.
//!
//! The engine consumes two provider operations: embedding a text into a
//! fixed-dimension vector and generating text from a prompt (streaming and
//! non-streaming variants, matching the `:embedContent`,
//! `:generateContent` and `:streamGenerateContent` endpoints).

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::AppConfig;

pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("provider returned {status}: {body}")]
    Provider { status: u16, body: String },

    #[error("provider unavailable (status {status})")]
    Unavailable { status: u16 },

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    #[error("cancelled")]
    Cancelled,

    #[error("failed to parse provider response: {0}")]
    Parse(String),
}

impl ProviderError {
    /// Throttling, outages and transport faults are worth retrying; client
    /// errors and cancellation are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Unavailable { .. } | ProviderError::Transport(_) | ProviderError::Timeout
        )
    }
}

fn map_reqwest_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout
    } else {
        ProviderError::Transport(err.to_string())
    }
}

fn classify_status(status: u16, body: String) -> ProviderError {
    match status {
        429 | 500 | 502 | 503 | 504 => ProviderError::Unavailable { status },
        _ => ProviderError::Provider { status, body },
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GenerationOptions {
    pub max_output_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub candidate_tokens: u64,
    pub total_tokens: u64,
}

/// Items of a generation stream: text fragments in arrival order, with the
/// provider's usage metadata interleaved at the end when present.
#[derive(Debug, Clone)]
pub enum GenerationEvent {
    Fragment(String),
    Usage(TokenUsage),
}

pub type GenerationStream = Pin<Box<dyn Stream<Item = ProviderResult<GenerationEvent>> + Send>>;

#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Embed a text into a dense vector. Deterministic for the same input
    /// under a given model version; the dimension is fixed per deployment.
    async fn embed(&self, text: &str, cancel: &CancellationToken) -> ProviderResult<Vec<f32>>;

    /// Generate a complete answer for a prompt (non-streaming endpoint).
    async fn generate(
        &self,
        prompt: &str,
        options: GenerationOptions,
        cancel: &CancellationToken,
    ) -> ProviderResult<String>;

    /// Generate an answer as a stream of text fragments.
    async fn generate_stream(
        &self,
        prompt: &str,
        options: GenerationOptions,
        cancel: &CancellationToken,
    ) -> ProviderResult<GenerationStream>;
}

// ---------------------------------------------------------------------------
// Gemini wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiEmbedRequest {
    content: GeminiContent,
}

#[derive(Debug, Deserialize)]
struct GeminiEmbedResponse {
    embedding: GeminiEmbeddingValues,
}

#[derive(Debug, Deserialize)]
struct GeminiEmbeddingValues {
    values: Vec<f32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerateRequest {
    contents: Vec<GeminiContent>,
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiStreamChunk {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    usage_metadata: Option<GeminiUsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
    #[serde(default)]
    total_token_count: u64,
}

impl GeminiStreamChunk {
    fn into_events(self) -> Vec<GenerationEvent> {
        let mut events = Vec::new();
        let text = self
            .candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .and_then(|c| c.parts.first())
            .map(|p| p.text.clone())
            .unwrap_or_default();
        if !text.is_empty() {
            events.push(GenerationEvent::Fragment(text));
        }
        if let Some(usage) = self.usage_metadata {
            events.push(GenerationEvent::Usage(TokenUsage {
                prompt_tokens: usage.prompt_token_count,
                candidate_tokens: usage.candidates_token_count,
                total_tokens: usage.total_token_count,
            }));
        }
        events
    }
}

fn user_content(text: &str) -> GeminiContent {
    GeminiContent {
        role: Some("user".to_string()),
        parts: vec![GeminiPart {
            text: text.to_string(),
        }],
    }
}

// ---------------------------------------------------------------------------
// Streaming response parser
// ---------------------------------------------------------------------------

/// Incremental parser for the provider's streaming body. Tolerates the three
/// framings seen in the wild: a JSON array of chunk objects, a single
/// object, and newline-delimited objects optionally prefixed with `data: `.
///
/// Works by scanning for complete top-level JSON objects (string-aware brace
/// matching) and ignoring the framing bytes between them, which covers all
/// three cases uniformly — including pretty-printed arrays whose objects
/// span multiple network reads.
pub(crate) struct StreamBodyParser {
    buffer: String,
    emitted_chunks: usize,
}

impl StreamBodyParser {
    pub(crate) fn new() -> Self {
        Self {
            buffer: String::new(),
            emitted_chunks: 0,
        }
    }

    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<GenerationEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));
        let mut events = Vec::new();
        for object in self.extract_objects() {
            match serde_json::from_str::<GeminiStreamChunk>(&object) {
                Ok(chunk) => {
                    self.emitted_chunks += 1;
                    events.extend(chunk.into_events());
                }
                Err(e) => {
                    warn!("skipping unparseable stream chunk: {}", e);
                }
            }
        }
        events
    }

    /// Finish the stream. Fails when the body contained no parseable chunk
    /// objects at all.
    pub(crate) fn finish(mut self) -> ProviderResult<Vec<GenerationEvent>> {
        let events: Vec<GenerationEvent> = self
            .extract_objects()
            .into_iter()
            .filter_map(|object| {
                let parsed = serde_json::from_str::<GeminiStreamChunk>(&object).ok();
                if parsed.is_some() {
                    self.emitted_chunks += 1;
                }
                parsed
            })
            .flat_map(GeminiStreamChunk::into_events)
            .collect();

        if self.emitted_chunks == 0 {
            let preview: String = self.buffer.chars().take(120).collect();
            return Err(ProviderError::Parse(format!(
                "no parseable chunks in streaming response: {preview:?}"
            )));
        }
        Ok(events)
    }

    /// Remove and return every complete top-level JSON object currently in
    /// the buffer, leaving any incomplete trailing object in place.
    fn extract_objects(&mut self) -> Vec<String> {
        let bytes = self.buffer.as_bytes();
        let mut objects = Vec::new();
        let mut consumed = 0usize;
        let mut i = 0usize;

        while i < bytes.len() {
            if bytes[i] != b'{' {
                // Framing bytes between objects: brackets, commas,
                // whitespace, `data: ` prefixes.
                i += 1;
                consumed = i;
                continue;
            }

            let start = i;
            let mut depth = 0usize;
            let mut in_string = false;
            let mut escaped = false;
            let mut end = None;

            while i < bytes.len() {
                let c = bytes[i];
                if in_string {
                    if escaped {
                        escaped = false;
                    } else if c == b'\\' {
                        escaped = true;
                    } else if c == b'"' {
                        in_string = false;
                    }
                } else {
                    match c {
                        b'"' => in_string = true,
                        b'{' => depth += 1,
                        b'}' => {
                            depth -= 1;
                            if depth == 0 {
                                end = Some(i);
                                break;
                            }
                        }
                        _ => {}
                    }
                }
                i += 1;
            }

            match end {
                Some(e) => {
                    objects.push(self.buffer[start..=e].to_string());
                    i = e + 1;
                    consumed = i;
                }
                None => {
                    // Incomplete object: keep it buffered from `start`.
                    consumed = start;
                    break;
                }
            }
        }

        self.buffer.drain(..consumed);
        objects
    }
}

// ---------------------------------------------------------------------------
// Gemini provider
// ---------------------------------------------------------------------------

pub struct GeminiProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    embedding_model: String,
    generation_model: String,
    embed_timeout: Duration,
    generation_timeout: Duration,
}

impl GeminiProvider {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.provider_base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().unwrap_or_default(),
            embedding_model: config.embedding_model.clone(),
            generation_model: config.generation_model.clone(),
            embed_timeout: config.embed_timeout,
            generation_timeout: config.generation_timeout,
        }
    }

    fn endpoint(&self, model: &str, verb: &str) -> String {
        format!(
            "{}/models/{}:{}?key={}",
            self.base_url, model, verb, self.api_key
        )
    }

    async fn check_status(response: reqwest::Response) -> ProviderResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status.as_u16(), body))
    }
}

#[async_trait]
impl ModelProvider for GeminiProvider {
    async fn embed(&self, text: &str, cancel: &CancellationToken) -> ProviderResult<Vec<f32>> {
        let url = self.endpoint(&self.embedding_model, "embedContent");
        let request = GeminiEmbedRequest {
            content: user_content(text),
        };

        let work = async {
            let response = self
                .http
                .post(&url)
                .timeout(self.embed_timeout)
                .json(&request)
                .send()
                .await
                .map_err(map_reqwest_error)?;
            let response = Self::check_status(response).await?;
            let parsed: GeminiEmbedResponse = response
                .json()
                .await
                .map_err(|e| ProviderError::Parse(e.to_string()))?;
            Ok(parsed.embedding.values)
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(ProviderError::Cancelled),
            result = work => result,
        }
    }

    async fn generate(
        &self,
        prompt: &str,
        options: GenerationOptions,
        cancel: &CancellationToken,
    ) -> ProviderResult<String> {
        let url = self.endpoint(&self.generation_model, "generateContent");
        let request = GeminiGenerateRequest {
            contents: vec![user_content(prompt)],
            generation_config: GeminiGenerationConfig {
                temperature: options.temperature,
                max_output_tokens: options.max_output_tokens,
            },
        };

        let work = async {
            let response = self
                .http
                .post(&url)
                .timeout(self.generation_timeout)
                .json(&request)
                .send()
                .await
                .map_err(map_reqwest_error)?;
            let response = Self::check_status(response).await?;
            let parsed: GeminiStreamChunk = response
                .json()
                .await
                .map_err(|e| ProviderError::Parse(e.to_string()))?;
            let text = parsed
                .candidates
                .first()
                .and_then(|c| c.content.as_ref())
                .map(|c| {
                    c.parts
                        .iter()
                        .map(|p| p.text.as_str())
                        .collect::<Vec<_>>()
                        .join("")
                })
                .unwrap_or_default();
            if text.is_empty() {
                return Err(ProviderError::Parse("no candidates in response".into()));
            }
            Ok(text)
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(ProviderError::Cancelled),
            result = work => result,
        }
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        options: GenerationOptions,
        cancel: &CancellationToken,
    ) -> ProviderResult<GenerationStream> {
        let url = self.endpoint(&self.generation_model, "streamGenerateContent");
        let request = GeminiGenerateRequest {
            contents: vec![user_content(prompt)],
            generation_config: GeminiGenerationConfig {
                temperature: options.temperature,
                max_output_tokens: options.max_output_tokens,
            },
        };

        let send = async {
            let response = self
                .http
                .post(&url)
                .timeout(self.generation_timeout)
                .json(&request)
                .send()
                .await
                .map_err(map_reqwest_error)?;
            Self::check_status(response).await
        };

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            result = send => result?,
        };

        debug!(model = %self.generation_model, "generation stream opened");

        let (tx, rx) = mpsc::channel::<ProviderResult<GenerationEvent>>(32);
        let cancel = cancel.clone();

        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut parser = StreamBodyParser::new();

            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = tx.send(Err(ProviderError::Cancelled)).await;
                        return;
                    }
                    next = body.next() => next,
                };

                match next {
                    Some(Ok(bytes)) => {
                        for event in parser.push(&bytes) {
                            if tx.send(Ok(event)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        let _ = tx.send(Err(map_reqwest_error(e))).await;
                        return;
                    }
                    None => break,
                }
            }

            match parser.finish() {
                Ok(events) => {
                    for event in events {
                        if tx.send(Ok(event)).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn collect_fragments(events: &[GenerationEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                GenerationEvent::Fragment(text) => Some(text.as_str()),
                GenerationEvent::Usage(_) => None,
            })
            .collect()
    }

    fn chunk_json(text: &str) -> String {
        format!(
            r#"{{"candidates":[{{"content":{{"role":"model","parts":[{{"text":"{text}"}}]}}}}]}}"#
        )
    }

    #[test]
    fn parser_handles_json_array_framing() {
        let mut parser = StreamBodyParser::new();
        let body = format!("[{},\n{}]", chunk_json("Hello "), chunk_json("world"));
        let events = parser.push(body.as_bytes());
        assert_eq!(collect_fragments(&events), "Hello world");
        assert!(parser.finish().is_ok());
    }

    #[test]
    fn parser_handles_single_object_framing() {
        let mut parser = StreamBodyParser::new();
        let events = parser.push(chunk_json("solo").as_bytes());
        assert_eq!(collect_fragments(&events), "solo");
    }

    #[test]
    fn parser_handles_ndjson_with_data_prefix() {
        let mut parser = StreamBodyParser::new();
        let body = format!(
            "data: {}\ndata: {}\n",
            chunk_json("part one, "),
            chunk_json("part two")
        );
        let events = parser.push(body.as_bytes());
        assert_eq!(collect_fragments(&events), "part one, part two");
    }

    #[test]
    fn parser_handles_objects_split_across_reads() {
        let mut parser = StreamBodyParser::new();
        let full = format!("[{}]", chunk_json("split"));
        let (a, b) = full.split_at(20);

        let events_a = parser.push(a.as_bytes());
        assert!(events_a.is_empty(), "incomplete object must stay buffered");
        let events_b = parser.push(b.as_bytes());
        assert_eq!(collect_fragments(&events_b), "split");
    }

    #[test]
    fn parser_surfaces_trailing_usage_metadata() {
        let mut parser = StreamBodyParser::new();
        let body = format!(
            r#"[{},{{"usageMetadata":{{"promptTokenCount":10,"candidatesTokenCount":20,"totalTokenCount":30}}}}]"#,
            chunk_json("answer")
        );
        let events = parser.push(body.as_bytes());
        let usage = events.iter().find_map(|e| match e {
            GenerationEvent::Usage(u) => Some(*u),
            _ => None,
        });
        assert_eq!(
            usage,
            Some(TokenUsage {
                prompt_tokens: 10,
                candidate_tokens: 20,
                total_tokens: 30
            })
        );
    }

    #[test]
    fn parser_rejects_garbage_bodies() {
        let mut parser = StreamBodyParser::new();
        let events = parser.push(b"this is not json at all");
        assert!(events.is_empty());
        assert!(matches!(parser.finish(), Err(ProviderError::Parse(_))));
    }

    #[test]
    fn parser_ignores_strings_containing_braces() {
        let mut parser = StreamBodyParser::new();
        let body = chunk_json("code: fn main() { println!(\\\"{}\\\"); }");
        let events = parser.push(body.as_bytes());
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn status_classification_separates_retryable_errors() {
        assert!(classify_status(429, String::new()).is_retryable());
        assert!(classify_status(503, String::new()).is_retryable());
        assert!(!classify_status(400, "bad".into()).is_retryable());
        assert!(!classify_status(404, "missing".into()).is_retryable());
    }

    fn test_provider(base_url: &str) -> GeminiProvider {
        let config = AppConfig {
            listen_addr: "127.0.0.1:0".into(),
            provider_base_url: base_url.to_string(),
            api_key: Some("test-key".into()),
            embedding_model: "embed-model".into(),
            generation_model: "gen-model".into(),
            embed_timeout: Duration::from_secs(5),
            generation_timeout: Duration::from_secs(5),
            embed_max_retries: 0,
            max_concurrent_requests: 2,
            embed_cache_minutes: 1,
            embed_cache_max_mb: 1,
            session_defaults: Default::default(),
        };
        GeminiProvider::new(&config)
    }

    #[tokio::test]
    async fn embed_parses_embedding_values() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/embed-model:embedContent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "embedding": { "values": [0.1, 0.2, 0.3] }
            })))
            .mount(&server)
            .await;

        let provider = test_provider(&server.uri());
        let cancel = CancellationToken::new();
        let embedding = provider.embed("hello", &cancel).await.unwrap();
        assert_eq!(embedding, vec![0.1, 0.2, 0.3]);
    }

    #[tokio::test]
    async fn embed_maps_throttling_to_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/embed-model:embedContent"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let provider = test_provider(&server.uri());
        let cancel = CancellationToken::new();
        let err = provider.embed("hello", &cancel).await.unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable { status: 429 }));
    }

    #[tokio::test]
    async fn embed_maps_client_error_to_provider_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/embed-model:embedContent"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad input"))
            .mount(&server)
            .await;

        let provider = test_provider(&server.uri());
        let cancel = CancellationToken::new();
        let err = provider.embed("hello", &cancel).await.unwrap_err();
        assert!(matches!(err, ProviderError::Provider { status: 400, .. }));
    }

    #[tokio::test]
    async fn embed_respects_cancellation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/embed-model:embedContent"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_secs(5))
                    .set_body_json(serde_json::json!({ "embedding": { "values": [0.0] } })),
            )
            .mount(&server)
            .await;

        let provider = test_provider(&server.uri());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = provider.embed("hello", &cancel).await.unwrap_err();
        assert!(matches!(err, ProviderError::Cancelled));
    }

    #[tokio::test]
    async fn generate_stream_concatenates_fragments() {
        let server = MockServer::start().await;
        let body = format!("[{},\n{}]", chunk_json("Hello "), chunk_json("world"));
        Mock::given(method("POST"))
            .and(path("/models/gen-model:streamGenerateContent"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let provider = test_provider(&server.uri());
        let cancel = CancellationToken::new();
        let options = GenerationOptions {
            max_output_tokens: 100,
            temperature: 0.5,
        };
        let mut stream = provider
            .generate_stream("hi", options, &cancel)
            .await
            .unwrap();

        let mut text = String::new();
        while let Some(item) = stream.next().await {
            if let GenerationEvent::Fragment(fragment) = item.unwrap() {
                text.push_str(&fragment);
            }
        }
        assert_eq!(text, "Hello world");
    }

    #[tokio::test]
    async fn generate_returns_joined_candidate_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/gen-model:generateContent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "candidates": [{
                    "content": { "role": "model", "parts": [{ "text": "full answer" }] }
                }]
            })))
            .mount(&server)
            .await;

        let provider = test_provider(&server.uri());
        let cancel = CancellationToken::new();
        let options = GenerationOptions {
            max_output_tokens: 100,
            temperature: 0.3,
        };
        let text = provider.generate("hi", options, &cancel).await.unwrap();
        assert_eq!(text, "full answer");
    }
}
