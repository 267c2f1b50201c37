//! Query/ingest orchestration.
//!
//! The engine is the public façade over the pipeline, retrieval strategies
//! and provider: both operations return lazy finite event streams realized
//! as bounded channels bridged into `ReceiverStream`s. Dropping a stream
//! (client disconnect) cancels the backing task through the caller's
//! cancellation token.

use std::sync::Arc;
use std::time::Instant;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::embedder::EmbeddingClient;
use crate::error::AppError;
use crate::pipeline::{self, IngestRequest};
use crate::provider::{GenerationEvent, GenerationOptions, ModelProvider, ProviderError, TokenUsage};
use crate::retrieval::{self, RetrievalStrategy};
use crate::session::Session;
use crate::types::{Citation, IngestProgressUpdate, QueryEvent, QueryMetrics, RetrievalResult};

const EVENT_CHANNEL_CAP: usize = 32;
const ANSWER_MAX_OUTPUT_TOKENS: u32 = 1024;
const ANSWER_TEMPERATURE: f32 = 0.7;

pub struct QueryRequest {
    pub query: String,
    pub strategy: Option<RetrievalStrategy>,
    pub top_k: Option<usize>,
}

pub struct RagEngine {
    embedder: Arc<EmbeddingClient>,
    provider: Arc<dyn ModelProvider>,
}

impl RagEngine {
    pub fn new(embedder: Arc<EmbeddingClient>, provider: Arc<dyn ModelProvider>) -> Self {
        Self { embedder, provider }
    }

    /// Ingest a document into a session, streaming progress updates.
    pub fn ingest_stream(
        &self,
        session: Arc<Session>,
        request: IngestRequest,
        cancel: CancellationToken,
    ) -> ReceiverStream<IngestProgressUpdate> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAP);
        let embedder = self.embedder.clone();
        tokio::spawn(pipeline::ingest_document(
            session, embedder, request, tx, cancel,
        ));
        ReceiverStream::new(rx)
    }

    /// Answer a query against a session, streaming retrieval, generation,
    /// citation and metrics events.
    pub fn query_stream(
        &self,
        session: Arc<Session>,
        request: QueryRequest,
        cancel: CancellationToken,
    ) -> ReceiverStream<QueryEvent> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAP);
        let embedder = self.embedder.clone();
        let provider = self.provider.clone();
        tokio::spawn(run_query(session, embedder, provider, request, tx, cancel));
        ReceiverStream::new(rx)
    }
}

async fn run_query(
    session: Arc<Session>,
    embedder: Arc<EmbeddingClient>,
    provider: Arc<dyn ModelProvider>,
    request: QueryRequest,
    tx: mpsc::Sender<QueryEvent>,
    cancel: CancellationToken,
) {
    let started = Instant::now();
    let (hits_before, misses_before) = embedder.cache_stats();

    if session.index.is_empty() {
        let _ = tx
            .send(QueryEvent::Error {
                content: "No documents in session. Please upload documents first.".to_string(),
            })
            .await;
        return;
    }

    let strategy = request.strategy.unwrap_or(session.config.default_strategy);
    let top_k = request.top_k.unwrap_or(session.config.top_k);

    // Retrieval
    let retrieval_started = Instant::now();
    let results = match retrieval::retrieve(
        strategy,
        &session,
        &embedder,
        provider.as_ref(),
        &request.query,
        top_k,
        &cancel,
    )
    .await
    {
        Ok(results) => results,
        // After cancellation no further events are emitted.
        Err(AppError::Cancelled) => return,
        Err(e) => {
            let _ = tx
                .send(QueryEvent::Error {
                    content: format!("Retrieval failed: {e}"),
                })
                .await;
            return;
        }
    };
    let retrieval_ms = retrieval_started.elapsed().as_millis() as u64;

    debug!(
        session_id = %session.session_id,
        strategy = strategy.label(),
        retrieved = results.len(),
        retrieval_ms,
        "retrieval complete"
    );

    if tx
        .send(QueryEvent::Retrieval {
            retrieved_chunks: results.clone(),
            content: format!(
                "Retrieved {} chunks using {} strategy",
                results.len(),
                strategy.label()
            ),
        })
        .await
        .is_err()
    {
        return;
    }

    if results.is_empty() {
        let _ = tx
            .send(QueryEvent::Generation {
                content: "No relevant information found in the uploaded documents for this query."
                    .to_string(),
            })
            .await;
        let metrics = finish_metrics(
            &session,
            &embedder,
            started,
            retrieval_ms,
            0,
            0,
            TokenUsage::default(),
            (hits_before, misses_before),
        );
        session.metrics.record_query(retrieval_ms, 0, 0, 0);
        let _ = tx.send(QueryEvent::Done { metrics }).await;
        return;
    }

    // Generation, grounded in the retrieved chunks.
    let prompt = build_prompt(&request.query, &results);
    let options = GenerationOptions {
        max_output_tokens: ANSWER_MAX_OUTPUT_TOKENS,
        temperature: ANSWER_TEMPERATURE,
    };

    let generation_started = Instant::now();
    let mut usage = TokenUsage::default();

    let mut stream = match provider.generate_stream(&prompt, options, &cancel).await {
        Ok(stream) => stream,
        Err(ProviderError::Cancelled) => return,
        Err(e) => {
            let _ = tx
                .send(QueryEvent::Error {
                    content: format!("Generation failed: {e}"),
                })
                .await;
            return;
        }
    };

    while let Some(item) = stream.next().await {
        match item {
            Ok(GenerationEvent::Fragment(fragment)) => {
                if fragment.is_empty() {
                    continue;
                }
                if tx
                    .send(QueryEvent::Generation { content: fragment })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Ok(GenerationEvent::Usage(u)) => usage = u,
            Err(ProviderError::Cancelled) => return,
            Err(e) => {
                warn!(error = %e, "generation stream failed");
                let _ = tx
                    .send(QueryEvent::Error {
                        content: format!("Generation failed: {e}"),
                    })
                    .await;
                return;
            }
        }
    }
    let generation_ms = generation_started.elapsed().as_millis() as u64;

    // Citations follow retrieval order.
    for result in &results {
        if tx
            .send(QueryEvent::Citation {
                citation: Citation::from_result(result),
            })
            .await
            .is_err()
        {
            return;
        }
    }

    let metrics = finish_metrics(
        &session,
        &embedder,
        started,
        retrieval_ms,
        generation_ms,
        results.len(),
        usage,
        (hits_before, misses_before),
    );
    session
        .metrics
        .record_query(retrieval_ms, generation_ms, results.len(), usage.total_tokens);

    info!(
        session_id = %session.session_id,
        total_ms = metrics.total_time_ms,
        chunks_retrieved = results.len(),
        tokens = usage.total_tokens,
        "query answered"
    );

    let _ = tx.send(QueryEvent::Done { metrics }).await;
}

#[allow(clippy::too_many_arguments)]
fn finish_metrics(
    session: &Session,
    embedder: &EmbeddingClient,
    started: Instant,
    retrieval_ms: u64,
    generation_ms: u64,
    chunks_retrieved: usize,
    usage: TokenUsage,
    cache_before: (u64, u64),
) -> QueryMetrics {
    let (hits_after, misses_after) = embedder.cache_stats();
    QueryMetrics {
        chunking_time_ms: 0,
        embedding_time_ms: 0,
        retrieval_time_ms: retrieval_ms,
        generation_time_ms: generation_ms,
        total_time_ms: started.elapsed().as_millis() as u64,
        total_chunks: session.index.len(),
        chunks_retrieved,
        embedding_cache_hits: hits_after.saturating_sub(cache_before.0),
        embedding_cache_misses: misses_after.saturating_sub(cache_before.1),
        total_tokens_used: usage.total_tokens,
        memory_used_bytes: process_memory_bytes(),
    }
}

/// Build the grounded generation prompt: preamble, one block per retrieved
/// chunk with its source and relevance, then the question.
fn build_prompt(query: &str, results: &[RetrievalResult]) -> String {
    let mut prompt = String::from(
        "You are a helpful assistant answering questions about uploaded documents. \
         Use ONLY the context below to answer. If the context does not contain the \
         answer, say so instead of guessing.\n\nContext:\n",
    );
    for result in results {
        prompt.push_str(&format!(
            "[Source: {}, Relevance: {:.0}%]\n{}\n",
            result.chunk.document_name,
            result.similarity_score * 100.0,
            result.chunk.content
        ));
    }
    prompt.push_str(&format!("\nQuestion: {query}\nAnswer:"));
    prompt
}

/// Resident set size of the current process, in bytes. Linux only; other
/// platforms report 0.
pub fn process_memory_bytes() -> u64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(statm) = std::fs::read_to_string("/proc/self/statm") {
            let mut fields = statm.split_whitespace();
            let _total = fields.next();
            if let Some(resident_pages) = fields.next().and_then(|v| v.parse::<u64>().ok()) {
                return resident_pages * 4096;
            }
        }
        0
    }
    #[cfg(not(target_os = "linux"))]
    {
        0
    }
}
