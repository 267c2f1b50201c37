//! Staged ingestion pipeline: chunk → embed → index.
//!
//! ```text
//!   Document → Chunker → [bounded channel, cap 50] → embed workers
//!                                                      ↓
//!                            [bounded channel, cap 20] → indexer
//! ```
//!
//! Both channels are bounded so a large document cannot balloon memory: a
//! slow indexer backpressures the embed workers, which backpressure the
//! producer. Per-chunk embedding failures are logged and the chunk dropped;
//! the document still ingests as long as at least one chunk lands in the
//! index.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chunker::{self, ChunkingStrategy};
use crate::embedder::EmbeddingClient;
use crate::error::AppError;
use crate::session::Session;
use crate::types::{Chunk, Document, EmbeddedChunk, IngestPhase, IngestProgressUpdate};

const CHUNK_CHANNEL_CAP: usize = 50;
const EMBED_CHANNEL_CAP: usize = 20;

pub struct IngestRequest {
    pub file_name: String,
    pub content: String,
    pub chunking_strategy: Option<ChunkingStrategy>,
}

/// Progress sink: forwards updates to the caller's stream and remembers the
/// last reported percentage so error updates can carry it.
#[derive(Clone)]
struct ProgressReporter {
    tx: mpsc::Sender<IngestProgressUpdate>,
    last_percent: Arc<AtomicU32>,
}

impl ProgressReporter {
    fn new(tx: mpsc::Sender<IngestProgressUpdate>) -> Self {
        Self {
            tx,
            last_percent: Arc::new(AtomicU32::new(0)),
        }
    }

    async fn send(&self, phase: IngestPhase, message: impl Into<String>, percent: f32) {
        self.last_percent
            .store(percent.to_bits(), Ordering::Relaxed);
        let _ = self
            .tx
            .send(IngestProgressUpdate::new(phase, message, percent))
            .await;
    }

    async fn send_error(&self, message: impl Into<String>) {
        let percent = f32::from_bits(self.last_percent.load(Ordering::Relaxed));
        let _ = self
            .tx
            .send(IngestProgressUpdate::new(
                IngestPhase::Error,
                message,
                percent,
            ))
            .await;
    }
}

/// Ingest one document into one session, reporting progress through `tx`.
///
/// Never returns an error: failures surface as a terminal `Error` progress
/// update, keeping the session usable.
pub async fn ingest_document(
    session: Arc<Session>,
    embedder: Arc<EmbeddingClient>,
    request: IngestRequest,
    tx: mpsc::Sender<IngestProgressUpdate>,
    cancel: CancellationToken,
) {
    let reporter = ProgressReporter::new(tx);
    if let Err(e) = run_pipeline(&session, &embedder, request, &reporter, &cancel).await {
        let message = match &e {
            AppError::Cancelled => "document processing was cancelled".to_string(),
            other => other.to_string(),
        };
        reporter.send_error(message).await;
    }
}

async fn run_pipeline(
    session: &Arc<Session>,
    embedder: &Arc<EmbeddingClient>,
    request: IngestRequest,
    reporter: &ProgressReporter,
    cancel: &CancellationToken,
) -> Result<(), AppError> {
    reporter
        .send(
            IngestPhase::Starting,
            format!("Starting ingestion of {}", request.file_name),
            0.0,
        )
        .await;

    // Pre-flight validation, before any work.
    let config = &session.config;
    if request.content.len() > config.max_file_size_bytes {
        return Err(AppError::Validation(format!(
            "File too large ({}KB). Maximum: {}KB",
            request.content.len() / 1024,
            config.max_file_size_bytes / 1024
        )));
    }
    if session.document_count() >= config.max_documents {
        return Err(AppError::Validation(format!(
            "document limit reached ({} documents max)",
            config.max_documents
        )));
    }

    let document = Document::new(request.file_name, request.content);
    let strategy = request
        .chunking_strategy
        .unwrap_or(config.default_chunking_strategy);

    reporter
        .send(
            IngestPhase::Chunking,
            format!("Splitting {} into chunks", document.file_name),
            10.0,
        )
        .await;

    let chunking_started = Instant::now();
    let chunks = chunker::chunk_document(&document, strategy, config.chunk_size, config.chunk_overlap);
    let chunking_ms = chunking_started.elapsed().as_millis() as u64;

    if chunks.is_empty() {
        return Err(AppError::Validation(
            "document produced no chunks".to_string(),
        ));
    }

    let total = chunks.len();
    debug!(
        document_id = %document.id,
        chunks = total,
        strategy = ?strategy,
        "document chunked"
    );

    reporter
        .send(
            IngestPhase::Embedding,
            format!("Embedding {total} chunks"),
            30.0,
        )
        .await;

    let embedding_started = Instant::now();
    let indexed = run_stages(session, embedder, &document, chunks, reporter, cancel).await?;
    let embedding_ms = embedding_started.elapsed().as_millis() as u64;

    if cancel.is_cancelled() {
        return Err(AppError::Cancelled);
    }
    if indexed == 0 {
        return Err(AppError::Provider(
            "all chunks failed to embed".to_string(),
        ));
    }

    // Finalize: the document joins the session only after its chunks are
    // indexed.
    session.documents.write().push(document.clone());
    session.touch();
    session
        .metrics
        .record_ingestion(chunking_ms, embedding_ms, indexed);

    if indexed < total {
        warn!(
            document_id = %document.id,
            indexed,
            total,
            "some chunks failed to embed and were skipped"
        );
    }
    info!(
        session_id = %session.session_id,
        document_id = %document.id,
        indexed,
        "document ingested"
    );

    reporter
        .send(
            IngestPhase::Complete,
            format!("Indexed {indexed} chunks from {}", document.file_name),
            100.0,
        )
        .await;

    Ok(())
}

/// Producer → embed workers → indexer, connected by bounded channels.
/// Returns the number of chunks appended to the session index.
async fn run_stages(
    session: &Arc<Session>,
    embedder: &Arc<EmbeddingClient>,
    document: &Document,
    chunks: Vec<Chunk>,
    reporter: &ProgressReporter,
    cancel: &CancellationToken,
) -> Result<usize, AppError> {
    let total = chunks.len();
    let (chunk_tx, chunk_rx) = flume::bounded::<Chunk>(CHUNK_CHANNEL_CAP);
    let (embedded_tx, embedded_rx) = flume::bounded::<EmbeddedChunk>(EMBED_CHANNEL_CAP);

    // Stage 2: single producer pushes chunks in chunk-index order.
    let producer = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            for chunk in chunks {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    result = chunk_tx.send_async(chunk) => {
                        if result.is_err() {
                            return;
                        }
                    }
                }
            }
        })
    };

    // Stage 3: embed workers. Completion counts drive the 30→80% progress
    // band; failed chunks are dropped with a warning.
    let worker_count = session
        .config
        .max_concurrent_embeddings
        .min(total)
        .max(1);
    let completed = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..worker_count)
        .map(|_| {
            let chunk_rx = chunk_rx.clone();
            let embedded_tx = embedded_tx.clone();
            let embedder = embedder.clone();
            let reporter = reporter.clone();
            let cancel = cancel.clone();
            let completed = completed.clone();
            tokio::spawn(async move {
                loop {
                    let chunk = tokio::select! {
                        _ = cancel.cancelled() => return,
                        received = chunk_rx.recv_async() => match received {
                            Ok(chunk) => chunk,
                            Err(_) => return,
                        }
                    };

                    match embedder.embed(&chunk.content, &cancel).await {
                        Ok(embedding) => {
                            let entry = EmbeddedChunk {
                                embedding: embedding.as_ref().clone(),
                                chunk,
                            };
                            let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                            let percent = 30.0 + (done as f32 / total as f32) * 50.0;
                            reporter
                                .send(
                                    IngestPhase::Embedding,
                                    format!("Embedded {done}/{total} chunks"),
                                    percent,
                                )
                                .await;

                            tokio::select! {
                                _ = cancel.cancelled() => return,
                                result = embedded_tx.send_async(entry) => {
                                    if result.is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                        Err(AppError::Cancelled) => return,
                        Err(e) => {
                            completed.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                chunk_id = %chunk.id,
                                error = %e,
                                "embedding failed, dropping chunk"
                            );
                        }
                    }
                }
            })
        })
        .collect();
    drop(chunk_rx);
    drop(embedded_tx);

    // Stage 4: single indexer appends to the session's vector index.
    let indexer = {
        let session = session.clone();
        let document_id = document.id.clone();
        tokio::spawn(async move {
            let mut indexed = 0usize;
            while let Ok(entry) = embedded_rx.recv_async().await {
                match session.index.insert(entry) {
                    Ok(()) => indexed += 1,
                    Err(e) => {
                        tracing::error!(
                            document_id = %document_id,
                            error = %e,
                            "failed to index embedded chunk"
                        );
                        return Err(e);
                    }
                }
            }
            Ok(indexed)
        })
    };

    let _ = producer.await;
    for worker in workers {
        let _ = worker.await;
    }

    if !cancel.is_cancelled() {
        reporter
            .send(
                IngestPhase::Indexing,
                "Writing chunks to the session index",
                90.0,
            )
            .await;
    }

    match indexer.await {
        Ok(result) => result,
        Err(join_error) => Err(AppError::Internal(anyhow::anyhow!(
            "indexer task failed: {join_error}"
        ))),
    }
}
