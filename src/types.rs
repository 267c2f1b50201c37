use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum number of characters kept in a citation preview.
const CITATION_PREVIEW_CHARS: usize = 200;

/// 16 lowercase hex characters derived from a v4 UUID. Used for document ids
/// and as the random part of session ids.
pub fn short_hex_id() -> String {
    let mut simple = Uuid::new_v4().simple().to_string();
    simple.truncate(16);
    simple
}

/// An uploaded text document. Immutable after creation; owned by exactly one
/// session and released when that session is evicted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub file_name: String,
    pub content: String,
    /// Number of `char`s in `content`. Chunk offsets are char offsets, so
    /// chunk boundaries never land inside a UTF-8 code point.
    pub char_count: usize,
    pub uploaded_at: DateTime<Utc>,
}

impl Document {
    pub fn new(file_name: impl Into<String>, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            id: short_hex_id(),
            file_name: file_name.into(),
            char_count: content.chars().count(),
            content,
            uploaded_at: Utc::now(),
        }
    }
}

/// A contiguous span of a document's text produced by the chunker.
///
/// `start_index`/`end_index` are char offsets into the owning document's
/// content (half-open). They are exact for fixed-size chunking and
/// best-effort (monotonically non-decreasing, within bounds) for the
/// sentence and paragraph strategies, whose chunk content is re-joined with
/// normalized separators.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub document_name: String,
    pub content: String,
    pub start_index: usize,
    pub end_index: usize,
    pub chunk_index: usize,
}

impl Chunk {
    pub fn new(
        document: &Document,
        chunk_index: usize,
        content: String,
        start_index: usize,
        end_index: usize,
    ) -> Self {
        Self {
            id: format!("{}_chunk_{}", document.id, chunk_index),
            document_id: document.id.clone(),
            document_name: document.file_name.clone(),
            content,
            start_index,
            end_index,
            chunk_index,
        }
    }
}

/// A chunk paired with its embedding vector. All embeddings within a session
/// share the same dimension; the vector index enforces this.
#[derive(Debug, Clone)]
pub struct EmbeddedChunk {
    pub chunk: Chunk,
    pub embedding: Vec<f32>,
}

/// One entry of a ranked retrieval. `rank` is 1-based; within a single
/// retrieval ranks follow similarity scores descending, ties broken by
/// insertion order into the index.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalResult {
    pub chunk: Chunk,
    pub similarity_score: f32,
    pub rank: usize,
}

/// Source attribution emitted after generation, one per retrieved chunk.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Citation {
    pub document_name: String,
    pub chunk_preview: String,
    pub relevance_score: f32,
    pub chunk_index: usize,
}

impl Citation {
    pub fn from_result(result: &RetrievalResult) -> Self {
        let content = &result.chunk.content;
        let preview = if content.chars().count() > CITATION_PREVIEW_CHARS {
            let truncated: String = content.chars().take(CITATION_PREVIEW_CHARS).collect();
            format!("{truncated}...")
        } else {
            content.clone()
        };
        Self {
            document_name: result.chunk.document_name.clone(),
            chunk_preview: preview,
            relevance_score: result.similarity_score,
            chunk_index: result.chunk.chunk_index,
        }
    }
}

/// Per-query timing and resource metrics, computed fresh for every query.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryMetrics {
    pub chunking_time_ms: u64,
    pub embedding_time_ms: u64,
    pub retrieval_time_ms: u64,
    pub generation_time_ms: u64,
    pub total_time_ms: u64,
    pub total_chunks: usize,
    pub chunks_retrieved: usize,
    pub embedding_cache_hits: u64,
    pub embedding_cache_misses: u64,
    pub total_tokens_used: u64,
    pub memory_used_bytes: u64,
}

/// Ingestion progress phases, reported over the ingest SSE stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IngestPhase {
    Starting,
    Chunking,
    Embedding,
    Indexing,
    Complete,
    Error,
}

impl IngestPhase {
    /// Pipeline step number for progress display (of `INGEST_TOTAL_STEPS`).
    pub fn step(self) -> u32 {
        match self {
            IngestPhase::Starting => 0,
            IngestPhase::Chunking => 1,
            IngestPhase::Embedding => 2,
            IngestPhase::Indexing => 3,
            IngestPhase::Complete | IngestPhase::Error => 4,
        }
    }
}

pub const INGEST_TOTAL_STEPS: u32 = 4;

/// One progress update on the ingestion stream.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestProgressUpdate {
    pub phase: IngestPhase,
    pub current_step: u32,
    pub total_steps: u32,
    pub message: String,
    pub percent_complete: f32,
}

impl IngestProgressUpdate {
    pub fn new(phase: IngestPhase, message: impl Into<String>, percent_complete: f32) -> Self {
        Self {
            phase,
            current_step: phase.step(),
            total_steps: INGEST_TOTAL_STEPS,
            message: message.into(),
            percent_complete,
        }
    }
}

/// Events emitted on the query SSE stream, in fixed order: optional
/// `retrieval`, zero or more `generation`, zero or more `citation`, exactly
/// one `done` — or a single terminal `error`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum QueryEvent {
    Retrieval {
        retrieved_chunks: Vec<RetrievalResult>,
        content: String,
    },
    Generation {
        content: String,
    },
    Citation {
        citation: Citation,
    },
    Done {
        metrics: QueryMetrics,
    },
    Error {
        content: String,
    },
}
