//! Per-session vector index.
//!
//! An append-only bag of embedded chunks. Appenders may be concurrent (the
//! ingestion pipeline's workers feed a single indexer, but queries run in
//! parallel with ingestion), and readers score against a consistent snapshot
//! by holding the read lock for the duration of the scan.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use rayon::prelude::*;

use crate::error::{AppError, AppResult};
use crate::similarity::cosine_similarity;
use crate::types::{EmbeddedChunk, RetrievalResult};

/// Index sizes at or above this are scored on the rayon pool. Scoring is
/// pure and the final stable sort breaks ties by insertion order, so the
/// result is deterministic either way.
const PARALLEL_SCORING_THRESHOLD: usize = 100;

#[derive(Default)]
pub struct VectorIndex {
    entries: RwLock<Vec<EmbeddedChunk>>,
    /// Embedding dimension, pinned by the first insert. 0 = empty index.
    dimension: AtomicUsize,
}

impl VectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Embedding dimension of the index, or 0 while empty.
    pub fn dimension(&self) -> usize {
        self.dimension.load(Ordering::Acquire)
    }

    /// Number of indexed chunks belonging to a document.
    pub fn chunk_count_for(&self, document_id: &str) -> usize {
        self.entries
            .read()
            .iter()
            .filter(|e| e.chunk.document_id == document_id)
            .count()
    }

    /// Rough live size of the index in bytes (embeddings + chunk text).
    pub fn approximate_bytes(&self) -> u64 {
        self.entries
            .read()
            .iter()
            .map(|e| {
                (e.embedding.len() * std::mem::size_of::<f32>() + e.chunk.content.len()) as u64
            })
            .sum()
    }

    /// Append an embedded chunk. All embeddings in one index must share the
    /// dimension pinned by the first insert.
    pub fn insert(&self, entry: EmbeddedChunk) -> AppResult<()> {
        let dim = entry.embedding.len();
        if dim == 0 {
            return Err(AppError::Validation(
                "embedding must not be empty".to_string(),
            ));
        }

        let mut entries = self.entries.write();
        let current = self.dimension.load(Ordering::Acquire);
        if current == 0 {
            self.dimension.store(dim, Ordering::Release);
        } else if current != dim {
            return Err(AppError::InvariantViolation(format!(
                "embedding dimension mismatch: index holds {current}-dim vectors, got {dim}"
            )));
        }
        entries.push(entry);
        Ok(())
    }

    /// Top-K cosine search. Results are sorted by score descending (ties
    /// broken by insertion order), scores below `min_score` dropped, and
    /// ranks assigned 1..=k.
    pub fn search(
        &self,
        query: &[f32],
        top_k: usize,
        min_score: f32,
    ) -> AppResult<Vec<RetrievalResult>> {
        let entries = self.entries.read();
        if entries.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        let dim = self.dimension.load(Ordering::Acquire);
        if query.len() != dim {
            return Err(AppError::InvariantViolation(format!(
                "query dimension {} does not match index dimension {dim}",
                query.len()
            )));
        }

        let mut scored: Vec<(usize, f32)> = if entries.len() >= PARALLEL_SCORING_THRESHOLD {
            entries
                .par_iter()
                .enumerate()
                .map(|(i, e)| (i, cosine_similarity(query, &e.embedding)))
                .collect()
        } else {
            entries
                .iter()
                .enumerate()
                .map(|(i, e)| (i, cosine_similarity(query, &e.embedding)))
                .collect()
        };

        scored.retain(|&(_, score)| score >= min_score);
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(CmpOrdering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(top_k);

        Ok(scored
            .into_iter()
            .enumerate()
            .map(|(position, (index, score))| RetrievalResult {
                chunk: entries[index].chunk.clone(),
                similarity_score: score,
                rank: position + 1,
            })
            .collect())
    }
}
