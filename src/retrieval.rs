//! Retrieval strategies: direct, query expansion with rerank, and
//! hypothetical-document embeddings (HyDE).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::embedder::EmbeddingClient;
use crate::error::{AppError, AppResult};
use crate::provider::{GenerationOptions, ModelProvider};
use crate::session::Session;
use crate::types::RetrievalResult;

/// Rerank bonus per additional query variation that retrieved a chunk.
const EXPANSION_HIT_BONUS: f32 = 0.05;
/// Candidate multiplier and threshold relaxation for expanded searches.
const EXPANSION_CANDIDATE_FACTOR: usize = 2;
const EXPANSION_SCORE_FACTOR: f32 = 0.8;

const HYDE_MAX_OUTPUT_TOKENS: u32 = 500;
const HYDE_TEMPERATURE: f32 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum RetrievalStrategy {
    #[default]
    Direct,
    QueryExpansion,
    HypotheticalDocument,
}

impl RetrievalStrategy {
    pub fn label(&self) -> &'static str {
        match self {
            RetrievalStrategy::Direct => "direct",
            RetrievalStrategy::QueryExpansion => "query expansion",
            RetrievalStrategy::HypotheticalDocument => "hypothetical document",
        }
    }
}

/// Run the selected strategy against a session's index.
pub async fn retrieve(
    strategy: RetrievalStrategy,
    session: &Session,
    embedder: &EmbeddingClient,
    provider: &dyn ModelProvider,
    query: &str,
    top_k: usize,
    cancel: &CancellationToken,
) -> AppResult<Vec<RetrievalResult>> {
    match strategy {
        RetrievalStrategy::Direct => retrieve_direct(session, embedder, query, top_k, cancel).await,
        RetrievalStrategy::QueryExpansion => {
            retrieve_expanded(session, embedder, query, top_k, cancel).await
        }
        RetrievalStrategy::HypotheticalDocument => {
            retrieve_hypothetical(session, embedder, provider, query, top_k, cancel).await
        }
    }
}

async fn retrieve_direct(
    session: &Session,
    embedder: &EmbeddingClient,
    query: &str,
    top_k: usize,
    cancel: &CancellationToken,
) -> AppResult<Vec<RetrievalResult>> {
    let query_embedding = embedder.embed(query, cancel).await?;
    session
        .index
        .search(&query_embedding, top_k, session.config.min_similarity_score)
}

/// Fixed templates applied to the trimmed query, deduplicated
/// case-insensitively while preserving order.
fn expand_query(query: &str) -> Vec<String> {
    let trimmed = query.trim();
    let candidates = [
        trimmed.to_string(),
        format!("What is {trimmed}?"),
        format!("How does {trimmed} work?"),
        format!("Examples of {trimmed}"),
    ];

    let mut seen = std::collections::HashSet::new();
    candidates
        .into_iter()
        .filter(|c| seen.insert(c.to_lowercase()))
        .collect()
}

struct MergedHit {
    result: RetrievalResult,
    max_score: f32,
    hit_count: usize,
    first_seen: usize,
}

async fn retrieve_expanded(
    session: &Session,
    embedder: &EmbeddingClient,
    query: &str,
    top_k: usize,
    cancel: &CancellationToken,
) -> AppResult<Vec<RetrievalResult>> {
    let variations = expand_query(query);
    debug!(count = variations.len(), "expanded query variations");

    // Embed all variations concurrently. This fails only when every
    // variation fails; partial failures leave `None` slots.
    let embeddings = embedder.embed_batch(&variations, cancel, |_| {}).await?;

    let candidate_count = top_k * EXPANSION_CANDIDATE_FACTOR;
    let relaxed_min = session.config.min_similarity_score * EXPANSION_SCORE_FACTOR;

    let mut merged: HashMap<String, MergedHit> = HashMap::new();
    let mut order = 0usize;

    for (variation, embedding) in variations.iter().zip(&embeddings) {
        let Some(embedding) = embedding else {
            warn!(variation = %variation, "variation embedding failed, skipping");
            continue;
        };
        let results = session.index.search(embedding, candidate_count, relaxed_min)?;
        for result in results {
            let key = result.chunk.id.clone();
            match merged.get_mut(&key) {
                Some(hit) => {
                    hit.hit_count += 1;
                    if result.similarity_score > hit.max_score {
                        hit.max_score = result.similarity_score;
                        hit.result = result;
                    }
                }
                None => {
                    merged.insert(
                        key,
                        MergedHit {
                            max_score: result.similarity_score,
                            result,
                            hit_count: 1,
                            first_seen: order,
                        },
                    );
                    order += 1;
                }
            }
        }
    }

    // Rerank: the best cosine score, boosted a little for chunks several
    // variations agree on.
    let mut hits: Vec<MergedHit> = merged.into_values().collect();
    hits.sort_by(|a, b| {
        let combined_a = a.max_score + (a.hit_count as f32 - 1.0) * EXPANSION_HIT_BONUS;
        let combined_b = b.max_score + (b.hit_count as f32 - 1.0) * EXPANSION_HIT_BONUS;
        combined_b
            .partial_cmp(&combined_a)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.first_seen.cmp(&b.first_seen))
    });
    hits.truncate(top_k);

    Ok(hits
        .into_iter()
        .enumerate()
        .map(|(i, hit)| RetrievalResult {
            similarity_score: hit.max_score,
            rank: i + 1,
            ..hit.result
        })
        .collect())
}

fn hyde_prompt(query: &str) -> String {
    format!(
        "Write a short, factual passage that would plausibly answer the question below, \
         as if taken from a reference document. Do not address the reader or mention \
         uncertainty.\n\nQuestion: {}\n\nPassage:",
        query.trim()
    )
}

async fn retrieve_hypothetical(
    session: &Session,
    embedder: &EmbeddingClient,
    provider: &dyn ModelProvider,
    query: &str,
    top_k: usize,
    cancel: &CancellationToken,
) -> AppResult<Vec<RetrievalResult>> {
    let options = GenerationOptions {
        max_output_tokens: HYDE_MAX_OUTPUT_TOKENS,
        temperature: HYDE_TEMPERATURE,
    };

    let hypothesis = match provider.generate(&hyde_prompt(query), options, cancel).await {
        Ok(text) if !text.trim().is_empty() => text,
        Ok(_) => {
            warn!("hypothesis generation returned empty text, falling back to direct retrieval");
            return retrieve_direct(session, embedder, query, top_k, cancel).await;
        }
        Err(crate::provider::ProviderError::Cancelled) => return Err(AppError::Cancelled),
        Err(e) => {
            warn!(error = %e, "hypothesis generation failed, falling back to direct retrieval");
            return retrieve_direct(session, embedder, query, top_k, cancel).await;
        }
    };

    match embedder.embed(&hypothesis, cancel).await {
        Ok(embedding) => session.index.search(
            &embedding,
            top_k,
            session.config.min_similarity_score,
        ),
        Err(AppError::Cancelled) => Err(AppError::Cancelled),
        Err(e) => {
            warn!(error = %e, "hypothesis embedding failed, falling back to direct retrieval");
            retrieve_direct(session, embedder, query, top_k, cancel).await
        }
    }
}
