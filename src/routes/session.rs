use axum::extract::{Path, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::chunker::ChunkingStrategy;
use crate::config::SessionConfig;
use crate::error::{AppError, AppResult};
use crate::retrieval::RetrievalStrategy;
use crate::state::AppState;

/// Per-field session config override; anything omitted falls back to the
/// process defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfigOverride {
    pub session_ttl_secs: Option<u64>,
    pub max_documents: Option<usize>,
    pub max_file_size_bytes: Option<usize>,
    pub chunk_size: Option<usize>,
    pub chunk_overlap: Option<usize>,
    pub top_k: Option<usize>,
    pub min_similarity_score: Option<f32>,
    pub default_strategy: Option<RetrievalStrategy>,
    pub default_chunking_strategy: Option<ChunkingStrategy>,
    pub max_concurrent_embeddings: Option<usize>,
}

impl SessionConfigOverride {
    pub fn apply(self, defaults: &SessionConfig) -> SessionConfig {
        SessionConfig {
            session_ttl_secs: self.session_ttl_secs.unwrap_or(defaults.session_ttl_secs),
            max_documents: self.max_documents.unwrap_or(defaults.max_documents),
            max_file_size_bytes: self
                .max_file_size_bytes
                .unwrap_or(defaults.max_file_size_bytes),
            chunk_size: self.chunk_size.unwrap_or(defaults.chunk_size),
            chunk_overlap: self.chunk_overlap.unwrap_or(defaults.chunk_overlap),
            top_k: self.top_k.unwrap_or(defaults.top_k),
            min_similarity_score: self
                .min_similarity_score
                .unwrap_or(defaults.min_similarity_score),
            default_strategy: self.default_strategy.unwrap_or(defaults.default_strategy),
            default_chunking_strategy: self
                .default_chunking_strategy
                .unwrap_or(defaults.default_chunking_strategy),
            max_concurrent_embeddings: self
                .max_concurrent_embeddings
                .unwrap_or(defaults.max_concurrent_embeddings),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateSessionRequest {
    pub config: Option<SessionConfigOverride>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub expires_at: DateTime<Utc>,
    pub max_documents: usize,
    pub max_file_size_bytes: usize,
}

pub async fn create_session(
    State(state): State<AppState>,
    body: Option<Json<CreateSessionRequest>>,
) -> AppResult<Json<CreateSessionResponse>> {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    let config = request
        .config
        .map(|o| o.apply(state.sessions.defaults()));

    let session = state.sessions.create(config);

    Ok(Json(CreateSessionResponse {
        session_id: session.session_id.clone(),
        expires_at: session.expires_at(),
        max_documents: session.config.max_documents,
        max_file_size_bytes: session.config.max_file_size_bytes,
    }))
}

pub async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> AppResult<Json<Value>> {
    if !state.sessions.remove(&session_id) {
        return Err(AppError::SessionNotFound(session_id));
    }
    Ok(Json(json!({ "deleted": true, "sessionId": session_id })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_applies_only_given_fields() {
        let defaults = SessionConfig::default();
        let json = r#"{"maxDocuments": 5, "chunkSize": 256}"#;
        let over: SessionConfigOverride = serde_json::from_str(json).unwrap();
        let config = over.apply(&defaults);

        assert_eq!(config.max_documents, 5);
        assert_eq!(config.chunk_size, 256);
        assert_eq!(config.chunk_overlap, defaults.chunk_overlap);
        assert_eq!(config.top_k, defaults.top_k);
    }

    #[test]
    fn empty_override_reproduces_defaults() {
        let defaults = SessionConfig::default();
        let config = SessionConfigOverride::default().apply(&defaults);
        assert_eq!(config.max_documents, defaults.max_documents);
        assert_eq!(config.session_ttl_secs, defaults.session_ttl_secs);
    }
}
