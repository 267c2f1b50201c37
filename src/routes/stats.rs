use axum::Json;
use axum::extract::{Query, State};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::session::{GlobalStats, SessionMetricsSnapshot};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct StatsParams {
    pub session_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentStats {
    pub id: String,
    pub file_name: String,
    pub char_count: usize,
    pub chunk_count: usize,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatsResponse {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub document_count: usize,
    pub chunk_count: usize,
    pub embedding_dimension: usize,
    pub index_bytes: u64,
    pub documents: Vec<DocumentStats>,
    pub metrics: SessionMetricsSnapshot,
}

/// `GET /api/rag/stats?session_id=…`
pub async fn session_stats(
    State(state): State<AppState>,
    Query(params): Query<StatsParams>,
) -> AppResult<Json<SessionStatsResponse>> {
    let session = state
        .sessions
        .get(&params.session_id)
        .ok_or_else(|| AppError::SessionNotFound(params.session_id.clone()))?;

    let documents: Vec<DocumentStats> = session
        .documents
        .read()
        .iter()
        .map(|doc| DocumentStats {
            id: doc.id.clone(),
            file_name: doc.file_name.clone(),
            char_count: doc.char_count,
            chunk_count: session.index.chunk_count_for(&doc.id),
            uploaded_at: doc.uploaded_at,
        })
        .collect();

    Ok(Json(SessionStatsResponse {
        session_id: session.session_id.clone(),
        created_at: session.created_at,
        expires_at: session.expires_at(),
        document_count: documents.len(),
        chunk_count: session.chunk_count(),
        embedding_dimension: session.index.dimension(),
        index_bytes: session.index.approximate_bytes(),
        documents,
        metrics: session.metrics.snapshot(),
    }))
}

/// `GET /api/rag/global-stats`
pub async fn global_stats(State(state): State<AppState>) -> Json<GlobalStats> {
    Json(state.sessions.global_stats())
}
