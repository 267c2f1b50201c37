use axum::Json;
use axum::extract::State;
use axum::response::IntoResponse;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::chunker::ChunkingStrategy;
use crate::error::{AppError, AppResult};
use crate::pipeline::IngestRequest;
use crate::routes::sse_response;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestBody {
    pub session_id: String,
    pub file_name: String,
    pub content: String,
    #[serde(default)]
    pub chunking_strategy: Option<ChunkingStrategy>,
}

/// `POST /api/rag/ingest` — SSE stream of ingestion progress updates.
pub async fn ingest(
    State(state): State<AppState>,
    Json(body): Json<IngestBody>,
) -> AppResult<impl IntoResponse> {
    if body.file_name.trim().is_empty() {
        return Err(AppError::Validation(
            "file name must not be empty".to_string(),
        ));
    }
    if body.content.is_empty() {
        return Err(AppError::Validation(
            "document content must not be empty".to_string(),
        ));
    }

    let session = state
        .sessions
        .get(&body.session_id)
        .ok_or_else(|| AppError::SessionNotFound(body.session_id.clone()))?;

    let cancel = CancellationToken::new();
    let stream = state.engine.ingest_stream(
        session,
        IngestRequest {
            file_name: body.file_name,
            content: body.content,
            chunking_strategy: body.chunking_strategy,
        },
        cancel.clone(),
    );

    Ok(sse_response(stream, cancel))
}
