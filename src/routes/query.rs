use axum::Json;
use axum::extract::State;
use axum::response::IntoResponse;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::engine::QueryRequest;
use crate::error::{AppError, AppResult};
use crate::retrieval::RetrievalStrategy;
use crate::routes::sse_response;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryBody {
    pub session_id: String,
    pub query: String,
    #[serde(default)]
    pub strategy: Option<RetrievalStrategy>,
    #[serde(default)]
    pub top_k: Option<usize>,
}

/// `POST /api/rag/query` — SSE stream of query events.
pub async fn query(
    State(state): State<AppState>,
    Json(body): Json<QueryBody>,
) -> AppResult<impl IntoResponse> {
    if body.query.trim().is_empty() {
        return Err(AppError::Validation("query must not be empty".to_string()));
    }

    let session = state
        .sessions
        .get(&body.session_id)
        .ok_or_else(|| AppError::SessionNotFound(body.session_id.clone()))?;

    let cancel = CancellationToken::new();
    let stream = state.engine.query_stream(
        session,
        QueryRequest {
            query: body.query,
            strategy: body.strategy,
            top_k: body.top_k,
        },
        cancel.clone(),
    );

    Ok(sse_response(stream, cancel))
}
