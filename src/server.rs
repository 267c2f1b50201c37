use axum::{
    Router,
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::Response,
    routing::{delete, get, post},
};
use tower_http::{compression::CompressionLayer, cors::{Any, CorsLayer}, trace::TraceLayer};

use crate::routes;
use crate::state::AppState;

pub fn create_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Public routes — no auth required (health probes only)
    let public_routes = Router::new().route("/health", get(routes::health::health_check));

    // SSE endpoints skip response compression so events flush immediately.
    let streaming_routes = Router::new()
        .route("/api/rag/ingest", post(routes::ingest::ingest))
        .route("/api/rag/query", post(routes::query::query));

    let api_routes = Router::new()
        .route("/shutdown", post(routes::health::shutdown_handler))
        .route("/api/rag/session", post(routes::session::create_session))
        .route(
            "/api/rag/session/{session_id}",
            delete(routes::session::delete_session),
        )
        .route("/api/rag/stats", get(routes::stats::session_stats))
        .route("/api/rag/global-stats", get(routes::stats::global_stats))
        .layer(CompressionLayer::new());

    public_routes
        .merge(
            streaming_routes
                .merge(api_routes)
                .layer(axum::middleware::from_fn(auth_middleware)),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Middleware that validates `Authorization: Bearer <token>` against the
/// `RAG_AUTH_TOKEN` environment variable. If the env var is not set or
/// empty, auth is skipped (development mode).
async fn auth_middleware(
    req: Request,
    next: Next,
) -> Result<Response, (StatusCode, axum::Json<serde_json::Value>)> {
    // Read expected token from env. Cache via OnceLock so we only read once.
    use std::sync::OnceLock;
    static AUTH_TOKEN: OnceLock<Option<String>> = OnceLock::new();
    let expected = AUTH_TOKEN.get_or_init(|| {
        std::env::var("RAG_AUTH_TOKEN").ok().filter(|t| !t.is_empty())
    });

    let expected_token = match expected {
        Some(t) => t.as_str(),
        None => return Ok(next.run(req).await), // No token configured — skip auth
    };

    let auth_header = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok());

    match auth_header {
        Some(header) if header.len() > 7 && header[..7].eq_ignore_ascii_case("bearer ") => {
            let token = &header[7..];
            if token == expected_token {
                Ok(next.run(req).await)
            } else {
                tracing::warn!("Auth token mismatch — rejecting request");
                Err((
                    StatusCode::UNAUTHORIZED,
                    axum::Json(serde_json::json!({"error": "Unauthorized", "status": 401})),
                ))
            }
        }
        _ => {
            tracing::warn!("Missing or malformed Authorization header — rejecting request");
            Err((
                StatusCode::UNAUTHORIZED,
                axum::Json(serde_json::json!({"error": "Unauthorized", "status": 401})),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    use crate::config::AppConfig;

    fn test_state() -> AppState {
        AppState::new(AppConfig::for_tests())
    }

    fn json_request(uri: &str, body: &str) -> HttpRequest<Body> {
        HttpRequest::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_is_public() {
        let app = create_app(test_state());
        let response = app
            .oneshot(HttpRequest::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn create_session_returns_ok() {
        let app = create_app(test_state());
        let response = app
            .oneshot(json_request("/api/rag/session", "{}"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn delete_unknown_session_is_404() {
        let app = create_app(test_state());
        let response = app
            .oneshot(
                HttpRequest::delete("/api/rag/session/rag_0000000000000000")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn delete_existing_session_is_ok() {
        let state = test_state();
        let session = state.sessions.create(None);
        let app = create_app(state);
        let response = app
            .oneshot(
                HttpRequest::delete(format!("/api/rag/session/{}", session.session_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn empty_query_is_rejected_before_streaming() {
        let state = test_state();
        let session = state.sessions.create(None);
        let app = create_app(state);
        let body = format!(r#"{{"sessionId":"{}","query":"   "}}"#, session.session_id);
        let response = app.oneshot(json_request("/api/rag/query", &body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn query_for_unknown_session_is_404() {
        let app = create_app(test_state());
        let body = r#"{"sessionId":"rag_ffffffffffffffff","query":"hello"}"#;
        let response = app.oneshot(json_request("/api/rag/query", body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn ingest_with_empty_content_is_400() {
        let state = test_state();
        let session = state.sessions.create(None);
        let app = create_app(state);
        let body = format!(
            r#"{{"sessionId":"{}","fileName":"a.txt","content":""}}"#,
            session.session_id
        );
        let response = app.oneshot(json_request("/api/rag/ingest", &body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn ingest_with_empty_file_name_is_400() {
        let state = test_state();
        let session = state.sessions.create(None);
        let app = create_app(state);
        let body = format!(
            r#"{{"sessionId":"{}","fileName":"  ","content":"text"}}"#,
            session.session_id
        );
        let response = app.oneshot(json_request("/api/rag/ingest", &body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn query_stream_responds_with_event_stream() {
        let state = test_state();
        let session = state.sessions.create(None);
        let app = create_app(state);
        // Empty session: the error arrives in-stream, so the response itself
        // is a 200 SSE stream.
        let body = format!(r#"{{"sessionId":"{}","query":"hello"}}"#, session.session_id);
        let response = app.oneshot(json_request("/api/rag/query", &body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        assert!(content_type.starts_with("text/event-stream"));
        assert_eq!(
            response
                .headers()
                .get("cache-control")
                .and_then(|v| v.to_str().ok()),
            Some("no-cache")
        );
    }

    #[tokio::test]
    async fn global_stats_is_reachable() {
        let app = create_app(test_state());
        let response = app
            .oneshot(
                HttpRequest::get("/api/rag/global-stats")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
