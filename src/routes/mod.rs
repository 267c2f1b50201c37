pub mod health;
pub mod ingest;
pub mod query;
pub mod session;
pub mod stats;

use std::convert::Infallible;

use axum::http::header;
use axum::response::IntoResponse;
use axum::response::sse::{Event, Sse};
use futures_util::{Stream, StreamExt, stream};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Bridge an event stream into an SSE response: one `data: <json>` frame per
/// event and a final `data: [DONE]`. The cancellation token is tied to the
/// response stream's lifetime, so a client disconnect (stream drop) cancels
/// the backing task.
pub(crate) fn sse_response<T, S>(events: S, cancel: CancellationToken) -> impl IntoResponse
where
    T: Serialize,
    S: Stream<Item = T> + Send + 'static,
{
    let guard = cancel.drop_guard();
    let frames = events
        .map(|item| match Event::default().json_data(&item) {
            Ok(event) => Ok::<_, Infallible>(event),
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize SSE event");
                Ok(Event::default().data("{}"))
            }
        })
        .chain(stream::once(async { Ok(Event::default().data("[DONE]")) }))
        .inspect(move |_| {
            // Holds the drop guard for the stream's lifetime.
            let _ = &guard;
        });

    (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        Sse::new(frames),
    )
}
