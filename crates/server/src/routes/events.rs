// crates/server/src/routes/events.rs
//! SSE endpoints over the event bus.
//!
//! One stream per subscription: `/api/events` follows the global topic,
//! `/api/sessions/{id}/events` a single session. The bus enforces the
//! five-subscribers-per-topic cap; when a handle is evicted its stream
//! simply ends and the client reconnects. Keep-alives go out every 30
//! seconds on otherwise idle streams.

use crate::bus::{Subscription, GLOBAL_TOPIC};
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
    Router,
};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/events", get(global_events))
        .route("/api/sessions/{id}/events", get(session_events))
}

async fn global_events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    event_stream(state.bus.subscribe(GLOBAL_TOPIC))
}

async fn session_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    event_stream(state.bus.subscribe(&id))
}

fn event_stream(
    mut subscription: Subscription,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let stream = async_stream::stream! {
        while let Some(event) = subscription.recv().await {
            let data = serde_json::to_string(&event).unwrap_or_default();
            yield Ok(Event::default().event(event.event_name()).data(data));
        }
        // recv() returning None means the handle was closed (evicted or
        // shutdown); ending the stream closes the HTTP response.
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(30))
            .text("keepalive"),
    )
}
