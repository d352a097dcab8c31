// crates/server/src/routes/mod.rs
//! HTTP surface: JSON REST, SSE event streams, and the mux WebSocket.

pub mod analytics;
pub mod dashboard;
pub mod events;
pub mod mux;
pub mod push;
pub mod search;
pub mod sessions;

use crate::state::AppState;
use axum::{extract::State, response::Json, routing::get, Router};
use std::sync::Arc;

/// Assemble every API route under one router.
pub fn api_routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .merge(dashboard::router())
        .merge(sessions::router())
        .merge(search::router())
        .merge(analytics::router())
        .merge(events::router())
        .merge(mux::router())
        .merge(push::router())
        .with_state(state)
}

/// GET /api/health
async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.uptime_secs(),
    }))
}
