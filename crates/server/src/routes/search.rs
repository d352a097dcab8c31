// crates/server/src/routes/search.rs
//! GET /api/search -- full-text search over message bodies and reasoning.

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::{
    extract::{Query, State},
    response::Json,
    routing::get,
    Router,
};
use serde::Deserialize;
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/api/search", get(search))
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    q: Option<String>,
    #[serde(default)]
    project: Option<String>,
    #[serde(default)]
    after: Option<String>,
    #[serde(default)]
    before: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
}

async fn search(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let q = query
        .q
        .as_deref()
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .ok_or_else(|| ApiError::BadRequest("missing query parameter: q".into()))?;

    let results = state
        .db
        .search_messages(
            q,
            query.project.as_deref(),
            query.after.as_deref(),
            query.before.as_deref(),
            query.limit,
        )
        .await?;

    Ok(Json(serde_json::json!({
        "query": q,
        "total": results.len(),
        "results": results,
    })))
}
