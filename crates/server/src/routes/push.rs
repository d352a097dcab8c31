// crates/server/src/routes/push.rs
//! Push-subscription registration endpoints.

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::{extract::State, response::Json, routing::post, Router};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route(
        "/api/push/subscribe",
        post(subscribe).delete(unsubscribe),
    )
}

#[derive(Debug, Deserialize)]
struct SubscribeBody {
    endpoint: String,
    keys: SubscriptionKeys,
    #[serde(default)]
    user_agent: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionKeys {
    p256dh: String,
    auth: String,
}

/// POST /api/push/subscribe
async fn subscribe(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SubscribeBody>,
) -> ApiResult<Json<serde_json::Value>> {
    if body.endpoint.is_empty() {
        return Err(ApiError::BadRequest("endpoint must not be empty".into()));
    }
    state
        .db
        .save_push_subscription(
            &body.endpoint,
            &body.keys.p256dh,
            &body.keys.auth,
            body.user_agent.as_deref().unwrap_or(""),
            Utc::now(),
        )
        .await?;
    Ok(Json(serde_json::json!({ "subscribed": true })))
}

#[derive(Debug, Deserialize)]
struct UnsubscribeBody {
    endpoint: String,
}

/// DELETE /api/push/subscribe
async fn unsubscribe(
    State(state): State<Arc<AppState>>,
    Json(body): Json<UnsubscribeBody>,
) -> ApiResult<Json<serde_json::Value>> {
    state.db.delete_push_subscription(&body.endpoint).await?;
    Ok(Json(serde_json::json!({ "unsubscribed": true })))
}
