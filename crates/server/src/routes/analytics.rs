// crates/server/src/routes/analytics.rs
//! Token and tool analytics over a trailing window.

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::{
    extract::{Query, State},
    response::Json,
    routing::get,
    Router,
};
use chrono::{Duration, SecondsFormat, Utc};
use claude_remote_db::RollupGroup;
use serde::Deserialize;
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/analytics/tokens", get(token_analytics))
        .route("/api/analytics/tools", get(tool_analytics))
}

#[derive(Debug, Deserialize)]
struct AnalyticsQuery {
    /// "7d" (default), "30d", or "90d".
    #[serde(default)]
    period: Option<String>,
    /// "day" (default) or "project"; tokens endpoint only.
    #[serde(default)]
    group_by: Option<String>,
}

fn window_start(period: Option<&str>) -> ApiResult<String> {
    let days = match period.unwrap_or("7d") {
        "7d" => 7,
        "30d" => 30,
        "90d" => 90,
        other => {
            return Err(ApiError::BadRequest(format!("unknown period: {other}")));
        }
    };
    Ok((Utc::now() - Duration::days(days)).to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// GET /api/analytics/tokens?period=7d&group_by=day
async fn token_analytics(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AnalyticsQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let since = window_start(query.period.as_deref())?;
    let group = match query.group_by.as_deref().unwrap_or("day") {
        "day" => RollupGroup::Day,
        "project" => RollupGroup::Project,
        other => {
            return Err(ApiError::BadRequest(format!("unknown group_by: {other}")));
        }
    };

    let data = state.db.token_rollup(&since, group).await?;

    let mut totals = serde_json::json!({
        "input": 0i64, "output": 0i64, "cache_read": 0i64, "cache_create": 0i64,
        "cost_estimate": 0.0f64,
    });
    let mut cost = 0.0;
    for bucket in &data {
        totals["input"] = (totals["input"].as_i64().unwrap_or(0) + bucket.input).into();
        totals["output"] = (totals["output"].as_i64().unwrap_or(0) + bucket.output).into();
        totals["cache_read"] =
            (totals["cache_read"].as_i64().unwrap_or(0) + bucket.cache_read).into();
        totals["cache_create"] =
            (totals["cache_create"].as_i64().unwrap_or(0) + bucket.cache_create).into();
        cost += bucket.cost_estimate;
    }
    totals["cost_estimate"] = serde_json::json!((cost * 100.0).round() / 100.0);

    Ok(Json(serde_json::json!({
        "period": query.period.as_deref().unwrap_or("7d"),
        "group_by": query.group_by.as_deref().unwrap_or("day"),
        "data": data,
        "totals": totals,
    })))
}

/// GET /api/analytics/tools?period=7d
async fn tool_analytics(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AnalyticsQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let since = window_start(query.period.as_deref())?;
    let tools = state.db.tool_rollup(&since).await?;
    Ok(Json(serde_json::json!({
        "period": query.period.as_deref().unwrap_or("7d"),
        "tools": tools,
    })))
}
