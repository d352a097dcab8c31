// crates/server/src/routes/dashboard.rs
//! GET /api/dashboard -- active sessions, recent activity, period stats.

use crate::error::ApiResult;
use crate::state::AppState;
use axum::{extract::State, response::Json, routing::get, Router};
use chrono::{Duration, SecondsFormat, Utc};
use claude_remote_db::SessionFilter;
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/api/dashboard", get(dashboard))
}

async fn dashboard(State(state): State<Arc<AppState>>) -> ApiResult<Json<serde_json::Value>> {
    let snapshot = state.registry.snapshot().await;

    // Recent sessions, kept only when a live process (or mux) hosts them.
    let page = state
        .db
        .list_sessions(&SessionFilter {
            limit: Some(50),
            ..Default::default()
        })
        .await?;

    let active_sessions: Vec<serde_json::Value> = page
        .sessions
        .iter()
        .filter_map(|s| {
            let info = snapshot.sessions.get(&s.session_id)?;
            Some(serde_json::json!({
                "session_id": s.session_id,
                "slug": s.slug,
                "project": s.project,
                "working_dir": s.working_dir,
                "model": s.model,
                "git_branch": s.git_branch,
                "is_running": true,
                "is_in_tmux": info.in_mux,
                "last_message_at": s.last_message_at,
                "message_count": s.message_count,
                "total_tokens": s.total_tokens(),
                "duration_minutes": duration_minutes(s.first_message_at.as_deref(), s.last_message_at.as_deref()),
            }))
        })
        .collect();

    let now = Utc::now();
    let today_start = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_default();
    let week_start = (now - Duration::days(7)).to_rfc3339_opts(SecondsFormat::Millis, true);

    let today = state.db.period_stats(&today_start).await?;
    let week = state.db.period_stats(&week_start).await?;

    let recent_messages = state.db.recent_messages(50).await?;
    let recent_tool_uses = state.db.recent_tool_uses(20).await?;

    Ok(Json(serde_json::json!({
        "active_sessions": active_sessions,
        "recent_activity": {
            "messages": recent_messages,
            "tool_uses": recent_tool_uses,
        },
        "stats": {
            "today_sessions": today.sessions,
            "today_tokens": today.total_tokens,
            "today_cost_estimate": today.cost_estimate,
            "week_sessions": week.sessions,
            "week_tokens": week.total_tokens,
            "week_cost_estimate": week.cost_estimate,
            "total_sessions": state.db.total_sessions().await?,
            "cache_hit_rate": state.db.cache_hit_rate().await?,
        },
    })))
}

/// Minutes between a session's first and last message, zero when unknown.
fn duration_minutes(first: Option<&str>, last: Option<&str>) -> i64 {
    let (Some(first), Some(last)) = (first, last) else {
        return 0;
    };
    let (Ok(first), Ok(last)) = (
        chrono::DateTime::parse_from_rfc3339(first),
        chrono::DateTime::parse_from_rfc3339(last),
    ) else {
        return 0;
    };
    last.signed_duration_since(first).num_minutes().max(0)
}
