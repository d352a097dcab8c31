// crates/server/src/routes/sessions.rs
//! Session list, detail, and conversation endpoints.

use crate::error::{ApiError, ApiResult};
use crate::procs::short_id;
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::get,
    Router,
};
use claude_remote_db::{SessionFilter, SessionRow};
use serde::Deserialize;
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/{id}", get(session_detail))
        .route("/api/sessions/{id}/conversation", get(conversation))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    /// "all" (default), "running", or "stopped".
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    project: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    offset: Option<i64>,
}

/// Serialize one row with its derived fields and liveness flags.
fn session_json(row: &SessionRow, is_running: bool, is_in_tmux: bool) -> serde_json::Value {
    serde_json::json!({
        "session_id": row.session_id,
        "slug": row.slug,
        "project": row.project,
        "working_dir": row.working_dir,
        "git_branch": row.git_branch,
        "model": row.model,
        "version": row.version,
        "first_message_at": row.first_message_at,
        "last_message_at": row.last_message_at,
        "message_count": row.message_count,
        "user_msg_count": row.user_msg_count,
        "asst_msg_count": row.asst_msg_count,
        "total_tokens": row.total_tokens(),
        "cost_estimate": row.cost_estimate(),
        "file_size_mb": (row.file_size_bytes as f64 / 1024.0 / 1024.0 * 100.0).round() / 100.0,
        "is_running": is_running,
        "is_in_tmux": is_in_tmux,
    })
}

/// GET /api/sessions?status=&project=&limit=&offset=
async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let status = query.status.as_deref().unwrap_or("all");
    if !matches!(status, "all" | "running" | "stopped") {
        return Err(ApiError::BadRequest(format!("unknown status: {status}")));
    }

    let page = state
        .db
        .list_sessions(&SessionFilter {
            project: query.project.clone(),
            limit: query.limit,
            offset: query.offset,
        })
        .await?;

    let snapshot = state.registry.snapshot().await;
    let mux_names = state.mux.list().await.unwrap_or_default();

    let sessions: Vec<serde_json::Value> = page
        .sessions
        .iter()
        .filter_map(|row| {
            let is_running = snapshot.is_running(&row.session_id);
            match status {
                "running" if !is_running => return None,
                "stopped" if is_running => return None,
                _ => {}
            }
            let is_in_tmux = snapshot
                .sessions
                .get(&row.session_id)
                .map(|info| info.in_mux)
                .unwrap_or_else(|| {
                    mux_names.contains(&format!(
                        "{}{}",
                        state.config.mux_prefix,
                        short_id(&row.session_id)
                    ))
                });
            Some(session_json(row, is_running, is_in_tmux))
        })
        .collect();

    Ok(Json(serde_json::json!({
        "sessions": sessions,
        "total": page.total,
        "limit": page.limit,
        "offset": page.offset,
    })))
}

/// GET /api/sessions/{id}
async fn session_detail(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let detail = state
        .db
        .session_detail(&id)
        .await?
        .ok_or_else(|| ApiError::SessionNotFound(id.clone()))?;

    let snapshot = state.registry.snapshot().await;
    let is_running = snapshot.is_running(&id);
    let is_in_tmux = snapshot
        .sessions
        .get(&id)
        .map(|info| info.in_mux)
        .unwrap_or(false);

    Ok(Json(serde_json::json!({
        "session": session_json(&detail.session, is_running, is_in_tmux),
        "files_touched": detail.files_touched,
        "tool_summary": detail.tool_summary,
        "token_breakdown": detail.token_breakdown,
    })))
}

#[derive(Debug, Deserialize)]
struct ConversationQuery {
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    offset: Option<i64>,
}

/// GET /api/sessions/{id}/conversation?limit=&offset=
async fn conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<ConversationQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let page = state
        .db
        .conversation(&id, query.limit.unwrap_or(200), query.offset.unwrap_or(0))
        .await?
        .ok_or_else(|| ApiError::SessionNotFound(id))?;
    Ok(Json(serde_json::to_value(&page).unwrap_or_default()))
}
