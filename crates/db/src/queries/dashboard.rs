// crates/db/src/queries/dashboard.rs
//! Dashboard projections: recent activity and period aggregates.

use crate::{Database, DbResult};
use claude_remote_core::pricing::estimate_cost;
use serde::Serialize;
use sqlx::FromRow;

/// One entry in the recent-activity feed: either a message or a tool use.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ActivityItem {
    pub session_id: String,
    pub slug: Option<String>,
    pub project: Option<String>,
    /// "message" or "tool_use".
    pub kind: String,
    pub role: Option<String>,
    pub tool_name: Option<String>,
    /// Message preview or tool input summary.
    pub detail: String,
    pub timestamp: String,
}

/// Aggregates over sessions active in a period.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PeriodStats {
    pub sessions: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read: i64,
    pub cache_create: i64,
    pub total_tokens: i64,
    pub cost_estimate: f64,
}

impl Database {
    /// The most recent messages across all sessions, newest first.
    pub async fn recent_messages(&self, limit: i64) -> DbResult<Vec<ActivityItem>> {
        let rows = sqlx::query_as::<_, ActivityItem>(
            r#"
            SELECT m.session_id, s.slug, s.project,
                   'message' AS kind,
                   m.role AS role,
                   NULL AS tool_name,
                   SUBSTR(m.body, 1, 120) AS detail,
                   m.timestamp
            FROM messages m
            JOIN sessions s ON m.session_id = s.session_id
            ORDER BY m.timestamp DESC
            LIMIT ?
            "#,
        )
        .bind(limit.clamp(1, 200))
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// The most recent tool invocations across all sessions, newest first.
    pub async fn recent_tool_uses(&self, limit: i64) -> DbResult<Vec<ActivityItem>> {
        let rows = sqlx::query_as::<_, ActivityItem>(
            r#"
            SELECT tu.session_id, s.slug, s.project,
                   'tool_use' AS kind,
                   NULL AS role,
                   tu.tool_name AS tool_name,
                   tu.input_summary AS detail,
                   tu.timestamp
            FROM tool_uses tu
            JOIN sessions s ON tu.session_id = s.session_id
            ORDER BY tu.timestamp DESC
            LIMIT ?
            "#,
        )
        .bind(limit.clamp(1, 200))
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Session-count and token aggregates over sessions whose last message
    /// is at or after `since`. Cost is summed per session using each
    /// session's own model, so mixed-model periods price correctly.
    pub async fn period_stats(&self, since: &str) -> DbResult<PeriodStats> {
        let rows: Vec<(Option<String>, i64, i64, i64, i64)> = sqlx::query_as(
            r#"
            SELECT model, total_input_tokens, total_output_tokens,
                   total_cache_read, total_cache_create
            FROM sessions
            WHERE last_message_at >= ?
            "#,
        )
        .bind(since)
        .fetch_all(self.pool())
        .await?;

        let mut stats = PeriodStats::default();
        for (model, input, output, cache_read, cache_create) in rows {
            stats.sessions += 1;
            stats.input_tokens += input;
            stats.output_tokens += output;
            stats.cache_read += cache_read;
            stats.cache_create += cache_create;
            stats.cost_estimate += estimate_cost(
                input.max(0) as u64,
                output.max(0) as u64,
                cache_read.max(0) as u64,
                cache_create.max(0) as u64,
                model.as_deref().unwrap_or(""),
            );
        }
        stats.total_tokens =
            stats.input_tokens + stats.output_tokens + stats.cache_read + stats.cache_create;
        stats.cost_estimate = (stats.cost_estimate * 100.0).round() / 100.0;
        Ok(stats)
    }

    /// Total number of indexed sessions.
    pub async fn total_sessions(&self) -> DbResult<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sessions")
            .fetch_one(self.pool())
            .await?;
        Ok(row.0)
    }

    /// Fraction of all prompt-side tokens served from cache, in [0, 1].
    pub async fn cache_hit_rate(&self) -> DbResult<f64> {
        let row: (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(total_cache_read), 0),
                   COALESCE(SUM(total_cache_create), 0),
                   COALESCE(SUM(total_input_tokens), 0)
            FROM sessions
            "#,
        )
        .fetch_one(self.pool())
        .await?;

        let (cache_read, cache_create, input) = row;
        let denominator = cache_read + cache_create + input;
        if denominator <= 0 {
            return Ok(0.0);
        }
        Ok((cache_read as f64 / denominator as f64 * 100.0).round() / 100.0)
    }
}
