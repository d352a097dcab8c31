// crates/db/src/queries/sessions.rs
//! Session list, detail, conversation, and idle-scan projections.

use crate::{Database, DbResult};
use claude_remote_core::pricing::estimate_cost;
use serde::Serialize;
use sqlx::FromRow;
use std::collections::HashMap;

/// Default page size for session lists.
const DEFAULT_LIMIT: i64 = 30;
/// Hard cap on any page size.
pub const MAX_LIMIT: i64 = 200;

/// One row of the `sessions` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct SessionRow {
    pub session_id: String,
    pub slug: Option<String>,
    pub project: Option<String>,
    pub working_dir: Option<String>,
    pub git_branch: Option<String>,
    pub model: Option<String>,
    pub version: Option<String>,
    pub first_message_at: Option<String>,
    pub last_message_at: Option<String>,
    pub message_count: i64,
    pub user_msg_count: i64,
    pub asst_msg_count: i64,
    pub total_input_tokens: i64,
    pub total_output_tokens: i64,
    pub total_cache_read: i64,
    pub total_cache_create: i64,
    pub file_size_bytes: i64,
    pub jsonl_path: Option<String>,
    pub indexed_at: Option<String>,
}

impl SessionRow {
    pub fn total_tokens(&self) -> i64 {
        self.total_input_tokens
            + self.total_output_tokens
            + self.total_cache_read
            + self.total_cache_create
    }

    pub fn cost_estimate(&self) -> f64 {
        estimate_cost(
            self.total_input_tokens.max(0) as u64,
            self.total_output_tokens.max(0) as u64,
            self.total_cache_read.max(0) as u64,
            self.total_cache_create.max(0) as u64,
            self.model.as_deref().unwrap_or(""),
        )
    }
}

/// Filters and paging for the session list.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub project: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct SessionPage {
    pub sessions: Vec<SessionRow>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

/// A deduplicated file touch with counts, for session detail.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct FileTouch {
    pub path: String,
    pub event_type: String,
    pub count: i64,
}

#[derive(Debug, Serialize)]
pub struct SessionDetail {
    pub session: SessionRow,
    pub files_touched: Vec<FileTouch>,
    pub tool_summary: HashMap<String, i64>,
    pub token_breakdown: TokenBreakdown,
}

#[derive(Debug, Serialize)]
pub struct TokenBreakdown {
    pub input: i64,
    pub output: i64,
    pub cache_read: i64,
    pub cache_create: i64,
}

/// One message in a conversation slice.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ConversationMessage {
    pub uuid: String,
    pub parent_uuid: Option<String>,
    pub role: String,
    pub body: String,
    pub reasoning: Option<String>,
    pub model: Option<String>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read: i64,
    pub cache_create: i64,
    pub timestamp: String,
    pub seq_num: i64,
    #[sqlx(skip)]
    pub tool_uses: Vec<ToolUseOut>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ToolUseOut {
    pub name: String,
    pub summary: String,
}

#[derive(Debug, Serialize)]
pub struct ConversationPage {
    pub session_id: String,
    pub messages: Vec<ConversationMessage>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

/// What the idle detector needs to know about a recently active session.
#[derive(Debug, Clone, FromRow)]
pub struct IdleCandidate {
    pub session_id: String,
    pub slug: Option<String>,
    pub last_role: String,
    pub last_timestamp: String,
    pub preview: String,
}

impl Database {
    /// Session list ordered by `last_message_at` DESC, with total count.
    pub async fn list_sessions(&self, filter: &SessionFilter) -> DbResult<SessionPage> {
        let limit = filter.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
        let offset = filter.offset.unwrap_or(0).max(0);

        let (total, sessions) = match &filter.project {
            Some(project) => {
                let total: (i64,) =
                    sqlx::query_as("SELECT COUNT(*) FROM sessions WHERE project = ?")
                        .bind(project)
                        .fetch_one(self.pool())
                        .await?;
                let sessions = sqlx::query_as::<_, SessionRow>(
                    "SELECT * FROM sessions WHERE project = ? ORDER BY last_message_at DESC LIMIT ? OFFSET ?",
                )
                .bind(project)
                .bind(limit)
                .bind(offset)
                .fetch_all(self.pool())
                .await?;
                (total.0, sessions)
            }
            None => {
                let total: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sessions")
                    .fetch_one(self.pool())
                    .await?;
                let sessions = sqlx::query_as::<_, SessionRow>(
                    "SELECT * FROM sessions ORDER BY last_message_at DESC LIMIT ? OFFSET ?",
                )
                .bind(limit)
                .bind(offset)
                .fetch_all(self.pool())
                .await?;
                (total.0, sessions)
            }
        };

        Ok(SessionPage {
            sessions,
            total,
            limit,
            offset,
        })
    }

    /// A single session row by id.
    pub async fn session(&self, session_id: &str) -> DbResult<Option<SessionRow>> {
        let row = sqlx::query_as::<_, SessionRow>("SELECT * FROM sessions WHERE session_id = ?")
            .bind(session_id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row)
    }

    /// Session row plus aggregates: deduplicated file touches, per-tool
    /// counts, and the token breakdown.
    pub async fn session_detail(&self, session_id: &str) -> DbResult<Option<SessionDetail>> {
        let Some(session) = self.session(session_id).await? else {
            return Ok(None);
        };

        let files_touched = sqlx::query_as::<_, FileTouch>(
            r#"
            SELECT file_path AS path, event_type, COUNT(*) AS count
            FROM file_events WHERE session_id = ?
            GROUP BY file_path, event_type
            ORDER BY count DESC LIMIT 100
            "#,
        )
        .bind(session_id)
        .fetch_all(self.pool())
        .await?;

        let tool_rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT tool_name, COUNT(*) FROM tool_uses WHERE session_id = ? GROUP BY tool_name",
        )
        .bind(session_id)
        .fetch_all(self.pool())
        .await?;

        let token_breakdown = TokenBreakdown {
            input: session.total_input_tokens,
            output: session.total_output_tokens,
            cache_read: session.total_cache_read,
            cache_create: session.total_cache_create,
        };

        Ok(Some(SessionDetail {
            session,
            files_touched,
            tool_summary: tool_rows.into_iter().collect(),
            token_breakdown,
        }))
    }

    /// Conversation slice in sequence order with per-message tool uses.
    pub async fn conversation(
        &self,
        session_id: &str,
        limit: i64,
        offset: i64,
    ) -> DbResult<Option<ConversationPage>> {
        if self.session(session_id).await?.is_none() {
            return Ok(None);
        }

        let limit = limit.clamp(1, MAX_LIMIT);
        let offset = offset.max(0);

        let total: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages WHERE session_id = ?")
            .bind(session_id)
            .fetch_one(self.pool())
            .await?;

        let mut messages = sqlx::query_as::<_, ConversationMessage>(
            "SELECT * FROM messages WHERE session_id = ? ORDER BY seq_num ASC LIMIT ? OFFSET ?",
        )
        .bind(session_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool())
        .await?;

        let tool_rows: Vec<(String, String, String)> = sqlx::query_as(
            r#"
            SELECT message_uuid, tool_name, input_summary FROM tool_uses
            WHERE message_uuid IN (
                SELECT uuid FROM messages WHERE session_id = ?
                ORDER BY seq_num ASC LIMIT ? OFFSET ?
            )
            ORDER BY id ASC
            "#,
        )
        .bind(session_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool())
        .await?;

        let mut by_uuid: HashMap<String, Vec<ToolUseOut>> = HashMap::new();
        for (uuid, name, summary) in tool_rows {
            by_uuid.entry(uuid).or_default().push(ToolUseOut { name, summary });
        }
        for msg in &mut messages {
            if let Some(tools) = by_uuid.remove(&msg.uuid) {
                msg.tool_uses = tools;
            }
        }

        Ok(Some(ConversationPage {
            session_id: session_id.to_string(),
            messages,
            total: total.0,
            limit,
            offset,
        }))
    }

    /// Sessions with any message activity since `cutoff`, each with its
    /// final message's role, timestamp, and preview. Drives the idle scan.
    pub async fn idle_candidates(&self, cutoff: &str) -> DbResult<Vec<IdleCandidate>> {
        let rows = sqlx::query_as::<_, IdleCandidate>(
            r#"
            SELECT s.session_id, s.slug,
                   m.role AS last_role,
                   m.timestamp AS last_timestamp,
                   SUBSTR(m.body, 1, 120) AS preview
            FROM sessions s
            JOIN messages m ON m.session_id = s.session_id
            WHERE m.seq_num = (SELECT MAX(seq_num) FROM messages WHERE session_id = s.session_id)
              AND s.last_message_at >= ?
            "#,
        )
        .bind(cutoff)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }
}
