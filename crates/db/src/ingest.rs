// crates/db/src/ingest.rs
//! Single-writer ingest operations.
//!
//! Three primitives: `upsert_session`, `append_messages`, and
//! `advance_ingest_offset`, plus `apply_batch` which runs all of them in one
//! transaction for a parsed file delta. Message inserts are keyed by uuid
//! and silently skip duplicates, so re-ingesting an already-ingested prefix
//! is a no-op. Session counters are reassigned from aggregates inside the
//! same transaction, never incremented.

use crate::{Database, DbError, DbResult};
use chrono::{DateTime, SecondsFormat, Utc};
use claude_remote_core::paths::project_name;
use claude_remote_core::types::{MessageRecord, ParsedBatch, Role, SessionMeta, ToolUseRecord};
use sqlx::{Sqlite, Transaction};
use std::collections::{BTreeSet, HashMap};
use tracing::warn;

/// Message previews carried on change events.
const PREVIEW_LIMIT: usize = 120;

/// Canonical timestamp format for all TEXT columns: RFC 3339 UTC with
/// millisecond precision and a `Z` suffix, so lexicographic order is
/// chronological order.
pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Per-file watermark loaded from `ingest_state`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestFileState {
    pub session_id: String,
    pub byte_offset: i64,
    pub mtime: i64,
}

/// A message that was actually inserted (duplicates excluded), with the
/// fields change events need.
#[derive(Debug, Clone)]
pub struct InsertedMessage {
    pub session_id: String,
    pub uuid: String,
    pub role: Role,
    pub preview: String,
    pub timestamp: DateTime<Utc>,
    pub tool_uses: Vec<ToolUseRecord>,
}

/// Result of applying one parsed batch.
#[derive(Debug, Default)]
pub struct AppliedBatch {
    /// Session ids inserted for the first time by this batch.
    pub new_sessions: Vec<String>,
    /// Messages inserted, in line order.
    pub inserted: Vec<InsertedMessage>,
    /// Messages skipped because their uuid already existed.
    pub duplicates: usize,
}

impl Database {
    /// Load all per-file ingest watermarks, keyed by path.
    pub async fn ingest_states(&self) -> DbResult<HashMap<String, IngestFileState>> {
        let rows: Vec<(String, String, i64, i64)> =
            sqlx::query_as("SELECT jsonl_path, session_id, byte_offset, mtime FROM ingest_state")
                .fetch_all(self.pool())
                .await?;
        Ok(rows
            .into_iter()
            .map(|(path, session_id, byte_offset, mtime)| {
                (
                    path,
                    IngestFileState {
                        session_id,
                        byte_offset,
                        mtime,
                    },
                )
            })
            .collect())
    }

    /// Insert or update a session row by id. Metadata coalesces with
    /// first-observation-wins; counters are untouched here (they are
    /// reassigned by [`Database::append_messages`]).
    ///
    /// Returns true when the session was newly created.
    pub async fn upsert_session(
        &self,
        session_id: &str,
        meta: &SessionMeta,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let mut tx = self.pool().begin().await?;
        let is_new = upsert_session_tx(&mut tx, session_id, meta, now).await?;
        tx.commit().await?;
        Ok(is_new)
    }

    /// Append messages (with their tool invocations and file events)
    /// atomically, assigning per-session sequence numbers that continue from
    /// the current maximum. Duplicate uuids are skipped together with their
    /// dependent rows. Sessions referenced by the records must already exist.
    pub async fn append_messages(
        &self,
        records: &[MessageRecord],
        now: DateTime<Utc>,
    ) -> DbResult<AppliedBatch> {
        let mut tx = self.pool().begin().await?;
        let mut applied = AppliedBatch::default();
        append_messages_tx(&mut tx, records, &mut applied).await?;
        reassign_counters_tx(&mut tx, records.iter().map(|m| m.session_id.as_str()), now).await?;
        tx.commit().await?;
        Ok(applied)
    }

    /// Record a new ingest watermark for a file. Offsets may only advance;
    /// a regression is rejected (use [`Database::reset_ingest_offset`] for
    /// the explicit truncation path).
    pub async fn advance_ingest_offset(
        &self,
        path: &str,
        session_id: &str,
        new_offset: u64,
        mtime: i64,
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        let mut tx = self.pool().begin().await?;
        advance_offset_tx(&mut tx, path, session_id, new_offset, mtime, now).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Reset a file's watermark to zero after observed truncation. The
    /// session row and its messages are retained; re-ingestion dedupes by
    /// uuid.
    pub async fn reset_ingest_offset(&self, path: &str) -> DbResult<()> {
        let mut tx = self.pool().begin().await?;
        sqlx::query("UPDATE ingest_state SET byte_offset = 0 WHERE jsonl_path = ?")
            .bind(path)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE sessions SET file_size_bytes = 0 WHERE jsonl_path = ?")
            .bind(path)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Drop the watermark for a file that disappeared from disk. Session
    /// history is retained; a reappearing file starts over at offset zero.
    pub async fn remove_ingest_state(&self, path: &str) -> DbResult<()> {
        sqlx::query("DELETE FROM ingest_state WHERE jsonl_path = ?")
            .bind(path)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Apply one parsed file delta in a single transaction: session
    /// upserts, message appends, counter reassignment, and the watermark
    /// advance. Partial application is never visible.
    pub async fn apply_batch(
        &self,
        path: &str,
        hint_session: &str,
        batch: &ParsedBatch,
        new_offset: u64,
        mtime: i64,
        now: DateTime<Utc>,
    ) -> DbResult<AppliedBatch> {
        let mut tx = self.pool().begin().await?;
        let mut applied = AppliedBatch::default();

        // Deterministic upsert order keeps transaction replays comparable.
        let sids: BTreeSet<&str> = batch
            .meta
            .keys()
            .map(String::as_str)
            .chain(batch.messages.iter().map(|m| m.session_id.as_str()))
            .collect();
        let empty = SessionMeta::default();
        for sid in &sids {
            let meta = batch.meta.get(*sid).unwrap_or(&empty);
            if upsert_session_tx(&mut tx, sid, meta, now).await? {
                applied.new_sessions.push(sid.to_string());
            }
        }

        append_messages_tx(&mut tx, &batch.messages, &mut applied).await?;
        reassign_counters_tx(&mut tx, sids.iter().copied(), now).await?;
        advance_offset_tx(&mut tx, path, hint_session, new_offset, mtime, now).await?;

        tx.commit().await?;
        Ok(applied)
    }
}

async fn upsert_session_tx(
    tx: &mut Transaction<'_, Sqlite>,
    session_id: &str,
    meta: &SessionMeta,
    now: DateTime<Utc>,
) -> DbResult<bool> {
    let existing: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM sessions WHERE session_id = ?")
        .bind(session_id)
        .fetch_optional(&mut **tx)
        .await?;

    let project = meta.working_dir.as_deref().map(project_name);

    sqlx::query(
        r#"
        INSERT INTO sessions (session_id, slug, project, working_dir, git_branch, model, version, indexed_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(session_id) DO UPDATE SET
            slug        = COALESCE(sessions.slug, excluded.slug),
            project     = COALESCE(sessions.project, excluded.project),
            working_dir = COALESCE(sessions.working_dir, excluded.working_dir),
            git_branch  = COALESCE(sessions.git_branch, excluded.git_branch),
            model       = COALESCE(sessions.model, excluded.model),
            version     = COALESCE(sessions.version, excluded.version),
            indexed_at  = excluded.indexed_at
        "#,
    )
    .bind(session_id)
    .bind(&meta.slug)
    .bind(&project)
    .bind(&meta.working_dir)
    .bind(&meta.git_branch)
    .bind(&meta.model)
    .bind(&meta.version)
    .bind(fmt_ts(now))
    .execute(&mut **tx)
    .await?;

    Ok(existing.is_none())
}

async fn append_messages_tx(
    tx: &mut Transaction<'_, Sqlite>,
    records: &[MessageRecord],
    applied: &mut AppliedBatch,
) -> DbResult<()> {
    let mut next_seq: HashMap<String, i64> = HashMap::new();

    for msg in records {
        let seq = match next_seq.get(&msg.session_id) {
            Some(seq) => *seq,
            None => {
                let row: (i64,) = sqlx::query_as(
                    "SELECT COALESCE(MAX(seq_num) + 1, 0) FROM messages WHERE session_id = ?",
                )
                .bind(&msg.session_id)
                .fetch_one(&mut **tx)
                .await?;
                row.0
            }
        };

        let ts = fmt_ts(msg.timestamp);
        let result = sqlx::query(
            r#"
            INSERT INTO messages
                (uuid, session_id, parent_uuid, role, body, reasoning, model,
                 input_tokens, output_tokens, cache_read, cache_create, timestamp, seq_num)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(uuid) DO NOTHING
            "#,
        )
        .bind(&msg.uuid)
        .bind(&msg.session_id)
        .bind(&msg.parent_uuid)
        .bind(msg.role.as_str())
        .bind(&msg.body)
        .bind(&msg.reasoning)
        .bind(&msg.model)
        .bind(msg.usage.input as i64)
        .bind(msg.usage.output as i64)
        .bind(msg.usage.cache_read as i64)
        .bind(msg.usage.cache_create as i64)
        .bind(&ts)
        .bind(seq)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            applied.duplicates += 1;
            continue;
        }
        next_seq.insert(msg.session_id.clone(), seq + 1);

        for tool in &msg.tool_uses {
            sqlx::query(
                r#"
                INSERT INTO tool_uses
                    (tool_use_id, session_id, message_uuid, tool_name, input_summary, timestamp)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&tool.tool_use_id)
            .bind(&msg.session_id)
            .bind(&msg.uuid)
            .bind(&tool.tool_name)
            .bind(&tool.input_summary)
            .bind(&ts)
            .execute(&mut **tx)
            .await?;
        }

        for event in &msg.file_events {
            sqlx::query(
                "INSERT INTO file_events (session_id, file_path, event_type, timestamp) VALUES (?, ?, ?, ?)",
            )
            .bind(&msg.session_id)
            .bind(&event.file_path)
            .bind(event.kind.as_str())
            .bind(&ts)
            .execute(&mut **tx)
            .await?;
        }

        applied.inserted.push(InsertedMessage {
            session_id: msg.session_id.clone(),
            uuid: msg.uuid.clone(),
            role: msg.role,
            preview: msg.body.chars().take(PREVIEW_LIMIT).collect(),
            timestamp: msg.timestamp,
            tool_uses: msg.tool_uses.clone(),
        });
    }

    Ok(())
}

/// Reassign counters and timestamp bounds from the messages table. Running
/// inside the append transaction makes "session totals = sum over messages"
/// hold at every commit point.
async fn reassign_counters_tx<'a>(
    tx: &mut Transaction<'_, Sqlite>,
    session_ids: impl Iterator<Item = &'a str>,
    now: DateTime<Utc>,
) -> DbResult<()> {
    let unique: BTreeSet<&str> = session_ids.collect();
    for sid in unique {
        sqlx::query(
            r#"
            UPDATE sessions SET
                message_count       = (SELECT COUNT(*) FROM messages WHERE session_id = ?1),
                user_msg_count      = (SELECT COUNT(*) FROM messages WHERE session_id = ?1 AND role = 'user'),
                asst_msg_count      = (SELECT COUNT(*) FROM messages WHERE session_id = ?1 AND role = 'assistant'),
                total_input_tokens  = (SELECT COALESCE(SUM(input_tokens), 0)  FROM messages WHERE session_id = ?1),
                total_output_tokens = (SELECT COALESCE(SUM(output_tokens), 0) FROM messages WHERE session_id = ?1),
                total_cache_read    = (SELECT COALESCE(SUM(cache_read), 0)    FROM messages WHERE session_id = ?1),
                total_cache_create  = (SELECT COALESCE(SUM(cache_create), 0)  FROM messages WHERE session_id = ?1),
                first_message_at    = COALESCE((SELECT MIN(timestamp) FROM messages WHERE session_id = ?1), first_message_at),
                last_message_at     = COALESCE((SELECT MAX(timestamp) FROM messages WHERE session_id = ?1), last_message_at),
                indexed_at          = ?2
            WHERE session_id = ?1
            "#,
        )
        .bind(sid)
        .bind(fmt_ts(now))
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn advance_offset_tx(
    tx: &mut Transaction<'_, Sqlite>,
    path: &str,
    session_id: &str,
    new_offset: u64,
    mtime: i64,
    now: DateTime<Utc>,
) -> DbResult<()> {
    let current: Option<(i64,)> =
        sqlx::query_as("SELECT byte_offset FROM ingest_state WHERE jsonl_path = ?")
            .bind(path)
            .fetch_optional(&mut **tx)
            .await?;

    if let Some((current,)) = current {
        if (new_offset as i64) < current {
            warn!(path, current, requested = new_offset, "rejecting ingest offset regression");
            return Err(DbError::OffsetRegression {
                path: path.to_string(),
                current,
                requested: new_offset as i64,
            });
        }
    }

    sqlx::query(
        r#"
        INSERT INTO ingest_state (jsonl_path, session_id, byte_offset, mtime, indexed_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(jsonl_path) DO UPDATE SET
            session_id  = excluded.session_id,
            byte_offset = excluded.byte_offset,
            mtime       = excluded.mtime,
            indexed_at  = excluded.indexed_at
        "#,
    )
    .bind(path)
    .bind(session_id)
    .bind(new_offset as i64)
    .bind(mtime)
    .bind(fmt_ts(now))
    .execute(&mut **tx)
    .await?;

    sqlx::query("UPDATE sessions SET file_size_bytes = ?, jsonl_path = ? WHERE session_id = ?")
        .bind(new_offset as i64)
        .bind(path)
        .bind(session_id)
        .execute(&mut **tx)
        .await?;

    Ok(())
}
