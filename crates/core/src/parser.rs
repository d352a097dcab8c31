// crates/core/src/parser.rs
//! Incremental JSONL parser for assistant session logs.
//!
//! Converts a batch of complete log lines into normalized records. The
//! function is pure: the same lines and fallback timestamp always produce
//! the same batch, so re-ingesting a prefix is a no-op at the store layer.

use crate::types::*;
use chrono::{DateTime, Utc};
use regex_lite::Regex;
use tracing::debug;

/// Hard cap on tool input summaries.
const SUMMARY_LIMIT: usize = 80;
/// Task-family summaries are shorter; they render in narrow dashboard cells.
const TASK_SUMMARY_LIMIT: usize = 60;
/// Bash file events store the command itself, truncated.
const BASH_EVENT_LIMIT: usize = 200;

/// Parse a batch of complete log lines into a [`ParsedBatch`].
///
/// - `session_hint` is the session id inferred from the file name; a line
///   carrying its own `sessionId` overrides it.
/// - `fallback_ts` replaces missing or malformed timestamps so the function
///   stays deterministic for a given input.
///
/// Malformed lines are skipped and counted, never fatal. Meta-flagged user
/// entries and tool_result-only user entries produce no message.
pub fn parse_lines(session_hint: &str, lines: &[String], fallback_ts: DateTime<Utc>) -> ParsedBatch {
    let mut batch = ParsedBatch::default();

    let command_tag = Regex::new(r"<command-name>[^<]*</command-name>\s*").unwrap();
    let command_args = Regex::new(r"<command-args>[^<]*</command-args>\s*").unwrap();

    for (line_no, raw) in lines.iter().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        let entry: LogEntry = match serde_json::from_str(line) {
            Ok(entry) => entry,
            Err(e) => {
                debug!(line = line_no + 1, error = %e, "skipping malformed log line");
                batch.malformed_lines += 1;
                continue;
            }
        };

        match entry {
            LogEntry::User {
                envelope,
                message,
                is_meta,
            } => {
                let sid = resolve_session(&envelope, session_hint);
                let ts = parse_timestamp(envelope.timestamp.as_deref(), fallback_ts);
                absorb_meta(&mut batch, &sid, &envelope, None);
                track_timestamps(&mut batch, ts);

                if is_meta == Some(true) {
                    continue;
                }
                let Some(message) = message else { continue };

                let extracted = extract_content(message.content.as_ref());
                // Tool results never become messages on their own.
                if extracted.tool_result_only {
                    continue;
                }

                let body = clean_command_tags(&extracted.body, &command_tag, &command_args);
                let usage = message
                    .usage
                    .as_ref()
                    .map(TokenUsage::from)
                    .unwrap_or_default();

                batch.messages.push(MessageRecord {
                    uuid: resolve_uuid(&envelope, &sid, ts, line_no),
                    session_id: sid,
                    parent_uuid: envelope.parent_uuid,
                    role: Role::User,
                    body,
                    reasoning: None,
                    model: message.model,
                    usage,
                    timestamp: ts,
                    tool_uses: Vec::new(),
                    file_events: Vec::new(),
                });
            }
            LogEntry::Assistant { envelope, message } => {
                let sid = resolve_session(&envelope, session_hint);
                let ts = parse_timestamp(envelope.timestamp.as_deref(), fallback_ts);
                let Some(message) = message else {
                    absorb_meta(&mut batch, &sid, &envelope, None);
                    track_timestamps(&mut batch, ts);
                    continue;
                };
                absorb_meta(&mut batch, &sid, &envelope, message.model.as_deref());
                track_timestamps(&mut batch, ts);

                let extracted = extract_content(message.content.as_ref());
                let usage = message
                    .usage
                    .as_ref()
                    .map(TokenUsage::from)
                    .unwrap_or_default();

                batch.messages.push(MessageRecord {
                    uuid: resolve_uuid(&envelope, &sid, ts, line_no),
                    session_id: sid,
                    parent_uuid: envelope.parent_uuid,
                    role: Role::Assistant,
                    body: extracted.body,
                    reasoning: extracted.reasoning,
                    model: message.model,
                    usage,
                    timestamp: ts,
                    tool_uses: extracted.tool_uses,
                    file_events: extracted.file_events,
                });
            }
            LogEntry::System {
                envelope,
                subtype,
                duration_ms,
            } => {
                let sid = resolve_session(&envelope, session_hint);
                let ts = parse_timestamp(envelope.timestamp.as_deref(), fallback_ts);
                absorb_meta(&mut batch, &sid, &envelope, None);
                track_timestamps(&mut batch, ts);
                if subtype.as_deref() == Some("turn_duration") {
                    batch.turn_duration_ms += duration_ms.unwrap_or(0);
                }
            }
            LogEntry::Progress | LogEntry::FileHistorySnapshot | LogEntry::QueueOperation => {}
            LogEntry::Other => {
                batch.unknown_types += 1;
            }
        }
    }

    batch
}

/// Aggregated pieces of a message's content array.
#[derive(Debug, Default)]
struct ExtractedContent {
    body: String,
    reasoning: Option<String>,
    tool_uses: Vec<ToolUseRecord>,
    file_events: Vec<FileEventRecord>,
    /// True when the content consisted exclusively of tool_result blocks.
    tool_result_only: bool,
}

fn extract_content(content: Option<&RawContent>) -> ExtractedContent {
    let mut out = ExtractedContent::default();

    let blocks = match content {
        None => return out,
        Some(RawContent::Text(text)) => {
            out.body = text.clone();
            return out;
        }
        Some(RawContent::Blocks(blocks)) => blocks,
    };

    let mut text_parts: Vec<&str> = Vec::new();
    let mut thinking_parts: Vec<&str> = Vec::new();
    let mut tool_result_count = 0usize;

    for block in blocks {
        match block {
            ContentBlock::Text { text } => text_parts.push(text),
            ContentBlock::Thinking { thinking } => thinking_parts.push(thinking),
            ContentBlock::ToolUse { id, name, input } => {
                out.tool_uses.push(ToolUseRecord {
                    tool_use_id: id.clone().unwrap_or_default(),
                    tool_name: name.clone(),
                    input_summary: tool_summary(name, input.as_ref()),
                });
                if let Some(event) = file_event_for(name, input.as_ref()) {
                    out.file_events.push(event);
                }
            }
            ContentBlock::ToolResult { .. } => tool_result_count += 1,
            ContentBlock::Other => {}
        }
    }

    out.body = text_parts.join("\n");
    if !thinking_parts.is_empty() {
        out.reasoning = Some(thinking_parts.join("\n"));
    }
    out.tool_result_only = tool_result_count > 0
        && text_parts.is_empty()
        && thinking_parts.is_empty()
        && out.tool_uses.is_empty();

    out
}

/// Build the one-line human summary for a tool invocation.
///
/// Read/Write/Edit show the file basename; Bash shows the command;
/// Grep/Glob show the pattern; the Task family shows subject or description.
/// Unknown tools probe a few common fields before giving up.
pub fn tool_summary(name: &str, input: Option<&serde_json::Value>) -> String {
    let Some(input) = input.and_then(|v| v.as_object()) else {
        return String::new();
    };

    let str_field = |key: &str| input.get(key).and_then(|v| v.as_str()).unwrap_or("");

    match name {
        "Read" | "Write" | "Edit" => truncate_chars(basename(str_field("file_path")), SUMMARY_LIMIT),
        "Bash" => truncate_chars(str_field("command").trim(), SUMMARY_LIMIT),
        "Grep" | "Glob" => truncate_chars(str_field("pattern").trim(), SUMMARY_LIMIT),
        "Task" | "TaskCreate" | "TaskUpdate" => {
            let val = match str_field("subject") {
                "" => str_field("description"),
                s => s,
            };
            truncate_chars(val.trim(), TASK_SUMMARY_LIMIT)
        }
        _ => {
            for key in ["subject", "description", "file_path", "command", "query"] {
                let val = str_field(key);
                if !val.is_empty() {
                    return truncate_chars(val.trim(), SUMMARY_LIMIT);
                }
            }
            String::new()
        }
    }
}

/// Fixed tool-name → file-event mapping.
///
/// Read/Glob/Grep touch files for reading, Write creates, Edit edits, and
/// Bash events carry the command itself in the path column.
pub fn file_event_for(name: &str, input: Option<&serde_json::Value>) -> Option<FileEventRecord> {
    let input = input?.as_object()?;
    let str_field = |key: &str| input.get(key).and_then(|v| v.as_str());

    let (kind, path) = match name {
        "Read" => (FileEventKind::Read, str_field("file_path")?),
        "Glob" | "Grep" => (FileEventKind::Read, str_field("path")?),
        "Write" => (FileEventKind::Create, str_field("file_path")?),
        "Edit" => (FileEventKind::Edit, str_field("file_path")?),
        "Bash" => {
            let cmd = str_field("command")?.trim();
            if cmd.is_empty() {
                return None;
            }
            return Some(FileEventRecord {
                file_path: truncate_chars(cmd, BASH_EVENT_LIMIT),
                kind: FileEventKind::Bash,
            });
        }
        _ => return None,
    };

    if path.is_empty() {
        return None;
    }
    Some(FileEventRecord {
        file_path: path.to_string(),
        kind,
    })
}

fn resolve_session(envelope: &Envelope, hint: &str) -> String {
    envelope
        .session_id
        .clone()
        .unwrap_or_else(|| hint.to_string())
}

fn resolve_uuid(envelope: &Envelope, sid: &str, ts: DateTime<Utc>, line_no: usize) -> String {
    envelope
        .uuid
        .clone()
        .unwrap_or_else(|| format!("{}-{}-{}", sid, ts.timestamp_millis(), line_no))
}

fn absorb_meta(batch: &mut ParsedBatch, sid: &str, envelope: &Envelope, model: Option<&str>) {
    let observed = SessionMeta {
        slug: envelope.slug.clone(),
        working_dir: envelope.cwd.clone(),
        git_branch: envelope.git_branch.clone(),
        model: model.map(str::to_string),
        version: envelope.version.clone(),
    };
    batch
        .meta
        .entry(sid.to_string())
        .or_default()
        .absorb(&observed);
}

fn track_timestamps(batch: &mut ParsedBatch, ts: DateTime<Utc>) {
    match batch.first_timestamp {
        Some(first) if first <= ts => {}
        _ => batch.first_timestamp = Some(ts),
    }
    match batch.last_timestamp {
        Some(last) if last >= ts => {}
        _ => batch.last_timestamp = Some(ts),
    }
}

/// Parse an RFC 3339 timestamp, falling back on missing/malformed input.
pub fn parse_timestamp(raw: Option<&str>, fallback: DateTime<Utc>) -> DateTime<Utc> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(fallback)
}

/// Strip assistant-injected command routing tags from user message text.
fn clean_command_tags(content: &str, tag: &Regex, args: &Regex) -> String {
    let cleaned = tag.replace_all(content, "");
    let cleaned = args.replace_all(&cleaned, "");
    cleaned.trim().to_string()
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn truncate_chars(s: &str, limit: usize) -> String {
    s.chars().take(limit).collect()
}
