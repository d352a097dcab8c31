// crates/core/src/types.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Message role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// Per-message token counters read from `message.usage`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub cache_read: u64,
    pub cache_create: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input + self.output + self.cache_read + self.cache_create
    }
}

/// File event kinds derived from tool invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileEventKind {
    Read,
    Write,
    Edit,
    Bash,
    Create,
}

impl FileEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileEventKind::Read => "read",
            FileEventKind::Write => "write",
            FileEventKind::Edit => "edit",
            FileEventKind::Bash => "bash",
            FileEventKind::Create => "create",
        }
    }
}

/// A tool invocation observed inside an assistant message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolUseRecord {
    pub tool_use_id: String,
    pub tool_name: String,
    pub input_summary: String,
}

/// A file touch derived from a tool invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEventRecord {
    pub file_path: String,
    pub kind: FileEventKind,
}

/// One normalized message, ready to be appended to the index.
///
/// `session_id` is resolved per line: the line's own `sessionId` wins over
/// the file-derived hint.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRecord {
    pub session_id: String,
    pub uuid: String,
    pub parent_uuid: Option<String>,
    pub role: Role,
    pub body: String,
    pub reasoning: Option<String>,
    pub model: Option<String>,
    pub usage: TokenUsage,
    pub timestamp: DateTime<Utc>,
    pub tool_uses: Vec<ToolUseRecord>,
    pub file_events: Vec<FileEventRecord>,
}

/// Session-level metadata coalesced from log lines. Every field is
/// first-observation-wins within a batch; `None` means no line carried it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionMeta {
    pub slug: Option<String>,
    pub working_dir: Option<String>,
    pub git_branch: Option<String>,
    pub model: Option<String>,
    pub version: Option<String>,
}

impl SessionMeta {
    /// Fill any unset field from another observation (first wins).
    pub fn absorb(&mut self, other: &SessionMeta) {
        macro_rules! take_first {
            ($field:ident) => {
                if self.$field.is_none() {
                    self.$field = other.$field.clone();
                }
            };
        }
        take_first!(slug);
        take_first!(working_dir);
        take_first!(git_branch);
        take_first!(model);
        take_first!(version);
    }
}

/// Output of one [`crate::parser::parse_lines`] call: normalized messages in
/// line order plus per-session metadata and skip counters.
#[derive(Debug, Default)]
pub struct ParsedBatch {
    /// Messages in the order their lines appeared.
    pub messages: Vec<MessageRecord>,
    /// Metadata per session id observed in this batch.
    pub meta: HashMap<String, SessionMeta>,
    pub first_timestamp: Option<DateTime<Utc>>,
    pub last_timestamp: Option<DateTime<Utc>>,
    /// Accumulated `turn_duration` milliseconds from system entries. Not
    /// persisted into session totals; exposed for diagnostics only.
    pub turn_duration_ms: u64,
    /// Lines that failed to parse as JSON objects.
    pub malformed_lines: usize,
    /// Lines with a `type` tag this parser does not recognize.
    pub unknown_types: usize,
}

impl ParsedBatch {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.meta.is_empty()
    }
}

// ============================================================================
// Raw JSONL wire types (deserialization only)
// ============================================================================

/// Fields shared by every log entry regardless of `type`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub parent_uuid: Option<String>,
    pub session_id: Option<String>,
    pub slug: Option<String>,
    pub cwd: Option<String>,
    pub git_branch: Option<String>,
    pub version: Option<String>,
    pub timestamp: Option<String>,
    pub uuid: Option<String>,
}

/// One line of the append-only session log, discriminated by `type`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum LogEntry {
    User {
        #[serde(flatten)]
        envelope: Envelope,
        message: Option<RawMessage>,
        #[serde(rename = "isMeta")]
        is_meta: Option<bool>,
    },
    Assistant {
        #[serde(flatten)]
        envelope: Envelope,
        message: Option<RawMessage>,
    },
    System {
        #[serde(flatten)]
        envelope: Envelope,
        subtype: Option<String>,
        #[serde(rename = "durationMs")]
        duration_ms: Option<u64>,
    },
    Progress,
    FileHistorySnapshot,
    QueueOperation,
    #[serde(other)]
    Other,
}

/// The nested `message` object carried by user/assistant entries.
#[derive(Debug, Clone, Deserialize)]
pub struct RawMessage {
    pub role: Option<String>,
    pub content: Option<RawContent>,
    pub model: Option<String>,
    pub usage: Option<RawUsage>,
}

/// Message content: either a plain string or an array of content blocks.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// Heterogeneous content blocks inside an array-form message body.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Thinking {
        thinking: String,
    },
    Text {
        text: String,
    },
    ToolUse {
        #[serde(default)]
        id: Option<String>,
        name: String,
        #[serde(default)]
        input: Option<serde_json::Value>,
    },
    ToolResult {
        #[serde(default)]
        content: Option<serde_json::Value>,
    },
    #[serde(other)]
    Other,
}

/// Token usage as written by the assistant tool.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawUsage {
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
    #[serde(default)]
    pub cache_read_input_tokens: Option<u64>,
    #[serde(default)]
    pub cache_creation_input_tokens: Option<u64>,
}

impl From<&RawUsage> for TokenUsage {
    fn from(raw: &RawUsage) -> Self {
        Self {
            input: raw.input_tokens.unwrap_or(0),
            output: raw.output_tokens.unwrap_or(0),
            cache_read: raw.cache_read_input_tokens.unwrap_or(0),
            cache_create: raw.cache_creation_input_tokens.unwrap_or(0),
        }
    }
}
