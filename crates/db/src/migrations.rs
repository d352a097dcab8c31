/// Inline SQL migrations for the claude-remote index schema.
///
/// One statement per entry; applied versions are tracked in a `_migrations`
/// table so non-idempotent statements only run once. All timestamps are
/// RFC 3339 UTC text and compare lexicographically.
pub const MIGRATIONS: &[&str] = &[
    // 1: sessions
    r#"
CREATE TABLE IF NOT EXISTS sessions (
    session_id          TEXT PRIMARY KEY,
    slug                TEXT,
    project             TEXT,
    working_dir         TEXT,
    git_branch          TEXT,
    model               TEXT,
    version             TEXT,
    first_message_at    TEXT,
    last_message_at     TEXT,
    message_count       INTEGER NOT NULL DEFAULT 0,
    user_msg_count      INTEGER NOT NULL DEFAULT 0,
    asst_msg_count      INTEGER NOT NULL DEFAULT 0,
    total_input_tokens  INTEGER NOT NULL DEFAULT 0,
    total_output_tokens INTEGER NOT NULL DEFAULT 0,
    total_cache_read    INTEGER NOT NULL DEFAULT 0,
    total_cache_create  INTEGER NOT NULL DEFAULT 0,
    file_size_bytes     INTEGER NOT NULL DEFAULT 0,
    jsonl_path          TEXT,
    indexed_at          TEXT
);
"#,
    // 2-3: session indexes
    r#"CREATE INDEX IF NOT EXISTS idx_sessions_last ON sessions(last_message_at DESC);"#,
    r#"CREATE INDEX IF NOT EXISTS idx_sessions_project ON sessions(project);"#,
    // 4: messages
    r#"
CREATE TABLE IF NOT EXISTS messages (
    uuid          TEXT PRIMARY KEY,
    session_id    TEXT NOT NULL REFERENCES sessions(session_id),
    parent_uuid   TEXT,
    role          TEXT NOT NULL,
    body          TEXT NOT NULL DEFAULT '',
    reasoning     TEXT,
    model         TEXT,
    input_tokens  INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    cache_read    INTEGER NOT NULL DEFAULT 0,
    cache_create  INTEGER NOT NULL DEFAULT 0,
    timestamp     TEXT NOT NULL,
    seq_num       INTEGER NOT NULL
);
"#,
    // 5: dense per-session ordering
    r#"CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_session_seq ON messages(session_id, seq_num);"#,
    // 6-8: tool_uses
    r#"
CREATE TABLE IF NOT EXISTS tool_uses (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    tool_use_id   TEXT,
    session_id    TEXT NOT NULL,
    message_uuid  TEXT NOT NULL,
    tool_name     TEXT NOT NULL,
    input_summary TEXT NOT NULL DEFAULT '',
    timestamp     TEXT NOT NULL
);
"#,
    r#"CREATE INDEX IF NOT EXISTS idx_tool_uses_session ON tool_uses(session_id);"#,
    r#"CREATE INDEX IF NOT EXISTS idx_tool_uses_name ON tool_uses(tool_name);"#,
    // 9-10: file_events
    r#"
CREATE TABLE IF NOT EXISTS file_events (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    file_path  TEXT NOT NULL,
    event_type TEXT NOT NULL,
    timestamp  TEXT NOT NULL
);
"#,
    r#"CREATE INDEX IF NOT EXISTS idx_file_events_session ON file_events(session_id);"#,
    // 11: push subscriptions
    r#"
CREATE TABLE IF NOT EXISTS push_subscriptions (
    endpoint   TEXT PRIMARY KEY,
    p256dh_key TEXT NOT NULL,
    auth_key   TEXT NOT NULL,
    user_agent TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL
);
"#,
    // 12: per-file ingest watermarks
    r#"
CREATE TABLE IF NOT EXISTS ingest_state (
    jsonl_path  TEXT PRIMARY KEY,
    session_id  TEXT NOT NULL,
    byte_offset INTEGER NOT NULL DEFAULT 0,
    mtime       INTEGER NOT NULL DEFAULT 0,
    indexed_at  TEXT NOT NULL
);
"#,
    // 13: full-text shadow of messages (external content, rowid-keyed)
    r#"
CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(
    body,
    reasoning,
    content='messages',
    content_rowid='rowid'
);
"#,
    // 14-16: keep the FTS shadow consistent on every mutation
    r#"
CREATE TRIGGER IF NOT EXISTS messages_ai AFTER INSERT ON messages BEGIN
    INSERT INTO messages_fts(rowid, body, reasoning)
    VALUES (new.rowid, new.body, new.reasoning);
END;
"#,
    r#"
CREATE TRIGGER IF NOT EXISTS messages_ad AFTER DELETE ON messages BEGIN
    INSERT INTO messages_fts(messages_fts, rowid, body, reasoning)
    VALUES ('delete', old.rowid, old.body, old.reasoning);
END;
"#,
    r#"
CREATE TRIGGER IF NOT EXISTS messages_au AFTER UPDATE ON messages BEGIN
    INSERT INTO messages_fts(messages_fts, rowid, body, reasoning)
    VALUES ('delete', old.rowid, old.body, old.reasoning);
    INSERT INTO messages_fts(rowid, body, reasoning)
    VALUES (new.rowid, new.body, new.reasoning);
END;
"#,
];
