// crates/server/src/indexer.rs
//! Watcher → Parser → Store glue.
//!
//! Each poll pass reads per-file growth, parses the complete lines, applies
//! the batch in one store transaction, and only then advances the in-memory
//! watermark. There is no queue between watcher and store that can
//! overflow: a slow store write just means the next pass reads a bigger
//! delta. Change events are coalesced per session over a 500 ms window
//! before hitting the bus.

use crate::bus::{EventBus, RemoteEvent, GLOBAL_TOPIC};
use crate::watcher::{read_growth, GrowthCandidate, LogWatcher, PollOutcome};
use chrono::{SecondsFormat, Utc};
use claude_remote_core::parser::parse_lines;
use claude_remote_core::RemoteConfig;
use claude_remote_db::{AppliedBatch, Database, DbResult};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Repeated store failures beyond this abort the process (continuing would
/// silently index nothing).
const MAX_CONSECUTIVE_FAILURES: u32 = 10;

/// Coalescing window for change events.
const BATCH_WINDOW: Duration = Duration::from_millis(500);

/// Max tool_use events per session per window; overflow is dropped.
const BATCH_TOOL_CAP: usize = 10;

/// How often due batches are flushed to the bus.
const FLUSH_TICK: Duration = Duration::from_millis(100);

pub struct Indexer {
    db: Database,
    bus: EventBus,
    watcher: LogWatcher,
    poll_interval: Duration,
    reconcile_interval: Duration,
    batcher: EventBatcher,
    consecutive_failures: u32,
}

impl Indexer {
    /// Build an indexer whose watcher resumes from the store's watermarks.
    pub async fn new(db: Database, bus: EventBus, config: &RemoteConfig) -> DbResult<Self> {
        let mut watcher = LogWatcher::new(config.projects_root.clone());
        watcher.restore(&db.ingest_states().await?);
        Ok(Self {
            db,
            bus,
            watcher,
            poll_interval: config.poll_interval,
            reconcile_interval: config.reconcile_interval,
            batcher: EventBatcher::new(BATCH_WINDOW),
            consecutive_failures: 0,
        })
    }

    /// Main loop: poll for growth, reconcile the root, flush event batches.
    /// `nudge` carries change hints from the optional notify fast path; a
    /// hint only schedules an immediate poll, correctness stays with the
    /// interval. Returns Ok on shutdown, Err when the store failed
    /// repeatedly.
    pub async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
        mut nudge: Option<tokio::sync::mpsc::Receiver<()>>,
    ) -> anyhow::Result<()> {
        let mut poll = tokio::time::interval(self.poll_interval);
        let mut reconcile = tokio::time::interval(self.reconcile_interval);
        let mut flush = tokio::time::interval(FLUSH_TICK);

        info!(root = %self.watcher.root().display(), "indexer started");

        loop {
            tokio::select! {
                _ = reconcile.tick() => {
                    self.reconcile_once().await;
                }
                _ = poll.tick() => {
                    self.pass().await;
                    if self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                        anyhow::bail!(
                            "store rejected {} consecutive ingest transactions",
                            self.consecutive_failures
                        );
                    }
                }
                _ = nudge_recv(&mut nudge) => {
                    self.pass().await;
                }
                _ = flush.tick() => {
                    self.flush_events(Instant::now());
                }
                _ = shutdown.changed() => {
                    // Drain anything still batched before going quiet.
                    self.flush_all_events();
                    info!("indexer stopped");
                    return Ok(());
                }
            }
        }
    }

    /// Re-enumerate the root: new files start at offset zero, vanished
    /// files lose their watch entry (history stays in the store).
    pub async fn reconcile_once(&mut self) {
        let report = self.watcher.reconcile().await;
        for path in &report.added {
            debug!(path = %path.display(), "tracking new session log");
        }
        for path in &report.removed {
            let path_str = path.to_string_lossy();
            if let Err(e) = self.db.remove_ingest_state(&path_str).await {
                warn!(path = %path_str, error = %e, "failed to drop ingest state");
            }
        }
    }

    /// One poll pass over all tracked files.
    pub async fn pass(&mut self) {
        let candidates = self.watcher.poll().await;
        for candidate in candidates {
            self.ingest_file(candidate).await;
        }
    }

    async fn ingest_file(&mut self, candidate: GrowthCandidate) {
        let path_str = candidate.path.to_string_lossy().to_string();
        let mut offset = candidate.offset;

        if candidate.shrunk {
            info!(path = %path_str, "file shrank; re-parsing from the start");
            if let Err(e) = self.db.reset_ingest_offset(&path_str).await {
                warn!(path = %path_str, error = %e, "truncation reset failed");
                self.consecutive_failures += 1;
                return;
            }
            self.watcher.reset(&candidate.path);
            offset = 0;
        }

        let delta = match read_growth(&candidate.path, offset).await {
            Ok(PollOutcome::Grew(delta)) => delta,
            Ok(PollOutcome::Unchanged) => return,
            Ok(PollOutcome::Truncated) => {
                // Shrank between stat and read; next poll restarts cleanly.
                if self.db.reset_ingest_offset(&path_str).await.is_ok() {
                    self.watcher.reset(&candidate.path);
                }
                return;
            }
            Err(e) => {
                // Transient I/O: abandon this file's pass, offset untouched.
                debug!(path = %path_str, error = %e, "read failed; will retry next poll");
                return;
            }
        };

        if delta.long_lines_skipped > 0 {
            warn!(
                path = %path_str,
                skipped = delta.long_lines_skipped,
                "oversized lines skipped"
            );
        }

        let now = Utc::now();
        let batch = parse_lines(&candidate.session_id, &delta.lines, now);
        if batch.malformed_lines > 0 || batch.unknown_types > 0 {
            debug!(
                path = %path_str,
                malformed = batch.malformed_lines,
                unknown = batch.unknown_types,
                "parser skipped lines"
            );
        }

        match self
            .db
            .apply_batch(
                &path_str,
                &candidate.session_id,
                &batch,
                delta.new_offset,
                candidate.mtime,
                now,
            )
            .await
        {
            Ok(applied) => {
                self.consecutive_failures = 0;
                self.watcher
                    .commit(&candidate.path, delta.new_offset, candidate.mtime);
                self.enqueue_events(applied);
            }
            Err(e) => {
                self.consecutive_failures += 1;
                error!(
                    path = %path_str,
                    error = %e,
                    failures = self.consecutive_failures,
                    "ingest transaction failed"
                );
            }
        }
    }

    fn enqueue_events(&mut self, applied: AppliedBatch) {
        let now = Instant::now();

        // Session discovery is not batched; subscribers want it promptly.
        for session_id in applied.new_sessions {
            self.bus
                .publish(GLOBAL_TOPIC, RemoteEvent::SessionStarted { session_id });
        }

        for msg in applied.inserted {
            let timestamp = msg.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true);
            self.batcher.push_message(
                now,
                RemoteEvent::NewMessage {
                    session_id: msg.session_id.clone(),
                    role: msg.role.as_str().to_string(),
                    preview: msg.preview,
                    timestamp: timestamp.clone(),
                },
            );
            for tool in msg.tool_uses {
                self.batcher.push_tool_use(
                    now,
                    RemoteEvent::ToolUse {
                        session_id: msg.session_id.clone(),
                        tool_name: tool.tool_name,
                        summary: tool.input_summary,
                        timestamp: timestamp.clone(),
                    },
                );
            }
        }
    }

    /// Publish batches whose coalescing window has elapsed.
    pub fn flush_events(&mut self, now: Instant) {
        for (topic, events) in self.batcher.flush_due(now) {
            for event in events {
                self.bus.publish(&topic, event.clone());
                self.bus.publish(GLOBAL_TOPIC, event);
            }
        }
    }

    fn flush_all_events(&mut self) {
        for (topic, events) in self.batcher.flush_all() {
            for event in events {
                self.bus.publish(&topic, event.clone());
                self.bus.publish(GLOBAL_TOPIC, event);
            }
        }
    }
}

/// Await a nudge if the channel exists and is open; otherwise never
/// resolves, so the select branch goes quiet instead of spinning.
async fn nudge_recv(nudge: &mut Option<tokio::sync::mpsc::Receiver<()>>) {
    match nudge {
        Some(rx) => {
            if rx.recv().await.is_none() {
                *nudge = None;
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending::<()>().await,
    }
}

// ============================================================================
// Event batching
// ============================================================================

struct PendingBatch {
    opened_at: Instant,
    new_message: Option<RemoteEvent>,
    tool_uses: Vec<RemoteEvent>,
    tool_overflow: u64,
}

impl PendingBatch {
    fn new(now: Instant) -> Self {
        Self {
            opened_at: now,
            new_message: None,
            tool_uses: Vec::new(),
            tool_overflow: 0,
        }
    }
}

/// Coalesces change events per session over a fixed window: the latest
/// `new_message` wins, `tool_use` events accumulate up to a small cap.
pub struct EventBatcher {
    window: Duration,
    pending: HashMap<String, PendingBatch>,
}

impl EventBatcher {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    pub fn push_message(&mut self, now: Instant, event: RemoteEvent) {
        let batch = self
            .pending
            .entry(event.session_id().to_string())
            .or_insert_with(|| PendingBatch::new(now));
        batch.new_message = Some(event);
    }

    pub fn push_tool_use(&mut self, now: Instant, event: RemoteEvent) {
        let batch = self
            .pending
            .entry(event.session_id().to_string())
            .or_insert_with(|| PendingBatch::new(now));
        if batch.tool_uses.len() >= BATCH_TOOL_CAP {
            batch.tool_overflow += 1;
            return;
        }
        batch.tool_uses.push(event);
    }

    /// Sessions whose window has elapsed, as (topic, events) pairs. The
    /// new_message (if any) leads, followed by the retained tool uses.
    pub fn flush_due(&mut self, now: Instant) -> Vec<(String, Vec<RemoteEvent>)> {
        let due: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, b)| now.duration_since(b.opened_at) >= self.window)
            .map(|(sid, _)| sid.clone())
            .collect();
        due.into_iter()
            .filter_map(|sid| self.pending.remove(&sid).map(|b| (sid, b)))
            .map(|(sid, batch)| (sid, Self::drain(batch)))
            .collect()
    }

    /// Flush everything regardless of window age (shutdown path).
    pub fn flush_all(&mut self) -> Vec<(String, Vec<RemoteEvent>)> {
        self.pending
            .drain()
            .map(|(sid, batch)| (sid, Self::drain(batch)))
            .collect()
    }

    fn drain(batch: PendingBatch) -> Vec<RemoteEvent> {
        if batch.tool_overflow > 0 {
            debug!(dropped = batch.tool_overflow, "tool_use events over batch cap dropped");
        }
        let mut events = Vec::with_capacity(1 + batch.tool_uses.len());
        if let Some(message) = batch.new_message {
            events.push(message);
        }
        events.extend(batch.tool_uses);
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claude_remote_core::RemoteConfig;
    use std::io::Write;
    use std::path::Path;

    fn message(sid: &str, preview: &str) -> RemoteEvent {
        RemoteEvent::NewMessage {
            session_id: sid.into(),
            role: "user".into(),
            preview: preview.into(),
            timestamp: "2026-02-06T06:46:54.000Z".into(),
        }
    }

    fn tool(sid: &str, name: &str) -> RemoteEvent {
        RemoteEvent::ToolUse {
            session_id: sid.into(),
            tool_name: name.into(),
            summary: String::new(),
            timestamp: "2026-02-06T06:46:55.000Z".into(),
        }
    }

    // ------------------------------------------------------------------
    // EventBatcher
    // ------------------------------------------------------------------

    #[test]
    fn batcher_latest_message_wins() {
        let mut batcher = EventBatcher::new(Duration::from_millis(500));
        let t0 = Instant::now();
        batcher.push_message(t0, message("A", "first"));
        batcher.push_message(t0, message("A", "second"));

        let flushed = batcher.flush_due(t0 + Duration::from_millis(600));
        assert_eq!(flushed.len(), 1);
        let (topic, events) = &flushed[0];
        assert_eq!(topic, "A");
        assert_eq!(events, &vec![message("A", "second")]);
    }

    #[test]
    fn batcher_respects_window() {
        let mut batcher = EventBatcher::new(Duration::from_millis(500));
        let t0 = Instant::now();
        batcher.push_message(t0, message("A", "x"));

        assert!(batcher.flush_due(t0 + Duration::from_millis(100)).is_empty());
        assert_eq!(batcher.flush_due(t0 + Duration::from_millis(500)).len(), 1);
        assert!(batcher.flush_due(t0 + Duration::from_secs(10)).is_empty());
    }

    #[test]
    fn batcher_caps_tool_uses() {
        let mut batcher = EventBatcher::new(Duration::from_millis(500));
        let t0 = Instant::now();
        for n in 0..15 {
            batcher.push_tool_use(t0, tool("A", &format!("Tool{n}")));
        }

        let flushed = batcher.flush_due(t0 + Duration::from_secs(1));
        let (_, events) = &flushed[0];
        assert_eq!(events.len(), 10, "tool uses cap at 10 per window");
    }

    #[test]
    fn batcher_keeps_sessions_separate() {
        let mut batcher = EventBatcher::new(Duration::from_millis(500));
        let t0 = Instant::now();
        batcher.push_message(t0, message("A", "for a"));
        batcher.push_message(t0, message("B", "for b"));

        let mut flushed = batcher.flush_due(t0 + Duration::from_secs(1));
        flushed.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(flushed.len(), 2);
        assert_eq!(flushed[0].0, "A");
        assert_eq!(flushed[1].0, "B");
    }

    // ------------------------------------------------------------------
    // Indexer end-to-end over a temp root
    // ------------------------------------------------------------------

    fn write_line(path: &Path, line: &str) {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        writeln!(f, "{line}").unwrap();
    }

    async fn test_indexer() -> (Indexer, Database, EventBus, tempfile::TempDir, std::path::PathBuf)
    {
        let tmp = tempfile::tempdir().unwrap();
        let project = tmp.path().join("-work-demo");
        std::fs::create_dir(&project).unwrap();
        let file = project.join("A.jsonl");

        let db = Database::open_in_memory().await.unwrap();
        let bus = EventBus::new();
        let config = RemoteConfig::for_tests(tmp.path().to_path_buf(), std::path::PathBuf::new());
        let indexer = Indexer::new(db.clone(), bus.clone(), &config).await.unwrap();
        (indexer, db, bus, tmp, file)
    }

    #[tokio::test]
    async fn live_append_publishes_on_both_topics() {
        let (mut indexer, db, bus, _tmp, file) = test_indexer().await;

        write_line(&file, r#"{"type":"user","sessionId":"A","uuid":"u1","timestamp":"2026-02-06T06:46:54Z","message":{"content":"hello"}}"#);
        indexer.reconcile_once().await;

        let mut session_sub = bus.subscribe("A");
        let mut global_sub = bus.subscribe(GLOBAL_TOPIC);

        indexer.pass().await;
        indexer.flush_events(Instant::now() + Duration::from_secs(1));

        // session_started arrives unbatched on the global topic.
        assert!(matches!(
            global_sub.try_recv(),
            Some(RemoteEvent::SessionStarted { session_id }) if session_id == "A"
        ));
        let global_msg = global_sub.try_recv().expect("new_message on global topic");
        let session_msg = session_sub.try_recv().expect("new_message on session topic");
        assert_eq!(global_msg, session_msg);
        match session_msg {
            RemoteEvent::NewMessage { session_id, role, preview, .. } => {
                assert_eq!(session_id, "A");
                assert_eq!(role, "user");
                assert_eq!(preview, "hello");
            }
            other => panic!("expected new_message, got {other:?}"),
        }

        // The appended message landed with the next sequence number.
        write_line(&file, r#"{"type":"user","sessionId":"A","uuid":"u2","timestamp":"2026-02-06T06:46:59Z","message":{"content":"again"}}"#);
        indexer.pass().await;
        indexer.flush_events(Instant::now() + Duration::from_secs(1));

        let row: (i64,) = sqlx::query_as("SELECT seq_num FROM messages WHERE uuid = 'u2'")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(row.0, 1);
        assert!(matches!(
            session_sub.try_recv(),
            Some(RemoteEvent::NewMessage { preview, .. }) if preview == "again"
        ));
    }

    #[tokio::test]
    async fn partial_line_waits_for_newline() {
        let (mut indexer, db, _bus, _tmp, file) = test_indexer().await;

        // A complete line plus a partial one, no trailing newline.
        write_line(&file, r#"{"type":"user","sessionId":"A","uuid":"u1","message":{"content":"full"}}"#);
        {
            let mut f = std::fs::OpenOptions::new().append(true).open(&file).unwrap();
            write!(f, r#"{{"type":"user","sessionId":"A","uuid":"u2","message":{{"content":"hal"#).unwrap();
        }
        indexer.reconcile_once().await;
        indexer.pass().await;

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count.0, 1, "partial line must not produce a message");

        // Completing the line yields exactly one more message.
        {
            let mut f = std::fs::OpenOptions::new().append(true).open(&file).unwrap();
            writeln!(f, r#"f done"}}}}"#).unwrap();
        }
        indexer.pass().await;

        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT uuid FROM messages ORDER BY seq_num")
                .fetch_all(db.pool())
                .await
                .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].0, "u2");
    }

    #[tokio::test]
    async fn truncation_reingests_without_duplicates() {
        let (mut indexer, db, _bus, _tmp, file) = test_indexer().await;

        let line = r#"{"type":"user","sessionId":"A","uuid":"u1","timestamp":"2026-02-06T06:46:54Z","message":{"content":"hello"}}"#;
        write_line(&file, line);
        indexer.reconcile_once().await;
        indexer.pass().await;

        // Shrink to zero, then rewrite the same content.
        std::fs::write(&file, "").unwrap();
        indexer.pass().await;
        write_line(&file, line);
        indexer.pass().await;

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count.0, 1, "re-ingest after truncation must not duplicate");

        let session: (i64,) =
            sqlx::query_as("SELECT file_size_bytes FROM sessions WHERE session_id = 'A'")
                .fetch_one(db.pool())
                .await
                .unwrap();
        assert_eq!(session.0 as usize, line.len() + 1);
    }
}
