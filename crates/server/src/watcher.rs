// crates/server/src/watcher.rs
//! Poll-based discovery and growth detection for session log files.
//!
//! The log root may live on a user-space filesystem that does not deliver
//! reliable change notifications, so correctness rests on `stat` polling.
//! A notify-based nudge can be layered on top when a startup probe says the
//! mount supports it; the nudge only schedules an earlier poll and never
//! replaces it.

use claude_remote_db::IngestFileState;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, warn};

/// Per-pass read window.
const READ_BUFFER: u64 = 1024 * 1024;
/// One extension is allowed for a line that straddles the window.
const READ_BUFFER_MAX: u64 = 2 * READ_BUFFER;

/// Last-seen state for one tracked log file.
#[derive(Debug, Clone)]
pub struct FileState {
    pub session_id: String,
    pub size_seen: u64,
    pub mtime_seen: i64,
}

/// A file whose stat no longer matches its last-seen state.
#[derive(Debug)]
pub struct GrowthCandidate {
    pub path: PathBuf,
    pub session_id: String,
    pub offset: u64,
    pub current_size: u64,
    pub mtime: i64,
    pub shrunk: bool,
}

/// Complete lines read past a watermark.
#[derive(Debug, Default)]
pub struct FileDelta {
    pub lines: Vec<String>,
    pub new_offset: u64,
    /// Lines abandoned because they exceeded the extended read buffer.
    pub long_lines_skipped: u64,
}

/// Outcome of probing one file for new bytes.
#[derive(Debug)]
pub enum PollOutcome {
    /// Nothing past the watermark (or only a partial trailing line).
    Unchanged,
    Grew(FileDelta),
    /// File is now smaller than the watermark.
    Truncated,
}

/// Result of re-enumerating the root.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub added: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
}

/// Tracks `path → (size_seen, mtime_seen, session id)` under a log root.
pub struct LogWatcher {
    root: PathBuf,
    files: HashMap<PathBuf, FileState>,
}

impl LogWatcher {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            files: HashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Seed watermarks from the store so a restart resumes where the last
    /// run committed.
    pub fn restore(&mut self, states: &HashMap<String, IngestFileState>) {
        for (path, state) in states {
            self.files.insert(
                PathBuf::from(path),
                FileState {
                    session_id: state.session_id.clone(),
                    size_seen: state.byte_offset.max(0) as u64,
                    mtime_seen: state.mtime,
                },
            );
        }
    }

    /// Re-enumerate the root: register newly created files at offset zero
    /// and report files that vanished (their history is kept; only the
    /// watch entry goes away).
    pub async fn reconcile(&mut self) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let found = enumerate_session_files(&self.root).await;

        for (path, session_id) in &found {
            if !self.files.contains_key(path) {
                self.files.insert(
                    path.clone(),
                    FileState {
                        session_id: session_id.clone(),
                        size_seen: 0,
                        mtime_seen: 0,
                    },
                );
                report.added.push(path.clone());
            }
        }

        let found_paths: std::collections::HashSet<&PathBuf> =
            found.iter().map(|(p, _)| p).collect();
        let gone: Vec<PathBuf> = self
            .files
            .keys()
            .filter(|p| !found_paths.contains(p))
            .cloned()
            .collect();
        for path in gone {
            self.files.remove(&path);
            report.removed.push(path);
        }

        report
    }

    /// Stat every tracked file and report the ones that changed. Watermarks
    /// are NOT advanced here; the indexer commits them only after the store
    /// transaction succeeds.
    pub async fn poll(&self) -> Vec<GrowthCandidate> {
        let mut candidates = Vec::new();
        for (path, state) in &self.files {
            let meta = match fs::metadata(path).await {
                Ok(meta) => meta,
                Err(e) => {
                    // Transient: the next poll retries, offset stays put.
                    debug!(path = %path.display(), error = %e, "stat failed, skipping this pass");
                    continue;
                }
            };
            let size = meta.len();
            if size == state.size_seen {
                continue;
            }
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            candidates.push(GrowthCandidate {
                path: path.clone(),
                session_id: state.session_id.clone(),
                offset: state.size_seen,
                current_size: size,
                mtime,
                shrunk: size < state.size_seen,
            });
        }
        candidates
    }

    /// Record a committed watermark.
    pub fn commit(&mut self, path: &Path, new_offset: u64, mtime: i64) {
        if let Some(state) = self.files.get_mut(path) {
            state.size_seen = new_offset;
            state.mtime_seen = mtime;
        }
    }

    /// Reset a file's watermark after truncation.
    pub fn reset(&mut self, path: &Path) {
        if let Some(state) = self.files.get_mut(path) {
            state.size_seen = 0;
        }
    }

    pub fn tracked_count(&self) -> usize {
        self.files.len()
    }
}

/// Enumerate `<root>/<project-dir>/<session-id>.jsonl` files.
pub async fn enumerate_session_files(root: &Path) -> Vec<(PathBuf, String)> {
    let mut found = Vec::new();

    let mut projects = match fs::read_dir(root).await {
        Ok(rd) => rd,
        Err(e) => {
            debug!(root = %root.display(), error = %e, "cannot read log root");
            return found;
        }
    };

    while let Ok(Some(project)) = projects.next_entry().await {
        let project_path = project.path();
        let is_dir = project
            .file_type()
            .await
            .map(|ft| ft.is_dir())
            .unwrap_or(false);
        if !is_dir {
            continue;
        }

        let mut sessions = match fs::read_dir(&project_path).await {
            Ok(rd) => rd,
            Err(_) => continue,
        };
        while let Ok(Some(entry)) = sessions.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().to_string()) else {
                continue;
            };
            found.push((path, stem));
        }
    }

    found
}

/// Read complete lines past `offset`.
///
/// At most one window (1 MiB, extended once to 2 MiB for a straddling line)
/// is consumed per call; remaining growth is picked up by the next poll. A
/// line longer than the extended window is skipped whole and counted.
pub async fn read_growth(path: &Path, offset: u64) -> std::io::Result<PollOutcome> {
    let meta = fs::metadata(path).await?;
    let size = meta.len();

    if size < offset {
        return Ok(PollOutcome::Truncated);
    }
    if size == offset {
        return Ok(PollOutcome::Unchanged);
    }

    let delta = size - offset;
    let mut file = fs::File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(offset)).await?;

    let mut window = delta.min(READ_BUFFER);
    let mut buf = read_exact_window(&mut file, window).await?;

    if last_newline(&buf).is_none() && delta > window {
        // A line straddles the window: extend once.
        window = delta.min(READ_BUFFER_MAX);
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        buf = read_exact_window(&mut file, window).await?;

        if last_newline(&buf).is_none() && delta > window {
            // Oversized line: scan forward for its terminator and skip it.
            return skip_long_line(&mut file, offset, window, size).await;
        }
    }

    let Some(pos) = last_newline(&buf) else {
        // Partial trailing line; wait for its newline.
        return Ok(PollOutcome::Unchanged);
    };

    let complete = &buf[..=pos];
    let lines = split_lines(complete);
    Ok(PollOutcome::Grew(FileDelta {
        lines,
        new_offset: offset + complete.len() as u64,
        long_lines_skipped: 0,
    }))
}

async fn read_exact_window(file: &mut fs::File, window: u64) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; window as usize];
    let mut filled = 0usize;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

/// The current line is longer than the extended buffer. Scan forward in
/// window-sized chunks until its newline, then resume normally from there.
async fn skip_long_line(
    file: &mut fs::File,
    offset: u64,
    consumed: u64,
    size: u64,
) -> std::io::Result<PollOutcome> {
    let mut scan_from = offset + consumed;
    loop {
        if scan_from >= size {
            // Terminator not on disk yet; try again next poll.
            return Ok(PollOutcome::Unchanged);
        }
        let window = (size - scan_from).min(READ_BUFFER);
        let buf = read_exact_window(file, window).await?;
        if buf.is_empty() {
            return Ok(PollOutcome::Unchanged);
        }
        if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let new_offset = scan_from + pos as u64 + 1;
            warn!(new_offset, "skipped a log line exceeding the read buffer");
            return Ok(PollOutcome::Grew(FileDelta {
                lines: Vec::new(),
                new_offset,
                long_lines_skipped: 1,
            }));
        }
        scan_from += buf.len() as u64;
    }
}

fn last_newline(buf: &[u8]) -> Option<usize> {
    buf.iter().rposition(|&b| b == b'\n')
}

fn split_lines(complete: &[u8]) -> Vec<String> {
    complete
        .split(|&b| b == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| String::from_utf8_lossy(line).into_owned())
        .collect()
}

/// Start a notify watcher that nudges the indexer when a `.jsonl` file
/// changes. The returned handle must stay alive for the watch to persist;
/// dropping it stops the nudges (polling is unaffected).
pub fn start_notify_nudger(
    root: &Path,
    tx: tokio::sync::mpsc::Sender<()>,
) -> notify::Result<notify::RecommendedWatcher> {
    use notify::Watcher;

    let mut watcher =
        notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| match res {
            Ok(event) => {
                let touches_log = event.paths.iter().any(|p| {
                    p.extension().map(|ext| ext == "jsonl").unwrap_or(false)
                });
                if touches_log {
                    // Full channel means a poll is already queued.
                    let _ = tx.try_send(());
                }
            }
            Err(e) => warn!(error = %e, "notify watcher error"),
        })?;
    watcher.watch(root, notify::RecursiveMode::Recursive)?;
    Ok(watcher)
}

/// Decide whether notify-based nudging may be layered over polling.
///
/// Path heuristic first: roots on network or user-space mounts (per
/// /proc/mounts where available) stay poll-only. Then a live probe: a watch
/// on the root must actually be establishable.
pub fn probe_notify_support(root: &Path) -> bool {
    if is_unreliable_mount(root) {
        return false;
    }
    match notify::recommended_watcher(|_res: Result<notify::Event, notify::Error>| {}) {
        Ok(mut watcher) => {
            use notify::Watcher;
            watcher
                .watch(root, notify::RecursiveMode::Recursive)
                .is_ok()
        }
        Err(_) => false,
    }
}

fn is_unreliable_mount(root: &Path) -> bool {
    let Ok(mounts) = std::fs::read_to_string("/proc/mounts") else {
        return false;
    };
    let root_str = root.to_string_lossy();
    let mut best: Option<(usize, String)> = None;
    for line in mounts.lines() {
        let mut parts = line.split_whitespace();
        let (Some(_dev), Some(mount_point), Some(fstype)) =
            (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        if root_str.starts_with(mount_point)
            && best.as_ref().map(|(len, _)| mount_point.len() > *len).unwrap_or(true)
        {
            best = Some((mount_point.len(), fstype.to_string()));
        }
    }
    match best {
        Some((_, fstype)) => {
            fstype.starts_with("fuse")
                || matches!(fstype.as_str(), "nfs" | "nfs4" | "cifs" | "smbfs" | "9p" | "sshfs")
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(path: &Path, content: &[u8]) {
        let mut f = std::fs::File::create(path).unwrap();
        f.write_all(content).unwrap();
    }

    fn append_file(path: &Path, content: &[u8]) {
        let mut f = std::fs::OpenOptions::new().append(true).open(path).unwrap();
        f.write_all(content).unwrap();
    }

    #[tokio::test]
    async fn read_growth_returns_complete_lines_only() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("s.jsonl");
        write_file(&path, b"line1\nline2\npartial");

        let PollOutcome::Grew(delta) = read_growth(&path, 0).await.unwrap() else {
            panic!("expected growth");
        };
        assert_eq!(delta.lines, vec!["line1", "line2"]);
        assert_eq!(delta.new_offset, 12);

        // The partial tail is not delivered until its newline lands.
        assert!(matches!(
            read_growth(&path, delta.new_offset).await.unwrap(),
            PollOutcome::Unchanged
        ));

        append_file(&path, b" done\n");
        let PollOutcome::Grew(delta2) = read_growth(&path, delta.new_offset).await.unwrap() else {
            panic!("expected growth after completing the line");
        };
        assert_eq!(delta2.lines, vec!["partial done"]);
    }

    #[tokio::test]
    async fn read_growth_detects_truncation() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("s.jsonl");
        write_file(&path, b"0123456789\n");
        assert!(matches!(
            read_growth(&path, 100).await.unwrap(),
            PollOutcome::Truncated
        ));
    }

    #[tokio::test]
    async fn read_growth_skips_oversized_line() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("s.jsonl");

        let mut content = vec![b'x'; (READ_BUFFER_MAX + 100) as usize];
        content.push(b'\n');
        content.extend_from_slice(b"{\"ok\":1}\n");
        write_file(&path, &content);

        let PollOutcome::Grew(delta) = read_growth(&path, 0).await.unwrap() else {
            panic!("expected growth with skip");
        };
        assert_eq!(delta.long_lines_skipped, 1);
        assert!(delta.lines.is_empty());
        assert_eq!(delta.new_offset, READ_BUFFER_MAX + 101);

        // The next pass picks up the healthy line after the monster.
        let PollOutcome::Grew(next) = read_growth(&path, delta.new_offset).await.unwrap() else {
            panic!("expected follow-up growth");
        };
        assert_eq!(next.lines, vec!["{\"ok\":1}"]);
    }

    #[tokio::test]
    async fn watcher_poll_reports_growth_and_shrink() {
        let tmp = tempfile::tempdir().unwrap();
        let project = tmp.path().join("-work-demo");
        std::fs::create_dir(&project).unwrap();
        let path = project.join("sess-a.jsonl");
        write_file(&path, b"one\n");

        let mut watcher = LogWatcher::new(tmp.path().to_path_buf());
        let report = watcher.reconcile().await;
        assert_eq!(report.added, vec![path.clone()]);
        assert_eq!(watcher.tracked_count(), 1);

        let candidates = watcher.poll().await;
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].session_id, "sess-a");
        assert_eq!(candidates[0].offset, 0);
        assert!(!candidates[0].shrunk);

        watcher.commit(&path, 4, candidates[0].mtime);
        assert!(watcher.poll().await.is_empty());

        // Truncation shows up as a shrunk candidate.
        write_file(&path, b"");
        let candidates = watcher.poll().await;
        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].shrunk);
        watcher.reset(&path);
        assert_eq!(watcher.poll().await.len(), 0);
    }

    #[tokio::test]
    async fn reconcile_reports_removed_files() {
        let tmp = tempfile::tempdir().unwrap();
        let project = tmp.path().join("-work-demo");
        std::fs::create_dir(&project).unwrap();
        let path = project.join("sess-a.jsonl");
        write_file(&path, b"one\n");

        let mut watcher = LogWatcher::new(tmp.path().to_path_buf());
        watcher.reconcile().await;
        assert_eq!(watcher.tracked_count(), 1);

        std::fs::remove_file(&path).unwrap();
        let report = watcher.reconcile().await;
        assert_eq!(report.removed, vec![path]);
        assert_eq!(watcher.tracked_count(), 0);
    }

    #[tokio::test]
    async fn restore_seeds_watermarks() {
        let mut watcher = LogWatcher::new(PathBuf::from("/nowhere"));
        let mut states = HashMap::new();
        states.insert(
            "/nowhere/-p/sess-a.jsonl".to_string(),
            IngestFileState {
                session_id: "sess-a".into(),
                byte_offset: 640,
                mtime: 1_000,
            },
        );
        watcher.restore(&states);
        assert_eq!(watcher.tracked_count(), 1);
    }
}
