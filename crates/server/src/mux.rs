// crates/server/src/mux.rs
//! Terminal-multiplexer control: create, list, join, inject, terminate,
//! and PTY attachment.
//!
//! Every tmux invocation is bounded by a 5 s timeout and surfaces stderr as
//! the fault payload. Attachment runs `tmux attach-session` under a local
//! PTY and bridges it to byte channels; dropping the pipe detaches the
//! client but never tears down the mux session itself.

use crate::procs::{short_id, ProcessRegistry};
use claude_remote_core::RemoteConfig;
use claude_remote_db::Database;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use serde::Serialize;
use std::io::Read;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// External command timeout.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Grace window between SIGTERM and kill-session.
const KILL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("mux session not found: {0}")]
    NotFound(String),

    #[error("mux command failed: {stderr}")]
    CommandFailed { stderr: String },

    #[error("mux command timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("PTY error: {0}")]
    Pty(String),

    #[error("store error: {0}")]
    Store(String),
}

/// Result of [`MuxController::join`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JoinOutcome {
    /// The session already runs inside one of our mux sessions.
    Attached { mux_name: String },
    /// The session runs, but outside any mux; we will not steal its tty.
    RunningNoTmux { message: String },
    /// A fresh mux session was created resuming this session.
    Created { mux_name: String },
}

pub struct MuxController {
    tmux_bin: String,
    claude_bin: String,
    prefix: String,
    db: Database,
    registry: Arc<ProcessRegistry>,
}

impl MuxController {
    pub fn new(config: &RemoteConfig, db: Database, registry: Arc<ProcessRegistry>) -> Self {
        Self {
            tmux_bin: config.tmux_bin.clone(),
            claude_bin: config.claude_bin.clone(),
            prefix: config.mux_prefix.clone(),
            db,
            registry,
        }
    }

    /// Mux session name for a session id: prefix plus the id's first eight
    /// characters.
    pub fn mux_name_for(&self, session_id: &str) -> String {
        format!("{}{}", self.prefix, short_id(session_id))
    }

    /// The command a new mux session runs to resume an assistant session.
    pub fn resume_command(&self, session_id: &str) -> String {
        format!("{} --resume {}", self.claude_bin, session_id)
    }

    async fn tmux(&self, args: &[&str]) -> Result<String, MuxError> {
        let output = tokio::time::timeout(
            COMMAND_TIMEOUT,
            Command::new(&self.tmux_bin)
                .args(args)
                .stdin(Stdio::null())
                .output(),
        )
        .await
        .map_err(|_| MuxError::Timeout(COMMAND_TIMEOUT))??;

        if !output.status.success() {
            return Err(MuxError::CommandFailed {
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn has_session(&self, name: &str) -> bool {
        self.tmux(&["has-session", "-t", name]).await.is_ok()
    }

    /// Create a detached mux session running `command` in `working_dir`.
    pub async fn create(
        &self,
        name: &str,
        working_dir: &str,
        command: &str,
        rows: u16,
        cols: u16,
    ) -> Result<(), MuxError> {
        self.tmux(&[
            "new-session",
            "-d",
            "-s",
            name,
            "-c",
            working_dir,
            "-x",
            &cols.to_string(),
            "-y",
            &rows.to_string(),
            command,
        ])
        .await?;
        info!(name, working_dir, "created mux session");
        Ok(())
    }

    /// Names of extant mux sessions. A failing listing (typically "no
    /// server running") reads as an empty list.
    pub async fn list(&self) -> Result<Vec<String>, MuxError> {
        match self
            .tmux(&["list-sessions", "-F", "#{session_name}"])
            .await
        {
            Ok(stdout) => Ok(stdout.lines().map(str::to_string).collect()),
            Err(MuxError::CommandFailed { stderr }) => {
                debug!(stderr, "tmux listing failed; treating as empty");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Attach-or-create for a session id; see [`JoinOutcome`].
    pub async fn join(&self, session_id: &str) -> Result<JoinOutcome, MuxError> {
        let mux_name = self.mux_name_for(session_id);

        let snapshot = self.registry.snapshot().await;
        if let Some(info) = snapshot.sessions.get(session_id) {
            if info.in_mux {
                return Ok(JoinOutcome::Attached { mux_name });
            }
            return Ok(JoinOutcome::RunningNoTmux {
                message: format!(
                    "session {session_id} is already running outside a mux session (pid {}); \
                     attach from its own terminal instead",
                    info.pid
                ),
            });
        }

        // The registry can miss a quiescent mux-hosted process; trust the
        // mux server's own listing before creating anything.
        if self.list().await?.contains(&mux_name) {
            return Ok(JoinOutcome::Attached { mux_name });
        }

        let Some(row) = self
            .db
            .session(session_id)
            .await
            .map_err(|e| MuxError::Store(e.to_string()))?
        else {
            return Err(MuxError::NotFound(session_id.to_string()));
        };
        let working_dir = row
            .working_dir
            .or_else(|| dirs::home_dir().map(|h| h.to_string_lossy().to_string()))
            .unwrap_or_else(|| "/".to_string());

        self.create(
            &mux_name,
            &working_dir,
            &self.resume_command(session_id),
            24,
            80,
        )
        .await?;
        Ok(JoinOutcome::Created { mux_name })
    }

    /// Append text to a mux session's input without attaching. The caller
    /// owns any trailing newline.
    pub async fn inject(&self, name: &str, text: &str) -> Result<(), MuxError> {
        if !self.has_session(name).await {
            return Err(MuxError::NotFound(name.to_string()));
        }
        self.tmux(&["send-keys", "-t", name, "-l", text]).await?;
        Ok(())
    }

    /// Graceful termination: SIGTERM the pane's process-group leader, wait
    /// up to five seconds, then kill the mux session outright.
    pub async fn terminate(&self, name: &str) -> Result<(), MuxError> {
        if !self.has_session(name).await {
            return Err(MuxError::NotFound(name.to_string()));
        }

        match self
            .tmux(&["list-panes", "-t", name, "-F", "#{pane_pid}"])
            .await
        {
            Ok(stdout) => {
                if let Some(pid) = stdout.lines().next().and_then(|l| l.trim().parse::<i32>().ok())
                {
                    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
                    if rc != 0 {
                        debug!(pid, "SIGTERM failed; falling through to kill-session");
                    }
                }
            }
            Err(e) => debug!(error = %e, "could not resolve pane pid"),
        }

        let deadline = tokio::time::Instant::now() + KILL_GRACE;
        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(500)).await;
            if !self.has_session(name).await {
                info!(name, "mux session exited after SIGTERM");
                return Ok(());
            }
        }

        warn!(name, "mux session survived the grace window; killing");
        self.tmux(&["kill-session", "-t", name]).await?;
        Ok(())
    }

    /// Open a bidirectional byte pipe onto a mux session by running
    /// `tmux attach-session` under a fresh PTY.
    pub async fn attach(&self, name: &str, rows: u16, cols: u16) -> Result<MuxPipe, MuxError> {
        if !self.has_session(name).await {
            return Err(MuxError::NotFound(name.to_string()));
        }

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| MuxError::Pty(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&self.tmux_bin);
        cmd.args(["attach-session", "-t", name]);
        cmd.env("TERM", "xterm-256color");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| MuxError::Pty(e.to_string()))?;
        drop(pair.slave);

        // Reader: blocking PTY reads, forwarded as owned chunks. The channel
        // bounds memory; a full channel back-pressures into the PTY buffer.
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| MuxError::Pty(e.to_string()))?;
        let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(256);
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if out_tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        // Writer: serialized through a channel so callers never block on
        // the PTY directly.
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| MuxError::Pty(e.to_string()))?;
        let writer = Arc::new(StdMutex::new(writer));
        let (in_tx, mut in_rx) = mpsc::channel::<Vec<u8>>(128);
        tokio::spawn(async move {
            while let Some(bytes) = in_rx.recv().await {
                let writer = writer.clone();
                let result = tokio::task::spawn_blocking(move || {
                    use std::io::Write;
                    let mut guard = writer.lock().expect("pty writer lock");
                    guard.write_all(&bytes).and_then(|_| guard.flush())
                })
                .await;
                if !matches!(result, Ok(Ok(()))) {
                    break;
                }
            }
        });

        Ok(MuxPipe {
            output: out_rx,
            handle: MuxHandle {
                input: in_tx,
                master: StdMutex::new(pair.master),
                child,
            },
        })
    }
}

/// A live PTY bridge to a mux session.
///
/// Reads and writes move raw bytes; `resize` is the out-of-band control.
/// Dropping the pipe kills only the local attach process.
pub struct MuxPipe {
    output: mpsc::Receiver<Vec<u8>>,
    handle: MuxHandle,
}

impl MuxPipe {
    /// Next chunk of terminal output; `None` when the attach process ended.
    pub async fn read(&mut self) -> Option<Vec<u8>> {
        self.output.recv().await
    }

    /// Queue bytes for the mux session's input. Returns false when the
    /// pipe has shut down.
    pub async fn write(&self, bytes: Vec<u8>) -> bool {
        self.handle.write(bytes).await
    }

    /// Resize the attached terminal without disturbing the byte stream.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), MuxError> {
        self.handle.resize(rows, cols)
    }

    /// Split into the output receiver and a write/resize handle, so a
    /// select loop can poll reads while another branch writes.
    pub fn split(self) -> (mpsc::Receiver<Vec<u8>>, MuxHandle) {
        (self.output, self.handle)
    }
}

/// Write/resize half of an attach pipe; owns the local attach process.
pub struct MuxHandle {
    input: mpsc::Sender<Vec<u8>>,
    master: StdMutex<Box<dyn MasterPty + Send>>,
    child: Box<dyn Child + Send + Sync>,
}

impl MuxHandle {
    pub async fn write(&self, bytes: Vec<u8>) -> bool {
        self.input.send(bytes).await.is_ok()
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), MuxError> {
        self.master
            .lock()
            .expect("pty master lock")
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| MuxError::Pty(e.to_string()))
    }
}

impl Drop for MuxHandle {
    fn drop(&mut self) {
        // Detach the local attach process; the mux session lives on.
        let _ = self.child.kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use claude_remote_core::types::SessionMeta;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    /// Install a shell script standing in for tmux, so command plumbing is
    /// exercised without a real mux server.
    fn fake_tmux(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("tmux");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    async fn controller_with(
        dir: &Path,
        script: &str,
        db: Database,
    ) -> MuxController {
        let mut config =
            RemoteConfig::for_tests(dir.to_path_buf(), PathBuf::new());
        config.tmux_bin = fake_tmux(dir, script).to_string_lossy().to_string();
        let registry = Arc::new(ProcessRegistry::new(&config));
        MuxController::new(&config, db, registry)
    }

    fn now() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 6, 7, 0, 0).unwrap()
    }

    #[test]
    fn mux_names_use_short_ids() {
        let config = RemoteConfig::for_tests(PathBuf::new(), PathBuf::new());
        // Cheap construction without async deps just for naming.
        assert_eq!(
            format!("{}{}", config.mux_prefix, short_id("0a1b2c3d-4e5f")),
            "claude-remote-0a1b2c3d"
        );
    }

    #[tokio::test]
    async fn list_parses_session_names() {
        let tmp = tempfile::tempdir().unwrap();
        let db = Database::open_in_memory().await.unwrap();
        let ctl = controller_with(
            tmp.path(),
            r#"case "$1" in
list-sessions) printf 'claude-remote-abc12345\nscratch\n';;
*) exit 0;;
esac"#,
            db,
        )
        .await;

        let names = ctl.list().await.unwrap();
        assert_eq!(names, vec!["claude-remote-abc12345", "scratch"]);
    }

    #[tokio::test]
    async fn list_is_empty_without_server() {
        let tmp = tempfile::tempdir().unwrap();
        let db = Database::open_in_memory().await.unwrap();
        let ctl = controller_with(
            tmp.path(),
            r#"echo 'no server running on /tmp/tmux-0/default' >&2; exit 1"#,
            db,
        )
        .await;

        assert!(ctl.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn inject_unknown_name_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let db = Database::open_in_memory().await.unwrap();
        let ctl = controller_with(
            tmp.path(),
            r#"case "$1" in
has-session) exit 1;;
*) exit 0;;
esac"#,
            db,
        )
        .await;

        let err = ctl.inject("claude-remote-missing", "hi\n").await.unwrap_err();
        assert!(matches!(err, MuxError::NotFound(_)));
    }

    #[tokio::test]
    async fn inject_sends_literal_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("calls.log");
        let db = Database::open_in_memory().await.unwrap();
        let ctl = controller_with(
            tmp.path(),
            &format!(
                r#"case "$1" in
has-session) exit 0;;
send-keys) echo "$@" >> {};;
*) exit 0;;
esac"#,
                log.display()
            ),
            db,
        )
        .await;

        ctl.inject("claude-remote-abc12345", "continue\n").await.unwrap();
        let calls = std::fs::read_to_string(&log).unwrap();
        assert!(calls.contains("-t claude-remote-abc12345 -l continue"));
    }

    #[tokio::test]
    async fn create_passes_geometry_and_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("calls.log");
        let db = Database::open_in_memory().await.unwrap();
        let ctl = controller_with(
            tmp.path(),
            &format!(r#"echo "$@" >> {}; exit 0"#, log.display()),
            db,
        )
        .await;

        ctl.create("claude-remote-abc12345", "/work/demo", "claude --resume x", 24, 80)
            .await
            .unwrap();
        let calls = std::fs::read_to_string(&log).unwrap();
        assert!(calls.contains("new-session -d -s claude-remote-abc12345 -c /work/demo -x 80 -y 24"));
    }

    #[tokio::test]
    async fn command_failure_surfaces_stderr() {
        let tmp = tempfile::tempdir().unwrap();
        let db = Database::open_in_memory().await.unwrap();
        let ctl = controller_with(
            tmp.path(),
            r#"echo 'duplicate session: x' >&2; exit 1"#,
            db,
        )
        .await;

        let err = ctl.create("x", "/", "cmd", 24, 80).await.unwrap_err();
        match err {
            MuxError::CommandFailed { stderr } => {
                assert_eq!(stderr, "duplicate session: x");
            }
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }

    // Join on a stopped-but-indexed session creates a mux session; a
    // second join attaches to the same one.
    #[tokio::test]
    async fn join_creates_then_attaches() {
        let tmp = tempfile::tempdir().unwrap();
        let state = tmp.path().join("created");
        let db = Database::open_in_memory().await.unwrap();
        db.upsert_session(
            "0a1b2c3d-4e5f-6071-8293-a4b5c6d7e8f9",
            &SessionMeta {
                working_dir: Some("/work/demo".into()),
                ..Default::default()
            },
            now(),
        )
        .await
        .unwrap();

        // The fake remembers creation: list-sessions reports the session
        // once new-session has run.
        let ctl = controller_with(
            tmp.path(),
            &format!(
                r#"case "$1" in
new-session) touch {state}; exit 0;;
list-sessions) if [ -f {state} ]; then echo claude-remote-0a1b2c3d; fi;;
has-session) [ -f {state} ] || exit 1;;
*) exit 0;;
esac"#,
                state = state.display()
            ),
            db,
        )
        .await;

        let first = ctl.join("0a1b2c3d-4e5f-6071-8293-a4b5c6d7e8f9").await.unwrap();
        assert_eq!(
            first,
            JoinOutcome::Created {
                mux_name: "claude-remote-0a1b2c3d".into()
            }
        );

        let second = ctl.join("0a1b2c3d-4e5f-6071-8293-a4b5c6d7e8f9").await.unwrap();
        assert_eq!(
            second,
            JoinOutcome::Attached {
                mux_name: "claude-remote-0a1b2c3d".into()
            }
        );
    }

    #[tokio::test]
    async fn join_unknown_session_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let db = Database::open_in_memory().await.unwrap();
        let ctl = controller_with(
            tmp.path(),
            r#"case "$1" in
list-sessions) exit 1;;
has-session) exit 1;;
*) exit 0;;
esac"#,
            db,
        )
        .await;

        let err = ctl.join("ffffffff-0000-0000-0000-000000000000").await.unwrap_err();
        assert!(matches!(err, MuxError::NotFound(_)));
    }

    #[tokio::test]
    async fn terminate_returns_once_session_dies() {
        let tmp = tempfile::tempdir().unwrap();
        let dead = tmp.path().join("dead");
        let db = Database::open_in_memory().await.unwrap();
        // list-panes marks the session dead, emulating SIGTERM landing.
        let ctl = controller_with(
            tmp.path(),
            &format!(
                r#"case "$1" in
has-session) [ -f {dead} ] && exit 1 || exit 0;;
list-panes) touch {dead}; echo 99999999;;
*) exit 0;;
esac"#,
                dead = dead.display()
            ),
            db,
        )
        .await;

        ctl.terminate("claude-remote-abc12345").await.unwrap();
    }

    #[tokio::test]
    async fn terminate_unknown_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let db = Database::open_in_memory().await.unwrap();
        let ctl = controller_with(tmp.path(), r#"exit 1"#, db).await;
        assert!(matches!(
            ctl.terminate("claude-remote-nope").await.unwrap_err(),
            MuxError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn attach_bridges_bytes_and_resizes() {
        let tmp = tempfile::tempdir().unwrap();
        let db = Database::open_in_memory().await.unwrap();
        // attach-session becomes `cat`: whatever we write comes back.
        let ctl = controller_with(
            tmp.path(),
            r#"case "$1" in
has-session) exit 0;;
attach-session) exec cat;;
*) exit 0;;
esac"#,
            db,
        )
        .await;

        let mut pipe = ctl.attach("claude-remote-abc12345", 24, 80).await.unwrap();
        assert!(pipe.write(b"hello mux\r".to_vec()).await);

        let chunk = tokio::time::timeout(Duration::from_secs(5), pipe.read())
            .await
            .expect("pty should echo within the timeout")
            .expect("pipe open");
        assert!(
            String::from_utf8_lossy(&chunk).contains("hello mux"),
            "echoed bytes should round-trip"
        );

        pipe.resize(50, 132).unwrap();
    }
}
