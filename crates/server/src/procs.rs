// crates/server/src/procs.rs
//! Discovery of live assistant processes and their session ids.
//!
//! A session id is taken from `--resume <uuid>` / `--session-id <uuid>` on
//! the command line; processes launched with `--continue` or bare carry no
//! id, so their working directory is mapped to the most recently modified
//! session log under the matching project directory. Results are cached for
//! two seconds to bound the system-call rate. The registry is read-only;
//! it never signals anything.

use claude_remote_core::paths::{encode_working_dir, most_recent_session_in};
use claude_remote_core::RemoteConfig;
use regex_lite::Regex;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::{ProcessesToUpdate, System};
use tokio::process::Command;
use tracing::debug;

/// Cache lifetime for one snapshot.
const CACHE_TTL: Duration = Duration::from_secs(2);

/// How long the tmux listing may take before we give up on it.
const TMUX_TIMEOUT: Duration = Duration::from_secs(5);

/// One live assistant process mapped to a session.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: u32,
    pub working_dir: PathBuf,
    /// True when a mux session named `<prefix><short id>` exists.
    pub in_mux: bool,
}

/// Point-in-time view of running sessions.
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    pub sessions: HashMap<String, ProcessInfo>,
}

impl RegistrySnapshot {
    pub fn is_running(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn running_ids(&self) -> HashSet<String> {
        self.sessions.keys().cloned().collect()
    }
}

pub struct ProcessRegistry {
    projects_root: PathBuf,
    claude_bin: String,
    tmux_bin: String,
    mux_prefix: String,
    cache: tokio::sync::Mutex<Option<(Instant, Arc<RegistrySnapshot>)>>,
}

impl ProcessRegistry {
    pub fn new(config: &RemoteConfig) -> Self {
        Self {
            projects_root: config.projects_root.clone(),
            claude_bin: config.claude_bin.clone(),
            tmux_bin: config.tmux_bin.clone(),
            mux_prefix: config.mux_prefix.clone(),
            cache: tokio::sync::Mutex::new(None),
        }
    }

    /// Current snapshot, refreshed at most every two seconds.
    pub async fn snapshot(&self) -> Arc<RegistrySnapshot> {
        let mut cache = self.cache.lock().await;
        if let Some((taken_at, snapshot)) = cache.as_ref() {
            if taken_at.elapsed() < CACHE_TTL {
                return snapshot.clone();
            }
        }
        let snapshot = Arc::new(self.refresh().await);
        *cache = Some((Instant::now(), snapshot.clone()));
        snapshot
    }

    async fn refresh(&self) -> RegistrySnapshot {
        let mux_short_ids = self.mux_short_ids().await;

        let bin = self.claude_bin.clone();
        let raw = tokio::task::spawn_blocking(move || scan_processes(&bin))
            .await
            .unwrap_or_default();

        let mut sessions = HashMap::new();
        for proc in raw {
            let session_id = match extract_session_id(&proc.args) {
                Some(id) => id,
                None => {
                    let Some(cwd) = &proc.cwd else { continue };
                    match self.session_for_cwd(cwd) {
                        Some(id) => id,
                        None => continue,
                    }
                }
            };
            let in_mux = mux_short_ids.contains(short_id(&session_id));
            let cwd = proc.cwd.unwrap_or_default();
            sessions
                .entry(session_id)
                .and_modify(|existing: &mut ProcessInfo| {
                    // Prefer the process that is inside a mux, else newest pid.
                    if in_mux && !existing.in_mux {
                        *existing = ProcessInfo {
                            pid: proc.pid,
                            working_dir: cwd.clone(),
                            in_mux,
                        };
                    }
                })
                .or_insert(ProcessInfo {
                    pid: proc.pid,
                    working_dir: cwd,
                    in_mux,
                });
        }

        RegistrySnapshot { sessions }
    }

    /// Map a working directory to its most recently active session log.
    fn session_for_cwd(&self, cwd: &PathBuf) -> Option<String> {
        let encoded = encode_working_dir(&cwd.to_string_lossy());
        let project_dir = self.projects_root.join(encoded);
        most_recent_session_in(&project_dir).map(|(id, _)| id)
    }

    /// Short ids of mux sessions carrying our name prefix. An absent or
    /// failing tmux server reads as "no mux sessions".
    async fn mux_short_ids(&self) -> HashSet<String> {
        let output = tokio::time::timeout(
            TMUX_TIMEOUT,
            Command::new(&self.tmux_bin)
                .args(["list-sessions", "-F", "#{session_name}"])
                .stdin(Stdio::null())
                .output(),
        )
        .await;

        let output = match output {
            Ok(Ok(output)) if output.status.success() => output,
            _ => return HashSet::new(),
        };

        String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|name| name.strip_prefix(&self.mux_prefix))
            .map(str::to_string)
            .collect()
    }
}

struct RawProcess {
    pid: u32,
    args: Vec<String>,
    cwd: Option<PathBuf>,
}

/// Synchronous process-table scan; call from `spawn_blocking`.
fn scan_processes(claude_bin: &str) -> Vec<RawProcess> {
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);

    let own_pid = std::process::id();
    let bin_name = claude_bin.rsplit('/').next().unwrap_or(claude_bin);

    let mut out = Vec::new();
    for (pid, process) in sys.processes() {
        let pid = pid.as_u32();
        if pid == own_pid {
            continue;
        }

        let name = process.name().to_string_lossy().to_string();
        let args: Vec<String> = process
            .cmd()
            .iter()
            .map(|a| a.to_string_lossy().to_string())
            .collect();

        // Native installs name the process after the binary; Node installs
        // run as `node .../@anthropic-ai/claude-code/cli.js`.
        let is_assistant = name.contains(bin_name)
            || args.iter().any(|a| a.contains("@anthropic-ai/claude"));
        if !is_assistant {
            continue;
        }
        // Our own tooling and browser helpers are not sessions.
        if args
            .iter()
            .any(|a| a.contains("--chrome-native-host") || a.contains("claude-remote"))
        {
            continue;
        }

        // sysinfo reads cwd on Linux but not on macOS; lsof fills the gap.
        let cwd = process
            .cwd()
            .map(|p| p.to_path_buf())
            .or_else(|| cwd_via_lsof(pid));

        out.push(RawProcess { pid, args, cwd });
    }
    debug!(count = out.len(), "assistant process scan");
    out
}

/// `lsof -a -p <pid> -d cwd -Fn` reliably reports same-user cwds where
/// sysinfo cannot.
fn cwd_via_lsof(pid: u32) -> Option<PathBuf> {
    let output = std::process::Command::new("lsof")
        .args(["-a", "-p", &pid.to_string(), "-d", "cwd", "-Fn"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    for line in stdout.lines() {
        if let Some(path) = line.strip_prefix('n') {
            if path.starts_with('/') {
                return Some(PathBuf::from(path));
            }
        }
    }
    None
}

/// Extract a session id from `--resume <uuid>`, `--session-id <uuid>`, or
/// their `=`-joined forms. `--continue` and bare invocations yield None and
/// fall back to cwd mapping.
pub fn extract_session_id(args: &[String]) -> Option<String> {
    let uuid = Regex::new(r"^[a-f0-9-]{36}$").unwrap();
    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next() {
        for flag in ["--resume", "--session-id"] {
            if arg.as_str() == flag {
                if let Some(next) = iter.peek() {
                    if uuid.is_match(next) {
                        return Some((*next).clone());
                    }
                }
            } else if let Some(value) = arg.strip_prefix(&format!("{flag}=")) {
                if uuid.is_match(value) {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}

/// First eight characters of a session id, used in mux session names.
pub fn short_id(session_id: &str) -> &str {
    &session_id[..session_id.len().min(8)]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    const SID: &str = "0a1b2c3d-4e5f-6071-8293-a4b5c6d7e8f9";

    #[test]
    fn extracts_resume_id() {
        assert_eq!(
            extract_session_id(&args(&["claude", "--resume", SID])),
            Some(SID.to_string())
        );
        assert_eq!(
            extract_session_id(&args(&["claude", &format!("--resume={SID}")])),
            Some(SID.to_string())
        );
    }

    #[test]
    fn extracts_session_id_flag() {
        assert_eq!(
            extract_session_id(&args(&["claude", "--session-id", SID])),
            Some(SID.to_string())
        );
    }

    #[test]
    fn continue_and_bare_yield_none() {
        assert_eq!(extract_session_id(&args(&["claude", "--continue"])), None);
        assert_eq!(extract_session_id(&args(&["claude"])), None);
        assert_eq!(
            extract_session_id(&args(&["claude", "--resume", "not-a-uuid"])),
            None
        );
    }

    #[test]
    fn short_id_truncates_safely() {
        assert_eq!(short_id(SID), "0a1b2c3d");
        assert_eq!(short_id("abc"), "abc");
    }

    #[tokio::test]
    async fn session_for_cwd_maps_to_newest_log() {
        let tmp = tempfile::tempdir().unwrap();
        let project = tmp.path().join("-work-demo");
        std::fs::create_dir(&project).unwrap();
        std::fs::write(project.join("sess-1.jsonl"), "{}\n").unwrap();

        let config = RemoteConfig::for_tests(tmp.path().to_path_buf(), PathBuf::new());
        let registry = ProcessRegistry::new(&config);
        assert_eq!(
            registry.session_for_cwd(&PathBuf::from("/work/demo")),
            Some("sess-1".to_string())
        );
        assert_eq!(registry.session_for_cwd(&PathBuf::from("/not/indexed")), None);
    }

    #[tokio::test]
    async fn snapshot_is_cached() {
        let tmp = tempfile::tempdir().unwrap();
        let config = RemoteConfig::for_tests(tmp.path().to_path_buf(), PathBuf::new());
        let registry = ProcessRegistry::new(&config);

        let first = registry.snapshot().await;
        let second = registry.snapshot().await;
        assert!(
            Arc::ptr_eq(&first, &second),
            "snapshots inside the TTL share the cached value"
        );
    }
}
