// crates/core/src/paths.rs
//! Project-directory name encoding and session-file lookups.
//!
//! The assistant tool stores one directory per project under the log root,
//! named by replacing every `/` in the working directory with `-`
//! (`/Users/foo/app` → `-Users-foo-app`). The reverse mapping is lossy for
//! directory names containing dashes; the indexer prefers the `cwd` field
//! from log entries when available and uses this only as a fallback.

use std::path::{Path, PathBuf};

/// Encode a working directory into its log-root directory name.
pub fn encode_working_dir(working_dir: &str) -> String {
    format!("-{}", working_dir.trim_start_matches('/').replace('/', "-"))
}

/// Decode a log-root directory name back into a working directory path.
pub fn decode_project_dir(project_dir_name: &str) -> String {
    format!(
        "/{}",
        project_dir_name.trim_start_matches('-').replace('-', "/")
    )
}

/// Last path component of a working directory, used as the project label.
pub fn project_name(working_dir: &str) -> String {
    Path::new(working_dir)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// The most recently modified `.jsonl` session file in a project directory,
/// returned as (session id, path). Used to map a running process with no
/// explicit session id to its likely session.
pub fn most_recent_session_in(project_dir: &Path) -> Option<(String, PathBuf)> {
    let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;

    for entry in std::fs::read_dir(project_dir).ok()?.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
            continue;
        }
        let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
            continue;
        };
        match &newest {
            Some((best, _)) if *best >= modified => {}
            _ => newest = Some((modified, path)),
        }
    }

    let (_, path) = newest?;
    let stem = path.file_stem()?.to_string_lossy().to_string();
    Some((stem, path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn encode_decode_round_trip() {
        let dir = encode_working_dir("/Users/cmericli/workspace");
        assert_eq!(dir, "-Users-cmericli-workspace");
        assert_eq!(decode_project_dir(&dir), "/Users/cmericli/workspace");
    }

    #[test]
    fn project_name_is_last_component() {
        assert_eq!(project_name("/Users/foo/my-app"), "my-app");
        assert_eq!(project_name(""), "unknown");
    }

    #[test]
    fn most_recent_session_picks_newest() {
        let tmp = tempfile::tempdir().unwrap();
        let older = tmp.path().join("sess-old.jsonl");
        let newer = tmp.path().join("sess-new.jsonl");
        fs::write(&older, "{}\n").unwrap();
        fs::write(&newer, "{}\n").unwrap();

        // Nudge mtimes apart without sleeping.
        let past = std::time::SystemTime::now() - std::time::Duration::from_secs(600);
        let f = fs::File::open(&older).unwrap();
        f.set_modified(past).unwrap();

        let (id, path) = most_recent_session_in(tmp.path()).unwrap();
        assert_eq!(id, "sess-new");
        assert_eq!(path, newer);
    }

    #[test]
    fn most_recent_session_ignores_non_jsonl() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("notes.txt"), "x").unwrap();
        assert!(most_recent_session_in(tmp.path()).is_none());
    }
}
