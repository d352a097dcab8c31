// crates/core/src/config.rs
//! Runtime configuration, read once at startup.
//!
//! Every knob has a documented default and an environment override. There is
//! no reload path: the process is restarted to pick up changes.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Default HTTP port.
const DEFAULT_PORT: u16 = 7860;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Invalid value for {var}: {value}")]
    Invalid { var: String, value: String },
}

/// All runtime configuration for the server process.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Root directory containing per-project session log directories.
    pub projects_root: PathBuf,
    /// SQLite index file path.
    pub db_path: PathBuf,
    /// HTTP listen address.
    pub listen: SocketAddr,
    /// File-stat polling cadence.
    pub poll_interval: Duration,
    /// Full root re-enumeration cadence.
    pub reconcile_interval: Duration,
    /// Assistant silence before a session counts as awaiting input.
    pub idle_threshold: Duration,
    /// Minimum gap between needs-input signals for one session.
    pub idle_cooldown: Duration,
    /// Global push-delivery cap per rolling hour.
    pub notify_hourly_cap: usize,
    /// Terminal multiplexer binary.
    pub tmux_bin: String,
    /// Assistant binary used when resuming sessions into a mux.
    pub claude_bin: String,
    /// Name prefix for mux sessions this server owns.
    pub mux_prefix: String,
}

impl RemoteConfig {
    /// Build a config from environment variables, falling back to defaults.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `CLAUDE_REMOTE_ROOT` | `~/.claude/projects` |
    /// | `CLAUDE_REMOTE_DB` | `~/.claude-remote/index.db` |
    /// | `CLAUDE_REMOTE_BIND` | `0.0.0.0` |
    /// | `CLAUDE_REMOTE_PORT` / `PORT` | `7860` |
    /// | `CLAUDE_REMOTE_POLL_SECS` | `2` |
    /// | `CLAUDE_REMOTE_RECONCILE_SECS` | `60` |
    /// | `CLAUDE_REMOTE_IDLE_SECS` | `30` |
    /// | `CLAUDE_REMOTE_IDLE_COOLDOWN_SECS` | `300` |
    /// | `CLAUDE_REMOTE_NOTIFY_HOURLY_CAP` | `10` |
    /// | `CLAUDE_REMOTE_TMUX_BIN` | `tmux` |
    /// | `CLAUDE_REMOTE_CLAUDE_BIN` | `claude` |
    /// | `CLAUDE_REMOTE_MUX_PREFIX` | `claude-remote-` |
    pub fn from_env() -> Result<Self, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::HomeDirNotFound)?;

        let projects_root = std::env::var("CLAUDE_REMOTE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join(".claude").join("projects"));

        let db_path = std::env::var("CLAUDE_REMOTE_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join(".claude-remote").join("index.db"));

        let bind: IpAddr = match std::env::var("CLAUDE_REMOTE_BIND") {
            Ok(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                var: "CLAUDE_REMOTE_BIND".into(),
                value: raw,
            })?,
            Err(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };

        let port = env_parse("CLAUDE_REMOTE_PORT")?
            .or(env_parse("PORT")?)
            .unwrap_or(DEFAULT_PORT);

        Ok(Self {
            projects_root,
            db_path,
            listen: SocketAddr::new(bind, port),
            poll_interval: Duration::from_secs(
                env_parse("CLAUDE_REMOTE_POLL_SECS")?.unwrap_or(2),
            ),
            reconcile_interval: Duration::from_secs(
                env_parse("CLAUDE_REMOTE_RECONCILE_SECS")?.unwrap_or(60),
            ),
            idle_threshold: Duration::from_secs(
                env_parse("CLAUDE_REMOTE_IDLE_SECS")?.unwrap_or(30),
            ),
            idle_cooldown: Duration::from_secs(
                env_parse("CLAUDE_REMOTE_IDLE_COOLDOWN_SECS")?.unwrap_or(300),
            ),
            notify_hourly_cap: env_parse("CLAUDE_REMOTE_NOTIFY_HOURLY_CAP")?.unwrap_or(10),
            tmux_bin: std::env::var("CLAUDE_REMOTE_TMUX_BIN").unwrap_or_else(|_| "tmux".into()),
            claude_bin: std::env::var("CLAUDE_REMOTE_CLAUDE_BIN")
                .unwrap_or_else(|_| "claude".into()),
            mux_prefix: std::env::var("CLAUDE_REMOTE_MUX_PREFIX")
                .unwrap_or_else(|_| "claude-remote-".into()),
        })
    }

    /// A config suitable for tests: everything under a scratch directory,
    /// aggressive timings.
    pub fn for_tests(root: PathBuf, db_path: PathBuf) -> Self {
        Self {
            projects_root: root,
            db_path,
            listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            poll_interval: Duration::from_millis(50),
            reconcile_interval: Duration::from_millis(500),
            idle_threshold: Duration::from_secs(30),
            idle_cooldown: Duration::from_secs(300),
            notify_hourly_cap: 10,
            tmux_bin: "tmux".into(),
            claude_bin: "claude".into(),
            mux_prefix: "claude-remote-".into(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid {
                var: var.into(),
                value: raw,
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_env() {
        // Env-var mutation is process-global; only assert on knobs that have
        // no override set in any test environment.
        let cfg = RemoteConfig::from_env().expect("config from env");
        assert_eq!(cfg.poll_interval, Duration::from_secs(2));
        assert_eq!(cfg.reconcile_interval, Duration::from_secs(60));
        assert_eq!(cfg.idle_threshold, Duration::from_secs(30));
        assert_eq!(cfg.idle_cooldown, Duration::from_secs(300));
        assert_eq!(cfg.notify_hourly_cap, 10);
        assert_eq!(cfg.mux_prefix, "claude-remote-");
    }

    #[test]
    fn test_config_uses_given_paths() {
        let cfg = RemoteConfig::for_tests(PathBuf::from("/tmp/root"), PathBuf::from("/tmp/db"));
        assert_eq!(cfg.projects_root, PathBuf::from("/tmp/root"));
        assert_eq!(cfg.db_path, PathBuf::from("/tmp/db"));
    }
}
