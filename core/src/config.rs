//! Runtime configuration. Resolved once at startup from a JSON file layered
//! under CLI overrides, then handed to the registry and maintenance loop by
//! value — nothing reads it back out of global state during steady-state
//! operation.

use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Config {
    /// Where per-session `.state` files live.
    pub state_dir: PathBuf,
    /// Bytes retained per session scrollback ring.
    pub buffer_capacity: usize,
    /// Dirty-flush period and "needs saving" age threshold, in seconds.
    pub save_interval_secs: u64,
    /// Minimum spacing between eviction sweeps, in seconds.
    pub cleanup_interval_secs: u64,
    /// Inactive sessions older than this are eviction candidates, in seconds.
    pub max_inactive_age_secs: u64,
    /// Soft cap on live session count; exceeding it drives further eviction.
    pub soft_session_cap: usize,
    /// Maximum OUTPUT payload size during buffer replay.
    pub replay_chunk_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/tmp/cmdr-sessions"),
            buffer_capacity: 1024 * 1024,
            save_interval_secs: 30,
            cleanup_interval_secs: 3_600,
            max_inactive_age_secs: 604_800,
            soft_session_cap: 100,
            replay_chunk_size: 8_192,
        }
    }
}

/// Overrides read from a JSON config file. Every field optional; absent
/// keys fall through to the built-in default, then to a CLI override.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct FileOverrides {
    state_dir: Option<PathBuf>,
    buffer_capacity: Option<usize>,
    save_interval_secs: Option<u64>,
    cleanup_interval_secs: Option<u64>,
    max_inactive_age_secs: Option<u64>,
    soft_session_cap: Option<usize>,
    replay_chunk_size: Option<usize>,
}

/// CLI-sourced overrides, applied last (CLI wins over file wins over
/// built-in default). `None` means "not passed on the command line".
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub state_dir: Option<PathBuf>,
    pub buffer_capacity: Option<usize>,
    pub save_interval_secs: Option<u64>,
    pub cleanup_interval_secs: Option<u64>,
    pub max_inactive_age_secs: Option<u64>,
    pub soft_session_cap: Option<usize>,
    pub replay_chunk_size: Option<usize>,
}

/// Resolve a `Config` from an optional JSON file and CLI overrides. A
/// missing or unreadable config file is not an error: it just leaves the
/// built-in defaults in place for its keys.
pub fn resolve(config_path: Option<&Path>, cli: &CliOverrides) -> Config {
    let file = config_path
        .and_then(|p| std::fs::read_to_string(p).ok())
        .and_then(|data| serde_json::from_str::<FileOverrides>(&data).ok())
        .unwrap_or_default();

    let defaults = Config::default();
    Config {
        state_dir: cli
            .state_dir
            .clone()
            .or(file.state_dir)
            .unwrap_or(defaults.state_dir),
        buffer_capacity: cli
            .buffer_capacity
            .or(file.buffer_capacity)
            .unwrap_or(defaults.buffer_capacity),
        save_interval_secs: cli
            .save_interval_secs
            .or(file.save_interval_secs)
            .unwrap_or(defaults.save_interval_secs),
        cleanup_interval_secs: cli
            .cleanup_interval_secs
            .or(file.cleanup_interval_secs)
            .unwrap_or(defaults.cleanup_interval_secs),
        max_inactive_age_secs: cli
            .max_inactive_age_secs
            .or(file.max_inactive_age_secs)
            .unwrap_or(defaults.max_inactive_age_secs),
        soft_session_cap: cli
            .soft_session_cap
            .or(file.soft_session_cap)
            .unwrap_or(defaults.soft_session_cap),
        replay_chunk_size: cli
            .replay_chunk_size
            .or(file.replay_chunk_size)
            .unwrap_or(defaults.replay_chunk_size),
    }
}
