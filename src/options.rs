// src/options.rs

//! Watcher configuration.
//!
//! All recognized options live in a single [`WatchOptions`] struct so that
//! embedders can build it in code or deserialize it from their own config
//! format. Unknown fields are rejected at construction via
//! `deny_unknown_fields`.
//!
//! Two settings can be overridden from the environment:
//! 1. `WATCHTREE_USEPOLLING` forces (or disables) the polling backend
//! 2. `WATCHTREE_INTERVAL` overrides the polling interval in milliseconds

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::Deserialize;

/// Environment variable forcing the polling backend on or off.
pub const ENV_USE_POLLING: &str = "WATCHTREE_USEPOLLING";

/// Environment variable overriding the polling interval (milliseconds).
pub const ENV_INTERVAL: &str = "WATCHTREE_INTERVAL";

/// Options accepted by [`crate::watch`].
///
/// Defaults match the behaviour most embedders want: recursive watching with
/// initial `add` events, symlink traversal, atomic-save collapsing, and the
/// native event backend where available.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct WatchOptions {
    /// Keep the watcher alive until `close()` is called.
    ///
    /// When false, the watcher closes itself right after the `ready` event;
    /// useful for one-shot directory snapshots.
    pub persistent: bool,

    /// Suppress `add`/`addDir` for entries found during the initial scan.
    pub ignore_initial: bool,

    /// Patterns (same syntax as watch inputs) that never produce events.
    pub ignored: Vec<String>,

    /// Traverse symlinks during scanning and rewrite event paths to the
    /// symlink view the user watched.
    pub follow_symlinks: bool,

    /// Report event paths relative to this directory.
    pub cwd: Option<PathBuf>,

    /// Maximum recursion depth below each watched root. Unbounded if `None`.
    pub depth: Option<usize>,

    /// Treat all inputs as literal paths, even if they contain glob
    /// metacharacters.
    pub disable_globbing: bool,

    /// Force the polling backend regardless of platform support.
    pub use_polling: bool,

    /// Polling period for regular files, in milliseconds.
    pub interval: u64,

    /// Polling period for binary files, in milliseconds.
    pub binary_interval: u64,

    /// Fetch a fresh stat for every `add`/`change` emission that does not
    /// already carry one.
    pub always_stat: bool,

    /// Collapse an editor's unlink-then-add save sequence into one `change`.
    ///
    /// `true` enables the default 100 ms collapse window; a number sets the
    /// window explicitly.
    pub atomic: Atomic,

    /// Hold `add`/`change` until the file's size has settled.
    pub await_write_finish: Option<AwaitWriteFinish>,

    /// Silently drop `EPERM`/`EACCES` instead of surfacing them on the
    /// `error` channel.
    pub ignore_permission_errors: bool,

    /// Upper bound on the number of patterns a single brace expansion may
    /// unroll into.
    pub expansion_limit: usize,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            persistent: true,
            ignore_initial: false,
            ignored: Vec::new(),
            follow_symlinks: true,
            cwd: None,
            depth: None,
            disable_globbing: false,
            use_polling: false,
            interval: 100,
            binary_interval: 300,
            always_stat: false,
            atomic: Atomic::Flag(true),
            await_write_finish: None,
            ignore_permission_errors: false,
            expansion_limit: 1000,
        }
    }
}

impl WatchOptions {
    /// Apply `WATCHTREE_USEPOLLING` / `WATCHTREE_INTERVAL` overrides.
    ///
    /// Called once at watcher construction, after the embedder has filled in
    /// the struct.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(raw) = std::env::var(ENV_USE_POLLING) {
            self.use_polling = truthy(&raw);
        }
        if let Ok(raw) = std::env::var(ENV_INTERVAL) {
            if let Ok(ms) = raw.trim().parse::<u64>() {
                self.interval = ms;
            }
        }
    }

    /// Basic sanity validation, run at watcher construction.
    pub fn validate(&self) -> Result<()> {
        if self.interval == 0 {
            return Err(anyhow!("interval must be >= 1 ms (got 0)"));
        }
        if self.binary_interval == 0 {
            return Err(anyhow!("binary_interval must be >= 1 ms (got 0)"));
        }
        if self.expansion_limit == 0 {
            return Err(anyhow!("expansion_limit must be >= 1 (got 0)"));
        }
        if let Some(awf) = &self.await_write_finish {
            if awf.poll_interval == 0 {
                return Err(anyhow!("await_write_finish.poll_interval must be >= 1 ms"));
            }
        }
        Ok(())
    }

    /// Polling period as a `Duration`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.interval)
    }

    /// Polling period for binary files as a `Duration`.
    pub fn binary_poll_interval(&self) -> Duration {
        Duration::from_millis(self.binary_interval)
    }
}

/// The `atomic` option: a flag or an explicit collapse window.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(untagged)]
pub enum Atomic {
    Flag(bool),
    DelayMs(u64),
}

impl Atomic {
    /// Whether atomic-save collapsing is active.
    pub fn enabled(&self) -> bool {
        match self {
            Atomic::Flag(on) => *on,
            Atomic::DelayMs(_) => true,
        }
    }

    /// How long an `unlink` is held back waiting for the matching `add`.
    pub fn delay(&self) -> Duration {
        match self {
            Atomic::Flag(_) => Duration::from_millis(100),
            Atomic::DelayMs(ms) => Duration::from_millis(*ms),
        }
    }
}

/// The `await_write_finish` option.
///
/// An `add`/`change` for a path is held until `stability_threshold` has
/// elapsed since the last observed size movement, checked every
/// `poll_interval`.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AwaitWriteFinish {
    /// Milliseconds the size must stay unchanged before emission.
    pub stability_threshold: u64,

    /// Milliseconds between `stat` polls.
    pub poll_interval: u64,
}

impl Default for AwaitWriteFinish {
    fn default() -> Self {
        Self {
            stability_threshold: 2000,
            poll_interval: 100,
        }
    }
}

impl AwaitWriteFinish {
    pub fn stability_threshold(&self) -> Duration {
        Duration::from_millis(self.stability_threshold)
    }

    pub fn poll_interval_duration(&self) -> Duration {
        Duration::from_millis(self.poll_interval)
    }
}

/// Environment-variable truthiness: `1`/`true` are true, `0`/`false` are
/// false, anything else coerces like a string would (non-empty = true).
fn truthy(raw: &str) -> bool {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" => true,
        "0" | "false" | "" => false,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let opts = WatchOptions::default();
        assert!(opts.persistent);
        assert!(opts.follow_symlinks);
        assert!(opts.atomic.enabled());
        assert!(opts.await_write_finish.is_none());
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = serde_json::from_str::<WatchOptions>(r#"{"use_poling": true}"#);
        assert!(err.is_err());
    }

    #[test]
    fn atomic_accepts_flag_or_delay() {
        let opts: WatchOptions = serde_json::from_str(r#"{"atomic": 250}"#).unwrap();
        assert!(opts.atomic.enabled());
        assert_eq!(opts.atomic.delay(), Duration::from_millis(250));

        let opts: WatchOptions = serde_json::from_str(r#"{"atomic": false}"#).unwrap();
        assert!(!opts.atomic.enabled());
    }

    #[test]
    fn truthiness_rules() {
        assert!(truthy("1"));
        assert!(truthy("true"));
        assert!(truthy("TRUE"));
        assert!(!truthy("0"));
        assert!(!truthy("false"));
        assert!(!truthy(""));
        assert!(truthy("yes"));
    }

    #[test]
    fn zero_interval_fails_validation() {
        let opts = WatchOptions {
            interval: 0,
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }
}
