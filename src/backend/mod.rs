// src/backend/mod.rs

//! OS-interaction backends.
//!
//! Three strategies detect filesystem changes; the orchestrator picks one
//! per watched input and owns all interpretation of what the backends
//! report:
//!
//! - [`native`]: a recursive OS event feed (`notify` in recursive mode).
//! - [`perdir`]: per-directory change signals; the dispatcher re-lists and
//!   diffs against the registry.
//! - [`poll`]: interval `stat` snapshots, for platforms or files where
//!   nothing better exists.
//!
//! Backends never decide semantics. They translate OS notifications into
//! [`BackendEvent`] messages and post them into the dispatcher's channel.

pub mod native;
pub mod perdir;
pub mod poll;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::errors::WatchError;
use crate::events::FileMeta;
use crate::options::WatchOptions;

/// Which backend strategy a watched input uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Native,
    PerDir,
    Poll,
}

impl BackendKind {
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Native => "native",
            BackendKind::PerDir => "per-dir",
            BackendKind::Poll => "poll",
        }
    }
}

/// Pick the backend for the current platform and options.
///
/// Polling wins when forced. Otherwise platforms with a kernel recursive
/// feed (FSEvents, ReadDirectoryChangesW) use the native backend and
/// everything else watches directory-by-directory. A hard native
/// construction failure downgrades to polling at subscribe time.
pub fn select_kind(opts: &WatchOptions) -> BackendKind {
    if opts.use_polling {
        return BackendKind::Poll;
    }
    if cfg!(any(target_os = "macos", target_os = "windows")) {
        BackendKind::Native
    } else {
        BackendKind::PerDir
    }
}

/// A notification posted by a backend into the dispatcher channel.
///
/// Interpretation (newness, ignore rules, throttling, settling) happens in
/// the dispatcher; backends only say what the OS told them.
#[derive(Debug)]
pub enum BackendEvent {
    /// Something appeared at `path`.
    Created { path: PathBuf, meta: Option<FileMeta> },
    /// Something changed at `path`.
    Modified { path: PathBuf, meta: Option<FileMeta> },
    /// Something disappeared from `path`.
    Removed { path: PathBuf },
    /// The OS reported a flag combination that cannot be trusted; the
    /// dispatcher resolves it with a `stat` and the registry.
    Ambiguous { path: PathBuf },
    /// A watched directory changed in some unspecified way (per-dir
    /// backend); the dispatcher re-lists and diffs it.
    DirTouched { dir: PathBuf },
    /// The feed dropped events; the affected root must be re-scanned
    /// instead of trusting deltas.
    Rescan { root: Option<PathBuf> },
    /// A fault on a specific handle; routed through the permission policy.
    Fault {
        path: Option<PathBuf>,
        error: WatchError,
    },
    /// The unprocessed OS notification, forwarded for the `raw` channel.
    Raw {
        backend: &'static str,
        path: Option<PathBuf>,
        detail: String,
    },
}

/// Common surface of the three strategies.
///
/// `subscribe`/`unsubscribe` are refcounted per path: watching the same
/// directory twice shares one OS handle, and the handle is released when
/// the last reference drops.
pub trait Backend: Send {
    fn kind(&self) -> BackendKind;

    /// Begin observing `path`. Recursive for the native backend, a single
    /// directory for per-dir, a single file or directory for polling.
    fn subscribe(&mut self, path: &Path) -> Result<(), WatchError>;

    /// Drop one reference to `path`, releasing the OS handle at zero.
    fn unsubscribe(&mut self, path: &Path);

    /// Release every handle. Idempotent; called on close.
    fn shutdown(&mut self);
}

/// Refcounts for shared OS handles, keyed by watched path.
#[derive(Debug, Default)]
pub struct HandleRefs {
    counts: HashMap<PathBuf, usize>,
}

impl HandleRefs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment; returns true when this is the first reference and the OS
    /// handle must actually be created.
    pub fn acquire(&mut self, path: &Path) -> bool {
        let count = self.counts.entry(path.to_path_buf()).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Decrement; returns true when the last reference dropped and the OS
    /// handle must be released.
    pub fn release(&mut self, path: &Path) -> bool {
        match self.counts.get_mut(path) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.counts.remove(path);
                true
            }
            None => false,
        }
    }

    /// Paths currently holding at least one reference.
    pub fn paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.counts.keys()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.counts.contains_key(path)
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn clear(&mut self) {
        self.counts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refcounts_share_and_release() {
        let mut refs = HandleRefs::new();
        let p = Path::new("/watched/dir");

        assert!(refs.acquire(p));
        assert!(!refs.acquire(p));
        assert!(!refs.release(p));
        assert!(refs.release(p));
        assert!(!refs.release(p));
        assert!(refs.is_empty());
    }

    #[test]
    fn polling_wins_selection_when_forced() {
        let opts = WatchOptions {
            use_polling: true,
            ..Default::default()
        };
        assert_eq!(select_kind(&opts), BackendKind::Poll);
    }
}
