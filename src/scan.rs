// src/scan.rs

//! Recursive initial scan of a watched root.
//!
//! Every subscribe starts with a walk of the tree below the root: discovered
//! entries are streamed back to the dispatcher, which owns the ignore
//! decision and the registry insert. The walk itself only prunes ignored
//! directories (so we never descend into `node_modules`-sized holes) and
//! honours the depth cap and symlink policy.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, trace, warn};
use walkdir::WalkDir;

use crate::errors::WatchError;
use crate::events::FileMeta;
use crate::path::{match_text, relative_str};
use crate::pattern::{CompiledGlob, PatternSet};

/// What a scan worker reports back to the dispatcher.
#[derive(Debug)]
pub enum ScanUpdate {
    /// A file or directory below the root.
    Entry { path: PathBuf, meta: FileMeta },
    /// A symlink and its resolved target, for the dispatcher's symlink map.
    SymlinkResolved { link: PathBuf, target: PathBuf },
    /// A fault the dispatcher should run through the permission policy.
    Fault(WatchError),
    /// The walk finished (or was poisoned); always the last update.
    Done,
}

/// Parameters for one scan worker.
#[derive(Debug, Clone)]
pub struct ScanParams {
    /// Literal directory (or file) the walk starts at.
    pub root: PathBuf,
    /// Pattern filter for glob inputs; `None` watches everything below the
    /// root.
    pub matcher: Option<CompiledGlob>,
    /// Base the pattern text is relative to; empty for absolute patterns.
    pub pattern_base: PathBuf,
    /// Base ignore patterns are matched against (the watch root).
    pub ignore_base: PathBuf,
    /// Maximum recursion depth below the root.
    pub depth: Option<usize>,
    pub follow_symlinks: bool,
    /// Compiled ignore patterns, used here only to prune whole directories.
    pub ignore: PatternSet,
    /// Close poison flag; the walk aborts promptly once set.
    pub poisoned: Arc<AtomicBool>,
}

/// Run a scan on the blocking pool, streaming updates through `emit`.
pub fn spawn_scan(params: ScanParams, emit: impl Fn(ScanUpdate) + Send + 'static) {
    tokio::task::spawn_blocking(move || {
        walk(&params, &emit);
        emit(ScanUpdate::Done);
    });
}

fn walk(params: &ScanParams, emit: &impl Fn(ScanUpdate)) {
    let mut walker = WalkDir::new(&params.root).follow_links(params.follow_symlinks);
    if let Some(depth) = params.depth {
        // depth counts levels below the root; walkdir counts the root as 0.
        walker = walker.max_depth(depth.saturating_add(1));
    }

    let iter = walker.into_iter().filter_entry(|entry| {
        // Prune ignored directories wholesale; files are filtered by the
        // dispatcher so the ignore decision happens exactly once per event.
        if !entry.file_type().is_dir() {
            return true;
        }
        match relative_str(&params.ignore_base, entry.path()) {
            Some(rel) if !rel.is_empty() => !params.ignore.matches(&rel),
            _ => true,
        }
    });

    for result in iter {
        if params.poisoned.load(Ordering::Relaxed) {
            debug!(root = ?params.root, "scan observed close; aborting");
            return;
        }

        let entry = match result {
            Ok(entry) => entry,
            Err(err) => {
                report_walk_error(err, emit);
                continue;
            }
        };

        if entry.path_is_symlink() {
            match std::fs::read_link(entry.path()) {
                Ok(target) => {
                    let target = if target.is_absolute() {
                        target
                    } else {
                        entry
                            .path()
                            .parent()
                            .map(|p| p.join(&target))
                            .unwrap_or(target)
                    };
                    emit(ScanUpdate::SymlinkResolved {
                        link: entry.path().to_path_buf(),
                        target,
                    });
                }
                Err(e) => {
                    trace!(path = ?entry.path(), error = %e, "readlink failed during scan");
                }
            }
        }

        let meta = match entry.metadata() {
            Ok(m) => FileMeta::from_std(&m),
            Err(err) => {
                report_walk_error(err, emit);
                continue;
            }
        };

        if let Some(matcher) = &params.matcher {
            // Glob inputs: non-matching files are dropped here. Directories
            // are always reported so the dispatcher can track and subscribe
            // them; whether an `addDir` is emitted is its decision.
            if !meta.is_dir {
                let text = match_text(&params.pattern_base, entry.path());
                let matched = text.as_deref().map(|t| matcher.matches(t)).unwrap_or(false);
                if !matched {
                    continue;
                }
            }
        }

        emit(ScanUpdate::Entry {
            path: entry.path().to_path_buf(),
            meta,
        });
    }
}

fn report_walk_error(err: walkdir::Error, emit: &impl Fn(ScanUpdate)) {
    let path = err
        .path()
        .map(Path::to_path_buf)
        .unwrap_or_default();

    if err.loop_ancestor().is_some() {
        // Symlink loop: skip the cycle, keep walking. The symlink map makes
        // sure events on the loop entry still surface.
        warn!(?path, "symlink loop detected during scan; skipping");
        return;
    }

    match err.into_io_error() {
        Some(io) => {
            if let Some(classified) = WatchError::from_io(&path, io) {
                emit(ScanUpdate::Fault(classified));
            }
        }
        None => trace!(?path, "non-io walk error ignored"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use tempfile::TempDir;

    fn collect_scan(params: ScanParams) -> Vec<ScanUpdate> {
        let (tx, rx) = mpsc::channel();
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async move {
            spawn_scan(params, move |u| {
                let _ = tx.send(u);
            });
            tokio::task::yield_now().await;
        });
        rx.into_iter().collect()
    }

    fn params(root: &Path) -> ScanParams {
        ScanParams {
            root: root.to_path_buf(),
            matcher: None,
            pattern_base: root.to_path_buf(),
            ignore_base: root.to_path_buf(),
            depth: None,
            follow_symlinks: true,
            ignore: PatternSet::default(),
            poisoned: Arc::new(AtomicBool::new(false)),
        }
    }

    #[test]
    fn scan_reports_files_and_dirs() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join("sub")).unwrap();
        std::fs::write(tmp.path().join("sub/a.txt"), b"a").unwrap();

        let updates = collect_scan(params(tmp.path()));
        let entries: Vec<_> = updates
            .iter()
            .filter_map(|u| match u {
                ScanUpdate::Entry { path, .. } => Some(path.clone()),
                _ => None,
            })
            .collect();

        assert!(entries.contains(&tmp.path().to_path_buf()));
        assert!(entries.contains(&tmp.path().join("sub")));
        assert!(entries.contains(&tmp.path().join("sub/a.txt")));
        assert!(matches!(updates.last(), Some(ScanUpdate::Done)));
    }

    #[test]
    fn depth_limits_the_walk() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("a/b")).unwrap();
        std::fs::write(tmp.path().join("a/b/deep.txt"), b"x").unwrap();

        let mut p = params(tmp.path());
        p.depth = Some(1);
        let updates = collect_scan(p);

        let paths: Vec<_> = updates
            .iter()
            .filter_map(|u| match u {
                ScanUpdate::Entry { path, .. } => Some(path.clone()),
                _ => None,
            })
            .collect();

        assert!(paths.contains(&tmp.path().join("a")));
        assert!(paths.contains(&tmp.path().join("a/b")));
        assert!(!paths.contains(&tmp.path().join("a/b/deep.txt")));
    }

    #[test]
    fn ignored_directories_are_pruned() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join("node_modules")).unwrap();
        std::fs::write(tmp.path().join("node_modules/x.js"), b"x").unwrap();
        std::fs::write(tmp.path().join("keep.js"), b"x").unwrap();

        let mut p = params(tmp.path());
        p.ignore = PatternSet::compile(&["node_modules".to_string()], 1000).unwrap();
        let updates = collect_scan(p);

        let paths: Vec<_> = updates
            .iter()
            .filter_map(|u| match u {
                ScanUpdate::Entry { path, .. } => Some(path.clone()),
                _ => None,
            })
            .collect();

        assert!(paths.contains(&tmp.path().join("keep.js")));
        assert!(!paths.iter().any(|p| p.ends_with("x.js")));
    }

    #[test]
    fn glob_matcher_filters_files_but_reports_dirs() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join("sub")).unwrap();
        std::fs::write(tmp.path().join("a.rs"), b"x").unwrap();
        std::fs::write(tmp.path().join("a.txt"), b"x").unwrap();

        let mut p = params(tmp.path());
        p.matcher = Some(CompiledGlob::new("**/*.rs", 1000).unwrap());
        let updates = collect_scan(p);

        let paths: Vec<_> = updates
            .iter()
            .filter_map(|u| match u {
                ScanUpdate::Entry { path, .. } => Some(path.clone()),
                _ => None,
            })
            .collect();

        assert!(paths.contains(&tmp.path().join("a.rs")));
        assert!(!paths.contains(&tmp.path().join("a.txt")));
        // Directories are traversal state, not matches; they still surface.
        assert!(paths.contains(&tmp.path().join("sub")));
    }
}
