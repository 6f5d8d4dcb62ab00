// src/backend/perdir.rs

//! Per-directory backend: a non-recursive watch on every discovered
//! directory.
//!
//! The OS only says "something changed around here". The callback maps each
//! notification to candidate directories and posts `DirTouched`; the
//! dispatcher throttles those signals, re-lists the directory, and diffs the
//! listing against the registry to recover concrete events. The diff itself
//! lives here ([`diff_directory`]) so the whole strategy reads in one place.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendEvent, BackendKind, HandleRefs};
use crate::errors::WatchError;
use crate::events::FileMeta;
use crate::registry::{ChildKind, DirRegistry};

/// Directory-level `notify` watcher with refcounted handles.
pub struct PerDirBackend {
    watcher: Option<RecommendedWatcher>,
    refs: HandleRefs,
}

impl std::fmt::Debug for PerDirBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerDirBackend")
            .field("dirs", &self.refs)
            .finish_non_exhaustive()
    }
}

impl PerDirBackend {
    pub fn new(events_tx: mpsc::UnboundedSender<BackendEvent>) -> Result<Self, WatchError> {
        let watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| {
                signal(res, &events_tx);
            },
            Config::default(),
        )?;

        info!("per-directory watch feed initialized");
        Ok(Self {
            watcher: Some(watcher),
            refs: HandleRefs::new(),
        })
    }

    /// Attach the OS watch, clearing a transient permission fault once by
    /// opening and closing the directory before retrying.
    fn attach(&mut self, dir: &Path) -> Result<(), WatchError> {
        let watcher = self.watcher.as_mut().ok_or(WatchError::Closed)?;

        match watcher.watch(dir, RecursiveMode::NonRecursive) {
            Ok(()) => Ok(()),
            Err(first) if is_permission(&first) => {
                debug!(?dir, "watch hit a permission glitch; clearing and retrying");
                let _ = std::fs::File::open(dir);
                watcher.watch(dir, RecursiveMode::NonRecursive).map_err(|e| {
                    WatchError::OsWatchFault {
                        path: dir.to_path_buf(),
                        reason: e.to_string(),
                    }
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Backend for PerDirBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::PerDir
    }

    fn subscribe(&mut self, dir: &Path) -> Result<(), WatchError> {
        if !self.refs.acquire(dir) {
            return Ok(());
        }
        match self.attach(dir) {
            Ok(()) => {
                debug!(?dir, "per-dir watch attached");
                Ok(())
            }
            Err(e) => {
                self.refs.release(dir);
                Err(e)
            }
        }
    }

    fn unsubscribe(&mut self, dir: &Path) {
        if !self.refs.release(dir) {
            return;
        }
        if let Some(watcher) = self.watcher.as_mut() {
            if let Err(e) = watcher.unwatch(dir) {
                debug!(?dir, error = %e, "per-dir unwatch failed (already gone?)");
            }
        }
    }

    fn shutdown(&mut self) {
        self.watcher.take();
        self.refs.clear();
    }
}

fn is_permission(err: &notify::Error) -> bool {
    matches!(
        &err.kind,
        notify::ErrorKind::Io(io) if io.kind() == std::io::ErrorKind::PermissionDenied
    )
}

/// Reduce a raw notification to "these directories need a re-list".
///
/// Both the event path and its parent are posted: the path covers the case
/// where a watched directory itself changed or vanished, the parent covers
/// changes to children. Untracked candidates are dropped by the dispatcher
/// and bursts collapse in the `readdir` throttle.
fn signal(res: notify::Result<notify::Event>, tx: &mpsc::UnboundedSender<BackendEvent>) {
    let event = match res {
        Ok(event) => event,
        Err(err) => {
            let path = err.paths.first().cloned();
            warn!(error = %err, "per-dir feed error");
            let _ = tx.send(BackendEvent::Fault {
                path,
                error: err.into(),
            });
            return;
        }
    };

    let _ = tx.send(BackendEvent::Raw {
        backend: "per-dir",
        path: event.paths.first().cloned(),
        detail: format!("{:?}", event.kind),
    });

    if matches!(event.attrs.flag(), Some(notify::event::Flag::Rescan)) {
        let _ = tx.send(BackendEvent::Rescan {
            root: event.paths.first().cloned(),
        });
        return;
    }

    let mut dirs: Vec<PathBuf> = Vec::new();
    for path in &event.paths {
        if let Some(parent) = path.parent() {
            dirs.push(parent.to_path_buf());
        }
        dirs.push(path.clone());
    }
    dirs.dedup();

    for dir in dirs {
        let _ = tx.send(BackendEvent::DirTouched { dir });
    }
}

/// Outcome of re-listing a touched directory against the registry.
#[derive(Debug, Default)]
pub struct DirDiff {
    /// Entries present on disk but unknown to the registry.
    pub added: Vec<(PathBuf, FileMeta)>,
    /// Registry children that no longer exist on disk.
    pub removed: Vec<(String, ChildKind)>,
    /// Known entries whose size or mtime moved since last observed.
    pub changed: Vec<(PathBuf, FileMeta)>,
}

/// List `dir` and diff it against the registry and the stat cache.
///
/// An `Err(NotFound)` here means the directory itself vanished; the caller
/// tears the subtree down.
pub fn diff_directory(
    dir: &Path,
    registry: &DirRegistry,
    stat_cache: &HashMap<PathBuf, FileMeta>,
) -> std::io::Result<DirDiff> {
    let mut diff = DirDiff::default();
    let mut seen: HashSet<String> = HashSet::new();

    for entry in std::fs::read_dir(dir)? {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        let meta = match entry.metadata() {
            Ok(m) => FileMeta::from_std(&m),
            Err(_) => continue, // raced away between readdir and stat
        };

        seen.insert(name.clone());
        let full = dir.join(&name);

        if !registry.has_child(dir, &name) {
            diff.added.push((full, meta));
        } else if let Some(prev) = stat_cache.get(&full) {
            if prev.size != meta.size || prev.mtime_ms != meta.mtime_ms {
                diff.changed.push((full, meta));
            }
        }
    }

    for (name, kind) in registry.children(dir) {
        if !seen.contains(&name) {
            diff.removed.push((name, kind));
        }
    }

    Ok(diff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn diff_spots_added_removed_changed() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path();
        std::fs::write(dir.join("kept.txt"), b"same").unwrap();
        std::fs::write(dir.join("new.txt"), b"new").unwrap();

        let mut registry = DirRegistry::new();
        registry.add_child(dir, "kept.txt", ChildKind::File);
        registry.add_child(dir, "gone.txt", ChildKind::File);

        let kept_meta =
            FileMeta::from_std(&std::fs::metadata(dir.join("kept.txt")).unwrap());
        let mut cache = HashMap::new();
        cache.insert(dir.join("kept.txt"), kept_meta);

        let diff = diff_directory(dir, &registry, &cache).unwrap();

        assert_eq!(diff.added.len(), 1);
        assert!(diff.added[0].0.ends_with("new.txt"));
        assert_eq!(diff.removed.len(), 1);
        assert_eq!(diff.removed[0].0, "gone.txt");
        assert!(diff.changed.is_empty());
    }

    #[test]
    fn diff_reports_size_movement_as_change() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path();
        std::fs::write(dir.join("f.txt"), b"grown contents").unwrap();

        let mut registry = DirRegistry::new();
        registry.add_child(dir, "f.txt", ChildKind::File);

        let stale = FileMeta {
            size: 1,
            ..FileMeta::from_std(&std::fs::metadata(dir.join("f.txt")).unwrap())
        };
        let mut cache = HashMap::new();
        cache.insert(dir.join("f.txt"), stale);

        let diff = diff_directory(dir, &registry, &cache).unwrap();
        assert_eq!(diff.changed.len(), 1);
    }

    #[test]
    fn diff_on_vanished_dir_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let gone = tmp.path().join("sub");
        std::fs::create_dir(&gone).unwrap();
        std::fs::remove_dir(&gone).unwrap();

        let registry = DirRegistry::new();
        let err = diff_directory(&gone, &registry, &HashMap::new()).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}
