// src/backend/native.rs

//! Native-event backend: one recursive subscription per watched root.
//!
//! On platforms with a kernel recursive directory-tree feed this backend
//! subscribes at the `glob_parent` of each input and translates the raw
//! notifications into [`BackendEvent`]s. Rename-ish and unclassifiable
//! notifications are forwarded as `Ambiguous` so the dispatcher can resolve
//! them with a `stat` and the registry instead of trusting the flags.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use notify::{Config, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendEvent, BackendKind, HandleRefs};
use crate::errors::WatchError;

/// Sibling subscriptions under one parent before they are folded into a
/// single parent watch with in-process filtering.
const CONSOLIDATE_AFTER: usize = 10;

/// Recursive `notify` watcher with refcounted, consolidating roots.
pub struct NativeBackend {
    watcher: Option<RecommendedWatcher>,
    refs: HandleRefs,
    /// Parents that replaced their individually-watched children.
    consolidated: HashMap<PathBuf, HashSet<PathBuf>>,
}

impl std::fmt::Debug for NativeBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeBackend")
            .field("roots", &self.refs)
            .finish_non_exhaustive()
    }
}

impl NativeBackend {
    /// Build the backend and its OS feed.
    ///
    /// A construction failure here is a hard-unavailable signal: the
    /// orchestrator reacts by falling back to polling.
    pub fn new(events_tx: mpsc::UnboundedSender<BackendEvent>) -> Result<Self, WatchError> {
        let watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| {
                translate(res, &events_tx);
            },
            Config::default(),
        )?;

        info!("native event feed initialized");
        Ok(Self {
            watcher: Some(watcher),
            refs: HandleRefs::new(),
            consolidated: HashMap::new(),
        })
    }

    fn covered_by_consolidated(&self, path: &Path) -> bool {
        self.consolidated
            .keys()
            .any(|parent| path.starts_with(parent))
    }

    /// Fold sibling subscriptions into one parent watch once there are more
    /// than [`CONSOLIDATE_AFTER`] of them.
    fn maybe_consolidate(&mut self, path: &Path) -> Result<bool, WatchError> {
        let Some(parent) = path.parent() else {
            return Ok(false);
        };

        let siblings: Vec<PathBuf> = self
            .refs
            .paths()
            .filter(|p| p.as_path() != path && p.parent() == Some(parent))
            .cloned()
            .collect();
        if siblings.len() + 1 <= CONSOLIDATE_AFTER {
            return Ok(false);
        }

        let watcher = self.watcher.as_mut().ok_or(WatchError::Closed)?;
        for sibling in &siblings {
            let _ = watcher.unwatch(sibling);
        }
        watcher.watch(parent, RecursiveMode::Recursive)?;

        let mut folded: HashSet<PathBuf> = siblings.into_iter().collect();
        folded.insert(path.to_path_buf());
        debug!(
            parent = ?parent,
            folded = folded.len(),
            "consolidated sibling watches into parent subscription"
        );
        self.consolidated.insert(parent.to_path_buf(), folded);
        Ok(true)
    }
}

impl Backend for NativeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    fn subscribe(&mut self, path: &Path) -> Result<(), WatchError> {
        if !self.refs.acquire(path) {
            return Ok(());
        }
        if self.covered_by_consolidated(path) {
            debug!(?path, "already covered by a consolidated parent watch");
            return Ok(());
        }
        if self.maybe_consolidate(path)? {
            return Ok(());
        }

        let watcher = self.watcher.as_mut().ok_or(WatchError::Closed)?;
        watcher.watch(path, RecursiveMode::Recursive)?;
        debug!(?path, "native watch attached");
        Ok(())
    }

    fn unsubscribe(&mut self, path: &Path) {
        if !self.refs.release(path) {
            return;
        }

        if let Some(parent) = path.parent() {
            if let Some(folded) = self.consolidated.get_mut(parent) {
                folded.remove(path);
                // The parent watch stays; filtering already happens
                // in-process.
                return;
            }
        }

        if let Some(watcher) = self.watcher.as_mut() {
            if let Err(e) = watcher.unwatch(path) {
                debug!(?path, error = %e, "native unwatch failed (already gone?)");
            }
        }
    }

    fn shutdown(&mut self) {
        // Dropping the OS watcher releases every subscription at once.
        self.watcher.take();
        self.refs.clear();
        self.consolidated.clear();
    }
}

/// Map one raw notification onto dispatcher messages.
fn translate(res: notify::Result<notify::Event>, tx: &mpsc::UnboundedSender<BackendEvent>) {
    let event = match res {
        Ok(event) => event,
        Err(err) => {
            let path = err.paths.first().cloned();
            warn!(error = %err, "native feed error");
            let _ = tx.send(BackendEvent::Fault {
                path,
                error: err.into(),
            });
            return;
        }
    };

    let _ = tx.send(BackendEvent::Raw {
        backend: "native",
        path: event.paths.first().cloned(),
        detail: format!("{:?}", event.kind),
    });

    // A rescan flag means the feed dropped events: deltas from here on are
    // stale until the root is walked again.
    if matches!(event.attrs.flag(), Some(notify::event::Flag::Rescan)) {
        let _ = tx.send(BackendEvent::Rescan {
            root: event.paths.first().cloned(),
        });
        return;
    }

    for path in event.paths {
        let msg = match event.kind {
            EventKind::Create(_) => BackendEvent::Created { path, meta: None },
            EventKind::Modify(notify::event::ModifyKind::Name(_)) => {
                // Renames surface as unmatched from/to halves; whether the
                // path now exists decides what actually happened.
                BackendEvent::Ambiguous { path }
            }
            EventKind::Modify(_) => BackendEvent::Modified { path, meta: None },
            EventKind::Remove(_) => BackendEvent::Removed { path },
            EventKind::Access(_) => continue,
            EventKind::Any | EventKind::Other => BackendEvent::Ambiguous { path },
        };
        let _ = tx.send(msg);
    }
}
