// src/watcher/dispatch.rs

//! The dispatcher: one task that owns all mutable watcher state.
//!
//! Backends, scan workers and timers post messages into channels this loop
//! drains; registry, throttle table, pending slots and the symlink map are
//! never touched from anywhere else, so no locks guard them. The emission
//! pipeline runs synchronously from the ignore check to the emit, which is
//! what keeps two events from racing to decide newness for the same path.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::backend::{
    native::NativeBackend, perdir, perdir::PerDirBackend, poll::PollBackend, select_kind, Backend,
    BackendEvent, BackendKind,
};
use crate::errors::WatchError;
use crate::events::{Event, EventBus, FileMeta, FsEventKind};
use crate::options::WatchOptions;
use crate::path::{absolutize, is_dotfile, is_glob, match_text, normalize, split_negation, to_slash};
use crate::pattern::{CompiledGlob, PatternSet};
use crate::registry::{ChildKind, DirRegistry, RemoveOutcome};
use crate::scan::{spawn_scan, ScanParams, ScanUpdate};
use crate::settle::SettleTracker;
use crate::throttle::{Acquire, ThrottleKind, ThrottleTable};

/// How often expired throttle slots are swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Requests from the public [`crate::Watcher`] handle.
#[derive(Debug)]
pub(crate) enum Command {
    Add {
        inputs: Vec<String>,
        reply: oneshot::Sender<Result<(), WatchError>>,
    },
    Unwatch {
        inputs: Vec<String>,
        reply: oneshot::Sender<()>,
    },
    GetWatched {
        reply: oneshot::Sender<BTreeMap<String, Vec<String>>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// One watched input after normalization and classification.
#[derive(Debug)]
struct WatchRoot {
    /// The input as the user wrote it (normalized), for dedup and unwatch.
    input: String,
    /// Literal subscription root on disk.
    root: PathBuf,
    /// Compiled pattern for glob inputs; literal inputs have none.
    matcher: Option<CompiledGlob>,
    /// Base the pattern text was written against (cwd for relative
    /// patterns); empty for absolute patterns, which match the full path.
    pattern_base: PathBuf,
}

/// Bookkeeping for an in-flight scan worker.
#[derive(Debug, Clone, Copy)]
struct ScanInfo {
    /// True for the scan triggered by `add`; its discoveries honour
    /// `ignore_initial`.
    initial: bool,
}

pub(crate) struct Dispatcher {
    opts: WatchOptions,
    bus: Arc<Mutex<EventBus>>,
    closed: Arc<AtomicBool>,

    backend: Box<dyn Backend>,
    backend_kind: BackendKind,
    backend_tx: mpsc::UnboundedSender<BackendEvent>,

    scan_tx: mpsc::UnboundedSender<(u64, ScanUpdate)>,
    deadline_tx: mpsc::UnboundedSender<PathBuf>,

    roots: HashMap<u64, WatchRoot>,
    next_root_id: u64,
    scans: HashMap<u64, ScanInfo>,
    next_scan_id: u64,

    registry: DirRegistry,
    throttle: ThrottleTable,
    settle: Option<SettleTracker>,
    /// Deferred `unlink`s waiting for a matching `add` (atomic mode).
    pending_unlinks: HashSet<PathBuf>,
    /// Directories whose throttled re-list has been rescheduled; the diff
    /// always reconciles the final state even when signals were coalesced.
    pending_retouch: HashSet<PathBuf>,
    /// Symlink path → resolved target, for event-path rewriting.
    symlinks: HashMap<PathBuf, PathBuf>,
    /// Last observed stat per path, feeding the per-dir diff.
    stat_cache: HashMap<PathBuf, FileMeta>,

    /// Literal paths never to emit for (negated inputs, unwatched paths).
    ignored_paths: HashSet<PathBuf>,
    /// Glob patterns never to emit for (`ignored` option plus accumulated
    /// negated/unwatched globs).
    ignored_patterns: Vec<String>,
    /// Compiled composite of `ignored_patterns`; rebuilt after mutation.
    ignore_matcher: Option<PatternSet>,

    ready_pending: usize,
    ready_fired: bool,
}

impl Dispatcher {
    /// Build the dispatcher, pick a backend, and spawn the drain loop.
    pub(crate) fn spawn(
        opts: WatchOptions,
        bus: Arc<Mutex<EventBus>>,
        closed: Arc<AtomicBool>,
    ) -> mpsc::UnboundedSender<Command> {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (backend_tx, backend_rx) = mpsc::unbounded_channel();
        let (scan_tx, scan_rx) = mpsc::unbounded_channel();
        let (deadline_tx, deadline_rx) = mpsc::unbounded_channel();

        let (backend, backend_kind) = build_backend(&opts, backend_tx.clone());
        info!(backend = backend_kind.name(), "watcher backend selected");

        let settle = opts.await_write_finish.map(SettleTracker::new);

        let dispatcher = Dispatcher {
            opts,
            bus,
            closed,
            backend,
            backend_kind,
            backend_tx,
            scan_tx,
            deadline_tx,
            roots: HashMap::new(),
            next_root_id: 0,
            scans: HashMap::new(),
            next_scan_id: 0,
            registry: DirRegistry::new(),
            throttle: ThrottleTable::new(),
            settle,
            pending_unlinks: HashSet::new(),
            pending_retouch: HashSet::new(),
            symlinks: HashMap::new(),
            stat_cache: HashMap::new(),
            ignored_paths: HashSet::new(),
            ignored_patterns: Vec::new(),
            ignore_matcher: None,
            ready_pending: 0,
            ready_fired: false,
        };

        tokio::spawn(dispatcher.run(commands_rx, backend_rx, scan_rx, deadline_rx));
        commands_tx
    }

    async fn run(
        mut self,
        mut commands_rx: mpsc::UnboundedReceiver<Command>,
        mut backend_rx: mpsc::UnboundedReceiver<BackendEvent>,
        mut scan_rx: mpsc::UnboundedReceiver<(u64, ScanUpdate)>,
        mut deadline_rx: mpsc::UnboundedReceiver<PathBuf>,
    ) {
        // Seed the ignore pattern list from options before anything flows.
        self.ignored_patterns = self.opts.ignored.clone();

        let settle_period = self
            .opts
            .await_write_finish
            .map(|awf| awf.poll_interval_duration())
            .unwrap_or(Duration::from_secs(3600));
        let mut settle_tick = tokio::time::interval(settle_period);
        settle_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut sweep_tick = tokio::time::interval(SWEEP_INTERVAL);
        sweep_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        debug!("dispatcher started");

        loop {
            tokio::select! {
                maybe_cmd = commands_rx.recv() => {
                    match maybe_cmd {
                        Some(cmd) => {
                            if !self.handle_command(cmd) {
                                break;
                            }
                        }
                        None => {
                            // Every handle dropped: same as close().
                            debug!("all watcher handles dropped; shutting down");
                            self.teardown();
                            break;
                        }
                    }
                }
                Some(event) = backend_rx.recv() => {
                    self.handle_backend_event(event);
                }
                Some((scan_id, update)) = scan_rx.recv() => {
                    if !self.handle_scan_update(scan_id, update) {
                        break;
                    }
                }
                Some(path) = deadline_rx.recv() => {
                    self.handle_unlink_deadline(path);
                }
                _ = settle_tick.tick(), if self.settle_active() => {
                    self.poll_settled().await;
                }
                _ = sweep_tick.tick() => {
                    self.throttle.sweep();
                }
            }
        }

        debug!("dispatcher exited");
    }

    fn settle_active(&self) -> bool {
        self.settle.as_ref().map(|s| s.has_pending()).unwrap_or(false)
    }

    // ---- command handling ---------------------------------------------

    /// Returns false when the loop should stop.
    fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Add { inputs, reply } => {
                let result = self.handle_add(inputs);
                let _ = reply.send(result);
                true
            }
            Command::Unwatch { inputs, reply } => {
                self.handle_unwatch(inputs);
                let _ = reply.send(());
                true
            }
            Command::GetWatched { reply } => {
                let _ = reply.send(self.watched_snapshot());
                true
            }
            Command::Close { reply } => {
                self.teardown();
                let _ = reply.send(());
                false
            }
        }
    }

    fn handle_add(&mut self, inputs: Vec<String>) -> Result<(), WatchError> {
        // Validate everything up front so a bad input leaves state unchanged.
        for raw in &inputs {
            if raw.trim().is_empty() {
                return Err(WatchError::InvalidArgument {
                    reason: "watch path must be a non-empty string".to_string(),
                });
            }
        }

        for raw in inputs {
            let normalized = normalize(&raw);
            let (body, negated) = split_negation(&normalized);

            if negated {
                self.add_ignore_entry(body);
                continue;
            }

            let treat_as_glob = is_glob(body) && !self.opts.disable_globbing;
            let (root, matcher, pattern_base) = if treat_as_glob {
                let matcher = match CompiledGlob::new(body, self.opts.expansion_limit) {
                    Ok(m) => m,
                    Err(err @ WatchError::ExpansionLimit { .. }) => {
                        // Reject this input, keep going with the others.
                        warn!(pattern = body, "glob expansion limit exceeded");
                        self.surface_fault(err);
                        continue;
                    }
                    Err(err) => {
                        self.surface_fault(err);
                        continue;
                    }
                };
                let parent = crate::path::glob_parent(body);
                let base = if Path::new(body).is_absolute() {
                    PathBuf::new()
                } else {
                    self.cwd_base()
                };
                (
                    absolutize(&parent, self.opts.cwd.as_deref()),
                    Some(matcher),
                    base,
                )
            } else {
                (absolutize(body, self.opts.cwd.as_deref()), None, PathBuf::new())
            };

            // Re-adding something that was unwatched revives it.
            self.ignored_paths.remove(&root);

            if self
                .roots
                .values()
                .any(|r| r.input == normalized && r.root == root)
            {
                debug!(input = %normalized, "input already watched; skipping");
                continue;
            }

            let root_id = self.next_root_id;
            self.next_root_id += 1;
            self.roots.insert(
                root_id,
                WatchRoot {
                    input: normalized.clone(),
                    root: root.clone(),
                    matcher,
                    pattern_base,
                },
            );

            // Native feeds subscribe once at the root; the other strategies
            // attach per directory as the scan discovers them.
            if self.backend_kind == BackendKind::Native {
                if let Err(err) = self.backend.subscribe(&root) {
                    self.surface_fault(err);
                }
            }

            self.start_scan(root_id, true);
        }

        Ok(())
    }

    fn handle_unwatch(&mut self, inputs: Vec<String>) {
        for raw in inputs {
            let normalized = normalize(&raw);
            let (body, _) = split_negation(&normalized);
            self.add_ignore_entry(body);

            let abs = absolutize(body, self.opts.cwd.as_deref());

            // Close backend handles rooted at the unwatched path.
            let doomed: Vec<u64> = self
                .roots
                .iter()
                .filter(|(_, r)| r.input == normalized || r.root.starts_with(&abs))
                .map(|(id, _)| *id)
                .collect();
            for id in doomed {
                if let Some(root) = self.roots.remove(&id) {
                    debug!(input = %root.input, "unwatching root");
                    self.backend.unsubscribe(&root.root);
                }
            }

            if self.backend_kind != BackendKind::Native {
                for dir in self.dirs_under(&abs) {
                    self.backend.unsubscribe(&dir);
                }
            }

            // Silent teardown: unwatch does not emit unlink events.
            self.registry.remove_subtree(&abs);
            self.stat_cache.retain(|p, _| !p.starts_with(&abs));
            if let Some(settle) = &mut self.settle {
                settle.cancel(&abs);
            }
            self.pending_unlinks.remove(&abs);
        }
    }

    fn dirs_under(&self, root: &Path) -> Vec<PathBuf> {
        self.registry
            .snapshot()
            .keys()
            .map(PathBuf::from)
            .filter(|d| d.starts_with(root))
            .collect()
    }

    fn add_ignore_entry(&mut self, body: &str) {
        if is_glob(body) {
            self.ignored_patterns.push(body.to_string());
        } else {
            self.ignored_paths
                .insert(absolutize(body, self.opts.cwd.as_deref()));
        }
        // Either way the cached composite matcher is stale now.
        self.ignore_matcher = None;
    }

    // ---- scanning ------------------------------------------------------

    fn start_scan(&mut self, root_id: u64, initial: bool) {
        let Some((root_path, matcher, pattern_base)) = self
            .roots
            .get(&root_id)
            .map(|r| (r.root.clone(), r.matcher.clone(), r.pattern_base.clone()))
        else {
            return;
        };

        let depth = self.opts.depth;
        self.spawn_scan_worker(initial, root_path.clone(), matcher, pattern_base, root_path, depth);
    }

    /// Scan a directory discovered at runtime, with the depth budget that
    /// remains below its covering root.
    fn start_live_scan(&mut self, dir: &Path) {
        let Some((root_path, matcher, pattern_base)) = self
            .roots
            .values()
            .find(|r| dir.starts_with(&r.root))
            .map(|r| (r.root.clone(), r.matcher.clone(), r.pattern_base.clone()))
        else {
            return;
        };

        let consumed = dir
            .strip_prefix(&root_path)
            .map(|rel| rel.components().count())
            .unwrap_or(0);
        let remaining = match self.opts.depth {
            Some(depth) if consumed > depth => return,
            Some(depth) => Some(depth - consumed),
            None => None,
        };

        self.spawn_scan_worker(
            false,
            dir.to_path_buf(),
            matcher,
            pattern_base,
            root_path,
            remaining,
        );
    }

    fn spawn_scan_worker(
        &mut self,
        initial: bool,
        scan_root: PathBuf,
        matcher: Option<CompiledGlob>,
        pattern_base: PathBuf,
        ignore_base: PathBuf,
        depth: Option<usize>,
    ) {
        let scan_id = self.next_scan_id;
        self.next_scan_id += 1;
        self.scans.insert(scan_id, ScanInfo { initial });
        self.ready_pending += 1;

        let params = ScanParams {
            root: scan_root,
            matcher,
            pattern_base,
            ignore_base,
            depth,
            follow_symlinks: self.opts.follow_symlinks,
            ignore: self.ignore_pattern_set().clone(),
            poisoned: Arc::clone(&self.closed),
        };

        let tx = self.scan_tx.clone();
        spawn_scan(params, move |update| {
            let _ = tx.send((scan_id, update));
        });
    }

    /// The directory relative patterns were written against.
    fn cwd_base(&self) -> PathBuf {
        self.opts
            .cwd
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_default())
    }

    /// Returns false when the loop should stop (non-persistent auto-close).
    fn handle_scan_update(&mut self, scan_id: u64, update: ScanUpdate) -> bool {
        let Some(info) = self.scans.get(&scan_id).copied() else {
            return true;
        };

        match update {
            ScanUpdate::Entry { path, meta } => {
                let suppress = info.initial && self.opts.ignore_initial;
                self.process_discovered(&path, meta, suppress, true);
            }
            ScanUpdate::SymlinkResolved { link, target } => {
                self.symlinks.insert(link, target);
            }
            ScanUpdate::Fault(err) => self.surface_fault(err),
            ScanUpdate::Done => {
                self.scans.remove(&scan_id);
                self.ready_pending = self.ready_pending.saturating_sub(1);
                trace!(scan_id, pending = self.ready_pending, "scan finished");

                if self.ready_pending == 0 && !self.ready_fired {
                    self.ready_fired = true;
                    info!("initial scans complete; watcher ready");
                    self.emit_event(Event::Ready);

                    if !self.opts.persistent {
                        debug!("persistent=false; closing after ready");
                        self.teardown();
                        return false;
                    }
                }
            }
        }
        true
    }

    // ---- backend events ------------------------------------------------

    fn handle_backend_event(&mut self, event: BackendEvent) {
        if self.closed.load(Ordering::Relaxed) {
            return;
        }

        match event {
            BackendEvent::Created { path, meta } => {
                if !self.event_in_scope(&path) {
                    return;
                }
                let Some(meta) = meta.or_else(|| self.fresh_stat(&path)) else {
                    // Raced away before we could look; a removal will follow
                    // if it was ever tracked.
                    return;
                };
                self.process_discovered(&path, meta, false, false);
            }
            BackendEvent::Modified { path, meta } => {
                if !self.event_in_scope(&path) {
                    return;
                }
                self.process_modified(&path, meta);
            }
            BackendEvent::Removed { path } => {
                if !self.event_in_scope(&path) {
                    return;
                }
                self.process_removed(&path);
            }
            BackendEvent::Ambiguous { path } => {
                if !self.event_in_scope(&path) {
                    return;
                }
                self.resolve_ambiguous(&path);
            }
            BackendEvent::DirTouched { dir } => self.handle_dir_touched(&dir),
            BackendEvent::Rescan { root } => self.handle_rescan(root),
            BackendEvent::Fault { path, error } => {
                debug!(?path, "backend fault");
                self.surface_fault(error);
            }
            BackendEvent::Raw {
                backend,
                path,
                detail,
            } => {
                self.emit_event(Event::Raw {
                    backend,
                    path,
                    detail,
                });
            }
        }
    }

    /// The erroneous-flag resolution: trust the filesystem, not the feed.
    fn resolve_ambiguous(&mut self, path: &Path) {
        match self.fresh_stat(path) {
            Some(meta) => {
                let known = if meta.is_dir {
                    self.registry.contains(path)
                } else {
                    self.is_known_file(path)
                };
                if known {
                    if !meta.is_dir {
                        self.stat_cache.insert(path.to_path_buf(), meta);
                        self.emit_candidate(FsEventKind::Change, path, Some(meta));
                    }
                } else {
                    self.process_discovered(path, meta, false, false);
                }
            }
            None => self.process_removed(path),
        }
    }

    fn handle_dir_touched(&mut self, dir: &Path) {
        if self.closed.load(Ordering::Relaxed) || !self.registry.contains(dir) {
            return;
        }
        self.pending_retouch.remove(dir);
        if let Acquire::Suppressed { count } = self.throttle.try_acquire(ThrottleKind::Readdir, dir)
        {
            trace!(?dir, count, "readdir throttled");
            // A coalesced signal must still be reconciled eventually: touch
            // the directory once more after the window expires.
            if self.pending_retouch.insert(dir.to_path_buf()) {
                let tx = self.backend_tx.clone();
                let dir = dir.to_path_buf();
                let window = ThrottleKind::Readdir.window();
                let closed = Arc::clone(&self.closed);
                tokio::spawn(async move {
                    tokio::time::sleep(window).await;
                    if !closed.load(Ordering::Relaxed) {
                        let _ = tx.send(BackendEvent::DirTouched { dir });
                    }
                });
            }
            return;
        }

        match perdir::diff_directory(dir, &self.registry, &self.stat_cache) {
            Ok(diff) => {
                for (path, meta) in diff.added {
                    // The listing shows everything in the directory; only
                    // entries some watched input covers become events (a
                    // single-file watch must not pull in its siblings).
                    if !self.event_in_scope(&path) {
                        continue;
                    }
                    self.process_discovered(&path, meta, false, false);
                }
                for (name, _) in diff.removed {
                    self.process_removed(&dir.join(name));
                }
                for (path, meta) in diff.changed {
                    if meta.is_dir {
                        continue;
                    }
                    self.stat_cache.insert(path.clone(), meta);
                    self.emit_candidate(FsEventKind::Change, &path, Some(meta));
                }
            }
            Err(err) if absorbed(&err) => {
                // The directory itself is gone.
                self.process_removed(dir);
            }
            Err(err) => {
                if let Some(classified) = WatchError::from_io(dir, err) {
                    self.surface_fault(classified);
                }
            }
        }
    }

    fn handle_rescan(&mut self, root: Option<PathBuf>) {
        let targets: Vec<u64> = self
            .roots
            .iter()
            .filter(|(_, r)| match &root {
                Some(path) => path.starts_with(&r.root) || r.root.starts_with(path),
                None => true,
            })
            .map(|(id, _)| *id)
            .collect();

        warn!(roots = targets.len(), "backend requested rescan; re-walking");
        for id in targets {
            self.start_scan(id, false);
        }
    }

    fn handle_unlink_deadline(&mut self, path: PathBuf) {
        if !self.pending_unlinks.remove(&path) {
            return; // collapsed into a change, or cleared by close
        }

        // If the path is back on disk the editor finished its save sequence
        // before we looked again: that is the atomic collapse, regardless of
        // whether the re-create signal reached us yet.
        if let Some(meta) = self.fresh_stat(&path) {
            if !meta.is_dir {
                debug!(?path, "unlink deadline found the file recreated; collapsing");
                if let (Some(parent), Some(name)) = (path.parent(), basename_of(&path)) {
                    self.registry.add_child(parent, &name, ChildKind::File);
                }
                self.stat_cache.insert(path.clone(), meta);
                self.emit_candidate(FsEventKind::Change, &path, Some(meta));
                return;
            }
        }

        self.emit_candidate(FsEventKind::Unlink, &path, None);
    }

    // ---- event derivation ---------------------------------------------

    /// A discovered file or directory, from a scan or a backend create.
    fn process_discovered(&mut self, path: &Path, meta: FileMeta, suppress: bool, from_scan: bool) {
        if self.closed.load(Ordering::Relaxed) {
            return;
        }

        // Ignored entries stay out of the registry entirely, so
        // `get_watched` only ever mirrors what was (or would be) announced.
        if self.is_ignored(path) {
            trace!(?path, "discovery suppressed by ignore rules");
            return;
        }

        if meta.is_dir {
            let new = !self.registry.contains(path);
            self.registry.touch(path);
            if let Some(parent) = path.parent() {
                if self.registry.contains(parent) {
                    if let Some(name) = basename_of(path) {
                        self.registry.add_child(parent, &name, ChildKind::Dir);
                    }
                }
            }
            self.stat_cache.insert(path.to_path_buf(), meta);

            if new && self.backend_kind != BackendKind::Native {
                if let Acquire::Fresh = self.throttle.try_acquire(ThrottleKind::WatchAttach, path) {
                    if let Err(err) = self.backend.subscribe(path) {
                        self.surface_fault(err);
                    }
                }
            }

            if new && !suppress && self.dir_emission_allowed(path) {
                self.emit_candidate(FsEventKind::AddDir, path, Some(meta));
            }
            if new && !from_scan {
                // A directory that appeared at runtime brings contents the
                // feed may never mention individually.
                self.start_live_scan(path);
            }
        } else {
            let Some(parent) = path.parent() else {
                return;
            };
            let Some(name) = basename_of(path) else {
                return;
            };

            let new = self.registry.add_child(parent, &name, ChildKind::File);
            self.stat_cache.insert(path.to_path_buf(), meta);

            // A watched single-file root needs its own handle on the
            // non-recursive strategies, re-attached whenever the file
            // reappears (the OS drops the old watch with the old inode).
            if self.backend_kind != BackendKind::Native
                && self.roots.values().any(|r| r.root == path)
            {
                if let Err(err) = self.backend.subscribe(path) {
                    self.surface_fault(err);
                }
            }

            if new && !suppress {
                self.emit_candidate(FsEventKind::Add, path, Some(meta));
            } else if !new && !from_scan {
                // Known file re-reported as created: treat as a change
                // (rename-over and safe-save patterns land here).
                self.emit_candidate(FsEventKind::Change, path, Some(meta));
            }
        }
    }

    fn process_modified(&mut self, path: &Path, meta: Option<FileMeta>) {
        if self.closed.load(Ordering::Relaxed) {
            return;
        }

        let meta = meta.or_else(|| self.fresh_stat(path));
        match meta {
            Some(meta) if meta.is_dir => {
                // Directory mtime churn is not a user-visible change.
                self.stat_cache.insert(path.to_path_buf(), meta);
            }
            Some(meta) => {
                if !self.is_known_file(path) {
                    // Modified something we never saw added: report the add.
                    self.process_discovered(path, meta, false, false);
                    return;
                }
                self.stat_cache.insert(path.to_path_buf(), meta);
                self.emit_candidate(FsEventKind::Change, path, Some(meta));
            }
            None => {
                // Gone by the time we looked.
                self.process_removed(path);
            }
        }
    }

    fn process_removed(&mut self, path: &Path) {
        if self.closed.load(Ordering::Relaxed) {
            return;
        }

        if let Some(settle) = &mut self.settle {
            settle.cancel(path);
        }

        if self.registry.contains(path) {
            self.remove_dir_subtree(path);
            return;
        }

        let Some(parent) = path.parent() else {
            return;
        };
        let Some(name) = basename_of(path) else {
            return;
        };

        match self.registry.remove_child(parent, &name) {
            RemoveOutcome::NotTracked => {}
            RemoveOutcome::Removed(kind) => {
                self.release_file_root_handle(path);
                self.emit_removal(path, kind);
            }
            RemoveOutcome::DirVanished(kind) => {
                self.release_file_root_handle(path);
                self.emit_removal(path, kind);
                // The parent went too; tear it down as its own removal.
                self.process_removed(&parent.to_path_buf());
            }
        }
    }

    /// A deleted single-file watch root loses its OS handle with the inode;
    /// drop our reference so a re-create attaches a fresh one.
    fn release_file_root_handle(&mut self, path: &Path) {
        if self.backend_kind != BackendKind::Native
            && self.roots.values().any(|r| r.root == path)
        {
            self.backend.unsubscribe(path);
        }
    }

    fn remove_dir_subtree(&mut self, dir: &Path) {
        let lost = self.registry.remove_subtree(dir);
        for (path, kind) in lost {
            if kind == ChildKind::Dir && self.backend_kind != BackendKind::Native {
                self.backend.unsubscribe(&path);
            }
            self.emit_removal(&path, kind);
        }

        if self.backend_kind != BackendKind::Native {
            self.backend.unsubscribe(dir);
        }
        self.stat_cache.retain(|p, _| !p.starts_with(dir));

        if let Some(parent) = dir.parent() {
            if let Some(name) = basename_of(dir) {
                let _ = self.registry.remove_child(parent, &name);
            }
        }
        self.emit_candidate(FsEventKind::UnlinkDir, dir, None);
    }

    fn emit_removal(&mut self, path: &Path, kind: ChildKind) {
        self.stat_cache.remove(path);
        match kind {
            ChildKind::Dir => self.emit_candidate(FsEventKind::UnlinkDir, path, None),
            ChildKind::File => {
                if self.opts.atomic.enabled() {
                    self.defer_unlink(path);
                } else {
                    self.emit_candidate(FsEventKind::Unlink, path, None);
                }
            }
        }
    }

    /// Hold a file `unlink` briefly; a racing `add` collapses both into one
    /// `change` (editor atomic-save pattern).
    fn defer_unlink(&mut self, path: &Path) {
        if !self.pending_unlinks.insert(path.to_path_buf()) {
            return; // at most one pending unlink per path
        }
        let tx = self.deadline_tx.clone();
        let path = path.to_path_buf();
        let delay = self.opts.atomic.delay();
        let closed = Arc::clone(&self.closed);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !closed.load(Ordering::Relaxed) {
                let _ = tx.send(path);
            }
        });
    }

    // ---- emission pipeline --------------------------------------------

    /// Steps 1–8 of the emission pipeline. Synchronous on purpose: nothing
    /// may suspend between the ignore decision and the emit.
    fn emit_candidate(&mut self, kind: FsEventKind, path: &Path, meta: Option<FileMeta>) {
        if self.closed.load(Ordering::Relaxed) {
            return;
        }

        if self.is_ignored(path) {
            trace!(?path, %kind, "suppressed by ignore rules");
            return;
        }

        // Atomic collapse: a pending unlink cancelled by this add becomes a
        // single change, which then faces the remaining gates like any
        // other change.
        let kind = if kind == FsEventKind::Add && self.pending_unlinks.remove(path) {
            debug!(?path, "unlink+add collapsed into change");
            FsEventKind::Change
        } else {
            kind
        };

        if let Some(settle) = &mut self.settle {
            if matches!(kind, FsEventKind::Add | FsEventKind::Change) {
                settle.track(kind, path);
                return;
            }
        }

        if kind == FsEventKind::Change {
            if let Acquire::Suppressed { count } =
                self.throttle.try_acquire(ThrottleKind::Change, path)
            {
                trace!(?path, count, "change throttled");
                return;
            }
        }

        let meta = if meta.is_none()
            && self.opts.always_stat
            && matches!(kind, FsEventKind::Add | FsEventKind::Change)
        {
            self.fresh_stat(path)
        } else {
            meta
        };

        self.emit_now(kind, path, meta);
    }

    /// Final emit, also used when a settled write is released.
    fn emit_now(&mut self, kind: FsEventKind, path: &Path, meta: Option<FileMeta>) {
        if self.closed.load(Ordering::Relaxed) {
            return;
        }
        let display = self.display_path(path);
        self.emit_event(Event::Path {
            kind,
            path: display,
            meta,
        });
    }

    fn emit_event(&mut self, event: Event) {
        if let Ok(mut bus) = self.bus.lock() {
            bus.emit(event);
        }
    }

    async fn poll_settled(&mut self) {
        let Some(settle) = &mut self.settle else {
            return;
        };
        let ready = settle.poll().await;
        for (kind, path, meta) in ready {
            if self.closed.load(Ordering::Relaxed) {
                return;
            }
            self.emit_now(kind, &path, Some(meta));
        }
    }

    // ---- ignore evaluation --------------------------------------------

    fn ignore_pattern_set(&mut self) -> &PatternSet {
        if self.ignore_matcher.is_none() {
            let compiled =
                PatternSet::compile(&self.ignored_patterns, self.opts.expansion_limit)
                    .unwrap_or_else(|e| {
                        warn!(error = %e, "invalid ignore pattern; ignoring none");
                        PatternSet::default()
                    });
            self.ignore_matcher = Some(compiled);
        }
        self.ignore_matcher.as_ref().unwrap()
    }

    /// The single ignore decision per event.
    fn is_ignored(&mut self, path: &Path) -> bool {
        if self.opts.atomic.enabled() && is_dotfile(path) {
            return true;
        }
        if self.ignored_paths.contains(path)
            || self
                .ignored_paths
                .iter()
                .any(|ignored| path.starts_with(ignored))
        {
            return true;
        }
        if self.ignored_patterns.is_empty() {
            return false;
        }

        let rel = self.rel_for_match(path);
        self.ignore_pattern_set().matches(&rel)
    }

    /// Ignore patterns are matched against the path relative to its watch
    /// root (so `*.tmp` means "anywhere under what you watch"), falling back
    /// to the absolute form for paths outside every root.
    fn rel_for_match(&self, path: &Path) -> String {
        for root in self.roots.values() {
            if let Ok(rel) = path.strip_prefix(&root.root) {
                let s = to_slash(rel);
                if !s.is_empty() {
                    return s;
                }
            }
        }
        to_slash(path)
    }

    // ---- helpers -------------------------------------------------------

    /// Is a backend event for this path any of our business?
    ///
    /// This is also where consolidation filtering happens: a parent-level
    /// native subscription reports siblings nobody asked about, and they
    /// fall out here.
    fn event_in_scope(&self, path: &Path) -> bool {
        // Anything the registry already tracks stays in scope: its removal
        // or change must flow even when a glob matcher would not re-match
        // the bare path string.
        if self.registry.contains(path) || self.is_known_file(path) {
            return true;
        }

        self.roots.values().any(|r| {
            if !(path == r.root || path.starts_with(&r.root)) {
                return false;
            }
            if let Some(depth) = self.opts.depth {
                let levels = path
                    .strip_prefix(&r.root)
                    .map(|rel| rel.components().count())
                    .unwrap_or(0);
                if levels > depth + 1 {
                    return false;
                }
            }
            match &r.matcher {
                Some(matcher) => {
                    // Directories pass so traversal bookkeeping works;
                    // emission is filtered separately.
                    path.is_dir()
                        || match_text(&r.pattern_base, path)
                            .map(|text| matcher.matches(&text))
                            .unwrap_or(false)
                }
                None => true,
            }
        })
    }

    /// Glob watches do not announce directories; literal watches do.
    fn dir_emission_allowed(&self, dir: &Path) -> bool {
        self.roots
            .values()
            .filter(|r| dir == r.root || dir.starts_with(&r.root))
            .any(|r| match &r.matcher {
                None => true,
                Some(matcher) => match_text(&r.pattern_base, dir)
                    .map(|text| matcher.matches(&text))
                    .unwrap_or(false),
            })
    }

    fn is_known_file(&self, path: &Path) -> bool {
        match (path.parent(), basename_of(path)) {
            (Some(parent), Some(name)) => self.registry.has_child(parent, &name),
            _ => false,
        }
    }

    fn fresh_stat(&self, path: &Path) -> Option<FileMeta> {
        let meta = if self.opts.follow_symlinks {
            std::fs::metadata(path)
        } else {
            std::fs::symlink_metadata(path)
        };
        meta.ok().map(|m| FileMeta::from_std(&m))
    }

    /// Rewrite an internal absolute path to the user's view: symlink paths
    /// they watched rather than resolved targets, then `cwd`-relative form.
    fn display_path(&self, path: &Path) -> PathBuf {
        let mut shown = path.to_path_buf();

        if self.opts.follow_symlinks {
            for (link, target) in &self.symlinks {
                if let Ok(rel) = shown.strip_prefix(target) {
                    shown = if rel.as_os_str().is_empty() {
                        link.clone()
                    } else {
                        link.join(rel)
                    };
                    break;
                }
            }
        }

        if let Some(cwd) = &self.opts.cwd {
            if let Ok(rel) = shown.strip_prefix(cwd) {
                if !rel.as_os_str().is_empty() {
                    shown = rel.to_path_buf();
                }
            }
        }

        shown
    }

    fn watched_snapshot(&self) -> BTreeMap<String, Vec<String>> {
        self.registry
            .snapshot()
            .into_iter()
            .map(|(dir, children)| {
                let shown = self.display_path(Path::new(&dir));
                (to_slash(&shown), children)
            })
            .collect()
    }

    fn surface_fault(&mut self, error: WatchError) {
        if error.is_permission() && self.opts.ignore_permission_errors {
            debug!(%error, "permission fault ignored by policy");
            return;
        }
        warn!(%error, "surfacing watch fault");
        self.emit_event(Event::Error(Arc::new(error)));
    }

    /// Close-time teardown: poison, release handles, cancel slots, drop
    /// registry state and end every subscription.
    fn teardown(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("closing watcher");

        self.backend.shutdown();
        if let Some(settle) = &mut self.settle {
            settle.clear();
        }
        self.pending_unlinks.clear();
        self.pending_retouch.clear();
        self.throttle.clear();
        self.registry.clear();
        self.stat_cache.clear();
        self.symlinks.clear();
        self.roots.clear();
        self.scans.clear();

        if let Ok(mut bus) = self.bus.lock() {
            bus.clear();
        }
    }
}

fn basename_of(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}

/// NotFound and ENOTDIR both mean "the directory is gone".
fn absorbed(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::NotFound || err.raw_os_error() == Some(20)
}

/// Construct the selected backend, downgrading to polling when the
/// event-driven feeds are hard-unavailable on this host.
fn build_backend(
    opts: &WatchOptions,
    tx: mpsc::UnboundedSender<BackendEvent>,
) -> (Box<dyn Backend>, BackendKind) {
    let poll = |tx: mpsc::UnboundedSender<BackendEvent>| {
        Box::new(PollBackend::new(
            tx,
            opts.poll_interval(),
            opts.binary_poll_interval(),
            opts.follow_symlinks,
        )) as Box<dyn Backend>
    };

    match select_kind(opts) {
        BackendKind::Poll => (poll(tx), BackendKind::Poll),
        BackendKind::Native => match NativeBackend::new(tx.clone()) {
            Ok(b) => (Box::new(b), BackendKind::Native),
            Err(e) => {
                warn!(error = %e, "native backend unavailable; falling back to polling");
                (poll(tx), BackendKind::Poll)
            }
        },
        BackendKind::PerDir => match PerDirBackend::new(tx.clone()) {
            Ok(b) => (Box::new(b), BackendKind::PerDir),
            Err(e) => {
                warn!(error = %e, "per-dir backend unavailable; falling back to polling");
                (poll(tx), BackendKind::Poll)
            }
        },
    }
}
