// src/backend/poll.rs

//! Polling backend: interval `stat`/`readdir` snapshots.
//!
//! The fallback when nothing event-driven exists (or when the user asks for
//! it): every subscribed path gets a small timer task that stats it each
//! tick and compares against the previous snapshot. Directories compare
//! their listing and report a `DirTouched` so the dispatcher's normal
//! re-list/diff path produces the concrete events.
//!
//! Binary files poll on the slower `binary_interval`: they change in bursts
//! and nobody needs millisecond latency on a `.jpg`.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::backend::{Backend, BackendEvent, BackendKind, HandleRefs};
use crate::errors::WatchError;
use crate::events::FileMeta;

/// Extensions polled on `binary_interval` instead of `interval`.
const BINARY_EXTENSIONS: &[&str] = &[
    "3gp", "7z", "avi", "bin", "bz2", "class", "dat", "dll", "dmg", "exe", "flac", "gif", "gz",
    "ico", "iso", "jar", "jpeg", "jpg", "mkv", "mov", "mp3", "mp4", "o", "ogg", "pdf", "png",
    "rar", "so", "swf", "tar", "tgz", "wav", "webm", "webp", "woff", "woff2", "xz", "zip",
];

fn is_binary_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let lower = e.to_ascii_lowercase();
            BINARY_EXTENSIONS.binary_search(&lower.as_str()).is_ok()
        })
        .unwrap_or(false)
}

struct PollTask {
    cancelled: Arc<AtomicBool>,
    handle: tokio::task::JoinHandle<()>,
}

/// Interval-polling watcher.
pub struct PollBackend {
    events_tx: mpsc::UnboundedSender<BackendEvent>,
    interval: Duration,
    binary_interval: Duration,
    follow_symlinks: bool,
    refs: HandleRefs,
    tasks: HashMap<PathBuf, PollTask>,
}

impl std::fmt::Debug for PollBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollBackend")
            .field("interval", &self.interval)
            .field("paths", &self.refs)
            .finish_non_exhaustive()
    }
}

impl PollBackend {
    pub fn new(
        events_tx: mpsc::UnboundedSender<BackendEvent>,
        interval: Duration,
        binary_interval: Duration,
        follow_symlinks: bool,
    ) -> Self {
        info!(?interval, ?binary_interval, "polling backend initialized");
        Self {
            events_tx,
            interval,
            binary_interval,
            follow_symlinks,
            refs: HandleRefs::new(),
            tasks: HashMap::new(),
        }
    }

    fn interval_for(&self, path: &Path) -> Duration {
        if is_binary_path(path) {
            self.binary_interval
        } else {
            self.interval
        }
    }
}

impl Backend for PollBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Poll
    }

    fn subscribe(&mut self, path: &Path) -> Result<(), WatchError> {
        if !self.refs.acquire(path) {
            return Ok(());
        }

        let cancelled = Arc::new(AtomicBool::new(false));
        let is_dir = std::fs::metadata(path).map(|m| m.is_dir()).unwrap_or(false);
        let handle = if is_dir {
            tokio::spawn(poll_dir(
                path.to_path_buf(),
                self.interval,
                self.events_tx.clone(),
                Arc::clone(&cancelled),
            ))
        } else {
            tokio::spawn(poll_file(
                path.to_path_buf(),
                self.interval_for(path),
                self.follow_symlinks,
                self.events_tx.clone(),
                Arc::clone(&cancelled),
            ))
        };

        debug!(?path, is_dir, "poll task started");
        self.tasks
            .insert(path.to_path_buf(), PollTask { cancelled, handle });
        Ok(())
    }

    fn unsubscribe(&mut self, path: &Path) {
        if !self.refs.release(path) {
            return;
        }
        if let Some(task) = self.tasks.remove(path) {
            task.cancelled.store(true, Ordering::Relaxed);
            task.handle.abort();
        }
    }

    fn shutdown(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.cancelled.store(true, Ordering::Relaxed);
            task.handle.abort();
        }
        self.refs.clear();
    }
}

/// Stat loop for a single file.
async fn poll_file(
    path: PathBuf,
    interval: Duration,
    follow_symlinks: bool,
    tx: mpsc::UnboundedSender<BackendEvent>,
    cancelled: Arc<AtomicBool>,
) {
    let mut prev = stat(&path, follow_symlinks).await;

    loop {
        tokio::time::sleep(interval).await;
        if cancelled.load(Ordering::Relaxed) {
            return;
        }

        let current = stat(&path, follow_symlinks).await;
        let send_ok = match (&prev, &current) {
            (Some(old), Some(new)) => {
                if old.ino.is_some() && old.ino != new.ino {
                    // Rename-over replaced the inode: reset the snapshot so
                    // the replacement keeps being tracked, and report the
                    // swap as a change.
                    trace!(?path, "inode changed between ticks");
                    tx.send(BackendEvent::Modified {
                        path: path.clone(),
                        meta: Some(*new),
                    })
                    .is_ok()
                } else if old.size != new.size
                    || old.mtime_ms != new.mtime_ms
                    || new.mtime_ms == Some(0)
                {
                    tx.send(BackendEvent::Modified {
                        path: path.clone(),
                        meta: Some(*new),
                    })
                    .is_ok()
                } else {
                    true
                }
            }
            (Some(_), None) => tx
                .send(BackendEvent::Removed { path: path.clone() })
                .is_ok(),
            (None, Some(new)) => tx
                .send(BackendEvent::Created {
                    path: path.clone(),
                    meta: Some(*new),
                })
                .is_ok(),
            (None, None) => true,
        };

        if !send_ok {
            return; // dispatcher is gone
        }
        prev = current;
    }
}

/// Listing loop for a directory; differences defer to the dispatcher's
/// re-list/diff machinery via `DirTouched`.
async fn poll_dir(
    dir: PathBuf,
    interval: Duration,
    tx: mpsc::UnboundedSender<BackendEvent>,
    cancelled: Arc<AtomicBool>,
) {
    let mut prev = list_dir(&dir).await;

    loop {
        tokio::time::sleep(interval).await;
        if cancelled.load(Ordering::Relaxed) {
            return;
        }

        let current = list_dir(&dir).await;
        if current != prev {
            if tx
                .send(BackendEvent::DirTouched { dir: dir.clone() })
                .is_err()
            {
                return;
            }
        }
        prev = current;
    }
}

async fn stat(path: &Path, follow_symlinks: bool) -> Option<FileMeta> {
    let result = if follow_symlinks {
        tokio::fs::metadata(path).await
    } else {
        tokio::fs::symlink_metadata(path).await
    };
    result.ok().map(|m| FileMeta::from_std(&m))
}

/// Name → (size, mtime) listing used as the directory snapshot.
async fn list_dir(dir: &Path) -> Option<BTreeMap<String, (u64, Option<u64>)>> {
    let mut entries = tokio::fs::read_dir(dir).await.ok()?;
    let mut listing = BTreeMap::new();

    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Ok(meta) = entry.metadata().await {
            let fm = FileMeta::from_std(&meta);
            listing.insert(name, (fm.size, fm.mtime_ms));
        }
    }
    Some(listing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::time::timeout;

    #[test]
    fn binary_extension_table_is_sorted_and_matches() {
        let mut sorted = BINARY_EXTENSIONS.to_vec();
        sorted.sort_unstable();
        assert_eq!(sorted, BINARY_EXTENSIONS, "binary_search needs sorted input");

        assert!(is_binary_path(Path::new("movie.MP4")));
        assert!(is_binary_path(Path::new("a/b/archive.tar")));
        assert!(!is_binary_path(Path::new("main.rs")));
        assert!(!is_binary_path(Path::new("Makefile")));
    }

    #[tokio::test]
    async fn file_change_is_detected_within_two_ticks() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("y.txt");
        std::fs::write(&file, b"one").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut backend = PollBackend::new(tx, Duration::from_millis(20), Duration::from_millis(40), true);
        backend.subscribe(&file).unwrap();

        std::fs::write(&file, b"two!").unwrap();

        let event = timeout(Duration::from_millis(500), async {
            loop {
                match rx.recv().await {
                    Some(BackendEvent::Modified { path, .. }) => break path,
                    Some(_) => continue,
                    None => panic!("channel closed"),
                }
            }
        })
        .await
        .expect("no change within timeout");

        assert_eq!(event, file);
        backend.shutdown();
    }

    #[tokio::test]
    async fn removal_and_reappearance_round_trip() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("z.txt");
        std::fs::write(&file, b"x").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut backend = PollBackend::new(tx, Duration::from_millis(20), Duration::from_millis(40), true);
        backend.subscribe(&file).unwrap();

        std::fs::remove_file(&file).unwrap();
        let removed = timeout(Duration::from_millis(500), async {
            loop {
                match rx.recv().await {
                    Some(BackendEvent::Removed { path }) => break path,
                    Some(_) => continue,
                    None => panic!("channel closed"),
                }
            }
        })
        .await
        .expect("no removal within timeout");
        assert_eq!(removed, file);

        std::fs::write(&file, b"back").unwrap();
        let created = timeout(Duration::from_millis(500), async {
            loop {
                match rx.recv().await {
                    Some(BackendEvent::Created { path, .. }) => break path,
                    Some(_) => continue,
                    None => panic!("channel closed"),
                }
            }
        })
        .await
        .expect("no create within timeout");
        assert_eq!(created, file);

        backend.shutdown();
    }

    #[tokio::test]
    async fn directory_listing_difference_signals_touch() {
        let tmp = TempDir::new().unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut backend = PollBackend::new(tx, Duration::from_millis(20), Duration::from_millis(40), true);
        backend.subscribe(tmp.path()).unwrap();

        std::fs::write(tmp.path().join("new.txt"), b"x").unwrap();

        let touched = timeout(Duration::from_millis(500), async {
            loop {
                match rx.recv().await {
                    Some(BackendEvent::DirTouched { dir }) => break dir,
                    Some(_) => continue,
                    None => panic!("channel closed"),
                }
            }
        })
        .await
        .expect("no dir touch within timeout");

        assert_eq!(touched, tmp.path());
        backend.shutdown();
    }
}
