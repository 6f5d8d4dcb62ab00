// src/settle.rs

//! Write-settle tracking for `await_write_finish`.
//!
//! An `add` or `change` for a path is not emitted while the file is still
//! being written. The dispatcher parks the event in a pending-write slot and
//! polls the file's size; once the size has held still across two
//! consecutive polls and the stability threshold has elapsed since the last
//! observed movement, the suppressed event goes out carrying the final stat.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{debug, trace};

use crate::events::{FileMeta, FsEventKind};
use crate::options::AwaitWriteFinish;

#[derive(Debug)]
struct PendingWrite {
    /// The suppressed event kind; an `add` followed by further writes is
    /// still emitted as `add`.
    kind: FsEventKind,
    last_change: Instant,
    last_size: Option<u64>,
    /// Consecutive polls that observed the same size.
    stable_polls: u32,
}

/// Dispatcher-owned table of pending-write slots.
///
/// At most one slot exists per path; a second `add`/`change` while a slot is
/// live just resets nothing and rides the existing wait.
#[derive(Debug)]
pub struct SettleTracker {
    cfg: AwaitWriteFinish,
    slots: HashMap<PathBuf, PendingWrite>,
}

impl SettleTracker {
    pub fn new(cfg: AwaitWriteFinish) -> Self {
        Self {
            cfg,
            slots: HashMap::new(),
        }
    }

    /// Park an `add`/`change` for `path`. Returns true when a new slot was
    /// created (first event for this path).
    pub fn track(&mut self, kind: FsEventKind, path: &Path) -> bool {
        if self.slots.contains_key(path) {
            trace!(?path, "write-settle slot already pending");
            return false;
        }
        self.slots.insert(
            path.to_path_buf(),
            PendingWrite {
                kind,
                last_change: Instant::now(),
                last_size: None,
                stable_polls: 0,
            },
        );
        true
    }

    /// Cancel the wait for `path` (racing unlink). The suppressed event is
    /// never emitted.
    pub fn cancel(&mut self, path: &Path) {
        if self.slots.remove(path).is_some() {
            debug!(?path, "write-settle wait cancelled by unlink");
        }
    }

    /// Is a slot live for `path`?
    pub fn is_pending(&self, path: &Path) -> bool {
        self.slots.contains_key(path)
    }

    /// Any slots at all? Lets the dispatcher skip the poll tick entirely.
    pub fn has_pending(&self) -> bool {
        !self.slots.is_empty()
    }

    /// One poll pass over every slot.
    ///
    /// Stats each pending path; returns the events whose files have settled,
    /// each carrying the final stat. Paths that stopped existing are dropped
    /// silently (the racing unlink reports independently).
    pub async fn poll(&mut self) -> Vec<(FsEventKind, PathBuf, FileMeta)> {
        let paths: Vec<PathBuf> = self.slots.keys().cloned().collect();
        let mut ready = Vec::new();

        for path in paths {
            let meta = match tokio::fs::metadata(&path).await {
                Ok(m) => m,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    self.slots.remove(&path);
                    continue;
                }
                Err(e) => {
                    trace!(?path, error = %e, "write-settle stat failed; keeping slot");
                    continue;
                }
            };

            let Some(slot) = self.slots.get_mut(&path) else {
                continue;
            };

            let size = meta.len();
            match slot.last_size {
                Some(prev) if prev == size => {
                    slot.stable_polls += 1;
                }
                _ => {
                    slot.last_size = Some(size);
                    slot.last_change = Instant::now();
                    slot.stable_polls = 0;
                    continue;
                }
            }

            let settled = slot.stable_polls >= 1
                && slot.last_change.elapsed() >= self.cfg.stability_threshold();
            if settled {
                let kind = slot.kind;
                self.slots.remove(&path);
                debug!(?path, %kind, "write settled; releasing suppressed event");
                ready.push((kind, path, FileMeta::from_std(&meta)));
            }
        }

        ready
    }

    /// Drop all slots. Used on close.
    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::TempDir;

    fn tracker(threshold_ms: u64) -> SettleTracker {
        SettleTracker::new(AwaitWriteFinish {
            stability_threshold: threshold_ms,
            poll_interval: 10,
        })
    }

    #[tokio::test]
    async fn growing_file_is_held_back() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("big.bin");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"aaaa").unwrap();
        f.sync_all().unwrap();

        let mut tracker = tracker(30);
        assert!(tracker.track(FsEventKind::Add, &path));

        // First poll records the size; nothing settles.
        assert!(tracker.poll().await.is_empty());

        // Grow the file; the stability clock resets.
        f.write_all(b"bbbb").unwrap();
        f.sync_all().unwrap();
        assert!(tracker.poll().await.is_empty());

        // Two stable polls plus threshold elapsed: the add is released.
        assert!(tracker.poll().await.is_empty());
        tokio::time::sleep(Duration::from_millis(40)).await;
        let ready = tracker.poll().await;
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].0, FsEventKind::Add);
        assert_eq!(ready[0].2.size, 8);
        assert!(!tracker.has_pending());
    }

    #[tokio::test]
    async fn vanished_file_drops_slot_silently() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("gone.txt");
        std::fs::write(&path, b"x").unwrap();

        let mut tracker = tracker(10);
        tracker.track(FsEventKind::Change, &path);
        std::fs::remove_file(&path).unwrap();

        assert!(tracker.poll().await.is_empty());
        assert!(!tracker.has_pending());
    }

    #[tokio::test]
    async fn cancel_prevents_emission() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("c.txt");
        std::fs::write(&path, b"x").unwrap();

        let mut tracker = tracker(0);
        tracker.track(FsEventKind::Add, &path);
        tracker.cancel(&path);

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(tracker.poll().await.is_empty());
    }

    #[test]
    fn at_most_one_slot_per_path() {
        let mut tracker = tracker(10);
        let path = Path::new("/tmp/x");
        assert!(tracker.track(FsEventKind::Add, path));
        assert!(!tracker.track(FsEventKind::Change, path));
    }
}
