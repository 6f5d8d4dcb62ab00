// src/throttle.rs

//! Per-`(kind, path)` event throttling.
//!
//! The OS layers love to report the same physical change several times in a
//! row. A throttle slot is reserved on the first event; duplicates inside
//! the window only bump a counter. Slots expire lazily on access and via a
//! periodic sweep from the dispatcher, so no per-slot timer exists to cancel
//! at close.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::trace;

/// What is being throttled. Each kind carries its own window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThrottleKind {
    /// `change` emissions for one path.
    Change,
    /// Bursts from layered OS watch events on the same inode.
    WatchAttach,
    /// Re-listing a directory after a "something changed here" signal.
    Readdir,
}

impl ThrottleKind {
    /// Default suppression window for this kind.
    pub fn window(&self) -> Duration {
        match self {
            ThrottleKind::Change => Duration::from_millis(50),
            ThrottleKind::WatchAttach => Duration::from_millis(5),
            ThrottleKind::Readdir => Duration::from_millis(1000),
        }
    }
}

/// Outcome of [`ThrottleTable::try_acquire`].
#[derive(Debug, PartialEq, Eq)]
pub enum Acquire {
    /// First event in the window; proceed.
    Fresh,
    /// A slot is already live; the event was counted and swallowed.
    Suppressed { count: u32 },
}

#[derive(Debug)]
struct Slot {
    deadline: Instant,
    suppressed: u32,
}

/// Table of live throttle slots.
#[derive(Debug, Default)]
pub struct ThrottleTable {
    slots: HashMap<(ThrottleKind, PathBuf), Slot>,
}

impl ThrottleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a slot for `(kind, path)` or report suppression.
    ///
    /// An expired slot is treated as absent, so expiry needs no timers.
    pub fn try_acquire(&mut self, kind: ThrottleKind, path: &Path) -> Acquire {
        let now = Instant::now();
        let key = (kind, path.to_path_buf());

        match self.slots.get_mut(&key) {
            Some(slot) if now < slot.deadline => {
                slot.suppressed += 1;
                trace!(?kind, ?path, count = slot.suppressed, "event suppressed");
                Acquire::Suppressed {
                    count: slot.suppressed,
                }
            }
            _ => {
                self.slots.insert(
                    key,
                    Slot {
                        deadline: now + kind.window(),
                        suppressed: 0,
                    },
                );
                Acquire::Fresh
            }
        }
    }

    /// Drop expired slots. Called from the dispatcher's housekeeping tick.
    pub fn sweep(&mut self) {
        let now = Instant::now();
        self.slots.retain(|_, slot| now < slot.deadline);
    }

    /// Number of live slots (expired ones may linger until the next sweep).
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Drop everything. Used on close.
    pub fn clear(&mut self) {
        self.slots.clear();
    }
}
