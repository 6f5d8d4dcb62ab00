// src/events.rs

//! The public event model and the channel fan-out.
//!
//! Every observation the engine makes is normalized into an [`Event`] and
//! emitted on the `all` channel plus the channel matching its kind.
//! Subscribers pull events from unbounded mpsc receivers so a slow consumer
//! never stalls the dispatcher.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use tokio::sync::mpsc;

use crate::errors::WatchError;

/// Semantic kind of a path-carrying event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FsEventKind {
    Add,
    AddDir,
    Change,
    Unlink,
    UnlinkDir,
}

impl FsEventKind {
    /// True for the kinds that describe a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self, FsEventKind::AddDir | FsEventKind::UnlinkDir)
    }

    /// The removal kind matching this kind's subject.
    pub fn removal(&self) -> FsEventKind {
        if self.is_dir() {
            FsEventKind::UnlinkDir
        } else {
            FsEventKind::Unlink
        }
    }
}

impl std::fmt::Display for FsEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FsEventKind::Add => "add",
            FsEventKind::AddDir => "addDir",
            FsEventKind::Change => "change",
            FsEventKind::Unlink => "unlink",
            FsEventKind::UnlinkDir => "unlinkDir",
        };
        f.write_str(s)
    }
}

/// Subscription channels exposed by [`crate::Watcher::on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    All,
    Add,
    AddDir,
    Change,
    Unlink,
    UnlinkDir,
    Ready,
    Raw,
    Error,
}

/// A platform stat record attached to events when available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMeta {
    pub size: u64,
    /// Modification time in milliseconds since the epoch, when the platform
    /// reports one.
    pub mtime_ms: Option<u64>,
    /// Inode number on unix platforms.
    pub ino: Option<u64>,
    /// Raw mode bits on unix platforms.
    pub mode: Option<u32>,
    pub is_file: bool,
    pub is_dir: bool,
    pub is_symlink: bool,
}

impl FileMeta {
    /// Build from a `std::fs::Metadata`.
    pub fn from_std(meta: &std::fs::Metadata) -> Self {
        let mtime_ms = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64);

        #[cfg(unix)]
        let (ino, mode) = {
            use std::os::unix::fs::MetadataExt;
            (Some(meta.ino()), Some(meta.mode()))
        };
        #[cfg(not(unix))]
        let (ino, mode) = (None, None);

        Self {
            size: meta.len(),
            mtime_ms,
            ino,
            mode,
            is_file: meta.is_file(),
            is_dir: meta.is_dir(),
            is_symlink: meta.file_type().is_symlink(),
        }
    }
}

/// One event as delivered to subscribers.
#[derive(Debug, Clone)]
pub enum Event {
    /// A path-carrying semantic event (`add`, `change`, `unlink`, ...).
    Path {
        kind: FsEventKind,
        path: PathBuf,
        meta: Option<FileMeta>,
    },
    /// Initial scan of all watched inputs has completed. Fires once.
    Ready,
    /// An unprocessed backend notification, for debugging.
    Raw {
        backend: &'static str,
        path: Option<PathBuf>,
        detail: String,
    },
    /// A fault that prevents correct future observation of some path.
    Error(Arc<WatchError>),
}

impl Event {
    /// The channel this event belongs to (besides `all`).
    pub fn channel(&self) -> Channel {
        match self {
            Event::Path { kind, .. } => match kind {
                FsEventKind::Add => Channel::Add,
                FsEventKind::AddDir => Channel::AddDir,
                FsEventKind::Change => Channel::Change,
                FsEventKind::Unlink => Channel::Unlink,
                FsEventKind::UnlinkDir => Channel::UnlinkDir,
            },
            Event::Ready => Channel::Ready,
            Event::Raw { .. } => Channel::Raw,
            Event::Error(_) => Channel::Error,
        }
    }

    /// The path this event refers to, when it has one.
    pub fn path(&self) -> Option<&std::path::Path> {
        match self {
            Event::Path { path, .. } => Some(path),
            Event::Raw { path, .. } => path.as_deref(),
            _ => None,
        }
    }
}

/// Fan-out of events to the `all` channel and per-kind channels.
///
/// Senders whose receiver has been dropped are pruned on the next emit, so
/// abandoned subscriptions do not accumulate.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: HashMap<Channel, Vec<mpsc::UnboundedSender<Event>>>,
    /// `ready` is sticky: it fires once, and a `ready` subscription opened
    /// after the fact receives it immediately instead of hanging forever.
    ready_seen: bool,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new subscription on the given channel.
    pub fn subscribe(&mut self, channel: Channel) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        if channel == Channel::Ready && self.ready_seen {
            let _ = tx.send(Event::Ready);
        }
        self.subscribers.entry(channel).or_default().push(tx);
        rx
    }

    /// Deliver an event to `all` subscribers and to its own channel.
    ///
    /// `raw` events are intentionally excluded from `all`: they duplicate the
    /// semantic events and exist for diagnostics only.
    pub fn emit(&mut self, event: Event) {
        if matches!(event, Event::Ready) {
            if self.ready_seen {
                return; // ready never re-fires
            }
            self.ready_seen = true;
        }
        let channel = event.channel();
        if channel != Channel::Raw {
            self.send_on(Channel::All, &event);
        }
        self.send_on(channel, &event);
    }

    fn send_on(&mut self, channel: Channel, event: &Event) {
        if let Some(senders) = self.subscribers.get_mut(&channel) {
            senders.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    /// Drop every subscription; used on close so receivers observe
    /// end-of-stream.
    pub fn clear(&mut self) {
        self.subscribers.clear();
    }
}
