// src/watcher/mod.rs

//! The user-facing watcher handle.
//!
//! [`watch`] wires the pieces together: options are finalized (environment
//! overrides, validation), the dispatcher task is spawned with its backend,
//! and the initial inputs are submitted. The returned [`Watcher`] is a thin
//! handle over a command channel; dropping every handle closes the watcher
//! the same way [`Watcher::close`] does.

mod dispatch;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::errors::WatchError;
use crate::events::{Channel, Event, EventBus};
use crate::options::WatchOptions;

use dispatch::{Command, Dispatcher};

/// Create a watcher and immediately subscribe to `paths`.
///
/// Inputs may be literal files or directories, glob patterns, or
/// `!`-negated patterns (which populate the ignore set). The call returns
/// once the inputs are accepted; subscribe to [`Channel::Ready`] to learn
/// when the initial scan has finished (`ready` is sticky, so subscribing
/// late still resolves).
///
/// The initial scan starts as soon as an input is accepted. To observe the
/// scan's own `add`/`addDir` events, create the watcher with no paths,
/// subscribe, and then call [`Watcher::add`]:
///
/// ```no_run
/// # use watchtree::{watch, Channel, WatchOptions};
/// # async fn demo() -> anyhow::Result<()> {
/// let watcher = watch([] as [&str; 0], WatchOptions::default()).await?;
/// let mut events = watcher.on(Channel::All);
/// watcher.add(["src"]).await?;
/// # Ok(()) }
/// ```
pub async fn watch<I, S>(paths: I, mut options: WatchOptions) -> Result<Watcher>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    options.apply_env_overrides();
    options.validate()?;

    let bus = Arc::new(Mutex::new(EventBus::new()));
    let closed = Arc::new(AtomicBool::new(false));
    let commands = Dispatcher::spawn(options, Arc::clone(&bus), Arc::clone(&closed));

    let watcher = Watcher {
        commands,
        bus,
        closed,
    };
    watcher.add(paths).await?;
    Ok(watcher)
}

/// Handle to a running watcher.
///
/// Cheap to clone; all clones drive the same dispatcher. The watcher closes
/// when [`Watcher::close`] is called or the last handle is dropped.
#[derive(Clone)]
pub struct Watcher {
    commands: mpsc::UnboundedSender<Command>,
    bus: Arc<Mutex<EventBus>>,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Watcher {
    /// Subscribe to one event channel.
    ///
    /// Every subscriber gets its own receiver; events are delivered to the
    /// `all` channel plus the channel matching their kind. Receivers end
    /// (return `None`) once the watcher closes.
    pub fn on(&self, channel: Channel) -> mpsc::UnboundedReceiver<Event> {
        let mut bus = self.bus.lock().expect("event bus poisoned");
        let rx = bus.subscribe(channel);
        if self.is_closed() {
            // Nothing will ever emit again; end the stream immediately
            // instead of handing back a receiver that hangs.
            bus.clear();
        }
        rx
    }

    /// Add more paths, globs or `!`-negations to the running watcher.
    pub async fn add<I, S>(&self, paths: I) -> Result<(), WatchError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let inputs: Vec<String> = paths.into_iter().map(Into::into).collect();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Add {
                inputs,
                reply: reply_tx,
            })
            .map_err(|_| WatchError::Closed)?;
        reply_rx.await.map_err(|_| WatchError::Closed)?
    }

    /// Stop watching the given paths and add them to the ignore set.
    ///
    /// No `unlink` events are emitted for entries that disappear from the
    /// watch this way.
    pub async fn unwatch<I, S>(&self, paths: I) -> Result<(), WatchError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let inputs: Vec<String> = paths.into_iter().map(Into::into).collect();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Unwatch {
                inputs,
                reply: reply_tx,
            })
            .map_err(|_| WatchError::Closed)?;
        reply_rx.await.map_err(|_| WatchError::Closed)
    }

    /// Map of watched directory → sorted child basenames.
    pub async fn get_watched(&self) -> Result<BTreeMap<String, Vec<String>>, WatchError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::GetWatched { reply: reply_tx })
            .map_err(|_| WatchError::Closed)?;
        reply_rx.await.map_err(|_| WatchError::Closed)
    }

    /// Close the watcher: release every backend handle, cancel pending
    /// slots, drop registry state. Resolves once teardown is complete; no
    /// events are emitted afterwards.
    pub async fn close(&self) -> Result<(), WatchError> {
        if self.is_closed() {
            return Ok(());
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Close { reply: reply_tx })
            .is_err()
        {
            // Dispatcher already gone; that is a completed close.
            return Ok(());
        }
        let _ = reply_rx.await;
        debug!("watcher closed");
        Ok(())
    }

    /// Has the watcher been closed (explicitly or by handle drop)?
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
