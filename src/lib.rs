// src/lib.rs

//! watchtree: a recursive filesystem-change watcher.
//!
//! Three OS-interaction strategies (a native recursive event feed,
//! per-directory change notifications, and interval polling) are unified
//! behind one semantic event contract: `add`, `change`, `unlink`, `addDir`,
//! `unlinkDir`, `ready`, `raw` and `error` channels over the paths, globs
//! and `!`-negations you ask for.
//!
//! ```no_run
//! use watchtree::{watch, Channel, Event, WatchOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let watcher = watch(["src/**/*.rs", "!src/generated"], WatchOptions::default()).await?;
//!
//!     let mut events = watcher.on(Channel::All);
//!     while let Some(event) = events.recv().await {
//!         if let Event::Path { kind, path, .. } = event {
//!             println!("{kind}: {}", path.display());
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod errors;
pub mod events;
pub mod options;
pub mod path;
pub mod pattern;
pub mod registry;
pub mod scan;
pub mod settle;
pub mod throttle;
pub mod watcher;

pub use errors::{Result, WatchError};
pub use events::{Channel, Event, FileMeta, FsEventKind};
pub use options::{Atomic, AwaitWriteFinish, WatchOptions};
pub use watcher::{watch, Watcher};
