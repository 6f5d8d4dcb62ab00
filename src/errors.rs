// src/errors.rs

//! Crate-wide error taxonomy.
//!
//! The watcher distinguishes errors by what the orchestrator should do with
//! them, not by where they came from:
//!
//! - `NotFound` / `NotADirectory` are absorbed internally; the absence *is*
//!   the signal and surfaces as an `unlink` event when the path was tracked.
//! - `Permission` is absorbed or forwarded on the `error` channel depending
//!   on `ignore_permission_errors`.
//! - Everything else is surfaced.

use std::path::PathBuf;

use thiserror::Error;

/// Convenience alias used throughout the crate for internal plumbing.
pub type Result<T> = anyhow::Result<T>;

/// Errors surfaced by the watcher, either as return values from `watch` /
/// `add` or as payloads on the `error` channel.
#[derive(Error, Debug)]
pub enum WatchError {
    /// A backend could not be constructed at all.
    ///
    /// When the native-event backend reports this at construction, the
    /// orchestrator falls back to the polling backend instead of failing the
    /// whole watcher.
    #[error("failed to initialize {backend} backend: {reason}")]
    BackendInit { backend: &'static str, reason: String },

    /// Brace expansion of a glob would exceed the configured bound.
    ///
    /// Only the offending input is rejected; other paths in the same `add`
    /// call proceed.
    #[error("brace expansion of '{pattern}' exceeds limit of {limit}")]
    ExpansionLimit { pattern: String, limit: usize },

    /// An input that cannot name a path (currently: the empty string).
    ///
    /// Returned from `add` without changing watcher state.
    #[error("invalid watch path: {reason}")]
    InvalidArgument { reason: String },

    /// Permission denied while observing a path.
    ///
    /// Forwarded on the `error` channel unless `ignore_permission_errors`
    /// is set.
    #[error("permission denied on {path}")]
    Permission { path: PathBuf },

    /// A recoverable backend fault on a specific watch handle.
    ///
    /// The backend attempts a one-shot open/close recovery first; if that
    /// fails the fault is surfaced and the handle is dropped, leaving the
    /// rest of the watcher intact.
    #[error("watch fault on {path}: {reason}")]
    OsWatchFault { path: PathBuf, reason: String },

    /// The watcher has been closed; the operation was discarded.
    #[error("watcher is closed")]
    Closed,

    /// Any other I/O error that prevents correct future observation.
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl WatchError {
    /// Classify an `io::Error` for a given path per the propagation policy.
    ///
    /// Returns `None` for errors that are always absorbed (`NotFound`,
    /// `NotADirectory`): the caller treats the path as gone and moves on.
    pub fn from_io(path: &std::path::Path, err: std::io::Error) -> Option<Self> {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => None,
            ErrorKind::PermissionDenied => Some(WatchError::Permission {
                path: path.to_path_buf(),
            }),
            _ => {
                // ENOTDIR has no stable `ErrorKind`; it arrives as a raw OS
                // error and is absorbed like NotFound.
                if is_not_a_directory(&err) {
                    return None;
                }
                Some(WatchError::Io {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
        }
    }

    /// True for faults the permission policy may absorb.
    pub fn is_permission(&self) -> bool {
        matches!(self, WatchError::Permission { .. })
    }
}

impl From<notify::Error> for WatchError {
    fn from(e: notify::Error) -> Self {
        match e.kind {
            notify::ErrorKind::PathNotFound => WatchError::InvalidArgument {
                reason: "watched path does not exist".to_string(),
            },
            notify::ErrorKind::Io(ref io) if io.kind() == std::io::ErrorKind::PermissionDenied => {
                WatchError::Permission {
                    path: e.paths.first().cloned().unwrap_or_default(),
                }
            }
            _ => WatchError::BackendInit {
                backend: "notify",
                reason: e.to_string(),
            },
        }
    }
}

#[cfg(unix)]
fn is_not_a_directory(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(20) // ENOTDIR
}

#[cfg(not(unix))]
fn is_not_a_directory(_err: &std::io::Error) -> bool {
    false
}
