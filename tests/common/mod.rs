#![allow(dead_code)]

use std::path::Path;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

use watchtree::{Channel, Event, FsEventKind, WatchOptions, Watcher};

/// Install a test subscriber once; respects `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Options forcing the deterministic polling backend with a fast tick.
pub fn poll_options() -> WatchOptions {
    WatchOptions {
        use_polling: true,
        interval: 50,
        ..Default::default()
    }
}

/// Block until the watcher reports `ready` (sticky, so never racy).
pub async fn await_ready(watcher: &Watcher) {
    let mut rx = watcher.on(Channel::Ready);
    timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for ready")
        .expect("watcher closed before ready");
}

/// Wait for the next path event matching `kind` and `path`, skipping
/// unrelated events in between.
pub async fn expect_path_event(
    rx: &mut UnboundedReceiver<Event>,
    kind: FsEventKind,
    path: &Path,
    secs: u64,
) -> Event {
    let deadline = Duration::from_secs(secs);
    timeout(deadline, async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if let Event::Path {
                kind: got_kind,
                path: got_path,
                ..
            } = &event
            {
                if *got_kind == kind && got_path == path {
                    return event;
                }
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {kind} {}", path.display()))
}

/// Drain everything currently queued on the receiver.
pub fn drain(rx: &mut UnboundedReceiver<Event>) -> Vec<Event> {
    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seen.push(event);
    }
    seen
}

/// Collect all events arriving within the window.
pub async fn collect_for(rx: &mut UnboundedReceiver<Event>, window: Duration) -> Vec<Event> {
    let mut seen = Vec::new();
    let _ = timeout(window, async {
        while let Some(event) = rx.recv().await {
            seen.push(event);
        }
    })
    .await;
    seen
}

/// Path-event kinds observed for one specific path, in arrival order.
pub fn kinds_for(events: &[Event], path: &Path) -> Vec<FsEventKind> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::Path { kind, path: p, .. } if p == path => Some(*kind),
            _ => None,
        })
        .collect()
}
