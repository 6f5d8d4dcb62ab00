mod common;

use std::error::Error;
use std::io::Write;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tokio::time::sleep;

use common::{
    await_ready, collect_for, drain, expect_path_event, init_tracing, kinds_for, poll_options,
};
use watchtree::{watch, AwaitWriteFinish, Channel, Event, FsEventKind, WatchOptions};

type TestResult = Result<(), Box<dyn Error>>;

/// Start on an empty directory; a file created after `ready` produces
/// exactly one `add`.
#[tokio::test]
async fn create_after_ready_emits_add() -> TestResult {
    init_tracing();
    let tmp = TempDir::new()?;
    let root = tmp.path().join("work");
    std::fs::create_dir(&root)?;

    let watcher = watch([root.to_str().unwrap()], poll_options()).await?;
    let mut all = watcher.on(Channel::All);
    await_ready(&watcher).await;
    drain(&mut all);

    let file = root.join("a");
    std::fs::write(&file, b"hello")?;

    expect_path_event(&mut all, FsEventKind::Add, &file, 5).await;

    watcher.close().await?;
    Ok(())
}

/// `ignore_initial` keeps the pre-existing tree silent through `ready`.
#[tokio::test]
async fn ignore_initial_suppresses_scan_events() -> TestResult {
    init_tracing();
    let tmp = TempDir::new()?;
    let root = tmp.path().join("work");
    std::fs::create_dir(&root)?;
    std::fs::write(root.join("b"), b"existing")?;

    let opts = WatchOptions {
        ignore_initial: true,
        ..poll_options()
    };
    let watcher = watch([root.to_str().unwrap()], opts).await?;
    let mut all = watcher.on(Channel::All);
    await_ready(&watcher).await;

    assert!(
        drain(&mut all).is_empty(),
        "no events may precede ready with ignore_initial"
    );

    // The registry still knows the tree.
    let watched = watcher.get_watched().await?;
    let children = watched
        .get(&root.to_string_lossy().replace('\\', "/"))
        .cloned()
        .unwrap_or_default();
    assert!(children.contains(&"b".to_string()));

    watcher.close().await?;
    Ok(())
}

/// Atomic editor save (unlink, then add within the window) collapses into a
/// single `change`.
#[tokio::test]
async fn atomic_save_collapses_to_change() -> TestResult {
    init_tracing();
    let tmp = TempDir::new()?;
    let root = tmp.path().join("work");
    std::fs::create_dir(&root)?;
    let file = root.join("c");
    std::fs::write(&file, b"version one")?;

    let watcher = watch([root.to_str().unwrap()], poll_options()).await?;
    let mut all = watcher.on(Channel::All);
    await_ready(&watcher).await;
    drain(&mut all);

    // Editor-style save: remove, then promptly recreate with new content.
    std::fs::remove_file(&file)?;
    sleep(Duration::from_millis(30)).await;
    std::fs::write(&file, b"version two, longer")?;

    expect_path_event(&mut all, FsEventKind::Change, &file, 5).await;

    // Give any stray unlink/add time to surface, then check none did.
    let tail = collect_for(&mut all, Duration::from_millis(600)).await;
    let kinds = kinds_for(&tail, &file);
    assert!(
        !kinds.contains(&FsEventKind::Unlink) && !kinds.contains(&FsEventKind::Add),
        "atomic save must not leak unlink/add, saw {kinds:?}"
    );

    watcher.close().await?;
    Ok(())
}

/// `await_write_finish` holds the `add` until the file stops growing.
#[tokio::test]
async fn write_settle_gates_growing_file() -> TestResult {
    init_tracing();
    let tmp = TempDir::new()?;
    let root = tmp.path().join("work");
    std::fs::create_dir(&root)?;

    let opts = WatchOptions {
        await_write_finish: Some(AwaitWriteFinish {
            stability_threshold: 200,
            poll_interval: 50,
        }),
        ..poll_options()
    };
    let watcher = watch([root.to_str().unwrap()], opts).await?;
    let mut all = watcher.on(Channel::All);
    await_ready(&watcher).await;
    drain(&mut all);

    // Grow the file in bursts for roughly half a second.
    let big = root.join("big");
    let mut handle = std::fs::File::create(&big)?;
    let mut last_write = Instant::now();
    for _ in 0..6 {
        handle.write_all(&[0u8; 4096])?;
        handle.sync_all()?;
        last_write = Instant::now();
        assert!(
            drain(&mut all).is_empty(),
            "no emission while the file is still growing"
        );
        sleep(Duration::from_millis(80)).await;
    }
    drop(handle);

    let event = expect_path_event(&mut all, FsEventKind::Add, &big, 5).await;
    assert!(
        last_write.elapsed() >= Duration::from_millis(180),
        "add released before the stability threshold"
    );
    if let Event::Path { meta, .. } = event {
        assert_eq!(meta.expect("settled add carries a stat").size, 6 * 4096);
    }

    watcher.close().await?;
    Ok(())
}

/// Rename-over replacement is reported as `change` by the polling backend.
#[tokio::test]
async fn rename_over_reports_change() -> TestResult {
    init_tracing();
    let tmp = TempDir::new()?;
    let root = tmp.path().join("work");
    std::fs::create_dir(&root)?;
    let target = root.join("y");
    std::fs::write(&target, b"old contents")?;

    let watcher = watch([root.to_str().unwrap()], poll_options()).await?;
    let mut all = watcher.on(Channel::All);
    await_ready(&watcher).await;
    drain(&mut all);

    // Safe-save pattern: write a replacement, then rename it over the
    // original.
    let staging = root.join("y.new");
    std::fs::write(&staging, b"new contents that differ")?;
    std::fs::rename(&staging, &target)?;

    expect_path_event(&mut all, FsEventKind::Change, &target, 5).await;

    watcher.close().await?;
    Ok(())
}

/// Deleting a tracked file emits `unlink`; deleting a tracked directory
/// tears down the whole subtree.
#[tokio::test]
async fn removals_emit_unlink_and_unlink_dir() -> TestResult {
    init_tracing();
    let tmp = TempDir::new()?;
    let root = tmp.path().join("work");
    std::fs::create_dir_all(root.join("sub"))?;
    std::fs::write(root.join("sub/inner.txt"), b"x")?;
    std::fs::write(root.join("top.txt"), b"x")?;

    let opts = WatchOptions {
        // Plain deletions, no editor heuristics in this test.
        atomic: watchtree::Atomic::Flag(false),
        ..poll_options()
    };
    let watcher = watch([root.to_str().unwrap()], opts).await?;
    let mut all = watcher.on(Channel::All);
    await_ready(&watcher).await;
    drain(&mut all);

    std::fs::remove_file(root.join("top.txt"))?;
    expect_path_event(&mut all, FsEventKind::Unlink, &root.join("top.txt"), 5).await;

    std::fs::remove_dir_all(root.join("sub"))?;
    expect_path_event(&mut all, FsEventKind::Unlink, &root.join("sub/inner.txt"), 5).await;
    expect_path_event(&mut all, FsEventKind::UnlinkDir, &root.join("sub"), 5).await;

    watcher.close().await?;
    Ok(())
}

/// A pure mtime touch with no size movement still counts as a change.
#[tokio::test]
async fn mtime_touch_reports_change() -> TestResult {
    use filetime::{set_file_mtime, FileTime};
    use std::time::SystemTime;

    init_tracing();
    let tmp = TempDir::new()?;
    let root = tmp.path().join("work");
    std::fs::create_dir(&root)?;
    let target = root.join("touched.txt");
    std::fs::write(&target, b"stable size")?;

    let watcher = watch([root.to_str().unwrap()], poll_options()).await?;
    let mut all = watcher.on(Channel::All);
    await_ready(&watcher).await;
    drain(&mut all);

    let back_then = SystemTime::now() - Duration::from_secs(600);
    set_file_mtime(&target, FileTime::from_system_time(back_then))?;

    expect_path_event(&mut all, FsEventKind::Change, &target, 5).await;

    watcher.close().await?;
    Ok(())
}

/// The initial scan announces the existing tree before `ready`.
#[tokio::test]
async fn initial_scan_announces_existing_entries() -> TestResult {
    init_tracing();
    let tmp = TempDir::new()?;
    let root = tmp.path().join("work");
    std::fs::create_dir_all(root.join("nested"))?;
    std::fs::write(root.join("one.txt"), b"1")?;
    std::fs::write(root.join("nested/two.txt"), b"2")?;

    // Subscribe before adding the path so the scan's own events are seen.
    let watcher = watch([] as [&str; 0], poll_options()).await?;
    let mut all = watcher.on(Channel::All);
    watcher.add([root.to_str().unwrap()]).await?;
    await_ready(&watcher).await;

    let events = drain(&mut all);
    assert_eq!(kinds_for(&events, &root.join("one.txt")), vec![FsEventKind::Add]);
    assert_eq!(
        kinds_for(&events, &root.join("nested/two.txt")),
        vec![FsEventKind::Add]
    );
    assert_eq!(
        kinds_for(&events, &root.join("nested")),
        vec![FsEventKind::AddDir]
    );

    watcher.close().await?;
    Ok(())
}
