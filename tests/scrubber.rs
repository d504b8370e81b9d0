use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::tempdir;

use query_harness::scrubber::{
    register_scrubber, ScrubReport, Scrubber, ScrubberConfig, LAST_SCRUB_TIME_KEY,
};
use query_harness::state::{GlobalState, MemoryGlobalState, SqliteGlobalState};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

fn query_dir(root: &Path, name: &str, timestamp: Option<&str>) -> PathBuf {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("results.bqrs"), b"rows").unwrap();
    if let Some(timestamp) = timestamp {
        std::fs::write(dir.join("timestamp"), timestamp).unwrap();
    }
    dir
}

fn config(roots: Vec<PathBuf>, throttle: Duration) -> ScrubberConfig {
    ScrubberConfig {
        wake_interval: Duration::from_secs(3600),
        throttle,
        max_query_age: Duration::from_secs(10 * 24 * 60 * 60),
        roots,
    }
}

#[tokio::test]
async fn expired_invalid_and_stray_entries_are_removed() {
    let root = tempdir().unwrap();
    let now = 100 * DAY_MS;
    let fresh = query_dir(root.path(), "fresh", Some(&(now - DAY_MS).to_string()));
    let boundary = query_dir(root.path(), "boundary", Some(&(now - 10 * DAY_MS).to_string()));
    let old = query_dir(root.path(), "old", Some(&(now - 10 * DAY_MS - 1).to_string()));
    let garbage = query_dir(root.path(), "garbage", Some("yesterday"));
    let unmarked = query_dir(root.path(), "unmarked", None);
    let stray = root.path().join("stray.txt");
    std::fs::write(&stray, "x").unwrap();

    let scrubber = Scrubber::new(
        config(vec![root.path().to_path_buf()], Duration::ZERO),
        Arc::new(MemoryGlobalState::new()),
    );
    let report = scrubber.scrub_at(now).await;

    assert!(fresh.exists());
    assert!(boundary.exists(), "exactly max age is kept");
    assert!(!old.exists());
    assert!(!garbage.exists());
    assert!(!unmarked.exists());
    assert!(!stray.exists());
    assert_eq!(report.deleted, 4);
    assert_eq!(report.kept, 2);
    assert!(report.errors.is_empty());
}

#[tokio::test]
async fn missing_roots_are_ignored() {
    let root = tempdir().unwrap();
    let scrubber = Scrubber::new(
        config(vec![root.path().join("does-not-exist")], Duration::ZERO),
        Arc::new(MemoryGlobalState::new()),
    );
    let report = scrubber.scrub_at(DAY_MS).await;
    assert_eq!(report.deleted + report.kept, 0);
    assert!(report.errors.is_empty());
}

#[tokio::test]
async fn throttle_is_shared_through_global_state() {
    let root = tempdir().unwrap();
    let storage = tempdir().unwrap();
    let state_path = storage.path().join("global-state.sqlite");
    let throttle = Duration::from_secs(2 * 60 * 60);
    let now = 50 * DAY_MS;

    let first = Scrubber::new(
        config(vec![root.path().to_path_buf()], throttle),
        Arc::new(SqliteGlobalState::new(&state_path).unwrap()),
    );
    let second = Scrubber::new(
        config(vec![root.path().to_path_buf()], throttle),
        Arc::new(SqliteGlobalState::new(&state_path).unwrap()),
    );

    assert!(first.tick_at(now).await.unwrap().is_some());
    // A second process inside the window does nothing.
    let stale = query_dir(root.path(), "unmarked", None);
    assert!(second.tick_at(now + 1_000).await.unwrap().is_none());
    assert!(stale.exists());

    let throttle_ms = throttle.as_millis() as i64;
    assert!(second.tick_at(now + throttle_ms).await.unwrap().is_some());
    assert!(!stale.exists());

    let state = SqliteGlobalState::new(&state_path).unwrap();
    assert_eq!(
        state.get(LAST_SCRUB_TIME_KEY).await.unwrap(),
        Some(json!(now + throttle_ms))
    );
}

#[tokio::test]
async fn scrub_now_ignores_a_last_run_in_the_future() {
    let root = tempdir().unwrap();
    let stale = query_dir(root.path(), "unmarked", None);
    let now = 20 * DAY_MS;
    let state = Arc::new(MemoryGlobalState::new());
    // Written by a window whose clock runs ahead.
    state.set(LAST_SCRUB_TIME_KEY, json!(now + DAY_MS)).await.unwrap();

    let scrubber = Scrubber::new(
        config(vec![root.path().to_path_buf()], Duration::from_secs(3600)),
        state.clone(),
    );
    assert!(scrubber.tick_at(now).await.unwrap().is_none());
    assert!(stale.exists());

    let report = scrubber.scrub_now_at(now).await.unwrap();
    assert_eq!(report.deleted, 1);
    assert!(!stale.exists());
    assert_eq!(state.get(LAST_SCRUB_TIME_KEY).await.unwrap(), Some(json!(now)));
}

#[tokio::test]
async fn registered_scrubber_runs_once_per_throttle_window() {
    let root = tempdir().unwrap();
    let stale = query_dir(root.path(), "unmarked", None);
    let runs = Arc::new(AtomicUsize::new(0));

    let scrubber = Scrubber::new(
        ScrubberConfig {
            wake_interval: Duration::from_millis(15),
            throttle: Duration::from_secs(3600),
            max_query_age: Duration::from_secs(3600),
            roots: vec![root.path().to_path_buf()],
        },
        Arc::new(MemoryGlobalState::new()),
    )
    .with_observer({
        let runs = runs.clone();
        move |_: &ScrubReport| {
            runs.fetch_add(1, Ordering::SeqCst);
        }
    });

    let handle = register_scrubber(scrubber);
    tokio::time::sleep(Duration::from_millis(200)).await;
    handle.stop().await;

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(!stale.exists());
}

#[tokio::test]
async fn stopped_scrubber_never_runs() {
    let root = tempdir().unwrap();
    let stale = query_dir(root.path(), "unmarked", None);
    let runs = Arc::new(AtomicUsize::new(0));

    let scrubber = Scrubber::new(
        config(vec![root.path().to_path_buf()], Duration::ZERO),
        Arc::new(MemoryGlobalState::new()),
    )
    .with_observer({
        let runs = runs.clone();
        move |_: &ScrubReport| {
            runs.fetch_add(1, Ordering::SeqCst);
        }
    });

    // Wakes hourly, so stopping right away means no pass.
    register_scrubber(scrubber).stop().await;
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert!(stale.exists());
}
