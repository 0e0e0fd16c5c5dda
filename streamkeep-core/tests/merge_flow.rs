mod support;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use streamkeep_core::ActivityGate;
use streamkeep_core::CaptureError;
use streamkeep_core::artifact::ArtifactLayout;
use streamkeep_core::locks::DirectoryLocks;
use streamkeep_core::merge::{MergeJob, MergeScheduler, next_window_after};
use streamkeep_core::tool::ToolOperation;
use support::{FakeTool, file_names, seed_file};
use tokio_util::sync::CancellationToken;

const FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

fn scheduler(root: &Path, tool: Arc<FakeTool>) -> MergeScheduler {
    scheduler_with_format(root, tool, FORMAT)
}

fn scheduler_with_format(root: &Path, tool: Arc<FakeTool>, format: &str) -> MergeScheduler {
    let layout = ArtifactLayout::new(root, "mkv", format);
    MergeScheduler::new(
        MergeJob::new(tool, layout.clone(), Duration::from_secs(3 * 3600)),
        layout,
        DirectoryLocks::new(),
        ActivityGate::new(true),
        4,
        CancellationToken::new(),
    )
}

fn half_past() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 13, 30, 0).unwrap()
}

#[tokio::test]
async fn aged_fragment_is_merged_at_half_past() {
    let root = tempfile::tempdir().expect("tempdir");
    let bob = root.path().join("bob");
    let window = next_window_after(half_past() - chrono::Duration::seconds(20));
    assert_eq!(window, half_past());

    seed_file(
        &bob,
        "bob_compressed_2024-05-01_09-30-00.mkv",
        window - chrono::Duration::hours(4),
    );

    let tool = Arc::new(FakeTool::default());
    let report = scheduler(root.path(), tool.clone())
        .run_window(window)
        .await
        .expect("window");
    assert_eq!(report.merged(), 1);

    assert_eq!(
        file_names(&bob),
        vec![
            "MERGED_2024-05-01_13-30-00.mkv".to_string(),
            "MERGED_2024-05-01_13-30-00.mkv_MERGED.png".to_string(),
        ]
    );

    let merges = tool.calls(ToolOperation::Merge);
    assert_eq!(merges.len(), 1);
    assert_eq!(
        merges[0].0,
        "file './bob_compressed_2024-05-01_09-30-00.mkv'\n"
    );
}

#[tokio::test]
async fn young_fragments_wait_for_a_later_window() {
    let root = tempfile::tempdir().expect("tempdir");
    let bob = root.path().join("bob");
    seed_file(
        &bob,
        "bob_compressed_2024-05-01_12-00-00.mkv",
        half_past() - chrono::Duration::hours(1),
    );

    let tool = Arc::new(FakeTool::default());
    let scheduler = scheduler(root.path(), tool.clone());

    let first = scheduler.run_window(half_past()).await.expect("window");
    assert_eq!(first.merged(), 0);
    assert!(tool.calls(ToolOperation::Merge).is_empty());
    assert_eq!(file_names(&bob), vec!["bob_compressed_2024-05-01_12-00-00.mkv"]);

    let later = half_past() + chrono::Duration::hours(2);
    let second = scheduler.run_window(later).await.expect("window");
    assert_eq!(second.merged(), 1);
    assert_eq!(
        file_names(&bob),
        vec![
            "MERGED_2024-05-01_15-30-00.mkv",
            "MERGED_2024-05-01_15-30-00.mkv_MERGED.png",
        ]
    );
}

#[tokio::test]
async fn failed_merge_is_retried_next_window_without_duplicates() {
    let root = tempfile::tempdir().expect("tempdir");
    let bob = root.path().join("bob");
    let alice = root.path().join("alice");
    let window = half_past();
    seed_file(&bob, "bob_compressed_a.mkv", window - chrono::Duration::hours(5));
    seed_file(&bob, "bob_compressed_b.mkv", window - chrono::Duration::hours(4));
    seed_file(&alice, "alice_compressed_a.mkv", window - chrono::Duration::hours(4));

    let tool = Arc::new(FakeTool::default());
    tool.fail_concat.store(true, Ordering::SeqCst);
    let scheduler = scheduler(root.path(), tool.clone());

    let failed = scheduler.run_window(window).await.expect("window");
    assert_eq!(failed.failures.len(), 2);
    assert_eq!(
        file_names(&bob),
        vec!["bob_compressed_a.mkv", "bob_compressed_b.mkv", "toMerge.txt"]
    );

    tool.fail_concat.store(false, Ordering::SeqCst);
    let next = window + chrono::Duration::minutes(30);
    let retried = scheduler.run_window(next).await.expect("window");
    assert_eq!(retried.merged(), 2);
    assert!(retried.failures.is_empty());

    let bob_listing = tool
        .calls(ToolOperation::Merge)
        .into_iter()
        .filter(|(_, output)| output.starts_with(&bob))
        .map(|(listing, _)| listing)
        .last()
        .expect("bob merged");
    assert_eq!(
        bob_listing,
        "file './bob_compressed_a.mkv'\nfile './bob_compressed_b.mkv'\n"
    );
    assert_eq!(
        file_names(&bob),
        vec![
            "MERGED_2024-05-01_14-00-00.mkv",
            "MERGED_2024-05-01_14-00-00.mkv_MERGED.png",
        ]
    );
}

#[tokio::test]
async fn colliding_merged_name_is_refused_and_nothing_is_lost() {
    let root = tempfile::tempdir().expect("tempdir");
    let bob = root.path().join("bob");
    let first_window = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    let later_window = Utc.with_ymd_and_hms(2024, 5, 1, 13, 30, 0).unwrap();
    seed_file(&bob, "bob_compressed_a.mkv", first_window - chrono::Duration::hours(4));
    seed_file(&bob, "bob_compressed_b.mkv", Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap());

    let tool = Arc::new(FakeTool::default());
    let scheduler = scheduler_with_format(root.path(), tool.clone(), "%Y-%m-%d");

    let first = scheduler.run_window(first_window).await.expect("window");
    assert_eq!(first.merged(), 1);
    let merged = bob.join("MERGED_2024-05-01.mkv");
    assert_eq!(std::fs::read(&merged).unwrap(), b"merged");
    std::fs::write(&merged, b"first window").unwrap();

    let later = scheduler.run_window(later_window).await.expect("window");
    assert_eq!(later.merged(), 0);
    assert_eq!(later.failures.len(), 1);
    assert!(matches!(
        &later.failures[0],
        (entity, CaptureError::ArtifactExists(path)) if entity == "bob" && *path == merged
    ));

    assert_eq!(std::fs::read(&merged).unwrap(), b"first window");
    assert!(bob.join("bob_compressed_b.mkv").exists());
    assert!(bob.join("toMerge.txt").exists());
    assert_eq!(tool.calls(ToolOperation::Merge).len(), 1);
}

#[tokio::test]
async fn a_window_over_an_empty_root_is_harmless() {
    let root = tempfile::tempdir().expect("tempdir");
    let report = scheduler(&root.path().join("missing"), Arc::new(FakeTool::default()))
        .run_window(half_past())
        .await
        .expect("window");
    assert!(report.reports.is_empty());
    assert!(report.failures.is_empty());
}
