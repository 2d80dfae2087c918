//! Merge-tool scenarios over real on-disk stores and PDF directories.

use std::path::Path;

use paperfetch_core::state::{
    DownloadRecord, DownloadStateStore, DownloadStatus, MergeOptions, merge_stores,
};
use tempfile::TempDir;

fn record(
    identifier: &str,
    status: DownloadStatus,
    last_attempted: i64,
    pdf_dir: Option<&Path>,
) -> DownloadRecord {
    let file_name = format!("{}.pdf", identifier.replace('/', "_"));
    DownloadRecord {
        identifier: identifier.to_string(),
        status,
        attempt_count: 1,
        should_retry: status != DownloadStatus::Failure,
        publisher: None,
        strategy_used: Some("generic".to_string()),
        landing_url: None,
        pdf_url: None,
        sanitized_filename: Some(file_name.clone()),
        local_path: pdf_dir.map(|d| d.join(&file_name).display().to_string()),
        file_exists: status == DownloadStatus::Success,
        error_reason: (status != DownloadStatus::Success).then(|| "HTTP 404".to_string()),
        block_detected: false,
        first_attempted: last_attempted,
        last_attempted,
        updated_at: last_attempted,
    }
}

async fn store_at(dir: &TempDir, name: &str) -> DownloadStateStore {
    DownloadStateStore::open(&dir.path().join(name)).await.unwrap()
}

/// Copies every record of `from` into a fresh store file.
async fn clone_store(dir: &TempDir, name: &str, from: &DownloadStateStore) -> DownloadStateStore {
    let clone = store_at(dir, name).await;
    for record in from.all_records().await.unwrap() {
        clone.import_record(&record).await.unwrap();
    }
    clone
}

// ==================== Success Over Failure With File Move ====================

#[tokio::test]
async fn test_source_success_replaces_target_failure_and_moves_file() {
    let dir = TempDir::new().unwrap();
    let source_pdfs = TempDir::new().unwrap();
    let target_pdfs = TempDir::new().unwrap();

    let source = store_at(&dir, "source.db").await;
    let target = store_at(&dir, "target.db").await;

    source
        .import_record(&record(
            "10.1/x",
            DownloadStatus::Success,
            200,
            Some(source_pdfs.path()),
        ))
        .await
        .unwrap();
    std::fs::write(source_pdfs.path().join("10.1_x.pdf"), b"%PDF-1.4 content").unwrap();

    target
        .import_record(&record("10.1/x", DownloadStatus::Failure, 300, None))
        .await
        .unwrap();

    let report = merge_stores(
        &source,
        source_pdfs.path(),
        &target,
        target_pdfs.path(),
        MergeOptions::default(),
    )
    .await
    .unwrap();

    assert_eq!(report.updated, 1);
    assert_eq!(report.success_over_failure, 1);
    assert_eq!(report.files_moved, 1);

    // Target record flipped to success, file physically present.
    let merged = target.get("10.1/x").await.unwrap().unwrap();
    assert_eq!(merged.status, DownloadStatus::Success);
    assert!(target_pdfs.path().join("10.1_x.pdf").exists());
    assert!(!source_pdfs.path().join("10.1_x.pdf").exists());
}

// ==================== Merge Determinism ====================

#[tokio::test]
async fn test_merge_is_order_insensitive_on_statuses() {
    let dir = TempDir::new().unwrap();
    let pdfs_a = TempDir::new().unwrap();
    let pdfs_b = TempDir::new().unwrap();

    let store_a = store_at(&dir, "a.db").await;
    let store_b = store_at(&dir, "b.db").await;

    // A mixed population exercising every conflict rule.
    let fixtures = [
        // (identifier, status in A, time, status in B, time)
        ("10.1/success-vs-failure", DownloadStatus::Success, 100, DownloadStatus::Failure, 500),
        ("10.1/failure-vs-success", DownloadStatus::Failure, 500, DownloadStatus::Success, 100),
        ("10.1/newer-failure-wins", DownloadStatus::Postponed, 900, DownloadStatus::Postponed, 100),
        ("10.1/older-failure-loses", DownloadStatus::Pending, 100, DownloadStatus::Pending, 900),
        ("10.1/both-success", DownloadStatus::Success, 400, DownloadStatus::Success, 600),
    ];
    for (id, status_a, time_a, status_b, time_b) in fixtures {
        store_a
            .import_record(&record(id, status_a, time_a, None))
            .await
            .unwrap();
        store_b
            .import_record(&record(id, status_b, time_b, None))
            .await
            .unwrap();
    }
    // Plus one identifier unique to each side.
    store_a
        .import_record(&record("10.1/only-a", DownloadStatus::Success, 100, None))
        .await
        .unwrap();
    store_b
        .import_record(&record("10.1/only-b", DownloadStatus::Failure, 100, None))
        .await
        .unwrap();

    // Path 1: single A→B merge.
    let b_once = clone_store(&dir, "b_once.db", &store_b).await;
    merge_stores(
        &store_a,
        pdfs_a.path(),
        &b_once,
        pdfs_b.path(),
        MergeOptions::default(),
    )
    .await
    .unwrap();

    // Path 2: A→B, then B→A.
    let b_twice = clone_store(&dir, "b_twice.db", &store_b).await;
    let a_final = clone_store(&dir, "a_final.db", &store_a).await;
    merge_stores(
        &store_a,
        pdfs_a.path(),
        &b_twice,
        pdfs_b.path(),
        MergeOptions::default(),
    )
    .await
    .unwrap();
    merge_stores(
        &b_twice,
        pdfs_b.path(),
        &a_final,
        pdfs_a.path(),
        MergeOptions::default(),
    )
    .await
    .unwrap();

    // Status-equivalence: both paths settle every identifier identically.
    let once: Vec<(String, DownloadStatus)> = b_once
        .all_records()
        .await
        .unwrap()
        .into_iter()
        .map(|r| (r.identifier, r.status))
        .collect();
    let twice: Vec<(String, DownloadStatus)> = a_final
        .all_records()
        .await
        .unwrap()
        .into_iter()
        .map(|r| (r.identifier, r.status))
        .collect();

    assert_eq!(once, twice, "A→B and A→B→A must agree on every status");

    // Spot-check the rules themselves.
    let by_id = |id: &str| {
        once.iter()
            .find(|(identifier, _)| identifier == id)
            .map(|(_, status)| *status)
            .unwrap()
    };
    assert_eq!(by_id("10.1/success-vs-failure"), DownloadStatus::Success);
    assert_eq!(by_id("10.1/failure-vs-success"), DownloadStatus::Success);
    assert_eq!(by_id("10.1/newer-failure-wins"), DownloadStatus::Postponed);
    assert_eq!(by_id("10.1/only-a"), DownloadStatus::Success);
    assert_eq!(by_id("10.1/only-b"), DownloadStatus::Failure);
}

// ==================== Dry Run ====================

#[tokio::test]
async fn test_dry_run_previews_without_touching_anything() {
    let dir = TempDir::new().unwrap();
    let source_pdfs = TempDir::new().unwrap();
    let target_pdfs = TempDir::new().unwrap();

    let source = store_at(&dir, "source.db").await;
    let target = store_at(&dir, "target.db").await;

    source
        .import_record(&record(
            "10.1/x",
            DownloadStatus::Success,
            200,
            Some(source_pdfs.path()),
        ))
        .await
        .unwrap();
    std::fs::write(source_pdfs.path().join("10.1_x.pdf"), b"%PDF-1.4").unwrap();
    target
        .import_record(&record("10.1/x", DownloadStatus::Failure, 100, None))
        .await
        .unwrap();

    let report = merge_stores(
        &source,
        source_pdfs.path(),
        &target,
        target_pdfs.path(),
        MergeOptions {
            move_files: true,
            dry_run: true,
        },
    )
    .await
    .unwrap();

    // Counters reflect decisions, state reflects nothing.
    assert_eq!(report.updated, 1);
    assert_eq!(report.files_moved, 0);
    assert!(source_pdfs.path().join("10.1_x.pdf").exists());
    let untouched = target.get("10.1/x").await.unwrap().unwrap();
    assert_eq!(untouched.status, DownloadStatus::Failure);
}

// ==================== Existing Files Are Never Overwritten ====================

#[tokio::test]
async fn test_existing_target_file_survives_merge() {
    let dir = TempDir::new().unwrap();
    let source_pdfs = TempDir::new().unwrap();
    let target_pdfs = TempDir::new().unwrap();

    let source = store_at(&dir, "source.db").await;
    let target = store_at(&dir, "target.db").await;

    source
        .import_record(&record(
            "10.1/x",
            DownloadStatus::Success,
            900,
            Some(source_pdfs.path()),
        ))
        .await
        .unwrap();
    std::fs::write(source_pdfs.path().join("10.1_x.pdf"), b"%PDF source").unwrap();
    std::fs::write(target_pdfs.path().join("10.1_x.pdf"), b"%PDF target").unwrap();
    target
        .import_record(&record("10.1/x", DownloadStatus::Success, 100, None))
        .await
        .unwrap();

    let report = merge_stores(
        &source,
        source_pdfs.path(),
        &target,
        target_pdfs.path(),
        MergeOptions::default(),
    )
    .await
    .unwrap();

    // Source record is newer and wins, but the file is not overwritten.
    assert_eq!(report.updated, 1);
    assert_eq!(report.files_skipped, 1);
    assert_eq!(
        std::fs::read(target_pdfs.path().join("10.1_x.pdf")).unwrap(),
        b"%PDF target"
    );
}
