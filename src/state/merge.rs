//! Merging two acquisition histories.
//!
//! [`merge_stores`] combines a source (state store, PDF directory) pair into
//! a target pair. Conflict resolution, per identifier present in both:
//!
//! - success beats failure, in either direction;
//! - same status on both sides: the more recent `last_attempted` wins;
//! - when the winning record is the source's and it has a file, the file is
//!   moved (or copied) into the target directory, never overwriting an
//!   existing file of the same name.
//!
//! Dry-run mode performs the full decision pass with zero mutation.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::{DownloadRecord, DownloadStateStore, DownloadStatus, StoreError};

/// Errors from a merge run.
#[derive(Debug, Error)]
pub enum MergeError {
    /// A store read or write failed.
    #[error("merge store error: {0}")]
    Store(#[from] StoreError),
}

/// Behavior switches for [`merge_stores`].
#[derive(Debug, Clone, Copy)]
pub struct MergeOptions {
    /// Move files out of the source directory (`true`) or copy them
    /// (`false`).
    pub move_files: bool,
    /// Decide everything, mutate nothing.
    pub dry_run: bool,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            move_files: true,
            dry_run: false,
        }
    }
}

/// Outcome counters from a merge run.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct MergeReport {
    /// Records present in the source store.
    pub total_source_entries: usize,
    /// Identifiers new to the target.
    pub added: usize,
    /// Target records replaced by source records.
    pub updated: usize,
    /// Subset of `updated` where a source success beat a target failure.
    pub success_over_failure: usize,
    /// Target records kept unchanged.
    pub kept_existing: usize,
    /// Files moved into the target directory.
    pub files_moved: usize,
    /// Files copied into the target directory.
    pub files_copied: usize,
    /// File operations skipped (already present, or no source file).
    pub files_skipped: usize,
    /// Non-fatal file-operation errors.
    pub errors: Vec<String>,
}

/// Which side of a conflict wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Add,
    UpdateSuccessOverFailure,
    UpdateNewer,
    KeepExisting,
}

/// Merges `source` into `target`.
///
/// # Errors
///
/// Returns [`MergeError`] when a store read/write fails. Individual file
/// operation failures are collected into [`MergeReport::errors`] and do not
/// abort the merge.
#[instrument(skip_all, fields(
    source_dir = %source_pdf_dir.display(),
    target_dir = %target_pdf_dir.display(),
))]
pub async fn merge_stores(
    source: &DownloadStateStore,
    source_pdf_dir: &Path,
    target: &DownloadStateStore,
    target_pdf_dir: &Path,
    options: MergeOptions,
) -> Result<MergeReport, MergeError> {
    let mut report = MergeReport::default();
    let source_records = source.all_records().await?;
    report.total_source_entries = source_records.len();

    if options.dry_run {
        info!("dry run: no changes will be made");
    }

    for source_record in source_records {
        let identifier = source_record.identifier.clone();
        let existing = target.get(&identifier).await?;

        let action = decide_action(&source_record, existing.as_ref());
        debug!(identifier, ?action, "merge decision");

        match action {
            Action::Add => report.added += 1,
            Action::UpdateSuccessOverFailure => {
                report.updated += 1;
                report.success_over_failure += 1;
            }
            Action::UpdateNewer => report.updated += 1,
            Action::KeepExisting => {
                report.kept_existing += 1;
                continue;
            }
        }

        if options.dry_run {
            continue;
        }

        let mut winner = source_record;
        if winner.status == DownloadStatus::Success {
            transfer_file(&mut winner, source_pdf_dir, target_pdf_dir, options, &mut report).await;
        }
        target.put_record(&winner).await?;
    }

    info!(
        added = report.added,
        updated = report.updated,
        kept_existing = report.kept_existing,
        files_moved = report.files_moved,
        files_copied = report.files_copied,
        files_skipped = report.files_skipped,
        "merge complete"
    );
    Ok(report)
}

/// Applies the conflict-resolution table.
fn decide_action(source: &DownloadRecord, existing: Option<&DownloadRecord>) -> Action {
    let Some(existing) = existing else {
        return Action::Add;
    };

    let source_success = source.status == DownloadStatus::Success;
    let existing_success = existing.status == DownloadStatus::Success;

    if source_success && !existing_success {
        Action::UpdateSuccessOverFailure
    } else if !source_success && existing_success {
        Action::KeepExisting
    } else if source.last_attempted > existing.last_attempted {
        Action::UpdateNewer
    } else {
        Action::KeepExisting
    }
}

/// Moves or copies the winner's file into the target directory and rewrites
/// its `local_path`. Skips (never overwrites) when a file of the same name
/// already exists in the target.
async fn transfer_file(
    winner: &mut DownloadRecord,
    source_pdf_dir: &Path,
    target_pdf_dir: &Path,
    options: MergeOptions,
    report: &mut MergeReport,
) {
    let Some(file_name) = winner
        .sanitized_filename
        .clone()
        .or_else(|| {
            winner
                .local_path
                .as_deref()
                .and_then(|p| Path::new(p).file_name())
                .and_then(|n| n.to_str())
                .map(str::to_string)
        })
    else {
        report.files_skipped += 1;
        return;
    };

    let source_file = source_pdf_dir.join(&file_name);
    let target_file = target_pdf_dir.join(&file_name);
    winner.local_path = Some(target_file.display().to_string());

    if target_file.exists() {
        debug!(file = %file_name, "target file already present; skipping");
        report.files_skipped += 1;
        return;
    }

    if !source_file.exists() {
        warn!(file = %source_file.display(), "source file missing; metadata merged without file");
        winner.file_exists = false;
        report.files_skipped += 1;
        return;
    }

    if let Err(e) = tokio::fs::create_dir_all(target_pdf_dir).await {
        report
            .errors
            .push(format!("create {}: {e}", target_pdf_dir.display()));
        return;
    }

    let outcome = if options.move_files {
        move_file(&source_file, &target_file).await
    } else {
        tokio::fs::copy(&source_file, &target_file).await.map(|_| ())
    };

    match outcome {
        Ok(()) => {
            if options.move_files {
                report.files_moved += 1;
                info!(file = %file_name, "moved");
            } else {
                report.files_copied += 1;
                info!(file = %file_name, "copied");
            }
            winner.file_exists = true;
        }
        Err(e) => {
            let message = format!("failed to transfer {file_name}: {e}");
            warn!("{message}");
            report.errors.push(message);
        }
    }
}

/// Renames, falling back to copy+remove across filesystems.
async fn move_file(source: &PathBuf, target: &PathBuf) -> std::io::Result<()> {
    match tokio::fs::rename(source, target).await {
        Ok(()) => Ok(()),
        Err(_) => {
            tokio::fs::copy(source, target).await?;
            tokio::fs::remove_file(source).await
        }
    }
}
