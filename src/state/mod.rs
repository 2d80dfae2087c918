//! Persistent per-identifier download state.
//!
//! The [`DownloadStateStore`] is the single writer of [`DownloadRecord`]
//! rows. It decides whether an identifier still needs work
//! ([`DownloadStateStore::should_download`]), records outcomes through
//! explicit success/failure/postpone transactions, and re-validates file
//! existence ([`DownloadStateStore::verify`]).
//!
//! Records persist indefinitely across process restarts; nothing here
//! deletes a row (only the merge tool replaces rows, and only with
//! better-or-newer data).

mod merge;
mod record;

pub use merge::{MergeError, MergeOptions, MergeReport, merge_stores};
pub use record::{DownloadRecord, DownloadStatus};

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::db::{Database, DbError};

/// Idempotent schema for the state store.
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS download_results (
        identifier TEXT PRIMARY KEY,
        status TEXT NOT NULL CHECK (status IN ('pending','success','failure','postponed')),
        attempt_count INTEGER NOT NULL DEFAULT 1,
        should_retry INTEGER NOT NULL DEFAULT 1,
        publisher TEXT,
        strategy_used TEXT,
        landing_url TEXT,
        pdf_url TEXT,
        sanitized_filename TEXT,
        local_path TEXT,
        file_exists INTEGER NOT NULL DEFAULT 0,
        error_reason TEXT,
        block_detected INTEGER NOT NULL DEFAULT 0,
        first_attempted INTEGER NOT NULL,
        last_attempted INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_results_status ON download_results(status)",
    "CREATE INDEX IF NOT EXISTS idx_results_should_retry ON download_results(should_retry)",
    "CREATE INDEX IF NOT EXISTS idx_results_publisher ON download_results(publisher)",
];

const SELECT_COLUMNS: &str = "identifier, status, attempt_count, should_retry, publisher, \
     strategy_used, landing_url, pdf_url, sanitized_filename, local_path, file_exists, \
     error_reason, block_detected, first_attempted, last_attempted, updated_at";

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to open the underlying database.
    #[error("state store error: {0}")]
    Db(#[from] DbError),

    /// A query failed.
    #[error("state store query failed: {0}")]
    Query(#[from] sqlx::Error),
}

/// Report from [`DownloadStateStore::verify`].
#[derive(Debug, Default, Clone)]
pub struct VerifyReport {
    /// Identifiers whose file is still present.
    pub verified: Vec<String>,
    /// Identifiers flipped back to `pending` because their file is gone.
    pub missing: Vec<String>,
}

/// Aggregate counts from [`DownloadStateStore::stats`].
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct StoreStats {
    /// Total tracked identifiers.
    pub total: i64,
    /// Identifiers in `success`.
    pub success: i64,
    /// Identifiers in terminal `failure`.
    pub failure: i64,
    /// Identifiers in `postponed`.
    pub postponed: i64,
    /// Identifiers in `pending`.
    pub pending: i64,
    /// Success rows whose file is currently missing.
    pub missing_files: i64,
    /// Download counts per publisher, most active first.
    pub by_publisher: Vec<(String, i64)>,
    /// Outcome counts per strategy, most used first.
    pub by_strategy: Vec<(String, i64)>,
}

/// Persistent key-value store of download outcomes, keyed by canonical
/// identifier.
#[derive(Debug, Clone)]
pub struct DownloadStateStore {
    db: Database,
}

impl DownloadStateStore {
    /// Opens the state store at `path`, creating the schema if needed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the database cannot be opened.
    #[instrument(skip(path), fields(path = %path.display()))]
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let db = Database::open(path).await?;
        db.apply_schema(SCHEMA).await?;
        Ok(Self { db })
    }

    /// In-memory store for tests.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the database cannot be opened.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let db = Database::open_in_memory().await?;
        db.apply_schema(SCHEMA).await?;
        Ok(Self { db })
    }

    /// Returns the record for an identifier, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    pub async fn get(&self, identifier: &str) -> Result<Option<DownloadRecord>, StoreError> {
        let record = sqlx::query_as::<_, DownloadRecord>(&format!(
            "SELECT {SELECT_COLUMNS} FROM download_results WHERE identifier = ?"
        ))
        .bind(identifier)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(record)
    }

    /// Checks whether an identifier still needs a download attempt.
    ///
    /// Returns `(false, Some(reason))` when the work is settled: already
    /// successful, permanently failed, or out of attempts.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    #[instrument(skip(self))]
    pub async fn should_download(
        &self,
        identifier: &str,
        max_attempts: u32,
    ) -> Result<(bool, Option<String>), StoreError> {
        let Some(record) = self.get(identifier).await? else {
            return Ok((true, None));
        };
        Ok(decide(&record, max_attempts))
    }

    /// Batch variant of [`should_download`](Self::should_download): one
    /// query for the whole batch instead of N.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    #[instrument(skip(self, identifiers), fields(count = identifiers.len()))]
    pub async fn batch_status(
        &self,
        identifiers: &[String],
        max_attempts: u32,
    ) -> Result<HashMap<String, (bool, Option<String>)>, StoreError> {
        if identifiers.is_empty() {
            return Ok(HashMap::new());
        }

        let placeholders = vec!["?"; identifiers.len()].join(",");
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM download_results WHERE identifier IN ({placeholders})"
        );
        let mut query = sqlx::query_as::<_, DownloadRecord>(&sql);
        for identifier in identifiers {
            query = query.bind(identifier);
        }
        let rows = query.fetch_all(self.db.pool()).await?;

        let known: HashMap<&str, &DownloadRecord> =
            rows.iter().map(|r| (r.identifier.as_str(), r)).collect();

        let mut status = HashMap::with_capacity(identifiers.len());
        for identifier in identifiers {
            let decision = known
                .get(identifier.as_str())
                .map_or((true, None), |record| decide(record, max_attempts));
            status.insert(identifier.clone(), decision);
        }
        Ok(status)
    }

    /// Records a successful, validated download.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the transaction fails.
    #[instrument(skip(self, local_path), fields(path = %local_path.display()))]
    pub async fn record_success(
        &self,
        identifier: &str,
        local_path: &Path,
        publisher: Option<&str>,
        strategy_used: &str,
        landing_url: Option<&str>,
        pdf_url: Option<&str>,
        sanitized_filename: &str,
    ) -> Result<(), StoreError> {
        let now = unix_now();
        sqlx::query(
            "INSERT INTO download_results (
                identifier, status, attempt_count, should_retry, publisher, strategy_used,
                landing_url, pdf_url, sanitized_filename, local_path, file_exists,
                error_reason, block_detected, first_attempted, last_attempted, updated_at
            ) VALUES (?, 'success', 1, 1, ?, ?, ?, ?, ?, ?, 1, NULL, 0, ?, ?, ?)
            ON CONFLICT(identifier) DO UPDATE SET
                status = 'success',
                attempt_count = attempt_count + 1,
                should_retry = 1,
                publisher = COALESCE(excluded.publisher, publisher),
                strategy_used = excluded.strategy_used,
                landing_url = COALESCE(excluded.landing_url, landing_url),
                pdf_url = excluded.pdf_url,
                sanitized_filename = excluded.sanitized_filename,
                local_path = excluded.local_path,
                file_exists = 1,
                error_reason = NULL,
                block_detected = 0,
                last_attempted = excluded.last_attempted,
                updated_at = excluded.updated_at",
        )
        .bind(identifier)
        .bind(publisher)
        .bind(strategy_used)
        .bind(landing_url)
        .bind(pdf_url)
        .bind(sanitized_filename)
        .bind(local_path.display().to_string())
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(self.db.pool())
        .await?;

        info!(identifier, strategy_used, "recorded success");
        Ok(())
    }

    /// Records a failed attempt.
    ///
    /// With `should_retry = true` the record stays `pending` (transient
    /// error, attempt count grows until the max-attempts gate closes); with
    /// `should_retry = false` the record becomes terminal `failure`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the transaction fails.
    #[instrument(skip(self, error_reason))]
    pub async fn record_failure(
        &self,
        identifier: &str,
        error_reason: &str,
        block_detected: bool,
        should_retry: bool,
    ) -> Result<(), StoreError> {
        let status = if should_retry {
            DownloadStatus::Pending
        } else {
            DownloadStatus::Failure
        };
        self.record_unsettled(identifier, status, error_reason, block_detected, should_retry)
            .await?;
        info!(identifier, error_reason, should_retry, "recorded failure");
        Ok(())
    }

    /// Records a postponement: a block signature deferred this identifier.
    /// Always retryable later; attempts still count toward the cap.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the transaction fails.
    #[instrument(skip(self, reason))]
    pub async fn record_postponed(
        &self,
        identifier: &str,
        reason: &str,
        block_detected: bool,
    ) -> Result<(), StoreError> {
        self.record_unsettled(
            identifier,
            DownloadStatus::Postponed,
            reason,
            block_detected,
            true,
        )
        .await?;
        info!(identifier, reason, "recorded postponement");
        Ok(())
    }

    async fn record_unsettled(
        &self,
        identifier: &str,
        status: DownloadStatus,
        error_reason: &str,
        block_detected: bool,
        should_retry: bool,
    ) -> Result<(), StoreError> {
        let now = unix_now();
        sqlx::query(
            "INSERT INTO download_results (
                identifier, status, attempt_count, should_retry, error_reason,
                block_detected, file_exists, first_attempted, last_attempted, updated_at
            ) VALUES (?, ?, 1, ?, ?, ?, 0, ?, ?, ?)
            ON CONFLICT(identifier) DO UPDATE SET
                status = excluded.status,
                attempt_count = attempt_count + 1,
                should_retry = excluded.should_retry,
                error_reason = excluded.error_reason,
                block_detected = excluded.block_detected,
                file_exists = 0,
                last_attempted = excluded.last_attempted,
                updated_at = excluded.updated_at",
        )
        .bind(identifier)
        .bind(status)
        .bind(should_retry)
        .bind(error_reason)
        .bind(block_detected)
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Flips a `success` record back to `pending` because its file is gone,
    /// enabling re-download without re-resolving metadata.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the update fails.
    #[instrument(skip(self))]
    pub async fn mark_file_missing(&self, identifier: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE download_results
             SET status = 'pending', file_exists = 0, updated_at = ?
             WHERE identifier = ?",
        )
        .bind(unix_now())
        .bind(identifier)
        .execute(self.db.pool())
        .await?;
        warn!(identifier, "file missing; record reset to pending");
        Ok(())
    }

    /// Resets the retry budget for an identifier so the next batch attempts
    /// it again regardless of prior failures.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the update fails.
    #[instrument(skip(self))]
    pub async fn mark_for_retry(&self, identifier: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE download_results
             SET status = 'pending', attempt_count = 0, should_retry = 1, updated_at = ?
             WHERE identifier = ?",
        )
        .bind(unix_now())
        .bind(identifier)
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Re-checks on-disk existence for every `success` record.
    ///
    /// Records whose file is missing flip to `pending`; records whose file
    /// reappeared get `file_exists` set again.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if queries fail.
    #[instrument(skip(self))]
    pub async fn verify(&self) -> Result<VerifyReport, StoreError> {
        let rows: Vec<(String, Option<String>, bool)> = sqlx::query_as(
            "SELECT identifier, local_path, file_exists
             FROM download_results WHERE status = 'success'",
        )
        .fetch_all(self.db.pool())
        .await?;

        let mut report = VerifyReport::default();
        for (identifier, local_path, file_exists_flag) in rows {
            let present = local_path
                .as_deref()
                .is_some_and(|p| PathBuf::from(p).exists());

            if present {
                if !file_exists_flag {
                    sqlx::query(
                        "UPDATE download_results SET file_exists = 1, updated_at = ?
                         WHERE identifier = ?",
                    )
                    .bind(unix_now())
                    .bind(&identifier)
                    .execute(self.db.pool())
                    .await?;
                }
                report.verified.push(identifier);
            } else {
                self.mark_file_missing(&identifier).await?;
                report.missing.push(identifier);
            }
        }

        info!(
            verified = report.verified.len(),
            missing = report.missing.len(),
            "verification complete"
        );
        Ok(report)
    }

    /// Returns every record, for merge and reporting.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    pub async fn all_records(&self) -> Result<Vec<DownloadRecord>, StoreError> {
        let rows = sqlx::query_as::<_, DownloadRecord>(&format!(
            "SELECT {SELECT_COLUMNS} FROM download_results ORDER BY identifier"
        ))
        .fetch_all(self.db.pool())
        .await?;
        Ok(rows)
    }

    /// Imports a full record verbatim, replacing any existing row.
    ///
    /// Exists for migrating histories produced elsewhere (an older tool, a
    /// hand-built export); normal operation goes through the
    /// success/failure/postpone transactions.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    pub async fn import_record(&self, record: &DownloadRecord) -> Result<(), StoreError> {
        self.put_record(record).await
    }

    /// Replaces (or inserts) a full record verbatim. Used by the merge tool,
    /// which has already applied the conflict rules.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    pub(crate) async fn put_record(&self, record: &DownloadRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO download_results (
                identifier, status, attempt_count, should_retry, publisher, strategy_used,
                landing_url, pdf_url, sanitized_filename, local_path, file_exists,
                error_reason, block_detected, first_attempted, last_attempted, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.identifier)
        .bind(record.status)
        .bind(record.attempt_count)
        .bind(record.should_retry)
        .bind(&record.publisher)
        .bind(&record.strategy_used)
        .bind(&record.landing_url)
        .bind(&record.pdf_url)
        .bind(&record.sanitized_filename)
        .bind(&record.local_path)
        .bind(record.file_exists)
        .bind(&record.error_reason)
        .bind(record.block_detected)
        .bind(record.first_attempted)
        .bind(record.last_attempted)
        .bind(unix_now())
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Aggregate statistics over the whole store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if queries fail.
    #[instrument(skip(self))]
    pub async fn stats(&self) -> Result<StoreStats, StoreError> {
        let mut stats = StoreStats::default();

        let counts: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM download_results GROUP BY status",
        )
        .fetch_all(self.db.pool())
        .await?;
        for (status, count) in counts {
            stats.total += count;
            match status.as_str() {
                "success" => stats.success = count,
                "failure" => stats.failure = count,
                "postponed" => stats.postponed = count,
                "pending" => stats.pending = count,
                _ => {}
            }
        }

        let (missing,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM download_results
             WHERE status = 'success' AND file_exists = 0",
        )
        .fetch_one(self.db.pool())
        .await?;
        stats.missing_files = missing;

        stats.by_publisher = sqlx::query_as(
            "SELECT publisher, COUNT(*) AS n FROM download_results
             WHERE publisher IS NOT NULL GROUP BY publisher ORDER BY n DESC LIMIT 10",
        )
        .fetch_all(self.db.pool())
        .await?;

        stats.by_strategy = sqlx::query_as(
            "SELECT strategy_used, COUNT(*) AS n FROM download_results
             WHERE strategy_used IS NOT NULL GROUP BY strategy_used ORDER BY n DESC",
        )
        .fetch_all(self.db.pool())
        .await?;

        debug!(total = stats.total, "computed store stats");
        Ok(stats)
    }
}

/// Applies the settled-work rules to one record.
fn decide(record: &DownloadRecord, max_attempts: u32) -> (bool, Option<String>) {
    match record.status {
        DownloadStatus::Success => (false, Some("already downloaded successfully".to_string())),
        DownloadStatus::Failure if !record.should_retry => (
            false,
            Some(format!(
                "permanent failure: {}",
                record.error_reason.as_deref().unwrap_or("unknown")
            )),
        ),
        _ if record.attempt_count >= i64::from(max_attempts) => (
            false,
            Some(format!(
                "max attempts reached ({}/{max_attempts})",
                record.attempt_count
            )),
        ),
        _ => (true, None),
    }
}

/// Current time as unix seconds.
pub(crate) fn unix_now() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
