//! Batch scheduling over the download executor.
//!
//! [`BatchOrchestrator::fetch_batch`] takes raw identifier strings and
//! guarantees exactly one [`DownloadResult`] per input; nothing is
//! silently dropped. Before any network traffic it normalizes and
//! deduplicates the inputs, drops known-blocked sources via the
//! postponement cache, and drops settled work via one batched state query.
//! Survivors run on a semaphore-bounded worker pool (width configurable
//! down to 1, i.e. fully sequential); a block detected by any worker is
//! visible to all others mid-batch through the shared cache and breaker.

use std::collections::HashSet;
use std::sync::Arc;

use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use super::cancel::CancellationToken;
use super::executor::{DownloadExecutor, DownloadResult, FetchStatus};
use crate::identifier::{NormalizedIdentifier, normalize};

/// Counts per outcome for one batch run.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct BatchStats {
    /// Downloaded (or registered) this run.
    pub success: usize,
    /// Settled earlier; no work done.
    pub skipped: usize,
    /// Failed (including unparseable inputs).
    pub failure: usize,
    /// Deferred by blocks or postponement entries.
    pub postponed: usize,
    /// Inputs that did not parse as any identifier kind.
    pub invalid: usize,
    /// Duplicate inputs removed before scheduling.
    pub duplicates: usize,
}

impl BatchStats {
    /// Total results (one per input identifier, minus removed duplicates).
    #[must_use]
    pub fn total(&self) -> usize {
        self.success + self.skipped + self.failure + self.postponed
    }
}

/// Everything a batch run produced.
#[derive(Debug)]
pub struct BatchReport {
    /// One result per (deduplicated) input identifier.
    pub results: Vec<DownloadResult>,
    /// Aggregate counts.
    pub stats: BatchStats,
}

/// Schedules identifiers across a bounded worker pool.
pub struct BatchOrchestrator {
    executor: Arc<DownloadExecutor>,
    workers: usize,
    cancel: CancellationToken,
    show_progress: bool,
}

impl BatchOrchestrator {
    /// Creates an orchestrator. `workers` is clamped to at least 1.
    #[must_use]
    pub fn new(
        executor: Arc<DownloadExecutor>,
        workers: usize,
        cancel: CancellationToken,
        show_progress: bool,
    ) -> Self {
        Self {
            executor,
            workers: workers.max(1),
            cancel,
            show_progress,
        }
    }

    /// Fetches a whole batch. Always returns one result per input
    /// identifier; duplicates (after normalization) are collapsed to their
    /// first occurrence.
    #[instrument(skip_all, fields(inputs = raw_identifiers.len(), workers = self.workers))]
    pub async fn fetch_batch(&self, raw_identifiers: &[String], force: bool) -> BatchReport {
        let mut results = Vec::with_capacity(raw_identifiers.len());
        let mut stats = BatchStats::default();

        // Normalize and deduplicate. Dedup before submission is what makes
        // last-write-wins safe in the store: no two workers share a key.
        let mut seen: HashSet<String> = HashSet::new();
        let mut normalized: Vec<NormalizedIdentifier> = Vec::new();
        for raw in raw_identifiers {
            match normalize(raw) {
                Ok(id) => {
                    if seen.insert(id.canonical.clone()) {
                        normalized.push(id);
                    } else {
                        debug!(identifier = %id.canonical, "duplicate input collapsed");
                        stats.duplicates += 1;
                    }
                }
                Err(e) => {
                    debug!(input = %raw, error = %e, "unparseable identifier");
                    stats.invalid += 1;
                    results.push(DownloadResult::failure(raw, e.to_string()));
                }
            }
        }

        // Pre-filter 1: known-blocked sources, zero network I/O.
        let (processable, blocked) = self
            .executor
            .postponement_cache()
            .filter_batch(normalized);
        for (identifier, reason) in blocked {
            results.push(DownloadResult::postponed(&identifier.canonical, reason));
        }

        // Pre-filter 2: settled work, one query for the whole batch.
        let mut to_fetch = Vec::with_capacity(processable.len());
        if force {
            info!(count = processable.len(), "force mode: re-downloading everything");
            to_fetch = processable;
        } else {
            let keys: Vec<String> = processable.iter().map(|i| i.canonical.clone()).collect();
            match self
                .executor
                .store()
                .batch_status(&keys, self.executor_max_attempts())
                .await
            {
                Ok(status) => {
                    for identifier in processable {
                        match status.get(&identifier.canonical) {
                            Some((false, reason)) => {
                                results.push(DownloadResult::skipped(
                                    &identifier.canonical,
                                    reason.clone().unwrap_or_else(|| "settled".to_string()),
                                ));
                            }
                            _ => to_fetch.push(identifier),
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "batch status check failed; attempting everything");
                    to_fetch = processable;
                }
            }
        }

        info!(
            eligible = to_fetch.len(),
            pre_filtered = results.len(),
            "batch pre-filter complete"
        );

        let progress = self.progress_bar(results.len() + to_fetch.len());
        if let Some(bar) = &progress {
            bar.inc(results.len() as u64);
        }

        // Worker pool: permits bound concurrency; acquiring before spawn
        // also makes the submission loop the first cancellation boundary.
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut handles = Vec::new();
        for identifier in to_fetch {
            if self.cancel.is_cancelled() {
                results.push(DownloadResult::skipped(&identifier.canonical, "cancelled"));
                if let Some(bar) = &progress {
                    bar.inc(1);
                }
                continue;
            }

            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                results.push(DownloadResult::skipped(&identifier.canonical, "cancelled"));
                continue;
            };
            let executor = Arc::clone(&self.executor);
            let key = identifier.canonical.clone();
            handles.push((
                key,
                tokio::spawn(async move {
                    let _permit = permit;
                    executor.fetch(&identifier, force).await
                }),
            ));
        }

        for (key, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => {
                    warn!(identifier = %key, error = %e, "worker task panicked");
                    DownloadResult::failure(&key, format!("worker panicked: {e}"))
                }
            };
            if let Some(bar) = &progress {
                bar.inc(1);
            }
            results.push(result);
        }

        if let Some(bar) = &progress {
            bar.finish_and_clear();
        }

        for result in &results {
            match result.status {
                FetchStatus::Success => stats.success += 1,
                FetchStatus::Skipped => stats.skipped += 1,
                FetchStatus::Failure => stats.failure += 1,
                FetchStatus::Postponed => stats.postponed += 1,
            }
        }

        info!(
            success = stats.success,
            skipped = stats.skipped,
            failed = stats.failure,
            postponed = stats.postponed,
            invalid = stats.invalid,
            "batch complete"
        );

        BatchReport { results, stats }
    }

    fn executor_max_attempts(&self) -> u32 {
        // The executor owns the canonical value; mirrored here for the
        // batched pre-filter query.
        self.executor.max_attempts()
    }

    fn progress_bar(&self, total: usize) -> Option<ProgressBar> {
        if !self.show_progress {
            return None;
        }
        let bar = ProgressBar::new(total as u64);
        bar.set_style(
            ProgressStyle::with_template("{bar:40} {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        Some(bar)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::download::{ExecutorConfig, HttpClient, RateLimiter};
    use crate::postponed::{BlockClassifier, CircuitBreaker, PostponementCache};
    use crate::state::DownloadStateStore;
    use crate::strategy::StrategyChain;
    use tempfile::TempDir;

    async fn orchestrator(dir: &TempDir) -> BatchOrchestrator {
        let executor = DownloadExecutor::new(
            Arc::new(HttpClient::new()),
            Arc::new(StrategyChain::new()),
            Arc::new(RateLimiter::disabled()),
            DownloadStateStore::open_in_memory().await.unwrap(),
            Arc::new(PostponementCache::open_in_memory().await.unwrap()),
            Arc::new(CircuitBreaker::new()),
            Arc::new(BlockClassifier::default()),
            CancellationToken::new(),
            ExecutorConfig {
                output_dir: dir.path().to_path_buf(),
                ..ExecutorConfig::default()
            },
        );
        BatchOrchestrator::new(Arc::new(executor), 2, CancellationToken::new(), false)
    }

    #[tokio::test]
    async fn test_invalid_identifiers_still_get_results() {
        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator(&dir).await;

        let report = orchestrator
            .fetch_batch(
                &["not an identifier".to_string(), "10.1234/ok".to_string()],
                false,
            )
            .await;

        assert_eq!(report.results.len(), 2);
        assert_eq!(report.stats.invalid, 1);
        let invalid = report
            .results
            .iter()
            .find(|r| r.identifier == "not an identifier")
            .unwrap();
        assert_eq!(invalid.status, FetchStatus::Failure);
    }

    #[tokio::test]
    async fn test_duplicates_collapse_to_one_result() {
        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator(&dir).await;

        let report = orchestrator
            .fetch_batch(
                &[
                    "10.1234/dup".to_string(),
                    "https://doi.org/10.1234/dup".to_string(),
                    "doi:10.1234/dup".to_string(),
                ],
                false,
            )
            .await;

        assert_eq!(report.results.len(), 1);
        assert_eq!(report.stats.duplicates, 2);
    }

    #[tokio::test]
    async fn test_cancelled_batch_skips_everything() {
        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator(&dir).await;
        orchestrator.cancel.cancel();

        let report = orchestrator
            .fetch_batch(&["10.1234/a".to_string(), "10.1234/b".to_string()], false)
            .await;

        assert_eq!(report.results.len(), 2);
        assert!(
            report
                .results
                .iter()
                .all(|r| r.status == FetchStatus::Skipped)
        );
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator(&dir).await;
        let report = orchestrator.fetch_batch(&[], false).await;
        assert!(report.results.is_empty());
        assert_eq!(report.stats.total(), 0);
    }
}
