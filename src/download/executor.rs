//! Per-identifier download driver.
//!
//! [`DownloadExecutor::fetch`] takes one normalized identifier through the
//! whole acquisition pipeline: cancellation gate, settled-work gate,
//! postponement gate, pre-existing-file registration, one shared
//! landing-page fetch, and the strategy chain, where each candidate URL is rate
//! limited, streamed with validation, and written atomically. Outcomes are
//! recorded into the state store; block signatures feed the postponement
//! cache and circuit breaker so sibling workers stop immediately.
//!
//! Every strategy-level error is classified locally and never escapes this
//! module as an error: a single identifier's failure must never abort the
//! batch.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use super::cancel::CancellationToken;
use super::client::HttpClient;
use super::error::FetchError;
use super::rate_limiter::{RateLimiter, parse_retry_after};
use crate::identifier::{IdentifierKind, NormalizedIdentifier};
use crate::postponed::{BlockClassifier, CircuitBreaker, PostponementCache};
use crate::publisher::publisher_for_doi;
use crate::state::DownloadStateStore;
use crate::strategy::{Disposition, DownloadStrategy, LandingPage, StrategyChain};

/// Outcome status of one fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    /// PDF downloaded (or registered) and validated.
    Success,
    /// Nothing to do: settled earlier, or cancelled before any work.
    Skipped,
    /// Failed; `error_reason` says why.
    Failure,
    /// Deferred by a block signature or postponement entry.
    Postponed,
}

impl FetchStatus {
    /// Stable lowercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Skipped => "skipped",
            Self::Failure => "failure",
            Self::Postponed => "postponed",
        }
    }
}

impl fmt::Display for FetchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-identifier result handed back to the caller. A batch always yields
/// exactly one of these per input identifier.
#[derive(Debug, Clone)]
pub struct DownloadResult {
    /// The identifier as the caller supplied it (canonical when it
    /// normalized, raw when it did not).
    pub identifier: String,
    /// Outcome status.
    pub status: FetchStatus,
    /// Where the PDF landed, on success.
    pub local_path: Option<PathBuf>,
    /// Why it failed, was skipped, or was postponed.
    pub error_reason: Option<String>,
    /// The strategy that settled the outcome.
    pub strategy_used: Option<String>,
    /// Publisher, when derivable.
    pub publisher: Option<String>,
}

impl DownloadResult {
    fn new(identifier: &str, status: FetchStatus) -> Self {
        Self {
            identifier: identifier.to_string(),
            status,
            local_path: None,
            error_reason: None,
            strategy_used: None,
            publisher: None,
        }
    }

    pub(crate) fn skipped(identifier: &str, reason: impl Into<String>) -> Self {
        let mut result = Self::new(identifier, FetchStatus::Skipped);
        result.error_reason = Some(reason.into());
        result
    }

    pub(crate) fn postponed(identifier: &str, reason: impl Into<String>) -> Self {
        let mut result = Self::new(identifier, FetchStatus::Postponed);
        result.error_reason = Some(reason.into());
        result
    }

    pub(crate) fn failure(identifier: &str, reason: impl Into<String>) -> Self {
        let mut result = Self::new(identifier, FetchStatus::Failure);
        result.error_reason = Some(reason.into());
        result
    }
}

impl fmt::Display for DownloadResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            FetchStatus::Success => match &self.local_path {
                Some(path) => write!(f, "ok {} -> {}", self.identifier, path.display()),
                None => write!(f, "ok {}", self.identifier),
            },
            _ => write!(
                f,
                "{} {} ({})",
                self.status,
                self.identifier,
                self.error_reason.as_deref().unwrap_or("no reason")
            ),
        }
    }
}

/// Tuning knobs for the executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Where PDFs land, flat, named by filename key.
    pub output_dir: PathBuf,
    /// Attempt cap per identifier, across runs.
    pub max_attempts: u32,
    /// Overall bound on one strategy attempt (locate + download).
    pub download_timeout: Duration,
    /// Hard cap on a single response body.
    pub max_pdf_bytes: u64,
    /// DOI resolver used for landing pages. Institutional link resolvers
    /// (and tests) substitute their own.
    pub doi_resolver: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./pdfs"),
            max_attempts: 3,
            download_timeout: Duration::from_secs(120),
            max_pdf_bytes: 100 * 1024 * 1024,
            doi_resolver: "https://doi.org".to_string(),
        }
    }
}

/// Drives one identifier through the strategy chain.
pub struct DownloadExecutor {
    client: Arc<HttpClient>,
    chain: Arc<StrategyChain>,
    rate_limiter: Arc<RateLimiter>,
    store: DownloadStateStore,
    postponed: Arc<PostponementCache>,
    breaker: Arc<CircuitBreaker>,
    blocks: Arc<BlockClassifier>,
    cancel: CancellationToken,
    config: ExecutorConfig,
}

/// What one strategy attempt produced.
enum AttemptOutcome {
    Downloaded { path: PathBuf, pdf_url: String },
    NoCandidate,
    Failed(FetchError),
}

impl DownloadExecutor {
    /// Wires up an executor over shared engine state.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        client: Arc<HttpClient>,
        chain: Arc<StrategyChain>,
        rate_limiter: Arc<RateLimiter>,
        store: DownloadStateStore,
        postponed: Arc<PostponementCache>,
        breaker: Arc<CircuitBreaker>,
        blocks: Arc<BlockClassifier>,
        cancel: CancellationToken,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            client,
            chain,
            rate_limiter,
            store,
            postponed,
            breaker,
            blocks,
            cancel,
            config,
        }
    }

    /// The state store this executor records into.
    #[must_use]
    pub fn store(&self) -> &DownloadStateStore {
        &self.store
    }

    /// The postponement cache this executor consults.
    #[must_use]
    pub fn postponement_cache(&self) -> &PostponementCache {
        &self.postponed
    }

    /// The attempt cap this executor enforces.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Fetches one identifier. Never returns an error: every failure mode
    /// becomes a [`DownloadResult`].
    #[instrument(skip(self, identifier), fields(identifier = %identifier.canonical))]
    pub async fn fetch(&self, identifier: &NormalizedIdentifier, force: bool) -> DownloadResult {
        let key = identifier.canonical.as_str();

        if self.cancel.is_cancelled() {
            return DownloadResult::skipped(key, "cancelled");
        }

        // Settled-work gate.
        if !force {
            match self.store.should_download(key, self.config.max_attempts).await {
                Ok((false, reason)) => {
                    let reason = reason.unwrap_or_else(|| "settled".to_string());
                    if let Some(result) = self.confirm_skip(identifier, &reason).await {
                        return result;
                    }
                    // File went missing; fall through and re-download.
                }
                Ok((true, _)) => {}
                Err(e) => {
                    warn!(error = %e, "state check failed; attempting download anyway");
                }
            }
        }

        // Postponement gate: zero network I/O for known-blocked sources.
        if let Some(reason) = self.postponed.should_skip(identifier) {
            info!(reason = %reason, "skipping postponed source");
            return DownloadResult::postponed(key, reason);
        }

        // A file from an earlier run (or copied in by hand) settles the
        // identifier without touching the network.
        if !force {
            if let Some(result) = self.register_pre_existing(identifier).await {
                return result;
            }
        }

        // Family gate: once one identifier of a family trips its breaker,
        // every sibling short-circuits before any network I/O (landing
        // fetch included) until explicit reset.
        if let Some(reason) = self.family_block(identifier) {
            info!(reason = %reason, "family circuit breaker open; postponing");
            self.record_postponed_quiet(key, &reason, true).await;
            return DownloadResult::postponed(key, reason);
        }

        // No claiming strategy means no landing fetch either.
        if self.chain.candidates(identifier).is_empty() {
            let reason = "no strategy can handle this identifier";
            self.record_failure_quiet(key, reason, false, false).await;
            return DownloadResult::failure(key, reason);
        }

        let landing = self.fetch_landing(identifier).await;
        self.run_chain(identifier, &landing).await
    }

    /// Returns the open-breaker reason for this identifier's family, keyed
    /// by the highest-priority claiming strategy that declares one.
    fn family_block(&self, identifier: &NormalizedIdentifier) -> Option<String> {
        let family = self
            .chain
            .candidates(identifier)
            .into_iter()
            .find_map(|strategy| strategy.family())?;
        self.breaker
            .is_tripped(family)
            .map(|reason| format!("{family} circuit breaker open: {reason}"))
    }

    /// Double-checks a success-skip against the disk. Returns the skip
    /// result, or `None` when the file vanished and the record was reset.
    async fn confirm_skip(
        &self,
        identifier: &NormalizedIdentifier,
        reason: &str,
    ) -> Option<DownloadResult> {
        let key = identifier.canonical.as_str();
        if !reason.contains("already downloaded") {
            debug!(reason = %reason, "skipping settled identifier");
            return Some(DownloadResult::skipped(key, reason));
        }

        let record = match self.store.get(key).await {
            Ok(record) => record?,
            Err(_) => return Some(DownloadResult::skipped(key, reason)),
        };
        let present = record
            .local_path
            .as_deref()
            .is_some_and(|p| PathBuf::from(p).exists());

        if present {
            let mut result = DownloadResult::skipped(key, reason);
            result.local_path = record.local_path.map(PathBuf::from);
            Some(result)
        } else {
            warn!("file missing for settled identifier; re-downloading");
            if let Err(e) = self.store.mark_file_missing(key).await {
                warn!(error = %e, "failed to reset missing-file record");
            }
            None
        }
    }

    /// Registers an on-disk PDF that the store does not know about yet.
    async fn register_pre_existing(
        &self,
        identifier: &NormalizedIdentifier,
    ) -> Option<DownloadResult> {
        let expected = self.config.output_dir.join(&identifier.filename_key);
        if !expected.exists() {
            return None;
        }

        let head = tokio::fs::read(&expected).await.ok()?;
        if !head.starts_with(b"%PDF") {
            warn!(path = %expected.display(), "existing file is not a valid PDF; ignoring");
            return None;
        }

        info!(path = %expected.display(), "registering pre-existing file");
        if let Err(e) = self
            .store
            .record_success(
                &identifier.canonical,
                &expected,
                self.publisher_of(identifier).as_deref(),
                "pre_existing",
                Some(&identifier.landing_url()),
                None,
                &identifier.filename_key,
            )
            .await
        {
            warn!(error = %e, "failed to record pre-existing file");
        }

        let mut result = DownloadResult::new(&identifier.canonical, FetchStatus::Success);
        result.local_path = Some(expected);
        result.strategy_used = Some("pre_existing".to_string());
        result.publisher = self.publisher_of(identifier);
        Some(result)
    }

    /// Fetches the landing page once, shared by every strategy. arXiv
    /// identifiers skip it: their PDF URL is derived, and an extra request
    /// against a possibly-throttled host buys nothing.
    async fn fetch_landing(&self, identifier: &NormalizedIdentifier) -> LandingPage {
        let landing_url = match identifier.kind {
            IdentifierKind::Doi => format!(
                "{}/{}",
                self.config.doi_resolver.trim_end_matches('/'),
                identifier.canonical
            ),
            _ => identifier.landing_url(),
        };
        if identifier.kind == IdentifierKind::Arxiv {
            return LandingPage::unfetched(landing_url);
        }

        self.rate_limiter.acquire(&landing_url).await;
        match self.client.get_page(&landing_url).await {
            Ok(page) => LandingPage {
                url: landing_url,
                final_url: Some(page.final_url),
                html: (page.status == 200).then_some(page.body),
            },
            Err(e) => {
                warn!(error = %e, "failed to fetch landing page");
                LandingPage::unfetched(landing_url)
            }
        }
    }

    /// Iterates the strategy chain until one attempt settles the outcome.
    async fn run_chain(
        &self,
        identifier: &NormalizedIdentifier,
        landing: &LandingPage,
    ) -> DownloadResult {
        let key = identifier.canonical.as_str();
        let candidates = self.chain.candidates(identifier);

        if candidates.is_empty() {
            let reason = "no strategy can handle this identifier";
            self.record_failure_quiet(key, reason, false, false).await;
            return DownloadResult::failure(key, reason);
        }

        let mut last_error: Option<(String, FetchError)> = None;
        let mut breaker_reason: Option<String> = None;

        for strategy in candidates {
            if self.cancel.is_cancelled() {
                return DownloadResult::skipped(key, "cancelled");
            }

            if let Some(family) = strategy.family() {
                if let Some(reason) = self.breaker.is_tripped(family) {
                    debug!(family, strategy = strategy.name(), "family breaker tripped; skipping");
                    breaker_reason = Some(format!("{family} circuit breaker open: {reason}"));
                    continue;
                }
            }

            debug!(strategy = strategy.name(), "trying strategy");
            let outcome = match tokio::time::timeout(
                self.config.download_timeout,
                self.attempt(strategy, identifier, landing),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => AttemptOutcome::Failed(FetchError::timeout(landing.effective_url())),
            };

            match outcome {
                AttemptOutcome::Downloaded { path, pdf_url } => {
                    return self
                        .settle_success(identifier, landing, strategy, path, &pdf_url)
                        .await;
                }
                AttemptOutcome::NoCandidate => {
                    debug!(strategy = strategy.name(), "no candidate URL");
                }
                AttemptOutcome::Failed(FetchError::Cancelled { .. }) => {
                    return DownloadResult::skipped(key, "cancelled");
                }
                AttemptOutcome::Failed(error) => {
                    warn!(strategy = strategy.name(), error = %error, "strategy attempt failed");
                    let disposition = strategy.classify(&error, &self.blocks);
                    match disposition {
                        Disposition::Postpone => {
                            return self
                                .settle_postponed(identifier, strategy, &error)
                                .await;
                        }
                        Disposition::Permanent => {
                            let reason = error.to_string();
                            self.record_failure_quiet(key, &reason, false, false).await;
                            let mut result = DownloadResult::failure(key, reason);
                            result.strategy_used = Some(strategy.name().to_string());
                            return result;
                        }
                        Disposition::Retryable => {
                            last_error = Some((strategy.name().to_string(), error));
                        }
                    }
                }
            }
        }

        // Chain exhausted without a settled outcome.
        if let Some(reason) = breaker_reason {
            self.record_postponed_quiet(key, &reason, true).await;
            return DownloadResult::postponed(key, reason);
        }

        match last_error {
            Some((strategy_name, error)) => {
                let reason = error.to_string();
                self.record_failure_quiet(key, &reason, false, true).await;
                let mut result = DownloadResult::failure(key, reason);
                result.strategy_used = Some(strategy_name);
                result
            }
            None => {
                // No strategy even produced a URL. Without a landing page
                // that may be transient; with one it is a real miss.
                let landing_failed = landing.html.is_none();
                let reason = "could not find a PDF URL";
                self.record_failure_quiet(key, reason, false, landing_failed)
                    .await;
                DownloadResult::failure(key, reason)
            }
        }
    }

    /// One strategy attempt: candidate URL, token, streamed download.
    async fn attempt(
        &self,
        strategy: &dyn DownloadStrategy,
        identifier: &NormalizedIdentifier,
        landing: &LandingPage,
    ) -> AttemptOutcome {
        let pdf_url = match strategy.pdf_url(identifier, landing).await {
            Ok(Some(url)) => url,
            Ok(None) => return AttemptOutcome::NoCandidate,
            Err(e) => return AttemptOutcome::Failed(e),
        };

        self.rate_limiter.acquire(&pdf_url).await;
        if self.cancel.is_cancelled() {
            return AttemptOutcome::Failed(FetchError::cancelled(&pdf_url));
        }

        if let Err(e) = tokio::fs::create_dir_all(&self.config.output_dir).await {
            return AttemptOutcome::Failed(FetchError::io(self.config.output_dir.clone(), e));
        }

        let dest = self.config.output_dir.join(&identifier.filename_key);
        match self
            .client
            .download_pdf(&pdf_url, &dest, &self.cancel, self.config.max_pdf_bytes)
            .await
        {
            Ok(_) => AttemptOutcome::Downloaded {
                path: dest,
                pdf_url,
            },
            Err(e) => AttemptOutcome::Failed(e),
        }
    }

    async fn settle_success(
        &self,
        identifier: &NormalizedIdentifier,
        landing: &LandingPage,
        strategy: &dyn DownloadStrategy,
        path: PathBuf,
        pdf_url: &str,
    ) -> DownloadResult {
        let key = identifier.canonical.as_str();
        let publisher = self.publisher_of(identifier);

        if let Err(e) = self
            .store
            .record_success(
                key,
                &path,
                publisher.as_deref(),
                strategy.name(),
                Some(&landing.url),
                Some(pdf_url),
                &identifier.filename_key,
            )
            .await
        {
            warn!(error = %e, "failed to record success");
        }

        info!(strategy = strategy.name(), path = %path.display(), "downloaded");
        let mut result = DownloadResult::new(key, FetchStatus::Success);
        result.local_path = Some(path);
        result.strategy_used = Some(strategy.name().to_string());
        result.publisher = publisher;
        result
    }

    /// Records a postponement and feeds the block bookkeeping: the
    /// postponement cache for the identifier's source, the family breaker
    /// when the strategy has one, and a rate-limiter penalty when the
    /// server said how long to back off.
    async fn settle_postponed(
        &self,
        identifier: &NormalizedIdentifier,
        strategy: &dyn DownloadStrategy,
        error: &FetchError,
    ) -> DownloadResult {
        let key = identifier.canonical.as_str();
        let reason = error.to_string();

        let block_shaped = matches!(
            error,
            FetchError::RateLimited { .. } | FetchError::AccessDenied { .. }
        ) || self.blocks.is_block(&reason, error.body_preview());

        if block_shaped {
            if let Err(e) = self.postponed.record_block_for(identifier, &reason).await {
                warn!(error = %e, "failed to persist block entry");
            }
            if let Some(family) = strategy.family() {
                self.breaker.trip(family, &reason);
            }
        }

        if let FetchError::RateLimited { url, retry_after } = error {
            if let Some(delay) = retry_after.as_deref().and_then(parse_retry_after) {
                self.rate_limiter.record_penalty(url, delay).await;
            }
        }

        self.record_postponed_quiet(key, &reason, block_shaped).await;
        let mut result = DownloadResult::postponed(key, reason);
        result.strategy_used = Some(strategy.name().to_string());
        result
    }

    fn publisher_of(&self, identifier: &NormalizedIdentifier) -> Option<String> {
        match identifier.kind {
            IdentifierKind::Doi => Some(publisher_for_doi(&identifier.canonical).to_string()),
            IdentifierKind::Arxiv => Some("arXiv".to_string()),
            IdentifierKind::Url => None,
        }
    }

    async fn record_failure_quiet(
        &self,
        key: &str,
        reason: &str,
        block_detected: bool,
        should_retry: bool,
    ) {
        if let Err(e) = self
            .store
            .record_failure(key, reason, block_detected, should_retry)
            .await
        {
            warn!(error = %e, "failed to record failure");
        }
    }

    async fn record_postponed_quiet(&self, key: &str, reason: &str, block_detected: bool) {
        if let Err(e) = self.store.record_postponed(key, reason, block_detected).await {
            warn!(error = %e, "failed to record postponement");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::identifier::normalize;
    use crate::strategy::build_default_chain;
    use tempfile::TempDir;

    async fn executor_with(chain: StrategyChain, output_dir: PathBuf) -> DownloadExecutor {
        DownloadExecutor::new(
            Arc::new(HttpClient::new()),
            Arc::new(chain),
            Arc::new(RateLimiter::disabled()),
            DownloadStateStore::open_in_memory().await.unwrap(),
            Arc::new(PostponementCache::open_in_memory().await.unwrap()),
            Arc::new(CircuitBreaker::new()),
            Arc::new(BlockClassifier::default()),
            CancellationToken::new(),
            ExecutorConfig {
                output_dir,
                ..ExecutorConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn test_cancelled_before_start_is_skipped() {
        let dir = TempDir::new().unwrap();
        let executor = executor_with(StrategyChain::new(), dir.path().to_path_buf()).await;
        executor.cancel.cancel();

        let id = normalize("10.1234/x").unwrap();
        let result = executor.fetch(&id, false).await;
        assert_eq!(result.status, FetchStatus::Skipped);
        assert_eq!(result.error_reason.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn test_empty_chain_is_permanent_failure() {
        let dir = TempDir::new().unwrap();
        let executor = executor_with(StrategyChain::new(), dir.path().to_path_buf()).await;

        let id = normalize("2301.12345").unwrap();
        let result = executor.fetch(&id, false).await;
        assert_eq!(result.status, FetchStatus::Failure);

        // Recorded as terminal: a second call skips.
        let result = executor.fetch(&id, false).await;
        assert_eq!(result.status, FetchStatus::Skipped);
    }

    #[tokio::test]
    async fn test_postponement_gate_before_network() {
        let dir = TempDir::new().unwrap();
        let client = Arc::new(HttpClient::new());
        let chain = build_default_chain(Arc::clone(&client), "test@example.org", None);
        let executor = executor_with(chain, dir.path().to_path_buf()).await;

        executor
            .postponed
            .record_prefix("10.1016", "Cloudflare")
            .await
            .unwrap();

        let id = normalize("10.1016/j.x.2024.1").unwrap();
        let result = executor.fetch(&id, false).await;
        assert_eq!(result.status, FetchStatus::Postponed);
        assert!(result.error_reason.unwrap().contains("10.1016"));
    }

    #[tokio::test]
    async fn test_pre_existing_valid_pdf_registered() {
        let dir = TempDir::new().unwrap();
        let id = normalize("10.1234/prefound").unwrap();
        std::fs::write(dir.path().join(&id.filename_key), b"%PDF-1.4 bytes").unwrap();

        let executor = executor_with(StrategyChain::new(), dir.path().to_path_buf()).await;
        let result = executor.fetch(&id, false).await;

        assert_eq!(result.status, FetchStatus::Success);
        assert_eq!(result.strategy_used.as_deref(), Some("pre_existing"));

        let record = executor.store.get(&id.canonical).await.unwrap().unwrap();
        assert_eq!(record.strategy_used.as_deref(), Some("pre_existing"));
    }

    #[tokio::test]
    async fn test_pre_existing_non_pdf_ignored() {
        let dir = TempDir::new().unwrap();
        let id = normalize("10.1234/htmlfile").unwrap();
        std::fs::write(dir.path().join(&id.filename_key), b"<html>nope</html>").unwrap();

        let executor = executor_with(StrategyChain::new(), dir.path().to_path_buf()).await;
        let result = executor.fetch(&id, false).await;

        // Falls through to the (empty) chain and fails, rather than
        // registering garbage as success.
        assert_eq!(result.status, FetchStatus::Failure);
    }

    #[tokio::test]
    async fn test_missing_file_resets_and_redownloads() {
        let dir = TempDir::new().unwrap();
        let executor = executor_with(StrategyChain::new(), dir.path().to_path_buf()).await;
        let id = normalize("10.1234/gone").unwrap();

        // Success on record, but no file on disk.
        executor
            .store
            .record_success(
                &id.canonical,
                &dir.path().join(&id.filename_key),
                None,
                "generic",
                None,
                None,
                &id.filename_key,
            )
            .await
            .unwrap();

        let result = executor.fetch(&id, false).await;
        // Chain is empty, so the re-download fails; the point is that the
        // settled-work gate did NOT skip.
        assert_eq!(result.status, FetchStatus::Failure);
    }
}
