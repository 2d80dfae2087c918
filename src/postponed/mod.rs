//! Blocked-source bookkeeping: the postponement cache, the per-family
//! circuit breaker, and the block-signature classifier.
//!
//! # Overview
//!
//! Three cooperating pieces keep the engine from hammering sources that have
//! started blocking:
//!
//! - [`PostponementCache`]: a persistent set of blocked domains and DOI
//!   prefixes. Lookup is an O(1) in-memory check, never a network call.
//!   Entries have no automatic expiry: an IP-level block does not clear on a
//!   known schedule, so only an operator command removes them.
//! - [`CircuitBreaker`]: per-strategy-family shared flags for publishers
//!   whose block signature is unambiguous and immediate. The first detection
//!   short-circuits every subsequent identifier of that family, across all
//!   concurrent workers, until explicit reset. One soft block must not
//!   become a hard IP ban because ten workers kept pushing.
//! - [`BlockClassifier`]: the empirically tuned string checks (captcha
//!   wording, Cloudflare markers, rate-limit phrases) that recognize a block
//!   signature in an error or response body. The marker list is
//!   operator-extensible through configuration; it is a calibration, not a
//!   contract.

use std::collections::HashSet;
use std::path::Path;
use std::sync::RwLock;

use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::db::{Database, DbError};
use crate::identifier::{IdentifierKind, NormalizedIdentifier};
use crate::state::unix_now;

/// Idempotent schema for the shared postponement store.
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS postponed_domains (
        domain TEXT PRIMARY KEY,
        reason TEXT NOT NULL,
        first_detected INTEGER NOT NULL,
        last_detected INTEGER NOT NULL,
        detection_count INTEGER NOT NULL DEFAULT 1
    )",
    "CREATE TABLE IF NOT EXISTS postponed_prefixes (
        prefix TEXT PRIMARY KEY,
        reason TEXT NOT NULL,
        first_detected INTEGER NOT NULL,
        last_detected INTEGER NOT NULL,
        detection_count INTEGER NOT NULL DEFAULT 1
    )",
];

/// Errors from the postponement store.
#[derive(Debug, Error)]
pub enum PostponedError {
    /// Failed to open the underlying database.
    #[error("postponement store error: {0}")]
    Db(#[from] DbError),

    /// A query failed.
    #[error("postponement store query failed: {0}")]
    Query(#[from] sqlx::Error),
}

/// One persisted block entry, for operator inspection.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PostponedEntry {
    /// `domain` or `prefix`.
    pub kind: &'static str,
    /// The blocked key.
    pub key: String,
    /// Why it was blocked.
    pub reason: String,
    /// Unix seconds of the first detection.
    pub first_detected: i64,
    /// Unix seconds of the latest detection.
    pub last_detected: i64,
    /// How many times the signature has been seen.
    pub detection_count: i64,
}

/// Persistent cache of blocked domains and DOI prefixes.
///
/// Lookups hit in-memory sets loaded at open time and maintained on every
/// write, so pre-filtering a batch costs no I/O.
#[derive(Debug)]
pub struct PostponementCache {
    db: Database,
    domains: RwLock<HashSet<String>>,
    prefixes: RwLock<HashSet<String>>,
}

impl PostponementCache {
    /// Opens (or creates) the shared postponement store at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`PostponedError`] if the database cannot be opened.
    #[instrument(skip(path), fields(path = %path.display()))]
    pub async fn open(path: &Path) -> Result<Self, PostponedError> {
        let db = Database::open(path).await?;
        db.apply_schema(SCHEMA).await?;
        let cache = Self {
            db,
            domains: RwLock::new(HashSet::new()),
            prefixes: RwLock::new(HashSet::new()),
        };
        cache.load().await?;
        Ok(cache)
    }

    /// In-memory cache for tests.
    ///
    /// # Errors
    ///
    /// Returns [`PostponedError`] if the database cannot be opened.
    pub async fn open_in_memory() -> Result<Self, PostponedError> {
        let db = Database::open_in_memory().await?;
        db.apply_schema(SCHEMA).await?;
        Ok(Self {
            db,
            domains: RwLock::new(HashSet::new()),
            prefixes: RwLock::new(HashSet::new()),
        })
    }

    async fn load(&self) -> Result<(), PostponedError> {
        let domains: Vec<(String,)> = sqlx::query_as("SELECT domain FROM postponed_domains")
            .fetch_all(self.db.pool())
            .await?;
        let prefixes: Vec<(String,)> = sqlx::query_as("SELECT prefix FROM postponed_prefixes")
            .fetch_all(self.db.pool())
            .await?;

        let domain_count = domains.len();
        let prefix_count = prefixes.len();
        if let Ok(mut set) = self.domains.write() {
            set.extend(domains.into_iter().map(|(d,)| d));
        }
        if let Ok(mut set) = self.prefixes.write() {
            set.extend(prefixes.into_iter().map(|(p,)| p));
        }

        info!(
            domains = domain_count,
            prefixes = prefix_count,
            "postponement cache loaded"
        );
        Ok(())
    }

    /// Returns the skip reason when this identifier's domain or DOI prefix
    /// is blocked. Pure in-memory lookup.
    #[must_use]
    pub fn should_skip(&self, identifier: &NormalizedIdentifier) -> Option<String> {
        match identifier.kind {
            IdentifierKind::Doi => {
                let prefix = identifier.doi_prefix()?;
                let blocked = self
                    .prefixes
                    .read()
                    .is_ok_and(|set| set.contains(prefix));
                blocked.then(|| format!("DOI prefix {prefix} is postponed"))
            }
            IdentifierKind::Url => {
                let domain = identifier.domain()?;
                let blocked = self
                    .domains
                    .read()
                    .is_ok_and(|set| set.contains(&domain));
                blocked.then(|| format!("domain {domain} is postponed"))
            }
            IdentifierKind::Arxiv => {
                let blocked = self
                    .domains
                    .read()
                    .is_ok_and(|set| set.contains("arxiv.org"));
                blocked.then(|| "domain arxiv.org is postponed".to_string())
            }
        }
    }

    /// Partitions a batch into (processable, blocked-with-reason) in one
    /// pass, with zero network I/O.
    #[must_use]
    pub fn filter_batch(
        &self,
        identifiers: Vec<NormalizedIdentifier>,
    ) -> (
        Vec<NormalizedIdentifier>,
        Vec<(NormalizedIdentifier, String)>,
    ) {
        let mut processable = Vec::with_capacity(identifiers.len());
        let mut blocked = Vec::new();

        for identifier in identifiers {
            match self.should_skip(&identifier) {
                Some(reason) => blocked.push((identifier, reason)),
                None => processable.push(identifier),
            }
        }

        if !blocked.is_empty() {
            info!(
                blocked = blocked.len(),
                total = blocked.len() + processable.len(),
                "pre-filtered known postponed sources"
            );
        }
        (processable, blocked)
    }

    /// Records a blocked domain. First occurrence inserts; repeats bump
    /// `detection_count` and `last_detected`.
    ///
    /// # Errors
    ///
    /// Returns [`PostponedError`] if the write fails.
    #[instrument(skip(self, reason))]
    pub async fn record_domain(&self, domain: &str, reason: &str) -> Result<(), PostponedError> {
        if domain.is_empty() {
            return Ok(());
        }
        let now = unix_now();
        sqlx::query(
            "INSERT INTO postponed_domains (domain, reason, first_detected, last_detected, detection_count)
             VALUES (?, ?, ?, ?, 1)
             ON CONFLICT(domain) DO UPDATE SET
                reason = excluded.reason,
                last_detected = excluded.last_detected,
                detection_count = detection_count + 1",
        )
        .bind(domain)
        .bind(reason)
        .bind(now)
        .bind(now)
        .execute(self.db.pool())
        .await?;

        if let Ok(mut set) = self.domains.write() {
            if set.insert(domain.to_string()) {
                warn!(domain, reason, "postponed domain added");
            }
        }
        Ok(())
    }

    /// Records a blocked DOI prefix.
    ///
    /// # Errors
    ///
    /// Returns [`PostponedError`] if the write fails.
    #[instrument(skip(self, reason))]
    pub async fn record_prefix(&self, prefix: &str, reason: &str) -> Result<(), PostponedError> {
        if prefix.is_empty() {
            return Ok(());
        }
        let now = unix_now();
        sqlx::query(
            "INSERT INTO postponed_prefixes (prefix, reason, first_detected, last_detected, detection_count)
             VALUES (?, ?, ?, ?, 1)
             ON CONFLICT(prefix) DO UPDATE SET
                reason = excluded.reason,
                last_detected = excluded.last_detected,
                detection_count = detection_count + 1",
        )
        .bind(prefix)
        .bind(reason)
        .bind(now)
        .bind(now)
        .execute(self.db.pool())
        .await?;

        if let Ok(mut set) = self.prefixes.write() {
            if set.insert(prefix.to_string()) {
                warn!(prefix, reason, "postponed DOI prefix added");
            }
        }
        Ok(())
    }

    /// Records the block key appropriate to this identifier: DOI prefix for
    /// DOIs, host domain for URLs, `arxiv.org` for arXiv IDs.
    ///
    /// # Errors
    ///
    /// Returns [`PostponedError`] if the write fails.
    pub async fn record_block_for(
        &self,
        identifier: &NormalizedIdentifier,
        reason: &str,
    ) -> Result<(), PostponedError> {
        match identifier.kind {
            IdentifierKind::Doi => {
                if let Some(prefix) = identifier.doi_prefix() {
                    self.record_prefix(prefix, reason).await?;
                }
            }
            IdentifierKind::Url => {
                if let Some(domain) = identifier.domain() {
                    self.record_domain(&domain, reason).await?;
                }
            }
            IdentifierKind::Arxiv => {
                self.record_domain("arxiv.org", reason).await?;
            }
        }
        Ok(())
    }

    /// Lists every persisted entry, domains first.
    ///
    /// # Errors
    ///
    /// Returns [`PostponedError`] if the query fails.
    pub async fn entries(&self) -> Result<Vec<PostponedEntry>, PostponedError> {
        let mut entries = Vec::new();

        let domains: Vec<(String, String, i64, i64, i64)> = sqlx::query_as(
            "SELECT domain, reason, first_detected, last_detected, detection_count
             FROM postponed_domains ORDER BY domain",
        )
        .fetch_all(self.db.pool())
        .await?;
        for (key, reason, first_detected, last_detected, detection_count) in domains {
            entries.push(PostponedEntry {
                kind: "domain",
                key,
                reason,
                first_detected,
                last_detected,
                detection_count,
            });
        }

        let prefixes: Vec<(String, String, i64, i64, i64)> = sqlx::query_as(
            "SELECT prefix, reason, first_detected, last_detected, detection_count
             FROM postponed_prefixes ORDER BY prefix",
        )
        .fetch_all(self.db.pool())
        .await?;
        for (key, reason, first_detected, last_detected, detection_count) in prefixes {
            entries.push(PostponedEntry {
                kind: "prefix",
                key,
                reason,
                first_detected,
                last_detected,
                detection_count,
            });
        }

        Ok(entries)
    }

    /// Removes one domain entry. Operator-only.
    ///
    /// # Errors
    ///
    /// Returns [`PostponedError`] if the delete fails.
    pub async fn remove_domain(&self, domain: &str) -> Result<bool, PostponedError> {
        let result = sqlx::query("DELETE FROM postponed_domains WHERE domain = ?")
            .bind(domain)
            .execute(self.db.pool())
            .await?;
        if let Ok(mut set) = self.domains.write() {
            set.remove(domain);
        }
        Ok(result.rows_affected() > 0)
    }

    /// Removes one prefix entry. Operator-only.
    ///
    /// # Errors
    ///
    /// Returns [`PostponedError`] if the delete fails.
    pub async fn remove_prefix(&self, prefix: &str) -> Result<bool, PostponedError> {
        let result = sqlx::query("DELETE FROM postponed_prefixes WHERE prefix = ?")
            .bind(prefix)
            .execute(self.db.pool())
            .await?;
        if let Ok(mut set) = self.prefixes.write() {
            set.remove(prefix);
        }
        Ok(result.rows_affected() > 0)
    }

    /// Clears everything. Operator-only.
    ///
    /// # Errors
    ///
    /// Returns [`PostponedError`] if the delete fails.
    #[instrument(skip(self))]
    pub async fn clear(&self) -> Result<(), PostponedError> {
        sqlx::query("DELETE FROM postponed_domains")
            .execute(self.db.pool())
            .await?;
        sqlx::query("DELETE FROM postponed_prefixes")
            .execute(self.db.pool())
            .await?;
        if let Ok(mut set) = self.domains.write() {
            set.clear();
        }
        if let Ok(mut set) = self.prefixes.write() {
            set.clear();
        }
        info!("postponement cache cleared");
        Ok(())
    }
}

/// Per-strategy-family shared block flags.
///
/// An explicit, injected object rather than hidden static state, so
/// independent engine instances (and independent tests) never leak trips
/// into each other.
#[derive(Debug, Default)]
pub struct CircuitBreaker {
    flags: DashMap<String, BreakerFlag>,
}

#[derive(Debug, Clone)]
struct BreakerFlag {
    reason: String,
    detection_count: u64,
}

impl CircuitBreaker {
    /// Creates a breaker with no tripped families.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the trip reason when `family` is blocked.
    #[must_use]
    pub fn is_tripped(&self, family: &str) -> Option<String> {
        self.flags.get(family).map(|flag| flag.reason.clone())
    }

    /// Trips the flag for a family. Returns `true` on the first detection;
    /// repeats only bump the count.
    pub fn trip(&self, family: &str, reason: &str) -> bool {
        let mut first = false;
        self.flags
            .entry(family.to_string())
            .and_modify(|flag| flag.detection_count += 1)
            .or_insert_with(|| {
                first = true;
                BreakerFlag {
                    reason: reason.to_string(),
                    detection_count: 1,
                }
            });
        if first {
            warn!(family, reason, "circuit breaker tripped");
        } else {
            debug!(family, "circuit breaker already tripped");
        }
        first
    }

    /// Clears one family's flag. Explicit reset is the only way out.
    pub fn reset(&self, family: &str) -> bool {
        let removed = self.flags.remove(family).is_some();
        if removed {
            info!(family, "circuit breaker reset");
        }
        removed
    }

    /// Clears every flag.
    pub fn reset_all(&self) {
        self.flags.clear();
    }

    /// Snapshot of tripped families and reasons.
    #[must_use]
    pub fn tripped(&self) -> Vec<(String, String)> {
        self.flags
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().reason.clone()))
            .collect()
    }
}

/// Default block-signature markers, lowercased. Matched as substrings
/// against error text and response bodies.
const DEFAULT_BLOCK_MARKERS: &[&str] = &[
    "cloudflare",
    "cf-ray",
    "checking your browser",
    "attention required",
    "captcha",
    "are you a robot",
    "unusual traffic",
    "rate limit",
    "too many requests",
    "retry later",
    "access denied",
];

/// Recognizes block signatures in error text and HTML bodies.
///
/// The marker list is a calibration, not a contract: operators extend it
/// through configuration as publishers change their block pages.
#[derive(Debug, Clone)]
pub struct BlockClassifier {
    markers: Vec<String>,
}

impl Default for BlockClassifier {
    fn default() -> Self {
        Self {
            markers: DEFAULT_BLOCK_MARKERS
                .iter()
                .map(|m| (*m).to_string())
                .collect(),
        }
    }
}

impl BlockClassifier {
    /// Default markers plus operator-supplied extras.
    #[must_use]
    pub fn with_extra_markers(extra: &[String]) -> Self {
        let mut classifier = Self::default();
        classifier
            .markers
            .extend(extra.iter().map(|m| m.to_lowercase()));
        classifier
    }

    /// Returns the first marker found in `text`, if any.
    #[must_use]
    pub fn matched_marker(&self, text: &str) -> Option<&str> {
        let lowered = text.to_lowercase();
        self.markers
            .iter()
            .find(|marker| lowered.contains(marker.as_str()))
            .map(String::as_str)
    }

    /// True when error text or body carries a block signature.
    #[must_use]
    pub fn is_block(&self, error_text: &str, body: &str) -> bool {
        self.matched_marker(error_text).is_some()
            || (!body.is_empty() && self.matched_marker(body).is_some())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::identifier::normalize;

    // ==================== PostponementCache Tests ====================

    #[tokio::test]
    async fn test_should_skip_blocked_prefix() {
        let cache = PostponementCache::open_in_memory().await.unwrap();
        cache.record_prefix("10.1016", "Cloudflare").await.unwrap();

        let id = normalize("10.1016/j.cell.2024.01.001").unwrap();
        let reason = cache.should_skip(&id).unwrap();
        assert!(reason.contains("10.1016"));
        assert!(reason.contains("postponed"));
    }

    #[tokio::test]
    async fn test_should_skip_blocked_domain() {
        let cache = PostponementCache::open_in_memory().await.unwrap();
        cache
            .record_domain("blocked.example.com", "403 Forbidden")
            .await
            .unwrap();

        let id = normalize("https://blocked.example.com/paper.pdf").unwrap();
        assert!(cache.should_skip(&id).is_some());

        let other = normalize("https://open.example.com/paper.pdf").unwrap();
        assert!(cache.should_skip(&other).is_none());
    }

    #[tokio::test]
    async fn test_should_skip_arxiv_via_domain() {
        let cache = PostponementCache::open_in_memory().await.unwrap();
        cache.record_domain("arxiv.org", "rate limit").await.unwrap();

        let id = normalize("2301.12345").unwrap();
        assert!(cache.should_skip(&id).is_some());
    }

    #[tokio::test]
    async fn test_filter_batch_partitions() {
        let cache = PostponementCache::open_in_memory().await.unwrap();
        cache.record_prefix("10.1016", "Cloudflare").await.unwrap();

        let ids = vec![
            normalize("10.1000/a").unwrap(),
            normalize("10.1016/x").unwrap(),
            normalize("10.1007/b").unwrap(),
        ];
        let (processable, blocked) = cache.filter_batch(ids);

        assert_eq!(processable.len(), 2);
        assert_eq!(blocked.len(), 1);
        assert_eq!(blocked[0].0.canonical, "10.1016/x");
    }

    #[tokio::test]
    async fn test_record_domain_repeat_bumps_count() {
        let cache = PostponementCache::open_in_memory().await.unwrap();
        cache.record_domain("x.com", "captcha").await.unwrap();
        cache.record_domain("x.com", "captcha").await.unwrap();
        cache.record_domain("x.com", "captcha").await.unwrap();

        let entries = cache.entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].detection_count, 3);
    }

    #[tokio::test]
    async fn test_clear_removes_everything() {
        let cache = PostponementCache::open_in_memory().await.unwrap();
        cache.record_domain("x.com", "captcha").await.unwrap();
        cache.record_prefix("10.1016", "captcha").await.unwrap();

        cache.clear().await.unwrap();

        assert!(cache.entries().await.unwrap().is_empty());
        let id = normalize("10.1016/x").unwrap();
        assert!(cache.should_skip(&id).is_none());
    }

    #[tokio::test]
    async fn test_remove_single_prefix() {
        let cache = PostponementCache::open_in_memory().await.unwrap();
        cache.record_prefix("10.1016", "captcha").await.unwrap();

        assert!(cache.remove_prefix("10.1016").await.unwrap());
        assert!(!cache.remove_prefix("10.1016").await.unwrap());

        let id = normalize("10.1016/x").unwrap();
        assert!(cache.should_skip(&id).is_none());
    }

    #[tokio::test]
    async fn test_cache_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("postponed.db");

        {
            let cache = PostponementCache::open(&path).await.unwrap();
            cache.record_prefix("10.1016", "Cloudflare").await.unwrap();
        }

        let reopened = PostponementCache::open(&path).await.unwrap();
        let id = normalize("10.1016/x").unwrap();
        assert!(reopened.should_skip(&id).is_some());
    }

    // ==================== CircuitBreaker Tests ====================

    #[test]
    fn test_breaker_trip_first_detection() {
        let breaker = CircuitBreaker::new();
        assert!(breaker.is_tripped("arxiv").is_none());

        assert!(breaker.trip("arxiv", "HTTP 429"));
        assert_eq!(breaker.is_tripped("arxiv").unwrap(), "HTTP 429");

        // Repeats are not "first" and keep the original reason.
        assert!(!breaker.trip("arxiv", "HTTP 403"));
        assert_eq!(breaker.is_tripped("arxiv").unwrap(), "HTTP 429");
    }

    #[test]
    fn test_breaker_families_independent() {
        let breaker = CircuitBreaker::new();
        breaker.trip("arxiv", "rate limit");
        assert!(breaker.is_tripped("springer").is_none());
    }

    #[test]
    fn test_breaker_reset_clears_flag() {
        let breaker = CircuitBreaker::new();
        breaker.trip("arxiv", "rate limit");
        assert!(breaker.reset("arxiv"));
        assert!(breaker.is_tripped("arxiv").is_none());
        assert!(!breaker.reset("arxiv"));
    }

    #[test]
    fn test_breaker_instances_do_not_share_state() {
        let a = CircuitBreaker::new();
        let b = CircuitBreaker::new();
        a.trip("arxiv", "rate limit");
        assert!(b.is_tripped("arxiv").is_none());
    }

    // ==================== BlockClassifier Tests ====================

    #[test]
    fn test_classifier_detects_cloudflare() {
        let classifier = BlockClassifier::default();
        assert!(classifier.is_block("", "<html>Checking your browser before accessing</html>"));
        assert!(classifier.is_block("cf-ray: 12345", ""));
    }

    #[test]
    fn test_classifier_detects_rate_limit_wording() {
        let classifier = BlockClassifier::default();
        assert!(classifier.is_block("HTTP 429 Too Many Requests", ""));
        assert!(classifier.is_block("rate limit exceeded", ""));
    }

    #[test]
    fn test_classifier_ignores_ordinary_errors() {
        let classifier = BlockClassifier::default();
        assert!(!classifier.is_block("HTTP 404 downloading https://x", ""));
        assert!(!classifier.is_block("connection reset by peer", "<html>article</html>"));
    }

    #[test]
    fn test_classifier_extra_markers() {
        let classifier = BlockClassifier::with_extra_markers(&["Bot Verification".to_string()]);
        assert!(classifier.is_block("", "<h1>bot verification required</h1>"));
    }

    #[test]
    fn test_classifier_case_insensitive() {
        let classifier = BlockClassifier::default();
        assert!(classifier.is_block("CAPTCHA required", ""));
    }
}
