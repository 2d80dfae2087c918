//! Per-domain token-bucket rate limiting for download requests.
//!
//! This module provides the [`RateLimiter`] struct which bounds the request
//! rate to each domain, preventing servers from blocking the client due to
//! excessive request rates.
//!
//! # Overview
//!
//! Each domain gets an independent bucket holding up to `capacity` tokens,
//! refilled continuously at `refill_rate` tokens per second. A request costs
//! one token; [`RateLimiter::acquire`] waits cooperatively (a timed sleep,
//! not a busy loop) until a token is available. The cap bounds burst size,
//! and independent buckets mean one slow domain never throttles another.
//!
//! Server-mandated delays (`Retry-After`) are debited into the offending
//! domain's bucket via [`RateLimiter::record_penalty`].
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use paperfetch_core::download::RateLimiter;
//!
//! # async fn example() {
//! // 3-token burst, refilling one token per second.
//! let limiter = Arc::new(RateLimiter::new(3.0, 1.0));
//!
//! // First requests ride the burst; later ones pace out at 1/s.
//! limiter.acquire("https://example.com/file1.pdf").await;
//! limiter.acquire("https://other.com/file.pdf").await; // independent bucket
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// Warning threshold for cumulative wait per domain (30 seconds).
const CUMULATIVE_WAIT_WARNING_THRESHOLD: Duration = Duration::from_secs(30);

/// Maximum Retry-After value (1 hour) to prevent excessive delays.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Per-domain token-bucket rate limiter.
///
/// Designed to be wrapped in `Arc` and shared across Tokio tasks. Uses
/// `DashMap` for lock-free bucket lookup and a `tokio::sync::Mutex` per
/// bucket for atomic refill-and-take operations.
///
/// # Invariants
///
/// - `tokens` never exceeds `capacity`
/// - refill is monotone in elapsed time
#[derive(Debug)]
pub struct RateLimiter {
    /// Maximum tokens a bucket can hold (burst bound).
    capacity: f64,

    /// Tokens added per second.
    refill_rate: f64,

    /// Whether rate limiting is disabled (for `--rate-limit 0`).
    disabled: bool,

    /// Per-domain buckets, created lazily.
    /// Arc lets us clone the bucket out and release the `DashMap` shard
    /// lock before awaiting on the inner Mutex.
    buckets: DashMap<String, Arc<DomainBucket>>,
}

/// State tracked for each domain.
#[derive(Debug)]
struct DomainBucket {
    state: Mutex<BucketState>,

    /// Cumulative wait applied to this domain (in milliseconds).
    /// Used to warn when excessive rate limiting occurs.
    cumulative_wait_ms: AtomicU64,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
    /// Server-mandated hold from a Retry-After penalty.
    blocked_until: Option<Instant>,
}

impl DomainBucket {
    /// New buckets start full so the first requests ride the burst.
    fn new(capacity: f64) -> Self {
        Self {
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
                blocked_until: None,
            }),
            cumulative_wait_ms: AtomicU64::new(0),
        }
    }

    /// Adds to the cumulative wait and returns the new total.
    #[allow(clippy::cast_possible_truncation)]
    fn add_cumulative_wait(&self, wait: Duration) -> Duration {
        let wait_ms = wait.as_millis() as u64;
        let new_total = self.cumulative_wait_ms.fetch_add(wait_ms, Ordering::SeqCst) + wait_ms;
        Duration::from_millis(new_total)
    }
}

impl RateLimiter {
    /// Creates a rate limiter with the given burst capacity and refill rate
    /// (tokens per second). Values below sane minimums are clamped.
    #[must_use]
    #[instrument(skip_all, fields(capacity, refill_rate))]
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        debug!(capacity, refill_rate, "creating rate limiter");
        Self {
            capacity: capacity.max(1.0),
            refill_rate: refill_rate.max(0.01),
            disabled: false,
            buckets: DashMap::new(),
        }
    }

    /// Creates a disabled rate limiter that applies no delays.
    #[must_use]
    pub fn disabled() -> Self {
        debug!("creating disabled rate limiter");
        Self {
            capacity: 0.0,
            refill_rate: 0.0,
            disabled: true,
            buckets: DashMap::new(),
        }
    }

    /// Returns whether rate limiting is disabled.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Returns the configured burst capacity.
    #[must_use]
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Returns the configured refill rate in tokens per second.
    #[must_use]
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Acquires one token for the given URL's domain, waiting as long as
    /// necessary. The wait is a cooperative sleep sized to the token
    /// deficit, plus a small jitter so simultaneous waiters don't stampede
    /// the same domain when they wake.
    #[instrument(skip(self), fields(domain))]
    pub async fn acquire(&self, url: &str) {
        if self.disabled {
            return;
        }

        let domain = extract_domain(url);
        tracing::Span::current().record("domain", domain.as_str());

        // Clone the Arc out so the DashMap shard lock is released before
        // any await.
        let bucket = self
            .buckets
            .entry(domain.clone())
            .or_insert_with(|| Arc::new(DomainBucket::new(self.capacity)))
            .clone();

        loop {
            let wait = {
                let mut state = bucket.state.lock().await;
                let now = Instant::now();

                if let Some(until) = state.blocked_until {
                    if now < until {
                        Some(until - now)
                    } else {
                        state.blocked_until = None;
                        self.try_take(&mut state, now)
                    }
                } else {
                    self.try_take(&mut state, now)
                }
            };

            let Some(wait) = wait else {
                return;
            };

            let cumulative = bucket.add_cumulative_wait(wait);
            debug!(
                domain = %domain,
                wait_ms = wait.as_millis(),
                cumulative_ms = cumulative.as_millis(),
                "waiting for rate limit token"
            );
            if cumulative >= CUMULATIVE_WAIT_WARNING_THRESHOLD {
                warn!(
                    domain = %domain,
                    cumulative_wait_secs = cumulative.as_secs(),
                    "excessive rate limiting - consider reducing request volume to this domain"
                );
            }

            tokio::time::sleep(wait + jitter_for(wait)).await;
        }
    }

    /// Refills the bucket for elapsed time and takes a token if available.
    /// Returns the wait needed when the bucket is dry.
    fn try_take(&self, state: &mut BucketState, now: Instant) -> Option<Duration> {
        let elapsed = now.saturating_duration_since(state.last_refill);
        state.tokens = (state.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.capacity);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            None
        } else {
            let deficit = 1.0 - state.tokens;
            Some(Duration::from_secs_f64(deficit / self.refill_rate))
        }
    }

    /// Records a server-mandated delay (from a Retry-After header) against
    /// the URL's domain. Subsequent acquisitions hold until the penalty
    /// passes.
    #[instrument(skip(self), fields(domain))]
    pub async fn record_penalty(&self, url: &str, delay: Duration) {
        if self.disabled {
            return;
        }

        let domain = extract_domain(url);
        tracing::Span::current().record("domain", domain.as_str());

        let bucket = self
            .buckets
            .entry(domain.clone())
            .or_insert_with(|| Arc::new(DomainBucket::new(self.capacity)))
            .clone();

        let mut state = bucket.state.lock().await;
        let until = Instant::now() + delay;
        state.blocked_until = Some(match state.blocked_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
        state.tokens = 0.0;

        let cumulative = bucket.add_cumulative_wait(delay);
        debug!(
            domain = %domain,
            delay_ms = delay.as_millis(),
            cumulative_ms = cumulative.as_millis(),
            "recorded server rate limit penalty"
        );
        if cumulative >= CUMULATIVE_WAIT_WARNING_THRESHOLD {
            warn!(
                domain = %domain,
                cumulative_wait_secs = cumulative.as_secs(),
                "excessive server rate limiting - site may be under heavy load"
            );
        }
    }
}

/// Jitter up to 5% of the wait, so the delay bound stays tight while
/// simultaneous waiters spread out.
fn jitter_for(wait: Duration) -> Duration {
    let max_jitter_ms = (wait.as_millis() / 20).min(u128::from(u64::MAX));
    if max_jitter_ms == 0 {
        return Duration::ZERO;
    }
    #[allow(clippy::cast_possible_truncation)]
    let jitter_ms = rand::thread_rng().gen_range(0..=max_jitter_ms as u64);
    Duration::from_millis(jitter_ms)
}

/// Extracts the domain from a URL.
///
/// Returns "unknown" for malformed URLs, ensuring all requests are still
/// rate limited even if the URL cannot be parsed.
///
/// # Examples
///
/// ```
/// use paperfetch_core::download::rate_limiter::extract_domain;
///
/// assert_eq!(extract_domain("https://example.com/path"), "example.com");
/// assert_eq!(extract_domain("http://Example.COM/Path"), "example.com");
/// assert_eq!(extract_domain("not a url"), "unknown");
/// ```
#[must_use]
pub fn extract_domain(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Parses a Retry-After header value into a Duration.
///
/// Supports two formats as per RFC 7231:
/// - Integer seconds: `Retry-After: 120`
/// - HTTP-date: `Retry-After: Wed, 21 Oct 2026 07:28:00 GMT`
///
/// Returns `None` if the value cannot be parsed. Caps excessive values at
/// 1 hour.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use paperfetch_core::download::rate_limiter::parse_retry_after;
///
/// assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
/// assert_eq!(parse_retry_after("0"), Some(Duration::ZERO));
/// assert_eq!(parse_retry_after("invalid"), None);
/// ```
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    // Try parsing as integer seconds first (most common)
    if let Ok(seconds) = header_value.parse::<i64>() {
        if seconds < 0 {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        }

        #[allow(clippy::cast_sign_loss)]
        let duration = Duration::from_secs(seconds as u64);

        if duration > MAX_RETRY_AFTER {
            warn!(
                seconds,
                max_seconds = MAX_RETRY_AFTER.as_secs(),
                "Retry-After exceeds maximum, capping at 1 hour"
            );
            return Some(MAX_RETRY_AFTER);
        }

        return Some(duration);
    }

    // Try parsing as HTTP-date
    if let Ok(datetime) = httpdate::parse_http_date(header_value) {
        let now = std::time::SystemTime::now();

        if let Ok(duration) = datetime.duration_since(now) {
            if duration > MAX_RETRY_AFTER {
                warn!(
                    delay_secs = duration.as_secs(),
                    max_secs = MAX_RETRY_AFTER.as_secs(),
                    "Retry-After date exceeds maximum, capping at 1 hour"
                );
                return Some(MAX_RETRY_AFTER);
            }
            Some(duration)
        } else {
            // Date is in the past
            debug!(
                header_value,
                "Retry-After date is in the past, returning zero"
            );
            Some(Duration::ZERO)
        }
    } else {
        debug!(header_value, "unparseable Retry-After value");
        None
    }
}
