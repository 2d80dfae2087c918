//! Persistent download record types and the status state machine.

use std::fmt;

/// Status of a tracked identifier.
///
/// State machine:
/// - `pending` is the sole initial state
/// - `pending → success` on a completed, validated download
/// - `pending → pending` on a transient error (attempt count grows)
/// - `pending → failure` on a permanent error (`should_retry = false`)
/// - `pending → postponed` on a block signature (retryable later)
/// - `success → pending` when verification finds the file missing
///
/// `success` and `failure` (with `should_retry = false`) are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
pub enum DownloadStatus {
    /// Not yet settled; eligible for (re-)download.
    Pending,
    /// PDF downloaded, validated, and on disk.
    Success,
    /// Permanent failure; never retried.
    Failure,
    /// Deferred by a block signature; retried once the block clears.
    Postponed,
}

impl DownloadStatus {
    /// Stable lowercase name, as stored in the database.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Postponed => "postponed",
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the download state store, keyed by canonical identifier.
///
/// Owned exclusively by the state store; mutated only through the
/// success/failure/postpone transactions.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DownloadRecord {
    /// Canonical identifier (DOI, arXiv ID, or URL).
    pub identifier: String,
    /// Current state-machine status.
    pub status: DownloadStatus,
    /// Total attempts made across all runs.
    pub attempt_count: i64,
    /// False marks a permanent failure.
    pub should_retry: bool,
    /// Publisher name, when known.
    pub publisher: Option<String>,
    /// Strategy that produced the last recorded outcome.
    pub strategy_used: Option<String>,
    /// Landing page URL used for resolution.
    pub landing_url: Option<String>,
    /// Direct PDF URL that was (or would be) downloaded.
    pub pdf_url: Option<String>,
    /// Flat filename derived from the identifier.
    pub sanitized_filename: Option<String>,
    /// Absolute or project-relative path of the downloaded file.
    pub local_path: Option<String>,
    /// Whether the file was present at the last check.
    pub file_exists: bool,
    /// Raw error text of the last failure, if any.
    pub error_reason: Option<String>,
    /// Whether the last failure carried a block signature.
    pub block_detected: bool,
    /// Unix seconds of the first attempt.
    pub first_attempted: i64,
    /// Unix seconds of the most recent attempt.
    pub last_attempted: i64,
    /// Unix seconds of the last row mutation.
    pub updated_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_as_str_round_trip_names() {
        assert_eq!(DownloadStatus::Pending.as_str(), "pending");
        assert_eq!(DownloadStatus::Success.as_str(), "success");
        assert_eq!(DownloadStatus::Failure.as_str(), "failure");
        assert_eq!(DownloadStatus::Postponed.as_str(), "postponed");
    }

    #[test]
    fn test_status_display_matches_as_str() {
        assert_eq!(DownloadStatus::Postponed.to_string(), "postponed");
    }
}
