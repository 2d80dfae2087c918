//! Error types for the download module.
//!
//! This module defines structured errors for all acquisition operations,
//! providing context-rich error messages for debugging and user feedback.
//! The variants map onto the engine's retry policy: rate limits and access
//! denials are postponement candidates, not-found is permanent, network
//! trouble is transient, and a failed PDF-signature check fails only the
//! strategy that produced the bytes.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while locating or downloading a PDF.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error fetching {url}: {source}")]
    Network {
        /// The URL that failed.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request or download timed out before completion.
    #[error("timeout fetching {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// Server signaled rate limiting (HTTP 429 or equivalent).
    #[error("rate limited by {url}")]
    RateLimited {
        /// The URL that rate-limited us.
        url: String,
        /// The raw Retry-After header value, if present.
        retry_after: Option<String>,
    },

    /// Access denied: paywall, missing entitlement, or bot blocking
    /// (HTTP 401/403).
    #[error("access denied (HTTP {status}) fetching {url}")]
    AccessDenied {
        /// The URL that refused us.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// The resource does not exist (HTTP 404/410).
    #[error("not found (HTTP {status}): {url}")]
    NotFound {
        /// The URL that was not found.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// Any other HTTP error response.
    #[error("HTTP {status} fetching {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// Downloaded bytes failed the PDF signature check.
    #[error("validation failed for {url}: {reason}")]
    Validation {
        /// The URL whose response was not a PDF.
        url: String,
        /// What the validation found.
        reason: String,
        /// Leading bytes of the offending body, for block-signature
        /// classification.
        body_preview: String,
    },

    /// Response exceeded the configured size bound.
    #[error("download of {url} exceeded size limit of {limit_bytes} bytes")]
    TooLarge {
        /// The URL being downloaded.
        url: String,
        /// The configured bound.
        limit_bytes: u64,
    },

    /// File system error during download (create file, write, rename).
    #[error("IO error writing to {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The candidate URL is malformed.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// The download was cancelled cooperatively.
    #[error("cancelled while fetching {url}")]
    Cancelled {
        /// The URL in flight when cancellation hit.
        url: String,
    },
}

impl FetchError {
    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates a rate-limited error.
    pub fn rate_limited(url: impl Into<String>, retry_after: Option<String>) -> Self {
        Self::RateLimited {
            url: url.into(),
            retry_after,
        }
    }

    /// Creates a validation error, keeping a bounded body preview for
    /// block-signature classification.
    pub fn validation(
        url: impl Into<String>,
        reason: impl Into<String>,
        body_preview: impl Into<String>,
    ) -> Self {
        Self::Validation {
            url: url.into(),
            reason: reason.into(),
            body_preview: body_preview.into(),
        }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates a cancellation marker.
    pub fn cancelled(url: impl Into<String>) -> Self {
        Self::Cancelled { url: url.into() }
    }

    /// Maps an HTTP error status to the right variant.
    ///
    /// | Status | Variant |
    /// |--------|---------|
    /// | 401, 403 | `AccessDenied` |
    /// | 404, 410 | `NotFound` |
    /// | 429 | `RateLimited` |
    /// | everything else | `HttpStatus` |
    #[must_use]
    pub fn from_status(url: &str, status: u16, retry_after: Option<String>) -> Self {
        match status {
            401 | 403 => Self::AccessDenied {
                url: url.to_string(),
                status,
            },
            404 | 410 => Self::NotFound {
                url: url.to_string(),
                status,
            },
            429 => Self::RateLimited {
                url: url.to_string(),
                retry_after,
            },
            _ => Self::HttpStatus {
                url: url.to_string(),
                status,
            },
        }
    }

    /// The body preview attached to this error, when one exists.
    #[must_use]
    pub fn body_preview(&self) -> &str {
        match self {
            Self::Validation { body_preview, .. } => body_preview,
            _ => "",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status_access_denied() {
        assert!(matches!(
            FetchError::from_status("http://x", 403, None),
            FetchError::AccessDenied { status: 403, .. }
        ));
        assert!(matches!(
            FetchError::from_status("http://x", 401, None),
            FetchError::AccessDenied { status: 401, .. }
        ));
    }

    #[test]
    fn test_from_status_not_found() {
        assert!(matches!(
            FetchError::from_status("http://x", 404, None),
            FetchError::NotFound { status: 404, .. }
        ));
        assert!(matches!(
            FetchError::from_status("http://x", 410, None),
            FetchError::NotFound { status: 410, .. }
        ));
    }

    #[test]
    fn test_from_status_rate_limited_keeps_retry_after() {
        let error = FetchError::from_status("http://x", 429, Some("120".to_string()));
        match error {
            FetchError::RateLimited { retry_after, .. } => {
                assert_eq!(retry_after.as_deref(), Some("120"));
            }
            other => panic!("expected RateLimited, got: {other:?}"),
        }
    }

    #[test]
    fn test_from_status_other_is_http_status() {
        assert!(matches!(
            FetchError::from_status("http://x", 503, None),
            FetchError::HttpStatus { status: 503, .. }
        ));
    }

    #[test]
    fn test_display_contains_url() {
        let error = FetchError::timeout("https://example.com/file.pdf");
        assert!(error.to_string().contains("https://example.com/file.pdf"));
        assert!(error.to_string().contains("timeout"));
    }

    #[test]
    fn test_validation_preview_accessible() {
        let error = FetchError::validation("http://x", "not a PDF", "<html>captcha</html>");
        assert_eq!(error.body_preview(), "<html>captcha</html>");
        assert_eq!(FetchError::timeout("http://x").body_preview(), "");
    }

    #[test]
    fn test_io_error_display() {
        let io_error = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let error = FetchError::io(PathBuf::from("/tmp/test.pdf"), io_error);
        assert!(error.to_string().contains("/tmp/test.pdf"));
    }
}
