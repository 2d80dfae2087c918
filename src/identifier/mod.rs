//! Identifier classification and normalization.
//!
//! Raw caller input (a DOI, an arXiv ID in any of its spellings, or a
//! landing-page URL) is resolved exactly once into a [`NormalizedIdentifier`]
//! carrying the canonical form and a stable filename key. Everything
//! downstream (state store, strategies, merge) keys off the canonical form.
//!
//! # Accepted forms
//!
//! - DOIs: `10.1234/suffix`, `https://doi.org/10.1234/suffix`, `doi:10.1234/…`
//! - arXiv: `2301.12345`, `2301.12345v2`, `math.GT/0309136`, `arxiv:…`,
//!   `10.48550/arXiv.2301.12345`, `https://arxiv.org/abs/…`,
//!   `https://arxiv.org/pdf/….pdf` (version suffixes preserved verbatim)
//! - URLs: any `http`/`https` URL with a host
//!
//! # Example
//!
//! ```
//! use paperfetch_core::identifier::{normalize, IdentifierKind};
//!
//! let id = normalize("https://doi.org/10.1007/s10623-024-01403-z").unwrap();
//! assert_eq!(id.kind, IdentifierKind::Doi);
//! assert_eq!(id.canonical, "10.1007/s10623-024-01403-z");
//! assert_eq!(id.filename_key, "10.1007_s10623-024-01403-z.pdf");
//! ```

use std::fmt;
use std::sync::LazyLock;

use md5::{Digest, Md5};
use regex::Regex;
use thiserror::Error;
use tracing::{debug, trace};

/// Regex for new-style arXiv IDs: `YYMM.NNNNN` with optional version.
#[allow(clippy::expect_used)]
static ARXIV_NEW_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{4}\.\d{4,5})(v\d+)?$").expect("arXiv new-style regex is valid")
});

/// Regex for old-style arXiv IDs: `archive.class/YYMMNNN`.
#[allow(clippy::expect_used)]
static ARXIV_OLD_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-z\-]+(?:\.[A-Z]{2})?/\d{7})(v\d+)?$").expect("arXiv old-style regex is valid")
});

/// Regex for arXiv IDs embedded in DOIs: `10.48550/arXiv.YYMM.NNNNN`.
#[allow(clippy::expect_used)]
static ARXIV_DOI_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"10\.48550/arXiv\.(\d{4}\.\d{4,5})(v\d+)?").expect("arXiv DOI regex is valid")
});

/// The detected kind of a normalized identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierKind {
    /// Digital Object Identifier.
    Doi,
    /// arXiv preprint identifier.
    Arxiv,
    /// Direct landing-page or file URL.
    Url,
}

impl fmt::Display for IdentifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Doi => write!(f, "DOI"),
            Self::Arxiv => write!(f, "arXiv"),
            Self::Url => write!(f, "URL"),
        }
    }
}

/// A classified, canonicalized identifier. Derived once per raw input;
/// immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedIdentifier {
    /// Detected identifier kind.
    pub kind: IdentifierKind,
    /// The original input text, untouched.
    pub raw: String,
    /// Canonical form used as the persistent key (bare DOI, bare arXiv ID,
    /// or the trimmed URL).
    pub canonical: String,
    /// Stable on-disk filename for the downloaded PDF.
    pub filename_key: String,
}

impl NormalizedIdentifier {
    /// Returns the DOI registrant prefix (`10.1016` for `10.1016/j.x.1`)
    /// when this identifier is a DOI.
    #[must_use]
    pub fn doi_prefix(&self) -> Option<&str> {
        if self.kind != IdentifierKind::Doi {
            return None;
        }
        self.canonical.split('/').next()
    }

    /// Returns the lowercased host when this identifier is a URL.
    #[must_use]
    pub fn domain(&self) -> Option<String> {
        if self.kind != IdentifierKind::Url {
            return None;
        }
        url::Url::parse(&self.canonical)
            .ok()
            .and_then(|u| u.host_str().map(str::to_lowercase))
    }

    /// Landing-page URL for this identifier: `doi.org` resolution for DOIs,
    /// the abstract page for arXiv IDs, the URL itself otherwise.
    #[must_use]
    pub fn landing_url(&self) -> String {
        match self.kind {
            IdentifierKind::Doi => format!("https://doi.org/{}", self.canonical),
            IdentifierKind::Arxiv => format!("https://arxiv.org/abs/{}", self.canonical),
            IdentifierKind::Url => self.canonical.clone(),
        }
    }
}

impl fmt::Display for NormalizedIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.canonical)
    }
}

/// Errors from identifier normalization. Never retried.
#[derive(Debug, Clone, Error)]
pub enum IdentifierError {
    /// The input could not be classified as DOI, arXiv ID, or URL.
    #[error("unrecognized identifier '{input}': {reason}")]
    Invalid {
        /// The offending input.
        input: String,
        /// Why it was rejected.
        reason: String,
    },
}

impl IdentifierError {
    fn invalid(input: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

/// Classifies and normalizes a raw identifier string.
///
/// # Errors
///
/// Returns [`IdentifierError::Invalid`] when the input is empty, a malformed
/// DOI, or not recognizable as any supported form.
#[tracing::instrument(skip(raw), fields(input_len = raw.len()))]
pub fn normalize(raw: &str) -> Result<NormalizedIdentifier, IdentifierError> {
    let input = raw.trim();
    if input.is_empty() {
        return Err(IdentifierError::invalid(raw, "empty input"));
    }

    // arXiv spellings first: several of them look like DOIs or URLs.
    if let Some(arxiv_id) = extract_arxiv_id(input) {
        trace!(arxiv_id = %arxiv_id, "classified as arXiv");
        return Ok(arxiv_identifier(raw, &arxiv_id));
    }

    if input.starts_with("10.") || is_doi_url(input) || has_doi_prefix(input) {
        let doi = normalize_doi(input);
        let doi = clean_trailing(&doi);
        let validated = validate_doi(input, &doi)?;
        debug!(doi = %validated, "classified as DOI");
        let filename_key = sanitize_filename_key(&validated);
        return Ok(NormalizedIdentifier {
            kind: IdentifierKind::Doi,
            raw: raw.to_string(),
            canonical: validated,
            filename_key,
        });
    }

    if input.starts_with("http://") || input.starts_with("https://") {
        let parsed = url::Url::parse(input)
            .map_err(|e| IdentifierError::invalid(raw, format!("malformed URL: {e}")))?;
        if parsed.host_str().is_none() {
            return Err(IdentifierError::invalid(raw, "URL has no host"));
        }
        debug!(url = %input, "classified as URL");
        return Ok(NormalizedIdentifier {
            kind: IdentifierKind::Url,
            raw: raw.to_string(),
            canonical: input.to_string(),
            filename_key: url_filename_key(input),
        });
    }

    Err(IdentifierError::invalid(
        raw,
        "not a DOI, arXiv ID, or http(s) URL",
    ))
}

fn arxiv_identifier(raw: &str, arxiv_id: &str) -> NormalizedIdentifier {
    NormalizedIdentifier {
        kind: IdentifierKind::Arxiv,
        raw: raw.to_string(),
        canonical: arxiv_id.to_string(),
        filename_key: sanitize_filename_key(arxiv_id),
    }
}

/// Extracts a clean arXiv ID (version suffix preserved) from any accepted
/// spelling, or `None` if the input is not arXiv-shaped.
fn extract_arxiv_id(input: &str) -> Option<String> {
    // Explicit prefix: arxiv:2301.12345
    let stripped = if input.len() >= 6 && input[..6].eq_ignore_ascii_case("arxiv:") {
        input[6..].trim()
    } else {
        input
    };

    // Embedded in an arXiv DOI (bare or behind doi.org).
    if let Some(cap) = ARXIV_DOI_PATTERN.captures(stripped) {
        let version = cap.get(2).map_or("", |m| m.as_str());
        return Some(format!("{}{version}", &cap[1]));
    }

    // Embedded in an arxiv.org URL: /abs/<id> or /pdf/<id>.pdf
    if stripped.to_lowercase().contains("arxiv.org") {
        let path = stripped
            .split_once("arxiv.org")
            .map(|(_, rest)| rest)
            .unwrap_or_default();
        for segment in ["/abs/", "/pdf/"] {
            if let Some(rest) = path.split_once(segment).map(|(_, r)| r) {
                let candidate = rest
                    .split(['?', '#'])
                    .next()
                    .unwrap_or_default()
                    .trim_end_matches(".pdf")
                    .trim_end_matches('/');
                if ARXIV_NEW_PATTERN.is_match(candidate) || ARXIV_OLD_PATTERN.is_match(candidate) {
                    return Some(candidate.to_string());
                }
            }
        }
        return None;
    }

    // Bare IDs. Old style contains a slash, so check before rejecting
    // DOI-looking inputs.
    if ARXIV_NEW_PATTERN.is_match(stripped) || ARXIV_OLD_PATTERN.is_match(stripped) {
        // Old-style matches keep their version capture too.
        return Some(stripped.to_string());
    }

    // Only the prefixed form may fall through with nothing matched; bare
    // inputs get re-examined as DOI/URL by the caller.
    None
}

fn is_doi_url(input: &str) -> bool {
    [
        "https://doi.org/",
        "http://doi.org/",
        "https://dx.doi.org/",
        "http://dx.doi.org/",
    ]
    .iter()
    .any(|prefix| input.starts_with(prefix))
}

fn has_doi_prefix(input: &str) -> bool {
    input.len() >= 4 && input[..4].eq_ignore_ascii_case("doi:")
}

/// Strips URL and `doi:` prefixes, URL-decodes, and trims.
fn normalize_doi(input: &str) -> String {
    let mut doi = input.trim();

    for prefix in &[
        "https://doi.org/",
        "http://doi.org/",
        "https://dx.doi.org/",
        "http://dx.doi.org/",
    ] {
        if let Some(stripped) = doi.strip_prefix(prefix) {
            doi = stripped;
            break;
        }
    }

    if doi.len() >= 4 && doi[..4].eq_ignore_ascii_case("doi:") {
        doi = doi[4..].trim_start();
    }

    match urlencoding::decode(doi) {
        Ok(decoded) => decoded.trim().to_string(),
        Err(_) => doi.trim().to_string(),
    }
}

/// Strips trailing punctuation that commonly clings to DOIs pasted from
/// text, plus unmatched closing parens/braces in the suffix.
fn clean_trailing(doi: &str) -> String {
    let mut result = doi.trim_end_matches(['.', ',', ';']).to_string();

    if let Some(slash_pos) = result.find('/') {
        for (open, close) in [('(', ')'), ('{', '}')] {
            while result.ends_with(close) && {
                let s = &result[slash_pos + 1..];
                s.chars().filter(|&c| c == close).count() > s.chars().filter(|&c| c == open).count()
            } {
                result.pop();
            }
        }
    }

    result
}

/// Validates a DOI: `10.` start, registrant of 4+ digits, non-empty suffix.
fn validate_doi(raw: &str, doi: &str) -> Result<String, IdentifierError> {
    if !doi.starts_with("10.") {
        return Err(IdentifierError::invalid(raw, "DOI must start with '10.'"));
    }

    let Some(slash_pos) = doi.find('/') else {
        return Err(IdentifierError::invalid(raw, "DOI has no suffix after '/'"));
    };

    let registrant = &doi[3..slash_pos];
    let first_segment = registrant.split('.').next().unwrap_or("");
    if first_segment.len() < 4 || !first_segment.chars().all(|c| c.is_ascii_digit()) {
        return Err(IdentifierError::invalid(
            raw,
            "DOI registrant code must have at least 4 digits",
        ));
    }

    if doi[slash_pos + 1..].is_empty() {
        return Err(IdentifierError::invalid(raw, "DOI has an empty suffix"));
    }

    Ok(doi.to_string())
}

/// Converts a DOI or arXiv ID to a safe flat filename: `/` and `:` become
/// `_`, anything outside `[A-Za-z0-9._-]` is dropped.
#[must_use]
pub fn sanitize_filename_key(identifier: &str) -> String {
    let safe: String = identifier
        .replace(['/', ':'], "_")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();
    format!("{safe}.pdf")
}

/// Filename key for URL-only inputs: MD5 of the URL, hex-encoded.
fn url_filename_key(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("{hex}.pdf")
}
