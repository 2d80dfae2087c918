//! Generic fallback: landing-page link scan.
//!
//! Handles identifiers from publishers without a specific strategy by
//! scanning the landing page HTML with progressively less reliable
//! patterns: citation meta tags first, then known publisher URL shapes,
//! data attributes, and finally any `.pdf`-looking href with obvious
//! assets and trackers filtered out.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use super::{DownloadStrategy, LandingPage};
use crate::download::FetchError;
use crate::identifier::NormalizedIdentifier;

/// Meta tags, most reliable first.
#[allow(clippy::expect_used)]
static META_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r#"(?i)<meta\s+name=["']citation_pdf_url["']\s+content=["']([^"']+)["']"#,
        r#"(?i)<meta\s+name=["']DC\.identifier["']\s+content=["']([^"']+\.pdf[^"']*)["']"#,
        r#"(?i)<meta\s+property=["']og:pdf["']\s+content=["']([^"']+)["']"#,
    ]
    .iter()
    .map(|p| Regex::new(p).expect("meta pattern is valid"))
    .collect()
});

/// Known publisher URL shapes.
#[allow(clippy::expect_used)]
static PUBLISHER_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r#"(?i)href=["']([^"']*/doi/pdf/[^"']+)["']"#,
        r#"(?i)href=["']([^"']*/content/pdf/[^"']+)["']"#,
        r#"(?i)href=["']([^"']*/fulltext\.pdf[^"']*)["']"#,
        r#"(?i)href=["']([^"']*/article[^"']*\.pdf[^"']*)["']"#,
        r#"(?i)href=["']([^"']*/viewPDFInterstitial[^"']*)["']"#,
    ]
    .iter()
    .map(|p| Regex::new(p).expect("publisher pattern is valid"))
    .collect()
});

/// Data attributes some platforms use instead of hrefs.
#[allow(clippy::expect_used)]
static DATA_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r#"(?i)data-pdf-url=["']([^"']+)["']"#,
        r#"(?i)data-download=["']([^"']+\.pdf[^"']*)["']"#,
        r#"(?i)data-article-pdf=["']([^"']+)["']"#,
    ]
    .iter()
    .map(|p| Regex::new(p).expect("data pattern is valid"))
    .collect()
});

/// Wide-net patterns, least reliable.
#[allow(clippy::expect_used)]
static GENERIC_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r#"(?i)href=["']([^"']*\.pdf[^"']*)["']"#,
        r#"(?i)href=["']([^"']*/pdf/[^"']*)["']"#,
        r#"(?i)href=["']([^"']*/download/[^"']*)["']"#,
    ]
    .iter()
    .map(|p| Regex::new(p).expect("generic pattern is valid"))
    .collect()
});

/// Extensions and keywords that disqualify a wide-net match.
const ASSET_MARKERS: &[&str] = &[".jpg", ".png", ".css", ".js", ".gif", ".svg"];
const TRACKER_MARKERS: &[&str] = &["tracking", "analytics", "pixel"];

/// Last-resort strategy for unknown publishers.
#[derive(Debug, Default)]
pub struct GenericStrategy;

impl GenericStrategy {
    /// Creates the generic fallback strategy.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn scan(html: &str, base: &str) -> Option<String> {
        for pattern in META_PATTERNS
            .iter()
            .chain(PUBLISHER_PATTERNS.iter())
            .chain(DATA_PATTERNS.iter())
        {
            if let Some(cap) = pattern.captures(html) {
                return Some(absolutize(&cap[1], base));
            }
        }

        for pattern in GENERIC_PATTERNS.iter() {
            for cap in pattern.captures_iter(html) {
                let href = &cap[1];
                let lowered = href.to_lowercase();
                if ASSET_MARKERS.iter().any(|m| lowered.contains(m)) {
                    continue;
                }
                if TRACKER_MARKERS.iter().any(|m| lowered.contains(m)) {
                    continue;
                }
                return Some(absolutize(href, base));
            }
        }

        None
    }
}

#[async_trait]
impl DownloadStrategy for GenericStrategy {
    fn name(&self) -> &'static str {
        "generic"
    }

    /// Catch-all; always last.
    fn priority(&self) -> u32 {
        1000
    }

    fn can_handle(&self, _identifier: &NormalizedIdentifier) -> bool {
        true
    }

    async fn pdf_url(
        &self,
        identifier: &NormalizedIdentifier,
        landing: &LandingPage,
    ) -> Result<Option<String>, FetchError> {
        let html = landing.html();
        if html.is_empty() {
            return Ok(None);
        }

        let found = Self::scan(html, landing.effective_url());
        if let Some(url) = &found {
            debug!(identifier = %identifier.canonical, url = %url, "generic scan found candidate");
        }
        Ok(found)
    }
}

/// Resolves a possibly-relative href against the landing URL.
fn absolutize(href: &str, base: &str) -> String {
    if href.starts_with("http") {
        return href.to_string();
    }
    url::Url::parse(base)
        .ok()
        .and_then(|b| b.join(href).ok())
        .map_or_else(|| href.to_string(), |u| u.to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::identifier::normalize;

    fn landing_with(html: &str) -> LandingPage {
        LandingPage {
            url: "https://doi.org/10.5555/x".to_string(),
            final_url: Some("https://journal.example.com/article/x".to_string()),
            html: Some(html.to_string()),
        }
    }

    #[test]
    fn test_handles_everything() {
        let strategy = GenericStrategy::new();
        assert!(strategy.can_handle(&normalize("10.5555/anything").unwrap()));
        assert!(strategy.can_handle(&normalize("https://anywhere.example.com/x").unwrap()));
    }

    #[tokio::test]
    async fn test_meta_tag_preferred() {
        let strategy = GenericStrategy::new();
        let id = normalize("10.5555/x").unwrap();
        let landing = landing_with(
            r#"<a href="/files/other.pdf">other</a>
               <meta name="citation_pdf_url" content="https://journal.example.com/pdf/x.pdf">"#,
        );

        let url = strategy.pdf_url(&id, &landing).await.unwrap().unwrap();
        assert_eq!(url, "https://journal.example.com/pdf/x.pdf");
    }

    #[tokio::test]
    async fn test_publisher_pattern_doi_pdf() {
        let strategy = GenericStrategy::new();
        let id = normalize("10.5555/x").unwrap();
        let landing = landing_with(r#"<a href="/doi/pdf/10.5555/x">Full text</a>"#);

        let url = strategy.pdf_url(&id, &landing).await.unwrap().unwrap();
        assert_eq!(url, "https://journal.example.com/doi/pdf/10.5555/x");
    }

    #[tokio::test]
    async fn test_data_attribute() {
        let strategy = GenericStrategy::new();
        let id = normalize("10.5555/x").unwrap();
        let landing =
            landing_with(r#"<button data-pdf-url="https://journal.example.com/d/x.pdf">"#);

        let url = strategy.pdf_url(&id, &landing).await.unwrap().unwrap();
        assert_eq!(url, "https://journal.example.com/d/x.pdf");
    }

    #[tokio::test]
    async fn test_wide_net_skips_assets_and_trackers() {
        let strategy = GenericStrategy::new();
        let id = normalize("10.5555/x").unwrap();
        let landing = landing_with(
            r#"<a href="/logo.png.pdf">fake</a>
               <a href="/analytics/track.pdf">tracker</a>
               <a href="/papers/real.pdf">PDF</a>"#,
        );

        let url = strategy.pdf_url(&id, &landing).await.unwrap().unwrap();
        assert_eq!(url, "https://journal.example.com/papers/real.pdf");
    }

    #[tokio::test]
    async fn test_no_html_yields_none() {
        let strategy = GenericStrategy::new();
        let id = normalize("10.5555/x").unwrap();
        let landing = LandingPage::unfetched(id.landing_url());

        assert!(strategy.pdf_url(&id, &landing).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_no_candidates_yields_none() {
        let strategy = GenericStrategy::new();
        let id = normalize("10.5555/x").unwrap();
        let landing = landing_with("<html><body>Abstract only.</body></html>");

        assert!(strategy.pdf_url(&id, &landing).await.unwrap().is_none());
    }
}
