//! Springer / Nature downloads.
//!
//! DOI prefixes 10.1007 (Springer) and 10.1038 (Nature); domains
//! `springer.com`, `link.springer.com`, `nature.com`.
//!
//! Springer's PDF URLs follow a stable pattern
//! (`link.springer.com/content/pdf/{doi}.pdf`), with the landing page's
//! download link as a better source when we have the HTML. A "Buy article"
//! page without a download link means no entitlement.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use super::{Disposition, DownloadStrategy, LandingPage, default_disposition};
use crate::download::FetchError;
use crate::identifier::{IdentifierKind, NormalizedIdentifier};
use crate::postponed::BlockClassifier;

#[allow(clippy::expect_used)]
static META_PDF_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<meta\s+name=["']citation_pdf_url["']\s+content=["']([^"']+)["']"#)
        .expect("meta pdf regex is valid")
});

/// Download button carries `data-track-action="download pdf"` or similar.
#[allow(clippy::expect_used)]
static DOWNLOAD_LINK_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)href=["']([^"']*/content/pdf/[^"']+)["']"#)
        .expect("download link regex is valid")
});

/// Strategy for Springer and Nature journals.
#[derive(Debug, Default)]
pub struct SpringerStrategy;

impl SpringerStrategy {
    /// Creates the Springer strategy.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DownloadStrategy for SpringerStrategy {
    fn name(&self) -> &'static str {
        "springer"
    }

    fn priority(&self) -> u32 {
        10
    }

    fn can_handle(&self, identifier: &NormalizedIdentifier) -> bool {
        match identifier.kind {
            IdentifierKind::Doi => matches!(identifier.doi_prefix(), Some("10.1007" | "10.1038")),
            IdentifierKind::Url => identifier
                .domain()
                .is_some_and(|d| d.contains("springer.com") || d.contains("nature.com")),
            IdentifierKind::Arxiv => false,
        }
    }

    async fn pdf_url(
        &self,
        identifier: &NormalizedIdentifier,
        landing: &LandingPage,
    ) -> Result<Option<String>, FetchError> {
        let html = landing.html();

        if let Some(cap) = META_PDF_PATTERN.captures(html) {
            let url = absolutize(&cap[1], landing.effective_url());
            debug!(url = %url, "found Springer PDF in citation_pdf_url meta");
            return Ok(Some(url));
        }

        if let Some(cap) = DOWNLOAD_LINK_PATTERN.captures(html) {
            let url = absolutize(&cap[1], landing.effective_url());
            debug!(url = %url, "found Springer content/pdf link");
            return Ok(Some(url));
        }

        // The URL pattern holds even without the landing page.
        if identifier.kind == IdentifierKind::Doi {
            let url = format!(
                "https://link.springer.com/content/pdf/{}.pdf",
                identifier.canonical
            );
            debug!(url = %url, "constructed Springer PDF URL from DOI pattern");
            return Ok(Some(url));
        }

        Ok(None)
    }

    fn classify(&self, error: &FetchError, blocks: &BlockClassifier) -> Disposition {
        // A Springer 403 on the PDF itself is a missing entitlement
        // (paywall), not bot blocking. Retrying cannot help.
        if matches!(error, FetchError::AccessDenied { .. }) {
            return Disposition::Permanent;
        }
        default_disposition(error, blocks)
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

    #[test]
    fn test_can_handle_springer_and_nature_prefixes() {
        let strategy = SpringerStrategy::new();
        assert!(strategy.can_handle(&normalize("10.1007/s10623-024-01403-z").unwrap()));
        assert!(strategy.can_handle(&normalize("10.1038/nature12373").unwrap()));
        assert!(!strategy.can_handle(&normalize("10.1016/j.cell.2024.01.001").unwrap()));
    }

    #[test]
    fn test_can_handle_springer_urls() {
        let strategy = SpringerStrategy::new();
        assert!(strategy.can_handle(
            &normalize("https://link.springer.com/article/10.1007/s1").unwrap()
        ));
        assert!(!strategy.can_handle(&normalize("https://example.com/x").unwrap()));
    }

    #[tokio::test]
    async fn test_pdf_url_prefers_meta_tag() {
        let strategy = SpringerStrategy::new();
        let id = normalize("10.1007/s10623-024-01403-z").unwrap();
        let landing = LandingPage {
            url: id.landing_url(),
            final_url: Some("https://link.springer.com/article/10.1007/s10623-024-01403-z".into()),
            html: Some(
                r#"<meta name="citation_pdf_url" content="https://link.springer.com/content/pdf/10.1007/s10623-024-01403-z.pdf">"#
                    .into(),
            ),
        };

        let url = strategy.pdf_url(&id, &landing).await.unwrap().unwrap();
        assert!(url.ends_with("s10623-024-01403-z.pdf"));
    }

    #[tokio::test]
    async fn test_pdf_url_from_relative_content_link() {
        let strategy = SpringerStrategy::new();
        let id = normalize("10.1007/s1").unwrap();
        let landing = LandingPage {
            url: id.landing_url(),
            final_url: Some("https://link.springer.com/article/10.1007/s1".into()),
            html: Some(r#"<a href="/content/pdf/10.1007/s1.pdf">Download PDF</a>"#.into()),
        };

        let url = strategy.pdf_url(&id, &landing).await.unwrap().unwrap();
        assert_eq!(url, "https://link.springer.com/content/pdf/10.1007/s1.pdf");
    }

    #[tokio::test]
    async fn test_pdf_url_falls_back_to_doi_pattern() {
        let strategy = SpringerStrategy::new();
        let id = normalize("10.1007/s1").unwrap();
        let landing = LandingPage::unfetched(id.landing_url());

        let url = strategy.pdf_url(&id, &landing).await.unwrap().unwrap();
        assert_eq!(url, "https://link.springer.com/content/pdf/10.1007/s1.pdf");
    }

    #[test]
    fn test_classify_access_denied_is_paywall() {
        let strategy = SpringerStrategy::new();
        let blocks = BlockClassifier::default();
        let error = FetchError::from_status("https://link.springer.com/x.pdf", 403, None);
        assert_eq!(strategy.classify(&error, &blocks), Disposition::Permanent);
    }

    #[test]
    fn test_classify_rate_limit_still_postpones() {
        let strategy = SpringerStrategy::new();
        let blocks = BlockClassifier::default();
        let error = FetchError::rate_limited("https://link.springer.com/x.pdf", None);
        assert_eq!(strategy.classify(&error, &blocks), Disposition::Postpone);
    }
}
