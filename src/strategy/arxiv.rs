//! Direct downloads from arXiv.
//!
//! arXiv is fully open access with a stable URL pattern, so no landing-page
//! scraping is needed: `https://arxiv.org/pdf/{id}.pdf`. The identifier
//! resolver has already reduced every accepted spelling (bare ID, `arxiv:`
//! prefix, embedded DOI, abs/pdf URLs) to the canonical ID.
//!
//! arXiv's rate limiter is the canonical example of an unambiguous,
//! immediate block signature: the moment one request trips it, every
//! further request from this address will too. The strategy therefore
//! participates in the `arxiv` circuit-breaker family: one detection
//! short-circuits the rest of the batch for this family.

use async_trait::async_trait;
use tracing::debug;

use super::{Disposition, DownloadStrategy, LandingPage, default_disposition};
use crate::download::FetchError;
use crate::identifier::{IdentifierKind, NormalizedIdentifier};
use crate::postponed::BlockClassifier;

/// Strategy for downloading preprints from arXiv.
#[derive(Debug, Default)]
pub struct ArxivStrategy;

impl ArxivStrategy {
    /// Creates the arXiv strategy.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DownloadStrategy for ArxivStrategy {
    fn name(&self) -> &'static str {
        "arxiv"
    }

    /// Early, right after the open-access lookup: free, fast, reliable.
    fn priority(&self) -> u32 {
        5
    }

    fn family(&self) -> Option<&'static str> {
        Some("arxiv")
    }

    fn can_handle(&self, identifier: &NormalizedIdentifier) -> bool {
        identifier.kind == IdentifierKind::Arxiv
    }

    async fn pdf_url(
        &self,
        identifier: &NormalizedIdentifier,
        _landing: &LandingPage,
    ) -> Result<Option<String>, FetchError> {
        let pdf_url = format!("https://arxiv.org/pdf/{}.pdf", identifier.canonical);
        debug!(arxiv_id = %identifier.canonical, pdf_url = %pdf_url, "constructed arXiv PDF URL");
        Ok(Some(pdf_url))
    }

    fn classify(&self, error: &FetchError, blocks: &BlockClassifier) -> Disposition {
        match error {
            // arXiv itself is dependable; connection trouble usually means
            // we are being throttled at the edge. Defer rather than churn.
            FetchError::Timeout { .. } | FetchError::Network { .. } => Disposition::Postpone,
            _ => default_disposition(error, blocks),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::identifier::normalize;

    #[tokio::test]
    async fn test_pdf_url_new_style() {
        let strategy = ArxivStrategy::new();
        let id = normalize("2301.12345").unwrap();
        let landing = LandingPage::unfetched(id.landing_url());

        let url = strategy.pdf_url(&id, &landing).await.unwrap().unwrap();
        assert_eq!(url, "https://arxiv.org/pdf/2301.12345.pdf");
    }

    #[tokio::test]
    async fn test_pdf_url_preserves_version() {
        let strategy = ArxivStrategy::new();
        let id = normalize("arXiv:2301.12345v2").unwrap();
        let landing = LandingPage::unfetched(id.landing_url());

        let url = strategy.pdf_url(&id, &landing).await.unwrap().unwrap();
        assert_eq!(url, "https://arxiv.org/pdf/2301.12345v2.pdf");
    }

    #[tokio::test]
    async fn test_pdf_url_old_style() {
        let strategy = ArxivStrategy::new();
        let id = normalize("math.GT/0309136").unwrap();
        let landing = LandingPage::unfetched(id.landing_url());

        let url = strategy.pdf_url(&id, &landing).await.unwrap().unwrap();
        assert_eq!(url, "https://arxiv.org/pdf/math.GT/0309136.pdf");
    }

    #[test]
    fn test_can_handle_only_arxiv() {
        let strategy = ArxivStrategy::new();
        assert!(strategy.can_handle(&normalize("2301.12345").unwrap()));
        assert!(strategy.can_handle(&normalize("10.48550/arXiv.2301.12345").unwrap()));
        assert!(!strategy.can_handle(&normalize("10.1007/s1").unwrap()));
    }

    #[test]
    fn test_family_is_arxiv() {
        assert_eq!(ArxivStrategy::new().family(), Some("arxiv"));
    }

    #[test]
    fn test_classify_network_trouble_postpones() {
        let strategy = ArxivStrategy::new();
        let blocks = BlockClassifier::default();
        assert_eq!(
            strategy.classify(&FetchError::timeout("https://arxiv.org/pdf/x.pdf"), &blocks),
            Disposition::Postpone
        );
    }

    #[test]
    fn test_classify_not_found_permanent() {
        let strategy = ArxivStrategy::new();
        let blocks = BlockClassifier::default();
        let error = FetchError::from_status("https://arxiv.org/pdf/x.pdf", 404, None);
        assert_eq!(strategy.classify(&error, &blocks), Disposition::Permanent);
    }
}
