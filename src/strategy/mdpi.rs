//! MDPI downloads.
//!
//! DOI prefix 10.3390; domain `mdpi.com`. MDPI is a fully open-access
//! publisher with a very consistent URL scheme: the PDF lives at the
//! article URL plus `/pdf`. Because everything is supposed to be freely
//! downloadable, errors here lean toward "temporary": a blocked or failing
//! MDPI request is almost never a paywall.

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

/// MDPI download links carry a version query: `/pdf?version=1234567890`.
#[allow(clippy::expect_used)]
static PDF_LINK_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)href=["']([^"']*/pdf(?:\?version=\d+)?)["']"#)
        .expect("pdf link regex is valid")
});

/// Strategy for MDPI journals.
#[derive(Debug, Default)]
pub struct MdpiStrategy;

impl MdpiStrategy {
    /// Creates the MDPI strategy.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DownloadStrategy for MdpiStrategy {
    fn name(&self) -> &'static str {
        "mdpi"
    }

    fn priority(&self) -> u32 {
        10
    }

    fn can_handle(&self, identifier: &NormalizedIdentifier) -> bool {
        match identifier.kind {
            IdentifierKind::Doi => identifier.doi_prefix() == Some("10.3390"),
            IdentifierKind::Url => identifier.domain().is_some_and(|d| d.ends_with("mdpi.com")),
            IdentifierKind::Arxiv => false,
        }
    }

    async fn pdf_url(
        &self,
        _identifier: &NormalizedIdentifier,
        landing: &LandingPage,
    ) -> Result<Option<String>, FetchError> {
        let html = landing.html();

        if let Some(cap) = META_PDF_PATTERN.captures(html) {
            let url = absolutize(&cap[1], landing.effective_url());
            debug!(url = %url, "found MDPI PDF in citation_pdf_url meta");
            return Ok(Some(url));
        }

        if let Some(cap) = PDF_LINK_PATTERN.captures(html) {
            let url = absolutize(&cap[1], landing.effective_url());
            debug!(url = %url, "found MDPI PDF link");
            return Ok(Some(url));
        }

        // The article URL plus /pdf works for every MDPI article; even a
        // doi.org landing that failed to fetch still redirects there.
        let base = landing.effective_url().trim_end_matches('/');
        if base.is_empty() {
            return Ok(None);
        }
        let url = if base.ends_with("/pdf") {
            base.to_string()
        } else {
            format!("{base}/pdf")
        };
        debug!(url = %url, "constructed MDPI PDF URL");
        Ok(Some(url))
    }

    fn classify(&self, error: &FetchError, blocks: &BlockClassifier) -> Disposition {
        match error {
            // Open access: transport trouble and odd statuses are all
            // expected to clear on their own.
            FetchError::Timeout { .. }
            | FetchError::Network { .. }
            | FetchError::HttpStatus { .. } => Disposition::Postpone,
            _ => default_disposition(error, blocks),
        }
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
    fn test_can_handle_mdpi() {
        let strategy = MdpiStrategy::new();
        assert!(strategy.can_handle(&normalize("10.3390/math9182272").unwrap()));
        assert!(strategy.can_handle(&normalize("https://www.mdpi.com/2227-7390/9/18/2272").unwrap()));
        assert!(!strategy.can_handle(&normalize("10.1007/x").unwrap()));
    }

    #[tokio::test]
    async fn test_pdf_url_appends_pdf_suffix() {
        let strategy = MdpiStrategy::new();
        let id = normalize("10.3390/math9182272").unwrap();
        let landing = LandingPage {
            url: id.landing_url(),
            final_url: Some("https://www.mdpi.com/2227-7390/9/18/2272".into()),
            html: Some("<html>no links here</html>".into()),
        };

        let url = strategy.pdf_url(&id, &landing).await.unwrap().unwrap();
        assert_eq!(url, "https://www.mdpi.com/2227-7390/9/18/2272/pdf");
    }

    #[tokio::test]
    async fn test_pdf_url_no_double_suffix() {
        let strategy = MdpiStrategy::new();
        let id = normalize("https://www.mdpi.com/2227-7390/9/18/2272/pdf").unwrap();
        let landing = LandingPage::unfetched(id.landing_url());

        let url = strategy.pdf_url(&id, &landing).await.unwrap().unwrap();
        assert_eq!(url, "https://www.mdpi.com/2227-7390/9/18/2272/pdf");
    }

    #[tokio::test]
    async fn test_pdf_url_versioned_link_from_html() {
        let strategy = MdpiStrategy::new();
        let id = normalize("10.3390/math9182272").unwrap();
        let landing = LandingPage {
            url: id.landing_url(),
            final_url: Some("https://www.mdpi.com/2227-7390/9/18/2272".into()),
            html: Some(
                r#"<a href="/2227-7390/9/18/2272/pdf?version=1631234567">Download</a>"#.into(),
            ),
        };

        let url = strategy.pdf_url(&id, &landing).await.unwrap().unwrap();
        assert_eq!(
            url,
            "https://www.mdpi.com/2227-7390/9/18/2272/pdf?version=1631234567"
        );
    }

    #[test]
    fn test_classify_leans_postpone() {
        let strategy = MdpiStrategy::new();
        let blocks = BlockClassifier::default();
        assert_eq!(
            strategy.classify(&FetchError::timeout("https://www.mdpi.com/x"), &blocks),
            Disposition::Postpone
        );
        // A missing article is still permanent.
        let error = FetchError::from_status("https://www.mdpi.com/x", 404, None);
        assert_eq!(strategy.classify(&error, &blocks), Disposition::Permanent);
    }
}
