//! Elsevier / ScienceDirect downloads.
//!
//! DOI prefix 10.1016; domain `sciencedirect.com`. ScienceDirect sits
//! behind aggressive bot protection, so this strategy only scrapes what the
//! landing page hands over (`citation_pdf_url` meta, `pdfft` links) and
//! leaves anything harder to the browser and generic fallbacks.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use super::{DownloadStrategy, LandingPage};
use crate::download::FetchError;
use crate::identifier::{IdentifierKind, NormalizedIdentifier};

#[allow(clippy::expect_used)]
static META_PDF_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<meta\s+name=["']citation_pdf_url["']\s+content=["']([^"']+)["']"#)
        .expect("meta pdf regex is valid")
});

/// ScienceDirect full-text links: `/science/article/pii/{PII}/pdfft?...`
#[allow(clippy::expect_used)]
static PDFFT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)href=["']([^"']*/pii/[^"']*/pdfft[^"']*)["']"#)
        .expect("pdfft regex is valid")
});

/// Strategy for Elsevier journals via ScienceDirect.
#[derive(Debug, Default)]
pub struct ElsevierStrategy;

impl ElsevierStrategy {
    /// Creates the Elsevier strategy.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DownloadStrategy for ElsevierStrategy {
    fn name(&self) -> &'static str {
        "elsevier"
    }

    fn priority(&self) -> u32 {
        10
    }

    fn can_handle(&self, identifier: &NormalizedIdentifier) -> bool {
        match identifier.kind {
            IdentifierKind::Doi => identifier.doi_prefix() == Some("10.1016"),
            IdentifierKind::Url => identifier
                .domain()
                .is_some_and(|d| d.contains("sciencedirect.com") || d.contains("elsevier.com")),
            IdentifierKind::Arxiv => false,
        }
    }

    async fn pdf_url(
        &self,
        _identifier: &NormalizedIdentifier,
        landing: &LandingPage,
    ) -> Result<Option<String>, FetchError> {
        let html = landing.html();
        if html.is_empty() {
            return Ok(None);
        }

        if let Some(cap) = META_PDF_PATTERN.captures(html) {
            let url = absolutize(&cap[1], landing.effective_url());
            debug!(url = %url, "found Elsevier PDF in citation_pdf_url meta");
            return Ok(Some(url));
        }

        if let Some(cap) = PDFFT_PATTERN.captures(html) {
            let url = absolutize(&cap[1], landing.effective_url());
            debug!(url = %url, "found ScienceDirect pdfft link");
            return Ok(Some(url));
        }

        Ok(None)
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
