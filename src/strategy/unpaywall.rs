//! Open-access lookup via the Unpaywall API.
//!
//! This is a meta-strategy that works across all publishers by finding
//! legal open-access copies. It runs first in the chain: one API call that
//! frequently sidesteps every scraping problem downstream.
//!
//! API: `GET https://api.unpaywall.org/v2/{doi}?email={email}`. No
//! authentication, just a contact email. The response carries
//! `best_oa_location.url_for_pdf` when an OA copy exists.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{Disposition, DownloadStrategy, LandingPage, default_disposition};
use crate::download::{FetchError, HttpClient};
use crate::identifier::{IdentifierKind, NormalizedIdentifier};
use crate::postponed::BlockClassifier;

const DEFAULT_ENDPOINT: &str = "https://api.unpaywall.org/v2";

/// Strategy for finding open-access PDFs via the Unpaywall API.
pub struct UnpaywallStrategy {
    client: Arc<HttpClient>,
    email: String,
    endpoint: String,
}

impl UnpaywallStrategy {
    /// Creates the strategy against the public Unpaywall endpoint.
    #[must_use]
    pub fn new(client: Arc<HttpClient>, email: &str) -> Self {
        Self::with_endpoint(client, email, DEFAULT_ENDPOINT)
    }

    /// Creates the strategy against a custom endpoint (a mirror, or a mock
    /// in tests).
    #[must_use]
    pub fn with_endpoint(client: Arc<HttpClient>, email: &str, endpoint: &str) -> Self {
        Self {
            client,
            email: email.to_string(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
        }
    }

    /// Picks the PDF URL out of an Unpaywall response document.
    fn extract_pdf_url(data: &serde_json::Value) -> Option<String> {
        if !data["is_oa"].as_bool().unwrap_or(false) {
            return None;
        }

        let best = if data["best_oa_location"].is_object() {
            &data["best_oa_location"]
        } else {
            data["oa_locations"].get(0)?
        };

        best["url_for_pdf"]
            .as_str()
            .or_else(|| best["url"].as_str())
            .map(str::to_string)
    }
}

#[async_trait]
impl DownloadStrategy for UnpaywallStrategy {
    fn name(&self) -> &'static str {
        "unpaywall"
    }

    /// Highest priority: try the legal open-access copy before any
    /// publisher scraping.
    fn priority(&self) -> u32 {
        0
    }

    fn can_handle(&self, identifier: &NormalizedIdentifier) -> bool {
        identifier.kind == IdentifierKind::Doi
    }

    async fn pdf_url(
        &self,
        identifier: &NormalizedIdentifier,
        _landing: &LandingPage,
    ) -> Result<Option<String>, FetchError> {
        let api_url = format!(
            "{}/{}?email={}",
            self.endpoint, identifier.canonical, self.email
        );

        let data = match self.client.get_json(&api_url).await {
            Ok(data) => data,
            Err(FetchError::NotFound { .. }) => {
                debug!(doi = %identifier.canonical, "DOI not in Unpaywall database");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        match Self::extract_pdf_url(&data) {
            Some(pdf_url) => {
                debug!(
                    doi = %identifier.canonical,
                    pdf_url = %pdf_url,
                    version = data["best_oa_location"]["version"].as_str().unwrap_or("unknown"),
                    "found OA PDF via Unpaywall"
                );
                Ok(Some(pdf_url))
            }
            None => {
                debug!(doi = %identifier.canonical, "no OA location available");
                Ok(None)
            }
        }
    }

    fn classify(&self, error: &FetchError, blocks: &BlockClassifier) -> Disposition {
        // The API itself timing out says nothing permanent about the paper;
        // defer rather than burn an attempt per strategy pass.
        if matches!(error, FetchError::Timeout { .. }) {
            warn!("Unpaywall API timeout; postponing");
            return Disposition::Postpone;
        }
        default_disposition(error, blocks)
    }
}
