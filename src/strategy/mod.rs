//! PDF-location strategies and the chain that dispatches them.
//!
//! Each publisher (plus a handful of cross-publisher sources) gets a
//! [`DownloadStrategy`]: a small object that claims identifiers it
//! understands, produces candidate PDF URLs, and rules on what its errors
//! mean. Strategies never make the final download, write files, or manage
//! retries; the executor does that.
//!
//! # Dispatch
//!
//! Strategies are collected into a [`StrategyChain`] sorted by ascending
//! priority. For one identifier, the chain yields every strategy that
//! claims it; the first to produce a candidate URL that downloads and
//! validates wins the attempt.
//!
//! # Error policy
//!
//! Each strategy is the authority on its own failures via
//! [`DownloadStrategy::classify`], returning a [`Disposition`]:
//! server errors, 403s, captcha-or-HTML-instead-of-PDF bodies, and
//! rate-limit wording postpone (retryable later, circuit-breaker
//! candidates); 404s and malformed identifiers fail permanently; anything
//! else is an ordinary retryable failure bounded by the attempt cap.

mod arxiv;
mod browser;
mod elsevier;
mod generic;
mod mdpi;
mod springer;
mod unpaywall;

pub use arxiv::ArxivStrategy;
pub use browser::{BrowserStrategy, PageRenderer, RenderedPage};
pub use elsevier::ElsevierStrategy;
pub use generic::GenericStrategy;
pub use mdpi::MdpiStrategy;
pub use springer::SpringerStrategy;
pub use unpaywall::UnpaywallStrategy;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::download::{FetchError, HttpClient};
use crate::identifier::NormalizedIdentifier;
use crate::postponed::BlockClassifier;

/// The landing page fetched once per identifier and shared by every
/// strategy in the chain.
#[derive(Debug, Clone, Default)]
pub struct LandingPage {
    /// The URL that was requested (usually a `doi.org` resolution).
    pub url: String,
    /// The URL after redirects, when the fetch succeeded.
    pub final_url: Option<String>,
    /// Page HTML, when the fetch succeeded with a 200.
    pub html: Option<String>,
}

impl LandingPage {
    /// A landing page that was never fetched (or failed to fetch).
    #[must_use]
    pub fn unfetched(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            final_url: None,
            html: None,
        }
    }

    /// The best URL to resolve relative links against.
    #[must_use]
    pub fn effective_url(&self) -> &str {
        self.final_url.as_deref().unwrap_or(&self.url)
    }

    /// Page HTML, empty when unavailable.
    #[must_use]
    pub fn html(&self) -> &str {
        self.html.as_deref().unwrap_or("")
    }
}

/// How a strategy rules on one of its failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Block-shaped: defer this identifier (and possibly its whole
    /// source) and retry once the block clears.
    Postpone,
    /// Will never succeed; stop retrying.
    Permanent,
    /// Ordinary failure; the next strategy (or a later run) may succeed.
    Retryable,
}

/// Capability contract for one acquisition source.
///
/// Object-safe via `async_trait` so the chain can hold `Box<dyn …>` values,
/// matching the closed-set-of-variants dispatch the engine needs.
#[async_trait]
pub trait DownloadStrategy: Send + Sync {
    /// Short stable name, recorded into the state store.
    fn name(&self) -> &'static str;

    /// Chain position; lower runs earlier.
    fn priority(&self) -> u32;

    /// Circuit-breaker family, for sources whose block signature is
    /// unambiguous enough that one detection should stop the whole family.
    fn family(&self) -> Option<&'static str> {
        None
    }

    /// Whether this strategy understands the identifier.
    fn can_handle(&self, identifier: &NormalizedIdentifier) -> bool;

    /// Produces a candidate PDF URL, or `None` when this source has nothing
    /// for the identifier.
    async fn pdf_url(
        &self,
        identifier: &NormalizedIdentifier,
        landing: &LandingPage,
    ) -> Result<Option<String>, FetchError>;

    /// Rules on an error produced while following this strategy's candidate.
    fn classify(&self, error: &FetchError, blocks: &BlockClassifier) -> Disposition {
        default_disposition(error, blocks)
    }
}

/// The shared postpone/permanent/retryable policy. Strategies override
/// only where their publisher deviates.
#[must_use]
pub fn default_disposition(error: &FetchError, blocks: &BlockClassifier) -> Disposition {
    match error {
        FetchError::RateLimited { .. } | FetchError::AccessDenied { .. } => Disposition::Postpone,
        FetchError::HttpStatus { status, .. } if (500..600).contains(status) => {
            Disposition::Postpone
        }
        FetchError::NotFound { .. } | FetchError::InvalidUrl { .. } => Disposition::Permanent,
        FetchError::Validation { body_preview, .. } => {
            if blocks.is_block("", body_preview) {
                Disposition::Postpone
            } else {
                Disposition::Retryable
            }
        }
        _ => Disposition::Retryable,
    }
}

/// Priority-ordered collection of strategies.
#[derive(Default)]
pub struct StrategyChain {
    strategies: Vec<Box<dyn DownloadStrategy>>,
}

impl std::fmt::Debug for StrategyChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyChain")
            .field(
                "strategies",
                &self.strategies.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl StrategyChain {
    /// Creates an empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a strategy, keeping the chain sorted by ascending
    /// priority (stable for equal priorities: registration order).
    pub fn register(&mut self, strategy: Box<dyn DownloadStrategy>) {
        self.strategies.push(strategy);
        self.strategies.sort_by_key(|s| s.priority());
    }

    /// Every strategy that claims the identifier, in priority order.
    #[must_use]
    pub fn candidates(&self, identifier: &NormalizedIdentifier) -> Vec<&dyn DownloadStrategy> {
        self.strategies
            .iter()
            .filter(|s| s.can_handle(identifier))
            .map(AsRef::as_ref)
            .collect()
    }

    /// Number of registered strategies.
    #[must_use]
    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    /// Whether the chain is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}

/// Builds the default chain: open-access lookup first, publisher-specific
/// strategies next, browser rendering and the generic landing-page scan as
/// fallbacks.
#[must_use]
pub fn build_default_chain(
    client: Arc<HttpClient>,
    unpaywall_email: &str,
    renderer: Option<Arc<dyn PageRenderer>>,
) -> StrategyChain {
    let mut chain = StrategyChain::new();
    chain.register(Box::new(UnpaywallStrategy::new(client, unpaywall_email)));
    chain.register(Box::new(ArxivStrategy::new()));
    chain.register(Box::new(SpringerStrategy::new()));
    chain.register(Box::new(ElsevierStrategy::new()));
    chain.register(Box::new(MdpiStrategy::new()));
    if let Some(renderer) = renderer {
        chain.register(Box::new(BrowserStrategy::new(renderer)));
    }
    chain.register(Box::new(GenericStrategy::new()));
    debug!(strategies = chain.len(), "built default strategy chain");
    chain
}
