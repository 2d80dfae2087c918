//! Browser-automation-backed acquisition.
//!
//! Some publishers only reveal their PDF links to a real rendering engine.
//! The engine treats that capability as opaque: a [`PageRenderer`] renders
//! a page and reports candidate PDF links (or an inline PDF), and this
//! strategy consumes it as one more data source.
//!
//! Automation sessions are not thread-safe and are expensive to start, so
//! the strategy enforces a per-domain affinity: at most one render per
//! domain at a time, with consecutive same-domain requests reusing the
//! serialized session instead of racing it.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::debug;

use super::{DownloadStrategy, LandingPage};
use crate::download::FetchError;
use crate::download::rate_limiter::extract_domain;
use crate::identifier::NormalizedIdentifier;

/// What a renderer extracted from one page.
#[derive(Debug, Clone, Default)]
pub struct RenderedPage {
    /// Rendered DOM serialized back to HTML.
    pub html: String,
    /// Candidate PDF links found in the rendered DOM, best first.
    pub pdf_links: Vec<String>,
    /// URL of an inline PDF viewer's document, when the page itself is one.
    pub inline_pdf: Option<String>,
}

/// Opaque browser-automation collaborator.
///
/// Implementations own session lifecycle, rendering, and link extraction.
/// The engine only promises to call one render per domain at a time.
#[async_trait]
pub trait PageRenderer: Send + Sync {
    /// Renders `url` and extracts PDF candidates.
    async fn render(&self, url: &str) -> Result<RenderedPage, FetchError>;
}

/// Strategy wrapping a [`PageRenderer`].
pub struct BrowserStrategy {
    renderer: Arc<dyn PageRenderer>,
    /// One lock per domain: the affinity constraint the scheduler honors.
    sessions: DashMap<String, Arc<Mutex<()>>>,
}

impl BrowserStrategy {
    /// Creates the strategy around a renderer.
    #[must_use]
    pub fn new(renderer: Arc<dyn PageRenderer>) -> Self {
        Self {
            renderer,
            sessions: DashMap::new(),
        }
    }

    fn session_lock(&self, domain: &str) -> Arc<Mutex<()>> {
        self.sessions
            .entry(domain.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl DownloadStrategy for BrowserStrategy {
    fn name(&self) -> &'static str {
        "browser"
    }

    /// Behind every direct strategy; rendering is slow and heavy.
    fn priority(&self) -> u32 {
        500
    }

    fn can_handle(&self, _identifier: &NormalizedIdentifier) -> bool {
        true
    }

    async fn pdf_url(
        &self,
        identifier: &NormalizedIdentifier,
        landing: &LandingPage,
    ) -> Result<Option<String>, FetchError> {
        let target = landing.effective_url();
        let domain = extract_domain(target);

        // Serialize renders per domain; the Arc keeps the lock alive even
        // if another worker drops the map entry's shard lock first.
        let lock = self.session_lock(&domain);
        let _session = lock.lock().await;

        debug!(identifier = %identifier.canonical, url = %target, "rendering page");
        let rendered = self.renderer.render(target).await?;

        if let Some(inline) = rendered.inline_pdf {
            debug!(url = %inline, "renderer reported inline PDF");
            return Ok(Some(inline));
        }
        Ok(rendered.pdf_links.into_iter().next())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::identifier::normalize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Renderer that records its peak concurrency per call.
    struct CountingRenderer {
        active: AtomicUsize,
        peak: AtomicUsize,
        links: Vec<String>,
    }

    impl CountingRenderer {
        fn new(links: Vec<String>) -> Self {
            Self {
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                links,
            }
        }
    }

    #[async_trait]
    impl PageRenderer for CountingRenderer {
        async fn render(&self, _url: &str) -> Result<RenderedPage, FetchError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(RenderedPage {
                html: String::new(),
                pdf_links: self.links.clone(),
                inline_pdf: None,
            })
        }
    }

    #[tokio::test]
    async fn test_returns_first_candidate_link() {
        let renderer = Arc::new(CountingRenderer::new(vec![
            "https://pub.example.com/a.pdf".to_string(),
            "https://pub.example.com/b.pdf".to_string(),
        ]));
        let strategy = BrowserStrategy::new(renderer);
        let id = normalize("https://pub.example.com/article/1").unwrap();
        let landing = LandingPage::unfetched(id.landing_url());

        let url = strategy.pdf_url(&id, &landing).await.unwrap();
        assert_eq!(url.as_deref(), Some("https://pub.example.com/a.pdf"));
    }

    #[tokio::test]
    async fn test_inline_pdf_wins_over_links() {
        struct InlineRenderer;

        #[async_trait]
        impl PageRenderer for InlineRenderer {
            async fn render(&self, _url: &str) -> Result<RenderedPage, FetchError> {
                Ok(RenderedPage {
                    html: String::new(),
                    pdf_links: vec!["https://x.example.com/link.pdf".to_string()],
                    inline_pdf: Some("https://x.example.com/inline.pdf".to_string()),
                })
            }
        }

        let strategy = BrowserStrategy::new(Arc::new(InlineRenderer));
        let id = normalize("https://x.example.com/viewer").unwrap();
        let landing = LandingPage::unfetched(id.landing_url());

        let url = strategy.pdf_url(&id, &landing).await.unwrap();
        assert_eq!(url.as_deref(), Some("https://x.example.com/inline.pdf"));
    }

    #[tokio::test]
    async fn test_same_domain_renders_are_serialized() {
        let renderer = Arc::new(CountingRenderer::new(vec![]));
        let strategy = Arc::new(BrowserStrategy::new(Arc::clone(&renderer) as Arc<dyn PageRenderer>));

        let mut handles = Vec::new();
        for i in 0..4 {
            let strategy = Arc::clone(&strategy);
            handles.push(tokio::spawn(async move {
                let id = normalize(&format!("https://same.example.com/article/{i}")).unwrap();
                let landing = LandingPage::unfetched(id.landing_url());
                strategy.pdf_url(&id, &landing).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(
            renderer.peak.load(Ordering::SeqCst),
            1,
            "at most one automation session per domain at a time"
        );
    }

    #[tokio::test]
    async fn test_different_domains_render_in_parallel() {
        let renderer = Arc::new(CountingRenderer::new(vec![]));
        let strategy = Arc::new(BrowserStrategy::new(Arc::clone(&renderer) as Arc<dyn PageRenderer>));

        let mut handles = Vec::new();
        for i in 0..4 {
            let strategy = Arc::clone(&strategy);
            handles.push(tokio::spawn(async move {
                let id = normalize(&format!("https://domain{i}.example.com/article")).unwrap();
                let landing = LandingPage::unfetched(id.landing_url());
                strategy.pdf_url(&id, &landing).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(
            renderer.peak.load(Ordering::SeqCst) > 1,
            "independent domains must not serialize on each other"
        );
    }
}
