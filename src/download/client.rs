//! HTTP client wrapper for landing pages and streaming PDF downloads.
//!
//! This module provides the `HttpClient` struct which handles streaming
//! downloads with proper timeout configuration and error handling.
//!
//! # Overview
//!
//! One client is created per engine and shared (it is `Clone` over a pooled
//! connection set). Downloads stream through a size-bounded chunked read:
//! the leading bytes are validated against the PDF signature before anything
//! touches the final path, data lands in a `.part` temporary file, and only
//! a fully-written, validated body is renamed into place. The cancellation
//! token is polled at every chunk boundary, so worst-case cancellation
//! latency is one chunk's transfer time.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::RETRY_AFTER;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, instrument, warn};

use super::cancel::CancellationToken;
use super::error::FetchError;

/// Default connect timeout in seconds.
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default per-request read timeout in seconds.
pub const READ_TIMEOUT_SECS: u64 = 120;

/// Leading bytes of every PDF file.
const PDF_MAGIC: &[u8] = b"%PDF";

/// How much of a non-PDF body is kept for block-signature classification.
const BODY_PREVIEW_BYTES: usize = 1024;

/// Browser-like User-Agent. Several publishers serve block pages to
/// anything that does not look like a browser.
const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// A fetched landing page.
#[derive(Debug, Clone)]
pub struct PageResponse {
    /// HTTP status code of the final response.
    pub status: u16,
    /// URL after redirects.
    pub final_url: String,
    /// Response body as text.
    pub body: String,
}

/// HTTP client for landing pages and streaming PDF downloads.
///
/// Designed to be created once and reused for every request in a batch,
/// taking advantage of connection pooling.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    /// Creates a new HTTP client with default timeouts.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails to build with the static
    /// configuration. This should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        Self::with_timeouts(CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS)
    }

    /// Creates a new HTTP client with explicit timeout values.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails to build with the supplied
    /// timeout configuration.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn with_timeouts(connect_timeout_secs: u64, read_timeout_secs: u64) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout_secs))
            .timeout(Duration::from_secs(read_timeout_secs))
            .gzip(true)
            .user_agent(USER_AGENT)
            .build()
            .expect("failed to build HTTP client with static configuration");
        Self { client }
    }

    /// Returns a reference to the underlying reqwest client.
    ///
    /// This can be used for advanced operations not covered by this wrapper.
    #[must_use]
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Fetches a landing page, following redirects.
    ///
    /// Non-success statuses are returned in the [`PageResponse`] rather than
    /// as errors: a 403 block page still carries a body worth classifying.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] only for transport-level failures (network,
    /// timeout).
    #[instrument(skip(self), fields(url = %url))]
    pub async fn get_page(&self, url: &str) -> Result<PageResponse, FetchError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::timeout(url)
            } else {
                FetchError::network(url, e)
            }
        })?;

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let body = response
            .text()
            .await
            .map_err(|e| FetchError::network(url, e))?;

        debug!(status, final_url = %final_url, bytes = body.len(), "fetched page");
        Ok(PageResponse {
            status,
            final_url,
            body,
        })
    }

    /// Fetches a URL and parses the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] for transport failures, error statuses, and
    /// unparseable bodies.
    #[instrument(skip(self), fields(url = %url))]
    pub async fn get_json(&self, url: &str) -> Result<serde_json::Value, FetchError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::timeout(url)
            } else {
                FetchError::network(url, e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = header_value(&response, RETRY_AFTER);
            return Err(FetchError::from_status(url, status.as_u16(), retry_after));
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| FetchError::network(url, e))
    }

    /// Streams `url` into `dest`, validating the PDF signature and renaming
    /// atomically into place on success. Returns bytes written.
    ///
    /// The body is buffered only long enough to check the leading bytes;
    /// everything streams through a `.part` temporary that is cleaned up on
    /// any failure. Cancellation is checked at every chunk boundary.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`]:
    /// - `from_status` mappings for error responses (with Retry-After kept)
    /// - `Validation` when the body does not start with `%PDF`
    /// - `TooLarge` when the stream exceeds `max_bytes`
    /// - `Cancelled` when the token fires mid-stream
    /// - `Io`/`Network`/`Timeout` for the usual transport failures
    #[instrument(skip(self, cancel), fields(url = %url, dest = %dest.display()))]
    pub async fn download_pdf(
        &self,
        url: &str,
        dest: &Path,
        cancel: &CancellationToken,
        max_bytes: u64,
    ) -> Result<u64, FetchError> {
        if cancel.is_cancelled() {
            return Err(FetchError::cancelled(url));
        }

        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::timeout(url)
            } else {
                FetchError::network(url, e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = header_value(&response, RETRY_AFTER);
            return Err(FetchError::from_status(url, status.as_u16(), retry_after));
        }

        let part_path = PathBuf::from(format!("{}.part", dest.display()));
        let result = self
            .stream_validated(url, response, &part_path, cancel, max_bytes)
            .await;

        match result {
            Ok(bytes) => {
                tokio::fs::rename(&part_path, dest)
                    .await
                    .map_err(|e| FetchError::io(dest.to_path_buf(), e))?;
                info!(bytes, path = %dest.display(), "download complete");
                Ok(bytes)
            }
            Err(e) => {
                debug!(path = %part_path.display(), "cleaning up partial file after error");
                let _ = tokio::fs::remove_file(&part_path).await;
                Err(e)
            }
        }
    }

    /// Streams the response body into `part_path` after validating the
    /// leading bytes. Returns bytes written.
    async fn stream_validated(
        &self,
        url: &str,
        response: reqwest::Response,
        part_path: &Path,
        cancel: &CancellationToken,
        max_bytes: u64,
    ) -> Result<u64, FetchError> {
        let mut stream = response.bytes_stream();
        let mut head: Vec<u8> = Vec::with_capacity(PDF_MAGIC.len());
        let mut writer: Option<BufWriter<File>> = None;
        let mut bytes_written: u64 = 0;

        while let Some(chunk_result) = stream.next().await {
            if cancel.is_cancelled() {
                return Err(FetchError::cancelled(url));
            }

            let chunk = chunk_result.map_err(|e| {
                if e.is_timeout() {
                    FetchError::timeout(url)
                } else {
                    FetchError::network(url, e)
                }
            })?;
            if chunk.is_empty() {
                continue;
            }

            bytes_written += chunk.len() as u64;
            if bytes_written > max_bytes {
                return Err(FetchError::TooLarge {
                    url: url.to_string(),
                    limit_bytes: max_bytes,
                });
            }

            match writer.as_mut() {
                Some(writer) => {
                    writer
                        .write_all(&chunk)
                        .await
                        .map_err(|e| FetchError::io(part_path.to_path_buf(), e))?;
                }
                None => {
                    // Hold bytes until the signature is decidable.
                    head.extend_from_slice(&chunk);
                    if head.len() >= PDF_MAGIC.len() {
                        if !head.starts_with(PDF_MAGIC) {
                            let preview_len = head.len().min(BODY_PREVIEW_BYTES);
                            let preview = String::from_utf8_lossy(&head[..preview_len]).to_string();
                            warn!(url = %url, "response is not a PDF");
                            return Err(FetchError::validation(
                                url,
                                "downloaded bytes do not start with the PDF signature",
                                preview,
                            ));
                        }
                        let file = File::create(part_path)
                            .await
                            .map_err(|e| FetchError::io(part_path.to_path_buf(), e))?;
                        let mut buffered = BufWriter::new(file);
                        buffered
                            .write_all(&head)
                            .await
                            .map_err(|e| FetchError::io(part_path.to_path_buf(), e))?;
                        writer = Some(buffered);
                    }
                }
            }
        }

        let Some(mut writer) = writer else {
            // Stream ended before the signature was decidable.
            let preview = String::from_utf8_lossy(&head).to_string();
            return Err(FetchError::validation(
                url,
                "response too short to be a PDF",
                preview,
            ));
        };

        writer
            .flush()
            .await
            .map_err(|e| FetchError::io(part_path.to_path_buf(), e))?;

        Ok(bytes_written)
    }
}

/// Extracts a header value as an owned string.
fn header_value(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(std::string::ToString::to_string)
}
