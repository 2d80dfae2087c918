//! Engine configuration.
//!
//! Settings resolve with the precedence: CLI arguments > config file >
//! built-in defaults. The config file is JSON, searched at
//! `./paperfetch.json` and then `~/.config/paperfetch/config.json` unless
//! an explicit path is given.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};

use crate::download::ExecutorConfig;

/// Placeholder contact address; operators should configure their own.
const DEFAULT_UNPAYWALL_EMAIL: &str = "research@example.org";

/// Tunable engine settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetcherConfig {
    /// Where PDFs land (flat directory).
    pub output_dir: PathBuf,
    /// State store path; defaults to `<output_dir>/metadata.db`.
    pub state_db: Option<PathBuf>,
    /// Shared postponement store path; defaults to
    /// `~/.cache/paperfetch/postponed.db` so it outlives any one project.
    pub postponed_db: Option<PathBuf>,
    /// Parallel download workers.
    pub workers: usize,
    /// Attempt cap per identifier, across runs.
    pub max_attempts: u32,
    /// Per-connection timeout.
    pub connect_timeout_secs: u64,
    /// Overall per-download timeout.
    pub download_timeout_secs: u64,
    /// Token-bucket burst capacity per domain.
    pub rate_capacity: f64,
    /// Token-bucket refill rate per domain (tokens/second).
    pub rate_refill_per_sec: f64,
    /// Hard cap on a single PDF, in megabytes.
    pub max_pdf_mb: u64,
    /// Contact email sent to the Unpaywall API.
    pub unpaywall_email: String,
    /// DOI resolver base URL (institutional link resolvers substitute
    /// their own).
    pub doi_resolver: String,
    /// Extra block-signature markers, merged with the built-in list.
    pub block_markers: Vec<String>,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./pdfs"),
            state_db: None,
            postponed_db: None,
            workers: 4,
            max_attempts: 3,
            connect_timeout_secs: 30,
            download_timeout_secs: 120,
            rate_capacity: 3.0,
            rate_refill_per_sec: 1.0,
            max_pdf_mb: 100,
            unpaywall_email: DEFAULT_UNPAYWALL_EMAIL.to_string(),
            doi_resolver: "https://doi.org".to_string(),
            block_markers: Vec::new(),
        }
    }
}

impl FetcherConfig {
    /// Loads configuration from the first readable file in the search
    /// order, falling back to defaults.
    #[must_use]
    pub fn load(explicit: Option<&Path>) -> Self {
        let candidates: Vec<PathBuf> = match explicit {
            Some(path) => vec![path.to_path_buf()],
            None => {
                let mut paths = vec![PathBuf::from("./paperfetch.json")];
                if let Some(home) = std::env::var_os("HOME") {
                    paths.push(
                        PathBuf::from(home)
                            .join(".config")
                            .join("paperfetch")
                            .join("config.json"),
                    );
                }
                paths
            }
        };

        for candidate in &candidates {
            if !candidate.exists() {
                continue;
            }
            match std::fs::read_to_string(candidate) {
                Ok(text) => match serde_json::from_str::<Self>(&text) {
                    Ok(config) => {
                        info!(path = %candidate.display(), "loaded configuration");
                        config.warn_on_placeholder_email();
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %candidate.display(), error = %e, "invalid config file; skipping");
                    }
                },
                Err(e) => {
                    warn!(path = %candidate.display(), error = %e, "unreadable config file; skipping");
                }
            }
        }

        if explicit.is_some() {
            warn!("requested config file not found; using defaults");
        }
        Self::default()
    }

    fn warn_on_placeholder_email(&self) {
        if self.unpaywall_email == DEFAULT_UNPAYWALL_EMAIL {
            warn!("using the placeholder Unpaywall email; set unpaywall_email in your config");
        }
    }

    /// Resolved state store path.
    #[must_use]
    pub fn state_db_path(&self) -> PathBuf {
        self.state_db
            .clone()
            .unwrap_or_else(|| self.output_dir.join("metadata.db"))
    }

    /// Resolved postponement store path (shared across projects).
    #[must_use]
    pub fn postponed_db_path(&self) -> PathBuf {
        self.postponed_db.clone().unwrap_or_else(|| {
            let base = std::env::var_os("HOME")
                .map_or_else(|| PathBuf::from("."), PathBuf::from);
            base.join(".cache").join("paperfetch").join("postponed.db")
        })
    }

    /// Executor settings derived from this configuration.
    #[must_use]
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            output_dir: self.output_dir.clone(),
            max_attempts: self.max_attempts,
            download_timeout: Duration::from_secs(self.download_timeout_secs),
            max_pdf_bytes: self.max_pdf_mb * 1024 * 1024,
            doi_resolver: self.doi_resolver.clone(),
        }
    }
}
