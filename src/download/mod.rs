//! Download engine: rate limiting, streaming HTTP, the per-identifier
//! executor, and batch orchestration.
//!
//! This module provides the network-facing half of the acquisition engine:
//! - [`RateLimiter`] - per-domain token-bucket throttle
//! - [`HttpClient`] - shared streaming client with PDF validation
//! - [`DownloadExecutor`] - drives one identifier through the strategy chain
//! - [`BatchOrchestrator`] - bounded-concurrency scheduling over many
//!   identifiers
//! - [`CancellationToken`] - cooperative cancellation threaded through all
//!   of the above

mod batch;
mod cancel;
mod client;
mod error;
mod executor;
pub mod rate_limiter;

pub use batch::{BatchOrchestrator, BatchReport, BatchStats};
pub use cancel::{CancellationToken, arm_watchdog, install_interrupt_handler};
pub use client::{CONNECT_TIMEOUT_SECS, HttpClient, PageResponse, READ_TIMEOUT_SECS};
pub use error::FetchError;
pub use executor::{DownloadExecutor, DownloadResult, ExecutorConfig, FetchStatus};
pub use rate_limiter::RateLimiter;
