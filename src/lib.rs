//! # registry-dl
//!
//! Concurrent, proxy-aware batch fetch engine for the certification
//! registry API.
//!
//! ## Design Philosophy
//!
//! registry-dl is designed to be:
//! - **Polite by construction** - Adaptive per-proxy rate limiting learns
//!   what the API tolerates instead of hammering it
//! - **Failure-tolerant** - Per-record failures degrade into report
//!   entries, never aborted runs
//! - **Resumable** - Each record lands as its own file, so interrupted
//!   runs pick up where they left off
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding
//!
//! ## Quick Start
//!
//! ```no_run
//! use registry_dl::{Config, RegistryDownloader, run_with_shutdown};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = Config::default();
//!     config.proxy.file = Some("proxies.txt".into());
//!     config.output.resume = true;
//!
//!     let downloader = RegistryDownloader::new(config)?;
//!
//!     // Cancel gracefully on SIGINT/SIGTERM
//!     tokio::spawn(run_with_shutdown(downloader.clone()));
//!
//!     let report = downloader.fetch_from_listing().await?;
//!     println!("{} fetched, {} failed", report.success, report.errors);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Batch directory layout and persistence
pub mod batch;
/// Configuration types
pub mod config;
/// Top-level downloader facade
pub mod downloader;
/// Error types
pub mod error;
/// HTTP request execution with retries and proxy routing
pub mod executor;
/// Adaptive per-proxy rate limiting
pub mod limiter;
/// Record id discovery via the listing endpoint
pub mod listing;
/// Run progress tracking
pub mod progress;
/// Proxy pool registry and pool file parsing
pub mod proxy;
/// Retry classification and backoff delays
pub mod retry;
/// Slice-based task scheduling
pub mod scheduler;
/// Core types
pub mod types;

// Re-export commonly used types
pub use config::{ApiConfig, Config, FetchConfig, LimiterConfig, OutputConfig, ProxyConfig};
pub use downloader::RegistryDownloader;
pub use error::{Error, ErrorCategory, Result};
pub use executor::{FetchOutcome, RequestExecutor};
pub use limiter::AdaptiveRateLimiter;
pub use listing::ListingClient;
pub use proxy::{LeasedProxy, ProxyRegistry, ProxyScheme, ProxySpec};
pub use scheduler::TaskScheduler;
pub use types::{BatchReport, FetchResult, PoolSnapshot, ProgressSnapshot, RecordId, RunState};

/// Wire OS termination signals to a graceful downloader shutdown
///
/// Blocks until a termination signal arrives, then cancels the downloader
/// so in-flight fetches drain and the batch report still gets written. On
/// unix this covers SIGTERM and SIGINT; elsewhere it falls back to
/// `tokio::signal::ctrl_c`.
pub async fn run_with_shutdown(downloader: RegistryDownloader) {
    wait_for_signal().await;
    downloader.shutdown();
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Registration can fail in stripped-down containers; degrade to
    // whichever handler still registers
    match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("caught SIGTERM, stopping"),
                _ = sigint.recv() => tracing::info!("caught SIGINT, stopping"),
            }
        }
        (Ok(mut sigterm), Err(e)) => {
            tracing::warn!(error = %e, "SIGINT handler unavailable, watching SIGTERM only");
            sigterm.recv().await;
            tracing::info!("caught SIGTERM, stopping");
        }
        (Err(e), Ok(mut sigint)) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable, watching SIGINT only");
            sigint.recv().await;
            tracing::info!("caught SIGINT, stopping");
        }
        (Err(e), Err(_)) => {
            tracing::warn!(error = %e, "unix signal handlers unavailable, falling back to ctrl-c");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "cannot listen for ctrl-c");
    } else {
        tracing::info!("caught ctrl-c, stopping");
    }
}
