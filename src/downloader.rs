//! Top-level facade tying the components into runs
//!
//! [`RegistryDownloader`] owns the proxy registry and the run's
//! cancellation token, and builds a fresh batch directory, executor, and
//! scheduler for each run. The registry is shared across runs so proxy
//! health and learned rates carry over.

use crate::batch::BatchPersistence;
use crate::config::Config;
use crate::error::Result;
use crate::executor::RequestExecutor;
use crate::listing::ListingClient;
use crate::proxy::ProxyRegistry;
use crate::scheduler::TaskScheduler;
use crate::types::{BatchReport, PoolSnapshot, RecordId};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Batch fetch engine for the certification registry API
///
/// Cheap to clone; clones share the proxy pool and cancellation token.
///
/// # Example
///
/// ```no_run
/// use registry_dl::{Config, RegistryDownloader};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = Config::default();
///     let downloader = RegistryDownloader::new(config)?;
///
///     let report = downloader.fetch_range(418_000, 418_100).await?;
///     println!("fetched {} of {}", report.success, report.total_ids);
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct RegistryDownloader {
    config: Config,
    registry: Arc<ProxyRegistry>,
    cancel: CancellationToken,
}

impl RegistryDownloader {
    /// Build a downloader, validating the config and loading the proxy
    /// pool it names
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(ProxyRegistry::from_config(&config.proxy)?);
        Ok(Self {
            config,
            registry,
            cancel: CancellationToken::new(),
        })
    }

    /// Token cancelled when [`shutdown`](Self::shutdown) is called
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request a graceful stop: in-flight fetches drain, the report is
    /// still written
    pub fn shutdown(&self) {
        tracing::info!("shutdown requested");
        self.cancel.cancel();
    }

    /// Fetch an explicit list of record ids
    ///
    /// An empty list fails with a configuration error rather than writing
    /// an empty report, since it always means a caller mistake (an inverted
    /// range, a listing that matched nothing).
    pub async fn fetch_ids(&self, ids: Vec<RecordId>) -> Result<BatchReport> {
        let (scheduler, _) = self.build_run()?;
        scheduler.run(ids, &self.cancel).await
    }

    /// Fetch every id in the inclusive range `[start, end]`
    pub async fn fetch_range(&self, start: u64, end: u64) -> Result<BatchReport> {
        let ids = (start..=end).map(RecordId).collect();
        self.fetch_ids(ids).await
    }

    /// Discover matching ids via the listing endpoint, then fetch them all
    ///
    /// Listing pages and record fetches share one executor, so the whole
    /// run stays within the pool's rate limits.
    pub async fn fetch_from_listing(&self) -> Result<BatchReport> {
        let (scheduler, executor) = self.build_run()?;
        let listing = ListingClient::new(self.config.api.clone(), executor);
        let ids = listing.discover_ids(&self.cancel).await?;
        scheduler.run(ids, &self.cancel).await
    }

    /// Fetch ids extracted from previously downloaded listing files
    ///
    /// Useful when the listing was exported separately and only the record
    /// details remain to be fetched.
    pub async fn fetch_from_files(&self, dir: &std::path::Path) -> Result<BatchReport> {
        let ids = crate::listing::load_ids_from_dir(dir, &self.config.api.id_field)?;
        self.fetch_ids(ids).await
    }

    /// Export the proxies that worked this session as a reusable pool file
    ///
    /// Returns the number of proxies written.
    pub fn export_working_proxies(&self, path: &std::path::Path) -> Result<usize> {
        self.registry.export_working(path)
    }

    /// Probe the pool and drop proxies that cannot connect
    ///
    /// Returns the pool state after pruning. Safe to run while a batch is
    /// in flight: leases report by stable id, so removals cannot credit a
    /// surviving proxy with another's results, and a task whose proxy was
    /// removed takes a fresh lease on its next attempt.
    pub async fn probe_proxies(&self) -> PoolSnapshot {
        let executor = RequestExecutor::new(
            &self.config,
            Arc::clone(&self.registry),
            self.config.output.output_root.join("diagnostics"),
        );
        executor.probe_pool().await;
        self.registry.snapshot()
    }

    /// Current aggregate state of the proxy pool
    #[must_use]
    pub fn pool_snapshot(&self) -> PoolSnapshot {
        self.registry.snapshot()
    }

    fn build_run(&self) -> Result<(TaskScheduler, Arc<RequestExecutor>)> {
        let batch = BatchPersistence::create(&self.config.output.output_root)?;
        let executor = Arc::new(RequestExecutor::new(
            &self.config,
            Arc::clone(&self.registry),
            batch.diagnostics_dir(),
        ));
        let scheduler = TaskScheduler::new(
            self.config.clone(),
            Arc::clone(&executor),
            Arc::clone(&self.registry),
            batch,
        );
        Ok((scheduler, executor))
    }
}
