//! Slice-based dispatch of fetch tasks
//!
//! The [`TaskScheduler`] drives a run to completion: it prepares the id
//! queue (dedup, resume filtering, optional shuffle and cap), dispatches
//! bounded-concurrency slices, persists fetched payloads, and writes the
//! final report.
//!
//! Concurrency is bounded per slice at `min(workers, active proxies)` when
//! a pool is loaded, so a shrinking pool automatically throttles the run
//! instead of piling more tasks onto fewer proxies. A fixed pause separates
//! slices to keep aggregate load smooth.
//!
//! Cancellation is cooperative: in-flight fetches drain, no new slice is
//! dispatched, and the report covers whatever reached a terminal outcome.

use crate::batch::{self, BatchPersistence};
use crate::config::Config;
use crate::error::{Error, ErrorCategory, Result};
use crate::executor::RequestExecutor;
use crate::progress::ProgressReporter;
use crate::proxy::ProxyRegistry;
use crate::types::{BatchReport, FetchResult, RecordId, RunState};
use rand::seq::SliceRandom;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Runs one batch of record fetches end to end
pub struct TaskScheduler {
    config: Config,
    executor: Arc<RequestExecutor>,
    registry: Arc<ProxyRegistry>,
    batch: BatchPersistence,
}

impl TaskScheduler {
    /// Create a scheduler writing into the given batch directory
    #[must_use]
    pub fn new(
        config: Config,
        executor: Arc<RequestExecutor>,
        registry: Arc<ProxyRegistry>,
        batch: BatchPersistence,
    ) -> Self {
        Self {
            config,
            executor,
            registry,
            batch,
        }
    }

    /// Fetch every id in `ids` to a terminal outcome and write the report
    ///
    /// Returns the written [`BatchReport`]. Per-item failures are folded
    /// into the report; only setup problems (an empty id set, unreadable
    /// output root, unwritable report) surface as errors.
    pub async fn run(&self, ids: Vec<RecordId>, cancel: &CancellationToken) -> Result<BatchReport> {
        let mut state = RunState::Loading;
        tracing::debug!(state = %state, "run state");

        let mut queue = self.prepare_queue(ids)?;
        let total_ids = queue.len();
        let progress = Arc::new(ProgressReporter::new(total_ids));
        let started = std::time::Instant::now();
        tracing::info!(total = total_ids, "starting batch run");

        state = RunState::Dispatching;
        tracing::debug!(state = %state, "run state");

        let mut results: Vec<FetchResult> = Vec::with_capacity(total_ids);
        while !queue.is_empty() && !cancel.is_cancelled() {
            let slice_size = self.slice_size();
            let slice: Vec<RecordId> = queue
                .drain(..slice_size.min(queue.len()))
                .collect();
            if queue.is_empty() && state != RunState::Draining {
                state = RunState::Draining;
                tracing::debug!(state = %state, "run state");
            }

            let mut tasks = JoinSet::new();
            for id in slice {
                let executor = Arc::clone(&self.executor);
                let progress = Arc::clone(&progress);
                let batch = self.batch.clone();
                let cancel = cancel.clone();
                tasks.spawn(async move {
                    fetch_and_persist(&executor, &batch, &progress, id, &cancel).await
                });
            }
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(result) => results.push(result),
                    Err(e) => tracing::error!(error = %e, "fetch task panicked"),
                }
            }

            if !queue.is_empty() && !cancel.is_cancelled() {
                tokio::select! {
                    () = cancel.cancelled() => {}
                    () = tokio::time::sleep(self.config.fetch.slice_pause) => {}
                }
            }
        }
        if cancel.is_cancelled() && !queue.is_empty() {
            tracing::warn!(
                remaining = queue.len(),
                "run interrupted, skipping undispatched ids"
            );
        }

        state = RunState::Reporting;
        tracing::debug!(state = %state, "run state");

        let report = self.write_report(total_ids, results, started.elapsed())?;
        let pool = (!self.registry.is_empty()).then(|| self.registry.snapshot());
        progress.log_summary(pool.as_ref());

        state = RunState::Done;
        tracing::debug!(state = %state, "run state");
        Ok(report)
    }

    /// Dedup, resume-filter, shuffle, and cap the id queue
    ///
    /// An empty id set is a caller mistake (a bad range, a listing that
    /// matched nothing) and fails loudly instead of producing an empty
    /// report. A queue emptied by resume filtering is different: everything
    /// asked for is already on disk, and the run completes as a no-op.
    fn prepare_queue(&self, ids: Vec<RecordId>) -> Result<Vec<RecordId>> {
        let mut seen = std::collections::HashSet::with_capacity(ids.len());
        let mut queue: Vec<RecordId> = ids.into_iter().filter(|id| seen.insert(*id)).collect();
        if queue.is_empty() {
            return Err(Error::Config {
                message: "no ids to process".to_string(),
                key: None,
            });
        }

        if self.config.output.resume {
            let done = batch::persisted_ids(&self.config.output.output_root)?;
            let before = queue.len();
            queue.retain(|id| !done.contains(id));
            tracing::info!(
                skipped = before - queue.len(),
                remaining = queue.len(),
                "resume filtering applied"
            );
        }
        if self.config.output.shuffle {
            queue.shuffle(&mut rand::thread_rng());
        }
        if let Some(limit) = self.config.output.limit {
            queue.truncate(limit);
        }
        Ok(queue)
    }

    /// Concurrency for the next slice
    fn slice_size(&self) -> usize {
        let workers = self.config.fetch.workers.max(1);
        if self.registry.is_empty() {
            return workers;
        }
        // A fully benched pool still dispatches one task, which will surface
        // pool exhaustion (or trip lazy reactivation) instead of spinning
        workers.min(self.registry.active_count().max(1))
    }

    fn write_report(
        &self,
        total_ids: usize,
        results: Vec<FetchResult>,
        elapsed: std::time::Duration,
    ) -> Result<BatchReport> {
        let success = results.iter().filter(|r| r.success).count();
        let report = BatchReport {
            timestamp: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            total_ids,
            completed: results.len(),
            success,
            errors: results.len() - success,
            time_elapsed: elapsed.as_secs_f64(),
            results,
        };
        self.batch.write_report(&report)?;
        Ok(report)
    }
}

/// Fetch one record, persist its payload, and record progress
async fn fetch_and_persist(
    executor: &RequestExecutor,
    batch: &BatchPersistence,
    progress: &ProgressReporter,
    id: RecordId,
    cancel: &CancellationToken,
) -> FetchResult {
    let outcome = executor.fetch_record(id, cancel).await;
    let (result, category) = match outcome.payload {
        Some(payload) => match batch.save_record(id, &payload) {
            Ok(_) => (outcome.result, None),
            Err(e) => {
                tracing::error!(%id, error = %e, "fetched record could not be persisted");
                (
                    FetchResult::failure(id, e.to_string(), outcome.result.proxy),
                    Some(ErrorCategory::Other),
                )
            }
        },
        None => (outcome.result, outcome.category),
    };
    progress.record(result.success, category);
    result
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LimiterConfig, ProxyConfig};
    use crate::proxy::ProxySpec;
    use std::time::Duration;
    use wiremock::matchers::{method, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(server_url: &str, tmp: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.api.detail_url = format!("{server_url}/records");
        config.fetch.workers = 4;
        config.fetch.max_attempts = 2;
        config.fetch.initial_delay = Duration::from_millis(5);
        config.fetch.rate_limit_pause = Duration::from_millis(5);
        config.fetch.slice_pause = Duration::from_millis(5);
        config.proxy.limiter.initial_rate = 100.0;
        config.proxy.limiter.max_rate = 100.0;
        config.output.output_root = tmp.to_path_buf();
        config
    }

    fn scheduler(config: &Config) -> TaskScheduler {
        let registry = Arc::new(ProxyRegistry::new(Vec::new(), ProxyConfig::default()));
        let batch = BatchPersistence::create(&config.output.output_root).unwrap();
        let executor = Arc::new(RequestExecutor::new(
            config,
            Arc::clone(&registry),
            batch.diagnostics_dir(),
        ));
        TaskScheduler::new(config.clone(), executor, registry, batch)
    }

    #[tokio::test]
    async fn run_fetches_all_ids_and_writes_report() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/records/\d+$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(&server.uri(), tmp.path());
        let scheduler = scheduler(&config);

        let ids = (1..=6).map(RecordId).collect();
        let report = scheduler.run(ids, &CancellationToken::new()).await.unwrap();

        assert_eq!(report.total_ids, 6);
        assert_eq!(report.completed, 6);
        assert_eq!(report.success, 6);
        assert_eq!(report.errors, 0);

        let saved = crate::batch::persisted_ids(tmp.path()).unwrap();
        assert_eq!(saved.len(), 6);
    }

    #[tokio::test]
    async fn duplicate_ids_are_fetched_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/records/1$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(&server.uri(), tmp.path());
        let scheduler = scheduler(&config);

        let report = scheduler
            .run(vec![RecordId(1), RecordId(1), RecordId(1)], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.total_ids, 1);
    }

    #[tokio::test]
    async fn failures_are_reported_not_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/records/1$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/records/2$"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(&server.uri(), tmp.path());
        let scheduler = scheduler(&config);

        let report = scheduler
            .run(vec![RecordId(1), RecordId(2)], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.success, 1);
        assert_eq!(report.errors, 1);
        let failed = report.results.iter().find(|r| !r.success).unwrap();
        assert_eq!(failed.id, RecordId(2));
    }

    #[tokio::test]
    async fn resume_skips_previously_persisted_ids() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/records/\d+$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let mut config = test_config(&server.uri(), tmp.path());

        let first = scheduler(&config);
        first
            .run(vec![RecordId(1), RecordId(2)], &CancellationToken::new())
            .await
            .unwrap();

        config.output.resume = true;
        let second = scheduler(&config);
        let report = second
            .run(
                vec![RecordId(1), RecordId(2), RecordId(3)],
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(report.total_ids, 1, "only the new id should remain");
    }

    #[tokio::test]
    async fn limit_caps_the_queue() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/records/\d+$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let mut config = test_config(&server.uri(), tmp.path());
        config.output.limit = Some(2);
        let scheduler = scheduler(&config);

        let report = scheduler
            .run((1..=10).map(RecordId).collect(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.total_ids, 2);
    }

    #[tokio::test]
    async fn cancelled_run_still_writes_a_report() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/records/\d+$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(&server.uri(), tmp.path());
        let scheduler = scheduler(&config);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = scheduler
            .run(vec![RecordId(1), RecordId(2)], &cancel)
            .await
            .unwrap();
        // nothing dispatched, but the report exists and is consistent
        assert_eq!(report.completed, 0);
        assert_eq!(report.total_ids, 2);
    }

    #[tokio::test]
    async fn empty_id_set_is_a_config_error() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.output.output_root = tmp.path().to_path_buf();
        let scheduler = scheduler(&config);

        let err = scheduler
            .run(Vec::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[tokio::test]
    async fn fully_resumed_queue_completes_as_a_no_op() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/records/\d+$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(2)
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let mut config = test_config(&server.uri(), tmp.path());

        let first = scheduler(&config);
        first
            .run(vec![RecordId(1), RecordId(2)], &CancellationToken::new())
            .await
            .unwrap();

        // everything already on disk: not an error, just nothing to do
        config.output.resume = true;
        let second = scheduler(&config);
        let report = second
            .run(vec![RecordId(1), RecordId(2)], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.total_ids, 0);
        assert_eq!(report.completed, 0);
    }

    #[tokio::test]
    async fn pool_bound_slices_dispatch_in_waves() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/records/\d+$"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"ok": true}))
                    .set_delay(Duration::from_millis(50)),
            )
            .expect(10)
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let mut config = test_config(&server.uri(), tmp.path());
        config.fetch.workers = 5;
        config.fetch.slice_pause = Duration::from_millis(1);
        // records are reached through the pool, not directly
        config.api.detail_url = "http://registry.invalid/records".to_string();

        // three pool entries, all routed through the mock server
        let spec: ProxySpec = server.uri().parse().unwrap();
        let proxy_config = ProxyConfig {
            limiter: LimiterConfig {
                initial_rate: 100.0,
                max_rate: 100.0,
                ..LimiterConfig::default()
            },
            ..ProxyConfig::default()
        };
        let registry = Arc::new(ProxyRegistry::new(vec![spec; 3], proxy_config));
        let batch = BatchPersistence::create(tmp.path()).unwrap();
        let executor = Arc::new(RequestExecutor::new(
            &config,
            Arc::clone(&registry),
            batch.diagnostics_dir(),
        ));
        let scheduler = TaskScheduler::new(config, executor, Arc::clone(&registry), batch);
        assert_eq!(scheduler.slice_size(), 3, "worker cap of 5 bounded by 3 proxies");

        let started = std::time::Instant::now();
        let report = scheduler
            .run((1..=10).map(RecordId).collect(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.completed, 10);
        assert_eq!(report.success, 10);

        // 10 ids at slice width 3 take four barrier-separated waves, so the
        // run cannot finish faster than four server delays
        assert!(
            started.elapsed() >= Duration::from_millis(190),
            "ran in {:?}, which is faster than four sequential waves",
            started.elapsed()
        );
        assert_eq!(registry.snapshot().total_success, 10);
    }

    #[test]
    fn slice_size_tracks_active_proxies() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.output.output_root = tmp.path().to_path_buf();
        config.fetch.workers = 10;

        let pool = vec![
            "10.0.0.1:8080".parse().unwrap(),
            "10.0.0.2:8080".parse().unwrap(),
        ];
        let registry = Arc::new(ProxyRegistry::new(pool, ProxyConfig::default()));
        let batch = BatchPersistence::create(tmp.path()).unwrap();
        let executor = Arc::new(RequestExecutor::new(
            &config,
            Arc::clone(&registry),
            batch.diagnostics_dir(),
        ));
        let scheduler = TaskScheduler::new(config, executor, registry, batch);

        assert_eq!(scheduler.slice_size(), 2, "bounded by active proxies");
    }
}
