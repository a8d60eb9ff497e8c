//! HTTP request execution with retries, proxy routing, and rate limiting
//!
//! The [`RequestExecutor`] is the only component that talks to the network.
//! For each call it leases one proxy from the [`ProxyRegistry`] (or goes
//! direct when no pool is loaded) and keeps that lease across every retry
//! attempt, swapping it out only if the registry benches the proxy mid-item.
//! Each attempt waits on the leased proxy's rate limiter, sends the request,
//! classifies the response, and reports the outcome back to both the limiter
//! and the registry.
//!
//! # Response classification
//!
//! - `200` with a JSON body: success
//! - `200` with an unparseable body: the raw body is saved as a diagnostic
//!   file and the attempt is retried
//! - `404`: the record does not exist; counts as proxy success but is a
//!   terminal failure for the item
//! - `429`: rate limited; a fixed pause is applied before the next attempt
//! - anything else, or a transport error: retried with linearly growing
//!   delay
//!
//! TLS verification is disabled because the vendor proxies in circulation
//! mostly re-sign traffic with self-issued certificates.

use crate::config::{ApiConfig, Config, FetchConfig};
use crate::error::{Error, Result};
use crate::limiter::AdaptiveRateLimiter;
use crate::proxy::{LeasedProxy, ProxyRegistry};
use crate::retry::{IsRetryable, add_jitter, attempt_delay};
use crate::types::{FetchResult, RecordId};
use rand::seq::SliceRandom;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Browser user agents rotated per request
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:126.0) Gecko/20100101 Firefox/126.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
];

/// Timeout used when probing proxies for liveness
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Terminal outcome of one record fetch, with the payload when successful
#[derive(Debug)]
pub struct FetchOutcome {
    /// The terminal result recorded in the batch report
    pub result: FetchResult,
    /// The fetched JSON document, present only on success
    pub payload: Option<Value>,
    /// Coarse category of the terminal error, for aggregate reporting
    pub category: Option<crate::error::ErrorCategory>,
}

/// Executes rate-limited, proxy-routed, retried HTTP requests
#[derive(Debug)]
pub struct RequestExecutor {
    api: ApiConfig,
    fetch: FetchConfig,
    registry: Arc<ProxyRegistry>,
    /// Limiter used when the pool is empty and requests go out directly
    direct_limiter: Arc<AdaptiveRateLimiter>,
    /// One client per proxy URL; clients hold connection pools, so rebuilding
    /// them per request would defeat keep-alive
    clients: Mutex<HashMap<String, reqwest::Client>>,
    /// Where malformed response bodies are saved for inspection
    diagnostics_dir: PathBuf,
}

impl RequestExecutor {
    /// Create an executor writing diagnostics under `diagnostics_dir`
    #[must_use]
    pub fn new(config: &Config, registry: Arc<ProxyRegistry>, diagnostics_dir: PathBuf) -> Self {
        Self {
            api: config.api.clone(),
            fetch: config.fetch.clone(),
            registry,
            direct_limiter: Arc::new(AdaptiveRateLimiter::new(config.proxy.limiter.clone())),
            clients: Mutex::new(HashMap::new()),
            diagnostics_dir,
        }
    }

    /// Fetch one record to a terminal outcome
    ///
    /// Runs up to `max_attempts` attempts. Never returns an error: terminal
    /// failures degrade into a failed [`FetchResult`] so one bad record
    /// cannot abort a batch.
    pub async fn fetch_record(&self, id: RecordId, cancel: &CancellationToken) -> FetchOutcome {
        let url = format!("{}/{}", self.api.detail_url.trim_end_matches('/'), id);
        let label = format!("record_{id}");
        self.run_attempts(&url, &[], &label, cancel)
            .await
            .into_outcome(id)
    }

    /// Fetch an arbitrary JSON endpoint with the same retry discipline
    ///
    /// Used for listing pages. Unlike [`fetch_record`](Self::fetch_record)
    /// the terminal error is surfaced, since a lost listing page means lost
    /// ids rather than one lost record.
    pub async fn get_json(
        &self,
        url: &str,
        query: &[(String, String)],
        cancel: &CancellationToken,
    ) -> Result<Value> {
        match self.run_attempts(url, query, "listing", cancel).await {
            Attempts::Success { payload, .. } => Ok(payload),
            Attempts::Failure { error, .. } => Err(error),
        }
    }

    /// Probe every proxy in the pool and drop the ones that cannot connect
    ///
    /// Each proxy gets one short GET against the listing endpoint. Run this
    /// before a large batch so dead vendor entries do not eat retry budget
    /// mid-run.
    pub async fn probe_pool(&self) {
        let pool = self.registry.all_ids();
        if pool.is_empty() {
            return;
        }
        tracing::info!(count = pool.len(), "probing proxy pool for liveness");

        let probes = pool.into_iter().map(|(id, spec)| {
            let url = self.api.listing_url.clone();
            let client = reqwest::Client::builder()
                .timeout(PROBE_TIMEOUT)
                .danger_accept_invalid_certs(true)
                .proxy_for(&spec)
                .build();
            async move {
                let alive = match client {
                    Ok(client) => client.get(&url).send().await.is_ok(),
                    Err(_) => false,
                };
                (id, spec, alive)
            }
        });

        let mut dead = Vec::new();
        for (id, spec, alive) in futures::future::join_all(probes).await {
            if !alive {
                tracing::warn!(proxy = %spec, "proxy failed liveness probe");
                dead.push(id);
            }
        }
        self.registry.remove_ids(&dead);
    }

    async fn run_attempts(
        &self,
        url: &str,
        query: &[(String, String)],
        diag_label: &str,
        cancel: &CancellationToken,
    ) -> Attempts {
        let mut last_error = Error::Interrupted;
        // One lease serves the whole retry loop, so retries cannot grab a
        // proxy another in-flight task of the same slice is using
        let mut lease = self.lease();
        let mut last_proxy = lease.as_ref().map(|l| l.spec.redacted());

        for attempt in 1..=self.fetch.max_attempts.max(1) {
            if cancel.is_cancelled() {
                return Attempts::Failure {
                    error: Error::Interrupted,
                    proxy: last_proxy,
                };
            }
            if let Some(current) = &lease {
                if !self.registry.is_active(current.id) {
                    lease = self.lease();
                    last_proxy = lease.as_ref().map(|l| l.spec.redacted()).or(last_proxy);
                }
            }

            let outcome = self
                .single_attempt(url, query, lease.as_ref(), diag_label, attempt)
                .await;
            match outcome {
                Ok(payload) => {
                    return Attempts::Success {
                        payload,
                        proxy: last_proxy,
                    };
                }
                Err(error) => {
                    let retryable = error.is_retryable() && attempt < self.fetch.max_attempts;
                    tracing::debug!(
                        url,
                        attempt,
                        error = %error,
                        retryable,
                        "request attempt failed"
                    );
                    if !retryable {
                        return Attempts::Failure {
                            error,
                            proxy: last_proxy,
                        };
                    }
                    // 429 gets the fixed pause the API expects; everything
                    // else backs off linearly with jitter
                    let delay = if error.is_rate_limit() {
                        self.fetch.rate_limit_pause
                    } else {
                        add_jitter(attempt_delay(self.fetch.initial_delay, attempt))
                    };
                    last_error = error;
                    tokio::select! {
                        () = cancel.cancelled() => {
                            return Attempts::Failure {
                                error: Error::Interrupted,
                                proxy: last_proxy,
                            };
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        Attempts::Failure {
            error: last_error,
            proxy: last_proxy,
        }
    }

    /// Take a lease for one item, or `None` to go direct
    fn lease(&self) -> Option<LeasedProxy> {
        if self.registry.is_empty() {
            return None;
        }
        // acquire only fails when the pool emptied under us; go direct then
        self.registry.acquire().ok()
    }

    /// One rate-limited, classified request through the given lease
    async fn single_attempt(
        &self,
        url: &str,
        query: &[(String, String)],
        lease: Option<&LeasedProxy>,
        diag_label: &str,
        attempt: u32,
    ) -> Result<Value> {
        let limiter = lease.map_or(&self.direct_limiter, |l| &l.limiter);
        limiter.wait_for_permission().await;

        let result = self.send_classified(url, query, lease, diag_label, attempt).await;

        // 404 proves the proxy and the API both answered; only the record is
        // missing, so it feeds the health trackers as a success
        let counts_as_success = matches!(&result, Ok(_) | Err(Error::NotFound { .. }));
        if counts_as_success {
            limiter.report_success().await;
            if let Some(lease) = lease {
                self.registry.report_success(lease.id);
            }
        } else {
            let is_rate_limit = result.as_ref().is_err_and(|e| e.is_rate_limit());
            limiter.report_error(is_rate_limit).await;
            if let Some(lease) = lease {
                self.registry.report_failure(lease.id, is_rate_limit);
            }
        }

        result
    }

    async fn send_classified(
        &self,
        url: &str,
        query: &[(String, String)],
        lease: Option<&LeasedProxy>,
        diag_label: &str,
        attempt: u32,
    ) -> Result<Value> {
        let client = self.client_for(lease)?;
        let user_agent = USER_AGENTS
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(USER_AGENTS[0]);

        let mut request = client
            .get(url)
            .header(reqwest::header::USER_AGENT, user_agent)
            .header(reqwest::header::ACCEPT, "application/json, text/plain, */*")
            .header(reqwest::header::ACCEPT_LANGUAGE, "ru-RU,ru;q=0.9,en-US;q=0.8,en;q=0.7");
        if !query.is_empty() {
            request = request.query(query);
        }
        let response = request.send().await?;
        let status = response.status();

        match status.as_u16() {
            200 => {
                let body = response.text().await?;
                match serde_json::from_str::<Value>(&body) {
                    Ok(payload) => Ok(payload),
                    Err(_) => {
                        let diagnostic = self.save_diagnostic(diag_label, attempt, &body);
                        Err(Error::MalformedResponse {
                            url: url.to_string(),
                            diagnostic,
                        })
                    }
                }
            }
            404 => Err(Error::NotFound {
                url: url.to_string(),
            }),
            429 => Err(Error::RateLimited {
                url: url.to_string(),
            }),
            status => Err(Error::UnexpectedStatus {
                status,
                url: url.to_string(),
            }),
        }
    }

    /// Get or build the cached client for a lease (or the direct client)
    fn client_for(&self, lease: Option<&LeasedProxy>) -> Result<reqwest::Client> {
        let key = lease.map_or_else(|| "direct".to_string(), |l| l.spec.url());
        let mut clients = match self.clients.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = reqwest::Client::builder()
            .timeout(self.fetch.request_timeout)
            .danger_accept_invalid_certs(true);
        if let Some(lease) = lease {
            builder = builder.proxy_for(&lease.spec);
        }
        let client = builder.build()?;
        clients.insert(key, client.clone());
        Ok(client)
    }

    /// Save a malformed response body for inspection, pruning old files
    ///
    /// Diagnostics are best-effort; failures here are logged and swallowed
    /// so a full disk cannot take the fetch loop down with it.
    fn save_diagnostic(&self, label: &str, attempt: u32, body: &str) -> Option<PathBuf> {
        if let Err(e) = std::fs::create_dir_all(&self.diagnostics_dir) {
            tracing::warn!(error = %e, "cannot create diagnostics directory");
            return None;
        }
        let path = self
            .diagnostics_dir
            .join(format!("{label}_attempt_{attempt}.html"));
        if let Err(e) = std::fs::write(&path, body) {
            tracing::warn!(path = %path.display(), error = %e, "cannot write diagnostic file");
            return None;
        }
        self.prune_diagnostics();
        Some(path)
    }

    /// Keep only the newest `diagnostics_cap` diagnostic files
    fn prune_diagnostics(&self) {
        let Ok(entries) = std::fs::read_dir(&self.diagnostics_dir) else {
            return;
        };
        let mut files: Vec<(std::time::SystemTime, PathBuf)> = entries
            .flatten()
            .filter_map(|entry| {
                let meta = entry.metadata().ok()?;
                if !meta.is_file() {
                    return None;
                }
                Some((meta.modified().ok()?, entry.path()))
            })
            .collect();
        if files.len() <= self.fetch.diagnostics_cap {
            return;
        }
        files.sort_by_key(|(modified, _)| *modified);
        let excess = files.len() - self.fetch.diagnostics_cap;
        for (_, path) in files.into_iter().take(excess) {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::debug!(path = %path.display(), error = %e, "cannot prune diagnostic file");
            }
        }
    }
}

enum Attempts {
    Success {
        payload: Value,
        proxy: Option<String>,
    },
    Failure {
        error: Error,
        proxy: Option<String>,
    },
}

impl Attempts {
    fn into_outcome(self, id: RecordId) -> FetchOutcome {
        match self {
            Attempts::Success { payload, proxy } => FetchOutcome {
                result: FetchResult::success(id, proxy),
                payload: Some(payload),
                category: None,
            },
            Attempts::Failure { error, proxy } => FetchOutcome {
                category: Some(error.category()),
                result: FetchResult::failure(id, error.to_string(), proxy),
                payload: None,
            },
        }
    }
}

/// Extension to attach a [`ProxySpec`](crate::proxy::ProxySpec) to a client builder
trait ProxyForExt {
    fn proxy_for(self, spec: &crate::proxy::ProxySpec) -> Self;
}

impl ProxyForExt for reqwest::ClientBuilder {
    fn proxy_for(self, spec: &crate::proxy::ProxySpec) -> Self {
        match reqwest::Proxy::all(spec.url()) {
            Ok(proxy) => self.proxy(proxy),
            Err(e) => {
                // A proxy line that parsed but cannot become a reqwest proxy
                // is a vendor-format oddity; run the request direct rather
                // than failing it
                tracing::warn!(proxy = %spec, error = %e, "cannot build proxy, sending direct");
                self
            }
        }
    }
}
