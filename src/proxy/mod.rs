//! Proxy pool registry
//!
//! The [`ProxyRegistry`] owns the pool loaded from the proxy file and hands
//! out leases with least-recently-used rotation. Each proxy carries its own
//! [`AdaptiveRateLimiter`] so a hammered endpoint slows down without
//! dragging healthy proxies with it.
//!
//! Health tracking follows per-proxy feedback: a run of consecutive
//! rate-limit errors deactivates the proxy for a cool-down period, after
//! which it becomes eligible again on the next acquisition. Reactivation is
//! lazy (checked inside [`acquire`](ProxyRegistry::acquire)) rather than
//! driven by timers.

pub mod parse;

pub use parse::{ProxyScheme, ProxySpec, load_pool_file};

use crate::config::ProxyConfig;
use crate::error::{Error, Result};
use crate::limiter::AdaptiveRateLimiter;
use crate::types::PoolSnapshot;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// A lease on one proxy, held for the whole retry loop of one item
///
/// Holds the proxy's limiter so the caller can wait on it, and the stable
/// id so each outcome can be reported back to the registry.
#[derive(Clone, Debug)]
pub struct LeasedProxy {
    /// Stable identifier inside the registry, used when reporting outcomes
    ///
    /// Survives pool compaction: removing dead proxies never redirects an
    /// in-flight lease's reports to another entry.
    pub id: u64,
    /// The proxy endpoint itself
    pub spec: ProxySpec,
    /// The proxy's dedicated rate limiter
    pub limiter: Arc<AdaptiveRateLimiter>,
}

#[derive(Debug)]
struct ProxyEntry {
    id: u64,
    spec: ProxySpec,
    limiter: Arc<AdaptiveRateLimiter>,
    active: bool,
    /// When a deactivated proxy becomes eligible again
    reactivate_after: Option<Instant>,
    last_used: Option<Instant>,
    success_count: u64,
    error_count: u64,
    consecutive_rate_limits: u32,
}

/// Shared registry of proxies with health tracking and LRU rotation
#[derive(Debug)]
pub struct ProxyRegistry {
    config: ProxyConfig,
    entries: Mutex<Vec<ProxyEntry>>,
}

impl ProxyRegistry {
    /// Build a registry over an already-parsed pool
    #[must_use]
    pub fn new(pool: Vec<ProxySpec>, config: ProxyConfig) -> Self {
        let entries = pool
            .into_iter()
            .enumerate()
            .map(|(id, spec)| ProxyEntry {
                id: id as u64,
                limiter: Arc::new(AdaptiveRateLimiter::new(config.limiter.clone())),
                spec,
                active: true,
                reactivate_after: None,
                last_used: None,
                success_count: 0,
                error_count: 0,
                consecutive_rate_limits: 0,
            })
            .collect();
        Self {
            config,
            entries: Mutex::new(entries),
        }
    }

    /// Load the pool file named by the config and build a registry
    ///
    /// A configured file that yields no usable proxies is a configuration
    /// error: the caller asked for a pool and did not get one. With no file
    /// configured the registry starts empty and requests go out directly,
    /// unless `require_proxies` forbids that too.
    pub fn from_config(config: &ProxyConfig) -> Result<Self> {
        let pool = match &config.file {
            Some(path) => {
                let pool = load_pool_file(path)?;
                if pool.is_empty() {
                    return Err(Error::Config {
                        message: format!(
                            "proxy file {} contains no usable proxies",
                            path.display()
                        ),
                        key: Some("proxy.file".to_string()),
                    });
                }
                pool
            }
            None => Vec::new(),
        };
        if config.require_proxies && pool.is_empty() {
            return Err(Error::Config {
                message: "require_proxies is set but no proxy file is configured".to_string(),
                key: Some("proxy.require_proxies".to_string()),
            });
        }
        Ok(Self::new(pool, config.clone()))
    }

    /// True when no proxies are loaded at all
    pub fn is_empty(&self) -> bool {
        self.lock_entries().is_empty()
    }

    /// Number of proxies currently eligible for leasing
    ///
    /// Counts cooled-down proxies as active, since they reactivate on the
    /// next acquisition.
    pub fn active_count(&self) -> usize {
        let now = Instant::now();
        self.lock_entries()
            .iter()
            .filter(|e| e.active || e.reactivate_after.is_some_and(|at| now >= at))
            .count()
    }

    /// Lease the least-recently-used active proxy
    ///
    /// Reactivates any proxies whose cool-down has expired first. When every
    /// proxy is benched the whole pool is reactivated early rather than
    /// stalling the run until a cool-down elapses. Fails with
    /// [`Error::PoolExhausted`] only when the pool is empty, which is the
    /// caller's signal to go direct.
    ///
    /// `last_used` is stamped inside the lock, so concurrent acquisitions
    /// within one dispatch slice land on distinct proxies as long as the
    /// slice is no larger than the active pool.
    pub fn acquire(&self) -> Result<LeasedProxy> {
        let mut entries = self.lock_entries();
        let now = Instant::now();

        for entry in entries.iter_mut() {
            if !entry.active && entry.reactivate_after.is_some_and(|at| now >= at) {
                entry.active = true;
                entry.reactivate_after = None;
                entry.consecutive_rate_limits = 0;
                tracing::info!(proxy = %entry.spec, "proxy reactivated after cool-down");
            }
        }

        if !entries.is_empty() && entries.iter().all(|e| !e.active) {
            tracing::warn!(
                count = entries.len(),
                "every proxy is benched, reactivating the pool early"
            );
            for entry in entries.iter_mut() {
                entry.active = true;
                entry.reactivate_after = None;
                entry.consecutive_rate_limits = 0;
            }
        }

        let entry = entries
            .iter_mut()
            .filter(|e| e.active)
            .min_by_key(|e| e.last_used)
            .ok_or(Error::PoolExhausted)?;

        entry.last_used = Some(now);
        Ok(LeasedProxy {
            id: entry.id,
            spec: entry.spec.clone(),
            limiter: Arc::clone(&entry.limiter),
        })
    }

    /// Whether the proxy behind a lease is still present and in rotation
    ///
    /// Lease holders check this between attempts so a proxy benched or
    /// removed mid-item gets swapped for a fresh lease.
    pub fn is_active(&self, id: u64) -> bool {
        self.lock_entries().iter().any(|e| e.id == id && e.active)
    }

    /// Record a successful request through the leased proxy
    ///
    /// A report against a removed proxy is a no-op.
    pub fn report_success(&self, id: u64) {
        let mut entries = self.lock_entries();
        if let Some(entry) = entries.iter_mut().find(|e| e.id == id) {
            entry.success_count += 1;
            entry.consecutive_rate_limits = 0;
        }
    }

    /// Record a failed request through the leased proxy
    ///
    /// Rate-limit failures count toward the deactivation threshold; reaching
    /// it takes the proxy out of rotation for the configured cool-down.
    pub fn report_failure(&self, id: u64, is_rate_limit: bool) {
        let mut entries = self.lock_entries();
        let Some(entry) = entries.iter_mut().find(|e| e.id == id) else {
            return;
        };
        entry.error_count += 1;
        if !is_rate_limit {
            entry.consecutive_rate_limits = 0;
            return;
        }
        entry.consecutive_rate_limits += 1;
        if entry.active && entry.consecutive_rate_limits >= self.config.deactivate_threshold {
            entry.active = false;
            entry.reactivate_after = Some(Instant::now() + self.config.cooldown);
            tracing::warn!(
                proxy = %entry.spec,
                consecutive = entry.consecutive_rate_limits,
                cooldown_secs = self.config.cooldown.as_secs(),
                "proxy deactivated after consecutive rate-limit errors"
            );
        }
    }

    /// Remove proxies that failed a connectivity probe
    ///
    /// `dead` holds stable ids from a probe pass. Kept proxies retain their
    /// ids, counters, and limiters, so leases taken before the removal still
    /// report against the right entry.
    pub fn remove_ids(&self, dead: &[u64]) {
        if dead.is_empty() {
            return;
        }
        let mut entries = self.lock_entries();
        entries.retain(|entry| {
            let keep = !dead.contains(&entry.id);
            if !keep {
                tracing::info!(proxy = %entry.spec, "removing dead proxy from pool");
            }
            keep
        });
    }

    /// All proxies with their stable ids, for probing
    pub fn all_ids(&self) -> Vec<(u64, ProxySpec)> {
        self.lock_entries()
            .iter()
            .map(|e| (e.id, e.spec.clone()))
            .collect()
    }

    /// Write the proxies that proved themselves this run to a pool file
    ///
    /// Keeps entries with at least one success, ordered best first (active,
    /// then most successes, then fewest errors). The output parses back as a
    /// pool file, credentials included. Returns the number written.
    pub fn export_working(&self, path: &Path) -> Result<usize> {
        let mut working: Vec<(bool, u64, u64, String)> = self
            .lock_entries()
            .iter()
            .filter(|e| e.success_count > 0)
            .map(|e| (e.active, e.success_count, e.error_count, e.spec.url()))
            .collect();
        working.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then(b.1.cmp(&a.1))
                .then(a.2.cmp(&b.2))
        });

        let mut out = format!(
            "# working proxies exported {}\n",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
        );
        for (_, _, _, url) in &working {
            out.push_str(url);
            out.push('\n');
        }
        std::fs::write(path, out)?;
        tracing::info!(path = %path.display(), count = working.len(), "exported working proxies");
        Ok(working.len())
    }

    /// Default timestamped filename for [`export_working`](Self::export_working)
    #[must_use]
    pub fn default_export_name() -> String {
        format!(
            "working_proxies_{}.txt",
            chrono::Local::now().format("%Y%m%d_%H%M%S")
        )
    }

    /// Aggregate pool statistics
    pub fn snapshot(&self) -> PoolSnapshot {
        let entries = self.lock_entries();
        let now = Instant::now();
        let active = entries
            .iter()
            .filter(|e| e.active || e.reactivate_after.is_some_and(|at| now >= at))
            .count();
        PoolSnapshot {
            total: entries.len(),
            active,
            inactive: entries.len() - active,
            total_success: entries.iter().map(|e| e.success_count).sum(),
            total_errors: entries.iter().map(|e| e.error_count).sum(),
        }
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, Vec<ProxyEntry>> {
        // Lock poisoning only happens if a holder panicked; the entry data
        // is still structurally sound, so keep going with it
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
