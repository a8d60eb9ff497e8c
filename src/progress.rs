//! Run progress tracking and periodic logging
//!
//! One [`ProgressReporter`] exists per run, shared by every fetch task. It
//! keeps lock-free counters for the hot path and logs a progress line at a
//! fixed completion interval with throughput and an ETA estimate.

use crate::error::ErrorCategory;
use crate::types::{PoolSnapshot, ProgressSnapshot};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Completions between progress log lines
const LOG_INTERVAL: usize = 25;

/// Shared progress state for one run
#[derive(Debug)]
pub struct ProgressReporter {
    total: usize,
    started: Instant,
    completed: AtomicUsize,
    success: AtomicUsize,
    errors: AtomicUsize,
    categories: Mutex<HashMap<ErrorCategory, usize>>,
}

impl ProgressReporter {
    /// Start tracking a run over `total` ids
    #[must_use]
    pub fn new(total: usize) -> Self {
        Self {
            total,
            started: Instant::now(),
            completed: AtomicUsize::new(0),
            success: AtomicUsize::new(0),
            errors: AtomicUsize::new(0),
            categories: Mutex::new(HashMap::new()),
        }
    }

    /// Record one terminal outcome
    ///
    /// Logs a progress line at a fixed completion interval and when the
    /// last id finishes.
    pub fn record(&self, success: bool, category: Option<ErrorCategory>) {
        if success {
            self.success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.errors.fetch_add(1, Ordering::Relaxed);
            if let Some(category) = category {
                if let Ok(mut categories) = self.categories.lock() {
                    *categories.entry(category).or_insert(0) += 1;
                }
            }
        }

        let completed = self.completed.fetch_add(1, Ordering::Relaxed) + 1;
        if completed % LOG_INTERVAL == 0 || completed == self.total {
            self.log_progress(completed);
        }
    }

    /// Point-in-time counters with throughput
    pub fn snapshot(&self) -> ProgressSnapshot {
        let completed = self.completed.load(Ordering::Relaxed);
        let elapsed = self.started.elapsed().as_secs_f64();
        let rate_per_min = if elapsed > 0.0 {
            completed as f64 * 60.0 / elapsed
        } else {
            0.0
        };
        ProgressSnapshot {
            total: self.total,
            completed,
            success: self.success.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            rate_per_min,
        }
    }

    /// Time since the run started
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Estimated time to completion, `None` until throughput is measurable
    pub fn eta(&self) -> Option<Duration> {
        let snapshot = self.snapshot();
        if snapshot.completed == 0 || snapshot.rate_per_min <= 0.0 {
            return None;
        }
        let remaining = self.total.saturating_sub(snapshot.completed);
        Some(Duration::from_secs_f64(
            remaining as f64 * 60.0 / snapshot.rate_per_min,
        ))
    }

    fn log_progress(&self, completed: usize) {
        let snapshot = self.snapshot();
        let percent = if self.total > 0 {
            completed as f64 * 100.0 / self.total as f64
        } else {
            100.0
        };
        tracing::info!(
            completed,
            total = self.total,
            percent = format!("{percent:.1}"),
            success = snapshot.success,
            errors = snapshot.errors,
            rate_per_min = format!("{:.1}", snapshot.rate_per_min),
            eta_secs = self.eta().map(|d| d.as_secs()),
            "progress"
        );
    }

    /// Log the end-of-run summary, with error counts per category and pool
    /// statistics when a proxy pool was in play
    pub fn log_summary(&self, pool: Option<&PoolSnapshot>) {
        let snapshot = self.snapshot();
        let categories = self
            .categories
            .lock()
            .map(|map| {
                let mut pairs: Vec<_> = map
                    .iter()
                    .map(|(category, count)| format!("{category}={count}"))
                    .collect();
                pairs.sort();
                pairs.join(", ")
            })
            .unwrap_or_default();

        tracing::info!(
            total = self.total,
            completed = snapshot.completed,
            success = snapshot.success,
            errors = snapshot.errors,
            error_breakdown = %categories,
            elapsed_secs = format!("{:.1}", self.elapsed().as_secs_f64()),
            "run finished"
        );
        if let Some(pool) = pool {
            tracing::info!(
                proxies_total = pool.total,
                proxies_active = pool.active,
                proxies_inactive = pool.inactive,
                proxy_success = pool.total_success,
                proxy_errors = pool.total_errors,
                "proxy pool summary"
            );
        }
    }
}
