//! Core types for registry-dl

use serde::{Deserialize, Serialize};

/// Unique identifier for a remote record
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RecordId(pub u64);

impl RecordId {
    /// Create a new RecordId
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the inner u64 value
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl From<u64> for RecordId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<RecordId> for u64 {
    fn from(id: RecordId) -> Self {
        id.0
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RecordId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Terminal outcome of one record fetch
///
/// Immutable once produced; appended to the batch report's `results` array.
/// The payload itself is not carried here — successful payloads go straight
/// to the batch directory.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FetchResult {
    /// The record this result is for
    pub id: RecordId,
    /// Whether the record was fetched and persisted
    pub success: bool,
    /// Error description for failed fetches
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Redacted identifier of the proxy used, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
}

impl FetchResult {
    /// A successful fetch through the given proxy
    pub fn success(id: RecordId, proxy: Option<String>) -> Self {
        Self {
            id,
            success: true,
            error: None,
            proxy,
        }
    }

    /// A terminally failed fetch
    pub fn failure(id: RecordId, error: String, proxy: Option<String>) -> Self {
        Self {
            id,
            success: false,
            error: Some(error),
            proxy,
        }
    }
}

/// Summary of one batch run, written as `download_report.json`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchReport {
    /// Wall-clock time the report was written (`YYYY-MM-DD HH:MM:SS`)
    pub timestamp: String,
    /// Number of ids the run started with (after dedup/resume filtering)
    pub total_ids: usize,
    /// Number of ids that reached a terminal outcome
    pub completed: usize,
    /// Number of successful fetches
    pub success: usize,
    /// Number of terminal failures
    pub errors: usize,
    /// Run duration in seconds
    pub time_elapsed: f64,
    /// Per-item terminal results
    pub results: Vec<FetchResult>,
}

/// Aggregate view of the proxy pool, for reporting
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    /// Total proxies in the pool
    pub total: usize,
    /// Proxies currently active
    pub active: usize,
    /// Proxies currently deactivated (cooling down)
    pub inactive: usize,
    /// Sum of success counters across the pool
    pub total_success: u64,
    /// Sum of error counters across the pool
    pub total_errors: u64,
}

/// Point-in-time view of run progress
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// Number of ids the run started with
    pub total: usize,
    /// Terminal outcomes recorded so far
    pub completed: usize,
    /// Successes so far
    pub success: usize,
    /// Failures so far
    pub errors: usize,
    /// Throughput in records per minute since the run started
    pub rate_per_min: f64,
}

/// Phase of a scheduler run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    /// Scanning, deduplicating, and filtering the id source
    Loading,
    /// Dispatching bounded-concurrency slices
    Dispatching,
    /// Queue empty, waiting for the final slice
    Draining,
    /// Writing the run summary
    Reporting,
    /// Run finished
    Done,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunState::Loading => "loading",
            RunState::Dispatching => "dispatching",
            RunState::Draining => "draining",
            RunState::Reporting => "reporting",
            RunState::Done => "done",
        };
        write!(f, "{name}")
    }
}
