//! Configuration types for registry-dl

use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::PathBuf, time::Duration};

/// Main configuration for [`RegistryDownloader`](crate::RegistryDownloader)
///
/// Fields are organized into logical sub-configs:
/// - [`api`](ApiConfig) — remote endpoints and query shape
/// - [`fetch`](FetchConfig) — concurrency, retries, timeouts
/// - [`proxy`](ProxyConfig) — proxy pool and adaptive rate limiting
/// - [`output`](OutputConfig) — batch directory, resume, shuffle
///
/// Every field has a sensible default; `Config::default()` is a working
/// configuration apart from the API base URLs, which point at the public
/// registry the tool was built for.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Remote API endpoints and query parameters
    #[serde(default)]
    pub api: ApiConfig,

    /// Fetch behavior (workers, retries, timeouts, pauses)
    #[serde(default)]
    pub fetch: FetchConfig,

    /// Proxy pool and per-proxy rate limiter settings
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Output directory layout and run options
    #[serde(default)]
    pub output: OutputConfig,
}

/// Remote API endpoints and query shape
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Detail endpoint; a record is fetched from `{detail_url}/{id}`
    #[serde(default = "default_detail_url")]
    pub detail_url: String,

    /// Listing endpoint, paginated via `page` / `per-page` query parameters
    #[serde(default = "default_listing_url")]
    pub listing_url: String,

    /// JSON field inside listing `items[]` that carries the record id
    #[serde(default = "default_id_field")]
    pub id_field: String,

    /// Records per listing page (default: 500)
    #[serde(default = "default_per_page")]
    pub per_page: u32,

    /// Sort expression sent with listing requests
    #[serde(default = "default_sort")]
    pub sort: String,

    /// Extra listing filters, sent verbatim as query parameters
    /// (e.g. `filter[DocStartDate][gte]` → `01.02.2025`)
    #[serde(default)]
    pub filters: BTreeMap<String, String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            detail_url: default_detail_url(),
            listing_url: default_listing_url(),
            id_field: default_id_field(),
            per_page: default_per_page(),
            sort: default_sort(),
            filters: BTreeMap::new(),
        }
    }
}

/// Fetch behavior: concurrency, retries, timeouts, pauses
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Upper bound on concurrent fetch tasks per slice (default: 50)
    ///
    /// Effective slice concurrency is `min(workers, active proxies)` when a
    /// proxy pool is loaded.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Total attempts per record, including the first (default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay before a retry; grows linearly with the attempt number
    /// (default: 2 seconds)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Per-request timeout (default: 10 seconds)
    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub request_timeout: Duration,

    /// Pause between dispatch slices, to smooth aggregate load (default: 5 seconds)
    #[serde(default = "default_slice_pause", with = "duration_serde")]
    pub slice_pause: Duration,

    /// Fixed sleep after an HTTP 429 before the next attempt (default: 5 seconds)
    #[serde(default = "default_rate_limit_pause", with = "duration_serde")]
    pub rate_limit_pause: Duration,

    /// Maximum number of malformed-response diagnostic files kept on disk
    /// (default: 20; oldest are pruned first)
    #[serde(default = "default_diagnostics_cap")]
    pub diagnostics_cap: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            request_timeout: default_request_timeout(),
            slice_pause: default_slice_pause(),
            rate_limit_pause: default_rate_limit_pause(),
            diagnostics_cap: default_diagnostics_cap(),
        }
    }
}

/// Proxy pool configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Path to the proxy pool file, one proxy per line; `None` runs direct
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Refuse to run without at least one loaded proxy (default: false)
    #[serde(default)]
    pub require_proxies: bool,

    /// Cool-down before a deactivated proxy is eligible again (default: 300 seconds)
    #[serde(default = "default_cooldown", with = "duration_serde")]
    pub cooldown: Duration,

    /// Consecutive rate-limit errors that deactivate a proxy (default: 5)
    #[serde(default = "default_deactivate_threshold")]
    pub deactivate_threshold: u32,

    /// Per-proxy adaptive rate limiter settings
    #[serde(default)]
    pub limiter: LimiterConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            file: None,
            require_proxies: false,
            cooldown: default_cooldown(),
            deactivate_threshold: default_deactivate_threshold(),
            limiter: LimiterConfig::default(),
        }
    }
}

/// Adaptive rate limiter tuning
///
/// One limiter instance exists per proxy (or one global instance when the
/// pool is empty). The current rate always stays within
/// `[min_rate, max_rate]`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Starting rate in calls per second (default: 0.5)
    #[serde(default = "default_initial_rate")]
    pub initial_rate: f64,

    /// Rate ceiling in calls per second (default: 1.0)
    #[serde(default = "default_max_rate")]
    pub max_rate: f64,

    /// Rate floor in calls per second (default: 0.1)
    #[serde(default = "default_min_rate")]
    pub min_rate: f64,

    /// Multiplier applied on a rate-limit error (default: 0.5)
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Multiplier applied after a success streak (default: 1.05)
    #[serde(default = "default_recovery_factor")]
    pub recovery_factor: f64,

    /// Consecutive successes required before a rate increase (default: 25)
    #[serde(default = "default_success_streak")]
    pub success_streak: u32,

    /// Minimum interval between upward rate adjustments (default: 10 seconds)
    #[serde(default = "default_adjust_cooldown", with = "duration_serde")]
    pub adjust_cooldown: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            initial_rate: default_initial_rate(),
            max_rate: default_max_rate(),
            min_rate: default_min_rate(),
            backoff_factor: default_backoff_factor(),
            recovery_factor: default_recovery_factor(),
            success_streak: default_success_streak(),
            adjust_cooldown: default_adjust_cooldown(),
        }
    }
}

/// Output directory layout and run options
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Root under which `batch_{timestamp}` directories are created
    /// (default: "./records")
    #[serde(default = "default_output_root")]
    pub output_root: PathBuf,

    /// Skip ids already persisted in previous batch directories
    #[serde(default)]
    pub resume: bool,

    /// Shuffle the id queue before dispatching, to spread load evenly
    #[serde(default)]
    pub shuffle: bool,

    /// Cap the number of ids processed this run (for trial runs)
    #[serde(default)]
    pub limit: Option<usize>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            output_root: default_output_root(),
            resume: false,
            shuffle: false,
            limit: None,
        }
    }
}

impl Config {
    /// Check the configuration for values that would break a run
    ///
    /// Called by [`RegistryDownloader::new`](crate::RegistryDownloader::new);
    /// standalone use is for validating user-supplied config files early.
    pub fn validate(&self) -> crate::error::Result<()> {
        for (key, value) in [
            ("api.detail_url", &self.api.detail_url),
            ("api.listing_url", &self.api.listing_url),
        ] {
            url::Url::parse(value).map_err(|e| crate::error::Error::Config {
                message: format!("invalid URL '{value}': {e}"),
                key: Some(key.to_string()),
            })?;
        }
        if self.fetch.workers == 0 {
            return Err(config_error("workers must be at least 1", "fetch.workers"));
        }
        if self.fetch.max_attempts == 0 {
            return Err(config_error(
                "max_attempts must be at least 1",
                "fetch.max_attempts",
            ));
        }
        if self.api.per_page == 0 {
            return Err(config_error("per_page must be at least 1", "api.per_page"));
        }
        let limiter = &self.proxy.limiter;
        if !(limiter.min_rate > 0.0 && limiter.min_rate <= limiter.max_rate) {
            return Err(config_error(
                "limiter rates must satisfy 0 < min_rate <= max_rate",
                "proxy.limiter",
            ));
        }
        if !(0.0 < limiter.backoff_factor && limiter.backoff_factor < 1.0) {
            return Err(config_error(
                "backoff_factor must be between 0 and 1",
                "proxy.limiter.backoff_factor",
            ));
        }
        if limiter.recovery_factor < 1.0 {
            return Err(config_error(
                "recovery_factor must be at least 1",
                "proxy.limiter.recovery_factor",
            ));
        }
        Ok(())
    }
}

fn config_error(message: &str, key: &str) -> crate::error::Error {
    crate::error::Error::Config {
        message: message.to_string(),
        key: Some(key.to_string()),
    }
}

fn default_detail_url() -> String {
    "https://api.belgiss.by/tsouz/tsouz-certifs".to_string()
}

fn default_listing_url() -> String {
    "https://api.belgiss.by/tsouz/tsouz-certifs-light".to_string()
}

fn default_id_field() -> String {
    "certdecltr_id".to_string()
}

fn default_per_page() -> u32 {
    500
}

fn default_sort() -> String {
    "-certdecltr_id".to_string()
}

fn default_workers() -> usize {
    50
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_slice_pause() -> Duration {
    Duration::from_secs(5)
}

fn default_rate_limit_pause() -> Duration {
    Duration::from_secs(5)
}

fn default_diagnostics_cap() -> usize {
    20
}

fn default_cooldown() -> Duration {
    Duration::from_secs(300)
}

fn default_deactivate_threshold() -> u32 {
    5
}

fn default_initial_rate() -> f64 {
    0.5
}

fn default_max_rate() -> f64 {
    1.0
}

fn default_min_rate() -> f64 {
    0.1
}

fn default_backoff_factor() -> f64 {
    0.5
}

fn default_recovery_factor() -> f64 {
    1.05
}

fn default_success_streak() -> u32 {
    25
}

fn default_adjust_cooldown() -> Duration {
    Duration::from_secs(10)
}

fn default_output_root() -> PathBuf {
    PathBuf::from("./records")
}

// Duration serialization helper (serialized as whole seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_working_limits() {
        let config = Config::default();
        assert_eq!(config.fetch.workers, 50);
        assert_eq!(config.fetch.max_attempts, 5);
        assert_eq!(config.proxy.deactivate_threshold, 5);
        assert_eq!(config.proxy.cooldown, Duration::from_secs(300));
        assert!(config.proxy.limiter.min_rate <= config.proxy.limiter.initial_rate);
        assert!(config.proxy.limiter.initial_rate <= config.proxy.limiter.max_rate);
    }

    #[test]
    fn empty_json_deserializes_to_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.api.per_page, 500);
        assert_eq!(config.fetch.slice_pause, Duration::from_secs(5));
        assert!(config.proxy.file.is_none());
        assert!(!config.output.resume);
    }

    #[test]
    fn durations_serialize_as_seconds() {
        let config = Config::default();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["fetch"]["request_timeout"], 10);
        assert_eq!(json["proxy"]["cooldown"], 300);
        assert_eq!(json["proxy"]["limiter"]["adjust_cooldown"], 10);
    }

    #[test]
    fn partial_json_overrides_only_named_fields() {
        let config: Config = serde_json::from_str(
            r#"{"fetch": {"workers": 3, "max_attempts": 2}, "output": {"resume": true}}"#,
        )
        .unwrap();
        assert_eq!(config.fetch.workers, 3);
        assert_eq!(config.fetch.max_attempts, 2);
        // untouched fields keep defaults
        assert_eq!(config.fetch.initial_delay, Duration::from_secs(2));
        assert!(config.output.resume);
        assert!(!config.output.shuffle);
    }

    #[test]
    fn default_config_validates() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn validate_rejects_bad_urls_and_zero_limits() {
        let mut config = Config::default();
        config.api.detail_url = "not a url".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.fetch.workers = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.proxy.limiter.min_rate = 2.0; // above max_rate
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.proxy.limiter.backoff_factor = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn filters_roundtrip_preserves_keys() {
        let mut config = Config::default();
        config.api.filters.insert(
            "filter[DocStartDate][gte]".to_string(),
            "01.02.2025".to_string(),
        );
        let json = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(
            back.api
                .filters
                .get("filter[DocStartDate][gte]")
                .map(String::as_str),
            Some("01.02.2025")
        );
    }
}
