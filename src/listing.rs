//! Record id discovery via the paginated listing endpoint
//!
//! The listing API is a standard paginated search: `page` and `per-page`
//! query parameters, a `sort` expression, arbitrary `filter[...]`
//! parameters, and a response of the form
//!
//! ```json
//! {
//!   "items": [{"certdecltr_id": 418112, ...}, ...],
//!   "_meta": {"totalCount": 12345, "pageCount": 25, ...}
//! }
//! ```
//!
//! Pages are fetched sequentially through the [`RequestExecutor`], so
//! listing traffic obeys the same proxy rotation and rate limits as record
//! fetches.

use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::executor::RequestExecutor;
use crate::types::RecordId;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Upper bound on id preallocation; `_meta.totalCount` comes from the
/// network and is not trusted with the allocator
const ID_PREALLOC_CAP: usize = 100_000;

/// Client for the paginated listing endpoint
pub struct ListingClient {
    api: ApiConfig,
    executor: Arc<RequestExecutor>,
}

impl ListingClient {
    /// Create a listing client sharing the run's executor
    #[must_use]
    pub fn new(api: ApiConfig, executor: Arc<RequestExecutor>) -> Self {
        Self { api, executor }
    }

    /// Total records matching the configured filters
    ///
    /// Issues a minimal one-record query and reads `_meta.totalCount`.
    pub async fn total_count(&self, cancel: &CancellationToken) -> Result<u64> {
        let query = self.base_query(1, 1);
        let page = self
            .executor
            .get_json(&self.api.listing_url, &query, cancel)
            .await?;
        page.pointer("/_meta/totalCount")
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::MalformedResponse {
                url: self.api.listing_url.clone(),
                diagnostic: None,
            })
    }

    /// Record ids on one listing page (1-based)
    pub async fn fetch_page(&self, page: u32, cancel: &CancellationToken) -> Result<Vec<RecordId>> {
        let query = self.base_query(page, self.api.per_page);
        let body = self
            .executor
            .get_json(&self.api.listing_url, &query, cancel)
            .await?;
        let items = body
            .get("items")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::MalformedResponse {
                url: self.api.listing_url.clone(),
                diagnostic: None,
            })?;

        let mut ids = Vec::with_capacity(items.len());
        for item in items {
            match extract_id(item, &self.api.id_field) {
                Some(id) => ids.push(id),
                None => {
                    tracing::warn!(
                        field = %self.api.id_field,
                        "listing item is missing its id field"
                    );
                }
            }
        }
        Ok(ids)
    }

    /// Walk every listing page and collect all matching record ids
    ///
    /// Returns the ids gathered so far if cancelled mid-walk. A page whose
    /// retries are exhausted aborts discovery, since silently losing a page
    /// of ids would make the run look complete when it is not.
    pub async fn discover_ids(&self, cancel: &CancellationToken) -> Result<Vec<RecordId>> {
        let total = self.total_count(cancel).await?;
        if total == 0 {
            tracing::info!("no records match the configured filters");
            return Ok(Vec::new());
        }
        let per_page = u64::from(self.api.per_page.max(1));
        let pages = u32::try_from(total.div_ceil(per_page)).unwrap_or(u32::MAX);
        tracing::info!(total, pages, per_page, "discovered listing size");

        let prealloc = usize::try_from(total).unwrap_or(usize::MAX);
        let mut ids = Vec::with_capacity(prealloc.min(ID_PREALLOC_CAP));
        for page in 1..=pages {
            if cancel.is_cancelled() {
                tracing::warn!(page, pages, "listing walk interrupted");
                break;
            }
            let page_ids = self.fetch_page(page, cancel).await?;
            tracing::debug!(page, count = page_ids.len(), "fetched listing page");
            ids.extend(page_ids);
        }
        Ok(ids)
    }

    fn base_query(&self, page: u32, per_page: u32) -> Vec<(String, String)> {
        let mut query = vec![
            ("page".to_string(), page.to_string()),
            ("per-page".to_string(), per_page.to_string()),
            ("sort".to_string(), self.api.sort.clone()),
        ];
        for (key, value) in &self.api.filters {
            query.push((key.clone(), value.clone()));
        }
        query
    }
}

/// Extract record ids from previously downloaded listing files
///
/// Scans `dir` for `*.json` files, reads the `items[]` array of each (a
/// bare top-level array is accepted too), and pulls `id_field` from every
/// item. Unreadable or unparseable files are logged and skipped. Ids are
/// deduplicated, first occurrence wins.
pub fn load_ids_from_dir(dir: &Path, id_field: &str) -> Result<Vec<RecordId>> {
    let mut ids = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for entry in std::fs::read_dir(dir)?.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let parsed: Value = match std::fs::read(&path)
            .map_err(crate::error::Error::from)
            .and_then(|bytes| Ok(serde_json::from_slice(&bytes)?))
        {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping unreadable listing file");
                continue;
            }
        };
        let items = match &parsed {
            Value::Array(items) => items.as_slice(),
            other => other
                .get("items")
                .and_then(Value::as_array)
                .map_or(&[][..], Vec::as_slice),
        };
        for item in items {
            if let Some(id) = extract_id(item, id_field) {
                if seen.insert(id) {
                    ids.push(id);
                }
            }
        }
    }
    tracing::info!(dir = %dir.display(), count = ids.len(), "loaded ids from listing files");
    Ok(ids)
}

/// Pull the record id out of a listing item, tolerating string-typed ids
fn extract_id(item: &Value, field: &str) -> Option<RecordId> {
    match item.get(field)? {
        Value::Number(n) => n.as_u64().map(RecordId),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
