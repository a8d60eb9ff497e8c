//! Batch directory layout and persistence
//!
//! Every run writes into its own timestamped directory under the output
//! root:
//!
//! ```text
//! records/
//!   batch_20250301_120000/
//!     418112.json              one file per fetched record
//!     418113.json
//!     diagnostics/             malformed response bodies, capped
//!     download_report.json     run summary, written last
//! ```
//!
//! Record files are written atomically (temp file then rename) so a crash
//! mid-write never leaves a half-record that a later resume would trust.

use crate::error::Result;
use crate::types::{BatchReport, RecordId};
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Filename of the run summary inside a batch directory
pub const REPORT_FILENAME: &str = "download_report.json";

/// Prefix of per-run directories under the output root
const BATCH_PREFIX: &str = "batch_";

/// Handle to one run's batch directory
#[derive(Clone, Debug)]
pub struct BatchPersistence {
    dir: PathBuf,
}

impl BatchPersistence {
    /// Create a fresh `batch_{timestamp}` directory under `output_root`
    ///
    /// Appends a numeric suffix when two runs start within the same second.
    pub fn create(output_root: &Path) -> Result<Self> {
        std::fs::create_dir_all(output_root)?;
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();

        let mut dir = output_root.join(format!("{BATCH_PREFIX}{stamp}"));
        let mut suffix = 1u32;
        while dir.exists() {
            dir = output_root.join(format!("{BATCH_PREFIX}{stamp}_{suffix}"));
            suffix += 1;
        }
        std::fs::create_dir(&dir)?;
        tracing::info!(dir = %dir.display(), "created batch directory");
        Ok(Self { dir })
    }

    /// Open an existing batch directory (used by tests and tooling)
    #[must_use]
    pub fn open(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// The batch directory path
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where this batch's diagnostic files go
    #[must_use]
    pub fn diagnostics_dir(&self) -> PathBuf {
        self.dir.join("diagnostics")
    }

    /// Persist one fetched record as `{id}.json`
    ///
    /// Pretty-printed for manual inspection. Atomic via temp-then-rename.
    pub fn save_record(&self, id: RecordId, payload: &Value) -> Result<PathBuf> {
        let path = self.dir.join(format!("{id}.json"));
        let tmp = self.dir.join(format!(".{id}.json.tmp"));
        std::fs::write(&tmp, serde_json::to_vec_pretty(payload)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(path)
    }

    /// Write the run summary as `download_report.json`
    pub fn write_report(&self, report: &BatchReport) -> Result<PathBuf> {
        let path = self.dir.join(REPORT_FILENAME);
        let tmp = self.dir.join(format!(".{REPORT_FILENAME}.tmp"));
        std::fs::write(&tmp, serde_json::to_vec_pretty(report)?)?;
        std::fs::rename(&tmp, &path)?;
        tracing::info!(path = %path.display(), "wrote batch report");
        Ok(path)
    }

    /// Read a run summary back from a batch directory
    pub fn read_report(dir: &Path) -> Result<BatchReport> {
        let bytes = std::fs::read(dir.join(REPORT_FILENAME))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Record ids already persisted by any previous batch under `output_root`
///
/// Scans every `batch_*` directory for `{id}.json` files. Temp files,
/// diagnostics, and reports are ignored. A missing output root is an empty
/// set, not an error.
pub fn persisted_ids(output_root: &Path) -> Result<HashSet<RecordId>> {
    let mut ids = HashSet::new();
    let entries = match std::fs::read_dir(output_root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
        Err(e) => return Err(e.into()),
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(BATCH_PREFIX) || !entry.path().is_dir() {
            continue;
        }
        for record in std::fs::read_dir(entry.path())?.flatten() {
            let file_name = record.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if let Some(stem) = file_name.strip_suffix(".json") {
                if let Ok(id) = stem.parse::<RecordId>() {
                    ids.insert(id);
                }
            }
        }
    }
    Ok(ids)
}
