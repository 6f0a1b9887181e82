use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

use super::archive::DailyArchive;
use crate::analyzers::coverage::CoverageReport;

/// A key that ended the run failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedKey {
    pub key: String,
    pub error: String,
}

/// What one orchestrator run did.
#[derive(Debug, Default, Serialize)]
pub struct RunSummary {
    pub planned: usize,
    /// Already done before this run started.
    pub skipped: usize,
    pub done: usize,
    pub failed: usize,
    /// Set when the run stopped early on a shutdown signal.
    pub cancelled: bool,
    /// Dispatched but neither done nor failed when the run stopped.
    pub abandoned: usize,
    /// Keyed by failure kind, e.g. `exhausted_retries`.
    pub failures: BTreeMap<String, Vec<FailedKey>>,
    pub rows_per_route: BTreeMap<String, usize>,
    /// Services listed across all keys, and how many were looked up after
    /// sampling down to the per-key cap.
    pub rids_listed: usize,
    pub rids_fetched: usize,
    /// Services looked up without yielding a row.
    pub rejected_rows: usize,
    pub requests: u64,
    /// Keys whose data includes a window still capped at minimum granularity.
    pub floor_keys: Vec<String>,
    #[serde(skip)]
    pub archives: Vec<DailyArchive>,
    pub coverage: Option<CoverageReport>,
}

impl RunSummary {
    pub(crate) fn record_failure(&mut self, kind: &str, key: String, error: String) {
        self.failed += 1;
        self.failures
            .entry(kind.to_string())
            .or_default()
            .push(FailedKey { key, error });
    }

    /// No failed keys, not cancelled, and coverage (if computed) passed.
    pub fn is_clean(&self) -> bool {
        self.failed == 0
            && !self.cancelled
            && self.coverage.as_ref().is_none_or(|c| c.passed)
    }

    pub fn log(&self) {
        info!(
            planned = self.planned,
            skipped = self.skipped,
            done = self.done,
            failed = self.failed,
            abandoned = self.abandoned,
            cancelled = self.cancelled,
            requests = self.requests,
            rids_listed = self.rids_listed,
            rids_fetched = self.rids_fetched,
            rejected_rows = self.rejected_rows,
            "Collection run summary"
        );

        for (route, rows) in &self.rows_per_route {
            info!(route = %route, rows, "Rows collected");
        }

        for (kind, keys) in &self.failures {
            warn!(kind = %kind, count = keys.len(), "Failed keys");
            for failed in keys {
                warn!(kind = %kind, key = %failed.key, error = %failed.error, "Failed key");
            }
        }

        if !self.floor_keys.is_empty() {
            warn!(
                count = self.floor_keys.len(),
                keys = ?self.floor_keys,
                "Keys capped at minimum window, observations may be undercounted"
            );
        }

        for archive in &self.archives {
            info!(
                date = %archive.date,
                rows = archive.rows,
                duplicates = archive.duplicates,
                path = %archive.path.display(),
                "Daily archive"
            );
        }

        if let Some(coverage) = &self.coverage {
            if coverage.passed {
                info!(
                    cells = coverage.cells,
                    sparse_cells = coverage.sparse_cells,
                    total_rows = coverage.total_rows,
                    "Coverage check passed"
                );
            } else {
                warn!(
                    cells = coverage.cells,
                    sparse_cells = coverage.sparse_cells,
                    total_rows = coverage.total_rows,
                    min_obs_per_cell = coverage.min_obs_per_cell,
                    "Coverage check failed"
                );
            }
        }
    }
}
