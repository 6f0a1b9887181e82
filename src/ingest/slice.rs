//! One key's collection: list its services (bisecting capped windows),
//! sample the list down to the configured cap, then look up each service's
//! arrival. Also the per-key JSON logs recording how that went.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{Instrument, debug, warn};

use crate::bisect::WindowBisector;
use crate::config::CollectorConfig;
use crate::fetch::{FailureKind, FetchFailure, RetryingFetcher, ServiceClient};
use crate::model::{DelayRecord, FetchKey, TimeWindow};

/// Counters for one key, kept up to date as collection proceeds so that a
/// failed key still reports how far it got.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SliceStats {
    pub rids_listed: usize,
    pub rids_fetched: usize,
    /// Services looked up without yielding a row.
    pub rejected: usize,
    pub metrics_ms: u64,
    pub details_ms: u64,
}

/// Rows collected for one key.
#[derive(Debug, Default)]
pub struct Slice {
    pub records: Vec<DelayRecord>,
    pub floor_windows: Vec<TimeWindow>,
    pub windows_fetched: usize,
    pub max_depth: u32,
}

/// Deterministic FNV-1a, so sampling does not depend on the std hasher's
/// per-process keys.
fn seed_for(key: &FetchKey) -> u64 {
    key.id().bytes().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
    })
}

/// Keeps at most `cap` RIDs. The choice depends only on the key and the set
/// of RIDs, never on listing order, and comes back sorted.
pub fn sample_rids(rids: Vec<String>, cap: Option<usize>, key: &FetchKey) -> Vec<String> {
    let mut rids = rids;
    rids.sort();
    rids.dedup();

    let Some(cap) = cap.filter(|cap| rids.len() > *cap) else {
        return rids;
    };

    let mut rng = StdRng::seed_from_u64(seed_for(key));
    let mut sampled: Vec<String> = rids.choose_multiple(&mut rng, cap).cloned().collect();
    sampled.sort();
    sampled
}

/// Collects one key. Every sampled service is looked up concurrently; the
/// shared budget bounds how many requests are actually in flight.
///
/// A lookup refused outright (`Fatal`) or answered with an unusable body
/// drops that service only. Rejected credentials or exhausted retries fail
/// the key.
pub async fn collect_slice<C: ServiceClient + 'static>(
    fetcher: &Arc<RetryingFetcher<C>>,
    config: &CollectorConfig,
    key: &FetchKey,
    stats: &mut SliceStats,
) -> Result<Slice, FetchFailure> {
    let started = Instant::now();
    let bisector = WindowBisector::new(fetcher.as_ref(), config.row_cap, config.min_window_minutes);
    let listed = bisector.collect(key).await;
    stats.metrics_ms = started.elapsed().as_millis() as u64;
    let listed = listed?;

    stats.rids_listed = listed.rids.len();
    let rids = sample_rids(listed.rids, config.rid_cap_per_slice, key);
    stats.rids_fetched = rids.len();
    if rids.len() < stats.rids_listed {
        debug!(
            listed = stats.rids_listed,
            kept = rids.len(),
            "Sampled services down to cap"
        );
    }

    let started = Instant::now();
    let looked_up = lookup_all(fetcher, key, rids).await;
    stats.details_ms = started.elapsed().as_millis() as u64;

    let looked_up = looked_up?;

    let mut records = Vec::with_capacity(looked_up.len());
    for (rid, result) in looked_up {
        match result {
            Ok(Some(record)) => records.push(record),
            Ok(None) => stats.rejected += 1,
            Err(failure) => {
                warn!(rid = %rid, kind = %failure.kind, error = %failure.last_error, "Dropping service");
                stats.rejected += 1;
            }
        }
    }

    Ok(Slice {
        records,
        floor_windows: listed.floor_windows,
        windows_fetched: listed.windows_fetched,
        max_depth: listed.max_depth,
    })
}

type Lookup = (String, Result<Option<DelayRecord>, FetchFailure>);

/// Looks up every RID, returning results in RID order. Stops at the first
/// failure that fails the whole key.
async fn lookup_all<C: ServiceClient + 'static>(
    fetcher: &Arc<RetryingFetcher<C>>,
    key: &FetchKey,
    rids: Vec<String>,
) -> Result<Vec<Lookup>, FetchFailure> {
    let mut tasks = JoinSet::new();
    for (index, rid) in rids.into_iter().enumerate() {
        let fetcher = fetcher.clone();
        let key = key.clone();
        tasks.spawn(
            async move {
                let result = fetcher.details_with_retry(&key, &rid).await;
                (index, rid, result)
            }
            .in_current_span(),
        );
    }

    let mut results = Vec::with_capacity(tasks.len());
    while let Some(joined) = tasks.join_next().await {
        let (index, rid, result) = match joined {
            Ok(done) => done,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => continue,
        };
        match &result {
            Err(failure)
                if matches!(failure.kind, FailureKind::Auth | FailureKind::ExhaustedRetries) =>
            {
                tasks.shutdown().await;
                return Err(failure.clone());
            }
            _ => {}
        }
        results.push((index, (rid, result)));
    }

    results.sort_by_key(|(index, _)| *index);
    Ok(results.into_iter().map(|(_, lookup)| lookup).collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SliceStatus {
    Ok,
    Failed,
}

/// What happened to one key on its latest attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceLog {
    pub key: String,
    pub status: SliceStatus,
    pub attempt: u32,
    #[serde(flatten)]
    pub stats: SliceStats,
    pub rows_written: usize,
    pub error: Option<String>,
    /// `auth`, `rate_limited`, `timeout`, `server_error`, `connection`,
    /// `client_error`, `data_integrity`, `write` or `panic`.
    pub error_class: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl SliceLog {
    pub fn ok(key: &FetchKey, attempt: u32, stats: SliceStats, rows_written: usize) -> Self {
        Self {
            key: key.id(),
            status: SliceStatus::Ok,
            attempt,
            stats,
            rows_written,
            error: None,
            error_class: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(
        key: &FetchKey,
        attempt: u32,
        stats: SliceStats,
        error_class: &str,
        error: String,
    ) -> Self {
        Self {
            key: key.id(),
            status: SliceStatus::Failed,
            attempt,
            stats,
            rows_written: 0,
            error: Some(error),
            error_class: Some(error_class.to_string()),
            timestamp: Utc::now(),
        }
    }
}

/// Writes `{dir}/{key}.json`, replacing the log of any earlier attempt.
pub fn write_slice_log(dir: &Path, log: &SliceLog) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("creating '{}'", dir.display()))?;
    let path = dir.join(format!("{}.json", log.key));
    let tmp = path.with_extension("json.tmp");

    let body = serde_json::to_vec_pretty(log)?;
    fs::write(&tmp, body).with_context(|| format!("writing '{}'", tmp.display()))?;
    fs::rename(&tmp, &path).with_context(|| format!("renaming to '{}'", path.display()))?;
    Ok(path)
}

/// Every slice log in `dir`, sorted by key. A missing directory holds none;
/// unreadable files are skipped with a warning.
pub fn load_slice_logs(dir: &Path) -> Result<Vec<SliceLog>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut logs = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("listing '{}'", dir.display()))? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let parsed = fs::read(&path)
            .map_err(anyhow::Error::from)
            .and_then(|body| Ok(serde_json::from_slice::<SliceLog>(&body)?));
        match parsed {
            Ok(log) => logs.push(log),
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable slice log"),
        }
    }
    logs.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(logs)
}

/// Slice outcomes counted by status and failure class.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorBreakdown {
    pub slices: usize,
    pub ok: usize,
    pub failed: usize,
    pub by_class: BTreeMap<String, usize>,
}

impl ErrorBreakdown {
    pub fn from_logs(logs: &[SliceLog]) -> Self {
        let mut breakdown = Self {
            slices: logs.len(),
            ..Default::default()
        };
        for log in logs {
            match log.status {
                SliceStatus::Ok => breakdown.ok += 1,
                SliceStatus::Failed => {
                    breakdown.failed += 1;
                    let class = log.error_class.as_deref().unwrap_or("unknown");
                    *breakdown.by_class.entry(class.to_string()).or_insert(0) += 1;
                }
            }
        }
        breakdown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Route;
    use chrono::NaiveDate;

    fn key(window: (&str, &str)) -> FetchKey {
        FetchKey::new(
            Route::new("PAD", "BRI"),
            NaiveDate::from_ymd_opt(2025, 8, 27).unwrap(),
            TimeWindow::parse(window.0, window.1).unwrap(),
        )
    }

    fn rids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("2025082771{i:05}")).collect()
    }

    #[test]
    fn test_sample_under_cap_keeps_everything() {
        let k = key(("0600", "0859"));
        assert_eq!(sample_rids(rids(5), Some(10), &k), rids(5));
        assert_eq!(sample_rids(rids(5), None, &k), rids(5));
        assert_eq!(sample_rids(rids(5), Some(5), &k), rids(5));
    }

    #[test]
    fn test_sample_is_deterministic_per_key() {
        let k = key(("0600", "0859"));
        let first = sample_rids(rids(50), Some(10), &k);

        let mut shuffled = rids(50);
        shuffled.reverse();
        let second = sample_rids(shuffled, Some(10), &k);

        assert_eq!(first.len(), 10);
        assert_eq!(first, second);
        assert!(first.windows(2).all(|w| w[0] < w[1]));
        assert!(first.iter().all(|rid| rids(50).contains(rid)));
    }

    #[test]
    fn test_sample_differs_between_keys() {
        let a = sample_rids(rids(200), Some(10), &key(("0600", "0859")));
        let b = sample_rids(rids(200), Some(10), &key(("0900", "1159")));
        assert_ne!(a, b);
    }

    #[test]
    fn test_slice_log_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let stats = SliceStats {
            rids_listed: 12,
            rids_fetched: 10,
            rejected: 1,
            metrics_ms: 340,
            details_ms: 2_100,
        };
        let log = SliceLog::ok(&key(("0600", "0859")), 2, stats, 9);

        let path = write_slice_log(dir.path(), &log).unwrap();
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "2025-08-27_PAD_BRI_0600_0859.json"
        );

        let value: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(value["status"], "ok");
        assert_eq!(value["rids_fetched"], 10);
        assert_eq!(value["details_ms"], 2_100);
        assert!(value["error_class"].is_null());

        assert_eq!(load_slice_logs(dir.path()).unwrap(), vec![log]);
    }

    #[test]
    fn test_load_skips_unreadable_logs() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("broken.json"), b"{").unwrap();
        fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();
        let log = SliceLog::failed(
            &key(("0600", "0859")),
            1,
            SliceStats::default(),
            "timeout",
            "timed out".into(),
        );
        write_slice_log(dir.path(), &log).unwrap();

        assert_eq!(load_slice_logs(dir.path()).unwrap(), vec![log]);
        assert!(load_slice_logs(&dir.path().join("missing")).unwrap().is_empty());
    }

    #[test]
    fn test_error_breakdown_counts_by_class() {
        let stats = SliceStats::default;
        let logs = vec![
            SliceLog::ok(&key(("0000", "0259")), 1, stats(), 4),
            SliceLog::failed(&key(("0300", "0559")), 1, stats(), "timeout", "t".into()),
            SliceLog::failed(&key(("0600", "0859")), 3, stats(), "server_error", "503".into()),
            SliceLog::failed(&key(("0900", "1159")), 1, stats(), "timeout", "t".into()),
        ];

        let breakdown = ErrorBreakdown::from_logs(&logs);

        assert_eq!(breakdown.slices, 4);
        assert_eq!(breakdown.ok, 1);
        assert_eq!(breakdown.failed, 3);
        assert_eq!(breakdown.by_class["timeout"], 2);
        assert_eq!(breakdown.by_class["server_error"], 1);
    }
}
