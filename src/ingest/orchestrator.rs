//! Drives collection of every configured key with a bounded worker pool.
//!
//! The orchestrator task is the only writer of [`CollectionState`]: workers
//! return their outcome through the `JoinSet` and the state is updated and
//! committed here, one key at a time.

use anyhow::Context;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use tokio::task::{Id, JoinSet};
use tracing::{Instrument, debug, error, info, warn};

use super::archive::{build_daily_archives, raw_file_path, read_records, write_records};
use super::slice::{SliceLog, SliceStats, collect_slice, write_slice_log};
use super::state::CollectionState;
use super::summary::RunSummary;
use crate::analyzers::coverage::CoverageReport;
use crate::config::CollectorConfig;
use crate::fetch::{FailureKind, FetchFailure, RetryingFetcher, ServiceClient};
use crate::model::{FetchKey, TimeWindow};

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Credentials were rejected; the run stopped.
    #[error("run halted at {key}: {failure}")]
    Auth { key: String, failure: FetchFailure },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result of one worker's unit of work.
struct KeyOutcome {
    rows: usize,
    floor_windows: Vec<TimeWindow>,
}

enum KeyError {
    Fetch(FetchFailure),
    Write(anyhow::Error),
}

/// Collects the key, then writes its rows to the raw sample file. The
/// stats come back whether or not that worked.
async fn collect_key<C: ServiceClient + 'static>(
    fetcher: Arc<RetryingFetcher<C>>,
    config: Arc<CollectorConfig>,
    key: FetchKey,
) -> (SliceStats, Result<KeyOutcome, KeyError>) {
    let mut stats = SliceStats::default();
    let result = collect_and_write(&fetcher, &config, &key, &mut stats).await;
    (stats, result)
}

async fn collect_and_write<C: ServiceClient + 'static>(
    fetcher: &Arc<RetryingFetcher<C>>,
    config: &CollectorConfig,
    key: &FetchKey,
    stats: &mut SliceStats,
) -> Result<KeyOutcome, KeyError> {
    let slice = collect_slice(fetcher, config, key, stats)
        .await
        .map_err(KeyError::Fetch)?;

    let path = raw_file_path(&config.raw_dir(), key);
    write_records(&path, &slice.records).map_err(KeyError::Write)?;

    debug!(
        rows = slice.records.len(),
        windows = slice.windows_fetched,
        depth = slice.max_depth,
        rids_listed = stats.rids_listed,
        rids_fetched = stats.rids_fetched,
        path = %path.display(),
        "Key collected"
    );

    Ok(KeyOutcome {
        rows: slice.records.len(),
        floor_windows: slice.floor_windows,
    })
}

/// Records every planned key as pending without fetching anything or
/// touching the network. Returns the number of keys that were new.
pub fn plan_collection(config: &CollectorConfig) -> anyhow::Result<usize> {
    let keys = config.fetch_keys();
    let mut state = CollectionState::load(&config.state_path)?;
    let added = state.seed_pending(&keys)?;
    info!(
        planned = keys.len(),
        added,
        state = %state.path().display(),
        "Collection plan recorded"
    );
    Ok(added)
}

pub struct IngestOrchestrator<C> {
    config: Arc<CollectorConfig>,
    fetcher: Arc<RetryingFetcher<C>>,
    state: CollectionState,
}

impl<C: ServiceClient + 'static> IngestOrchestrator<C> {
    /// Loads the collection state from `config.state_path`.
    pub fn new(config: CollectorConfig, fetcher: RetryingFetcher<C>) -> anyhow::Result<Self> {
        let state = CollectionState::load(&config.state_path)?;
        Ok(Self {
            config: Arc::new(config),
            fetcher: Arc::new(fetcher),
            state,
        })
    }

    pub fn state(&self) -> &CollectionState {
        &self.state
    }

    pub fn fetcher(&self) -> &RetryingFetcher<C> {
        &self.fetcher
    }

    /// Every configured key, date-major.
    pub fn plan(&self) -> Vec<FetchKey> {
        self.config.fetch_keys()
    }

    fn attempt(&self, key: &FetchKey) -> u32 {
        self.state.get(key).map_or(1, |record| record.attempts)
    }

    /// The slice log is diagnostic; failing to write it does not fail the key.
    fn log_slice(&self, log: SliceLog) {
        let dir = self.config.slice_log_dir();
        if let Err(e) = write_slice_log(&dir, &log) {
            warn!(key = %log.key, error = %e, "Failed to write slice log");
        }
    }

    /// Collects every key not already done. Per-key failures are recorded
    /// and the run continues; rejected credentials stop it. When `shutdown`
    /// resolves, in-flight keys are abandoned without being marked done.
    #[tracing::instrument(skip_all, fields(workers = self.config.workers))]
    pub async fn run(
        &mut self,
        shutdown: impl Future<Output = ()>,
    ) -> Result<RunSummary, IngestError> {
        let keys = self.plan();
        let mut summary = RunSummary {
            planned: keys.len(),
            ..Default::default()
        };
        self.state.seed_pending(&keys)?;

        let mut queue: VecDeque<FetchKey> = keys
            .into_iter()
            .filter(|key| !self.state.is_done(key))
            .collect();
        summary.skipped = summary.planned - queue.len();
        info!(
            planned = summary.planned,
            skipped = summary.skipped,
            remaining = queue.len(),
            "Starting collection run"
        );

        let mut tasks = JoinSet::new();
        let mut in_flight: HashMap<Id, FetchKey> = HashMap::new();
        let requests_before = self.fetcher.requests();
        tokio::pin!(shutdown);

        loop {
            while tasks.len() < self.config.workers {
                let Some(key) = queue.pop_front() else {
                    break;
                };
                self.state.mark_in_progress(&key)?;

                let span = tracing::info_span!("collect_key", key = %key);
                let handle = tasks.spawn(
                    collect_key(self.fetcher.clone(), self.config.clone(), key.clone())
                        .instrument(span),
                );
                in_flight.insert(handle.id(), key);
            }

            if tasks.is_empty() {
                break;
            }

            let joined = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    warn!(in_flight = in_flight.len(), pending = queue.len(), "Shutdown requested, abandoning in-flight keys");
                    summary.cancelled = true;
                    break;
                }
                joined = tasks.join_next_with_id() => joined,
            };
            let Some(joined) = joined else {
                break;
            };

            let (id, (stats, result)) = match joined {
                Ok(joined) => joined,
                Err(join_error) => {
                    let Some(key) = in_flight.remove(&join_error.id()) else {
                        continue;
                    };
                    error!(key = %key, error = %join_error, "Worker task failed");
                    let message = join_error.to_string();
                    self.state.mark_failed(&key, "panic", &message)?;
                    self.log_slice(SliceLog::failed(
                        &key,
                        self.attempt(&key),
                        SliceStats::default(),
                        "panic",
                        message.clone(),
                    ));
                    summary.record_failure("panic", key.id(), message);
                    continue;
                }
            };
            let Some(key) = in_flight.remove(&id) else {
                continue;
            };

            let attempt = self.attempt(&key);
            summary.rids_listed += stats.rids_listed;
            summary.rids_fetched += stats.rids_fetched;
            summary.rejected_rows += stats.rejected;

            match result {
                Ok(outcome) => {
                    self.state
                        .mark_done(&key, outcome.rows, &outcome.floor_windows)?;
                    self.log_slice(SliceLog::ok(&key, attempt, stats, outcome.rows));
                    summary.done += 1;
                    *summary
                        .rows_per_route
                        .entry(key.route.to_string())
                        .or_insert(0) += outcome.rows;
                    if !outcome.floor_windows.is_empty() {
                        summary.floor_keys.push(key.id());
                    }
                    info!(key = %key, rows = outcome.rows, "Key done");
                }
                Err(KeyError::Fetch(failure)) if failure.kind == FailureKind::Auth => {
                    let message = failure.last_error.to_string();
                    self.state.mark_failed(&key, failure.kind.as_str(), &message)?;
                    self.log_slice(SliceLog::failed(
                        &key,
                        attempt,
                        stats,
                        failure.last_error.class(),
                        message.clone(),
                    ));
                    summary.record_failure(failure.kind.as_str(), key.id(), message);

                    error!(key = %key, "Upstream rejected credentials, halting run");
                    tasks.shutdown().await;
                    summary.abandoned = in_flight.len();
                    summary.requests = self.fetcher.requests() - requests_before;
                    summary.log();
                    return Err(IngestError::Auth {
                        key: key.id(),
                        failure,
                    });
                }
                Err(KeyError::Fetch(failure)) => {
                    let message = failure.last_error.to_string();
                    self.state.mark_failed(&key, failure.kind.as_str(), &message)?;
                    self.log_slice(SliceLog::failed(
                        &key,
                        attempt,
                        stats,
                        failure.last_error.class(),
                        message.clone(),
                    ));
                    summary.record_failure(failure.kind.as_str(), key.id(), message);
                    warn!(key = %key, kind = %failure.kind, attempts = failure.attempts, "Key failed");
                }
                Err(KeyError::Write(e)) => {
                    let message = format!("{e:#}");
                    self.state.mark_failed(&key, "write", &message)?;
                    self.log_slice(SliceLog::failed(&key, attempt, stats, "write", message.clone()));
                    summary.record_failure("write", key.id(), message);
                    error!(key = %key, error = %e, "Failed to write raw sample file");
                }
            }
        }

        if summary.cancelled {
            tasks.shutdown().await;
            summary.abandoned = in_flight.len();
            summary.requests = self.fetcher.requests() - requests_before;
            return Ok(summary);
        }
        summary.requests = self.fetcher.requests() - requests_before;

        summary.archives = build_daily_archives(
            &self.config.raw_dir(),
            &self.config.daily_dir(),
            &self.config.dates(),
        )
        .context("building daily archives")?;

        let mut records = Vec::new();
        for archive in &summary.archives {
            records.extend(read_records(&archive.path)?);
        }
        summary.coverage = Some(CoverageReport::from_records(
            &records,
            self.config.qa_min_obs_per_cell,
        ));

        Ok(summary)
    }
}
