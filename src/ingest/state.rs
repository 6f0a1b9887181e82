//! Persisted per-key collection progress.
//!
//! Every transition is written to a temp file, fsynced and renamed over the
//! previous state, so a crash leaves the last complete write intact.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::model::{FetchKey, TimeWindow};

const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl KeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStatus::Pending => "pending",
            KeyStatus::InProgress => "in_progress",
            KeyStatus::Done => "done",
            KeyStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyRecord {
    pub status: KeyStatus,
    /// Times this key has been dispatched, across runs.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub failure_kind: Option<String>,
    #[serde(default)]
    pub rows: usize,
    /// Sub-windows kept while still capped at minimum granularity.
    #[serde(default)]
    pub floor_windows: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl KeyRecord {
    fn pending() -> Self {
        Self {
            status: KeyStatus::Pending,
            attempts: 0,
            last_error: None,
            failure_kind: None,
            rows: 0,
            floor_windows: Vec::new(),
            updated_at: Utc::now(),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct StateFile {
    version: u32,
    updated_at: DateTime<Utc>,
    entries: BTreeMap<String, KeyRecord>,
}

/// Owned by the orchestrator. Each `mark_*` call commits before returning.
pub struct CollectionState {
    path: PathBuf,
    entries: BTreeMap<String, KeyRecord>,
}

impl CollectionState {
    /// Loads state from `path`, starting empty if the file does not exist.
    /// A temp file left by an interrupted write is ignored.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No collection state yet, starting empty");
            return Ok(Self {
                path: path.to_path_buf(),
                entries: BTreeMap::new(),
            });
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("reading collection state '{}'", path.display()))?;
        let file: StateFile = serde_json::from_str(&content)
            .with_context(|| format!("parsing collection state '{}'", path.display()))?;
        if file.version != STATE_VERSION {
            anyhow::bail!(
                "collection state '{}' has version {}, expected {STATE_VERSION}",
                path.display(),
                file.version
            );
        }

        let interrupted = file
            .entries
            .values()
            .filter(|r| r.status == KeyStatus::InProgress)
            .count();
        if interrupted > 0 {
            warn!(interrupted, "Keys left in progress by a previous run will be retried");
        }

        Ok(Self {
            path: path.to_path_buf(),
            entries: file.entries,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &FetchKey) -> Option<&KeyRecord> {
        self.entries.get(&key.id())
    }

    pub fn status(&self, key: &FetchKey) -> KeyStatus {
        self.get(key).map_or(KeyStatus::Pending, |r| r.status)
    }

    pub fn is_done(&self, key: &FetchKey) -> bool {
        self.status(key) == KeyStatus::Done
    }

    /// Adds any missing keys as pending and commits once.
    pub fn seed_pending<'a>(&mut self, keys: impl IntoIterator<Item = &'a FetchKey>) -> Result<usize> {
        let mut added = 0;
        for key in keys {
            self.entries.entry(key.id()).or_insert_with(|| {
                added += 1;
                KeyRecord::pending()
            });
        }
        self.commit()?;
        Ok(added)
    }

    pub fn mark_in_progress(&mut self, key: &FetchKey) -> Result<()> {
        let record = self.entry(key);
        record.status = KeyStatus::InProgress;
        record.attempts += 1;
        record.updated_at = Utc::now();
        self.commit()
    }

    pub fn mark_done(&mut self, key: &FetchKey, rows: usize, floor_windows: &[TimeWindow]) -> Result<()> {
        let record = self.entry(key);
        record.status = KeyStatus::Done;
        record.last_error = None;
        record.failure_kind = None;
        record.rows = rows;
        record.floor_windows = floor_windows.iter().map(ToString::to_string).collect();
        record.updated_at = Utc::now();
        self.commit()
    }

    pub fn mark_failed(&mut self, key: &FetchKey, kind: &str, error: &str) -> Result<()> {
        let record = self.entry(key);
        record.status = KeyStatus::Failed;
        record.failure_kind = Some(kind.to_string());
        record.last_error = Some(error.to_string());
        record.updated_at = Utc::now();
        self.commit()
    }

    pub fn counts(&self) -> BTreeMap<KeyStatus, usize> {
        let mut counts = BTreeMap::new();
        for record in self.entries.values() {
            *counts.entry(record.status).or_insert(0) += 1;
        }
        counts
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &KeyRecord)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn failed(&self) -> impl Iterator<Item = (&str, &KeyRecord)> {
        self.iter().filter(|(_, r)| r.status == KeyStatus::Failed)
    }

    fn entry(&mut self, key: &FetchKey) -> &mut KeyRecord {
        self.entries.entry(key.id()).or_insert_with(KeyRecord::pending)
    }

    /// Writes the full state durably.
    pub fn commit(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating state directory '{}'", parent.display()))?;
        }

        let file = StateFile {
            version: STATE_VERSION,
            updated_at: Utc::now(),
            entries: self.entries.clone(),
        };

        let tmp = tmp_path(&self.path);
        {
            let handle = File::create(&tmp)
                .with_context(|| format!("creating temp state file '{}'", tmp.display()))?;
            let mut writer = BufWriter::new(handle);
            serde_json::to_writer_pretty(&mut writer, &file)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("replacing collection state '{}'", self.path.display()))?;
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
