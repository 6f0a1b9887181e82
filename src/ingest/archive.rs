//! Gzip CSV sample files: one per collected key, then one per day.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use csv::WriterBuilder;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::model::{DelayRecord, FetchKey};

/// Result of concatenating one day's raw files.
#[derive(Debug, Clone, PartialEq)]
pub struct DailyArchive {
    pub date: NaiveDate,
    pub path: PathBuf,
    pub files: usize,
    pub rows: usize,
    pub duplicates: usize,
}

fn date_dir(raw_dir: &Path, date: NaiveDate) -> PathBuf {
    raw_dir.join(format!("date={}", date.format("%Y-%m-%d")))
}

/// Deterministic location of a key's raw sample file.
pub fn raw_file_path(raw_dir: &Path, key: &FetchKey) -> PathBuf {
    date_dir(raw_dir, key.date).join(format!("delays_{}.csv.gz", key.id()))
}

pub fn daily_archive_path(daily_dir: &Path, date: NaiveDate) -> PathBuf {
    daily_dir.join(format!("delays_{}.csv.gz", date.format("%Y-%m-%d")))
}

/// Writes records as gzip CSV with a header row. The file appears under its
/// final name only once fully written.
pub fn write_records(path: &Path, records: &[DelayRecord]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating directory '{}'", parent.display()))?;
    }

    let mut tmp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    tmp_name.push(".partial");
    let tmp = path.with_file_name(tmp_name);

    {
        let file = File::create(&tmp).with_context(|| format!("creating '{}'", tmp.display()))?;
        let encoder = GzEncoder::new(file, Compression::default());
        let mut writer = WriterBuilder::new().has_headers(true).from_writer(encoder);
        if records.is_empty() {
            writer.write_record(HEADERS)?;
        }
        for record in records {
            writer.serialize(record)?;
        }
        let encoder = writer
            .into_inner()
            .map_err(|e| anyhow::anyhow!("flushing '{}': {}", tmp.display(), e.error()))?;
        let file = encoder.finish()?;
        file.sync_all()?;
    }

    fs::rename(&tmp, path).with_context(|| format!("renaming into '{}'", path.display()))?;
    debug!(path = %path.display(), rows = records.len(), "Wrote sample file");
    Ok(())
}

const HEADERS: [&str; 8] = [
    "origin",
    "destination",
    "train_id",
    "date",
    "scheduled_arrival",
    "actual_arrival",
    "delay_minutes",
    "hour",
];

pub fn read_records(path: &Path) -> Result<Vec<DelayRecord>> {
    let file = File::open(path).with_context(|| format!("opening '{}'", path.display()))?;
    let mut rdr = csv::Reader::from_reader(GzDecoder::new(BufReader::new(file)));

    let mut rows = Vec::new();
    for result in rdr.deserialize() {
        let record: DelayRecord =
            result.with_context(|| format!("reading row from '{}'", path.display()))?;
        rows.push(record);
    }
    Ok(rows)
}

/// Gzip CSV files in `dir`, sorted by name. Partial writes are skipped.
fn archive_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("listing '{}'", dir.display()))? {
        let path = entry?.path();
        let is_archive = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("delays_") && n.ends_with(".csv.gz"));
        if path.is_file() && is_archive {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Concatenates each date's raw files into one archive per day, dropping
/// repeated (train_id, destination) pairs. Dates with no raw files are
/// skipped.
pub fn build_daily_archives(
    raw_dir: &Path,
    daily_dir: &Path,
    dates: &[NaiveDate],
) -> Result<Vec<DailyArchive>> {
    let mut archives = Vec::new();

    for &date in dates {
        let dir = date_dir(raw_dir, date);
        if !dir.is_dir() {
            continue;
        }

        let files = archive_files(&dir)?;
        let mut seen = HashSet::new();
        let mut rows = Vec::new();
        let mut duplicates = 0;

        for file in &files {
            for record in read_records(file)? {
                if seen.insert((record.train_id.clone(), record.destination.clone())) {
                    rows.push(record);
                } else {
                    duplicates += 1;
                }
            }
        }

        let path = daily_archive_path(daily_dir, date);
        write_records(&path, &rows)?;
        info!(
            date = %date,
            files = files.len(),
            rows = rows.len(),
            duplicates,
            "Wrote daily archive"
        );

        archives.push(DailyArchive {
            date,
            path,
            files: files.len(),
            rows: rows.len(),
            duplicates,
        });
    }

    Ok(archives)
}

/// Reads every daily archive in `daily_dir`.
pub fn load_daily_archives(daily_dir: &Path) -> Result<Vec<DelayRecord>> {
    let mut records = Vec::new();
    for file in archive_files(daily_dir)? {
        records.extend(read_records(&file)?);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Route, TimeWindow};

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 8, 27).unwrap()
    }

    fn record(train_id: &str, dest: &str, scheduled: &str, actual: &str) -> DelayRecord {
        DelayRecord::from_times(&Route::new("PAD", dest), train_id, date(), scheduled, actual)
            .unwrap()
    }

    fn key(start: &str, end: &str) -> FetchKey {
        FetchKey::new(
            Route::new("PAD", "BRI"),
            date(),
            TimeWindow::parse(start, end).unwrap(),
        )
    }

    #[test]
    fn test_raw_file_path_is_deterministic() {
        let path = raw_file_path(Path::new("data/raw_delays"), &key("0600", "0859"));
        assert_eq!(
            path,
            PathBuf::from("data/raw_delays/date=2025-08-27/delays_2025-08-27_PAD_BRI_0600_0859.csv.gz")
        );
    }

    #[test]
    fn test_write_then_read_keeps_negative_delays() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("delays_x.csv.gz");
        let rows = vec![
            record("R1", "BRI", "0712", "0718"),
            record("R2", "BRI", "0745", "0741"),
        ];

        write_records(&path, &rows).unwrap();
        let back = read_records(&path).unwrap();

        assert_eq!(back, rows);
        assert_eq!(back[1].delay_minutes, -4);
        assert!(!path.with_file_name("delays_x.csv.gz.partial").exists());
    }

    #[test]
    fn test_empty_file_still_has_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("delays_empty.csv.gz");

        write_records(&path, &[]).unwrap();

        assert!(read_records(&path).unwrap().is_empty());
    }

    #[test]
    fn test_daily_archive_dedups_on_train_and_destination() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("raw_delays");
        let daily = dir.path().join("daily");

        write_records(
            &raw_file_path(&raw, &key("0600", "0859")),
            &[record("R1", "BRI", "0712", "0718"), record("R2", "BRI", "0812", "0812")],
        )
        .unwrap();
        write_records(
            &raw_file_path(&raw, &key("0800", "0959")),
            &[record("R2", "BRI", "0812", "0812"), record("R3", "BRI", "0912", "0920")],
        )
        .unwrap();

        let other_day = date().succ_opt().unwrap();
        let archives = build_daily_archives(&raw, &daily, &[date(), other_day]).unwrap();

        assert_eq!(archives.len(), 1);
        assert_eq!(archives[0].files, 2);
        assert_eq!(archives[0].rows, 3);
        assert_eq!(archives[0].duplicates, 1);

        let loaded = load_daily_archives(&daily).unwrap();
        let ids: Vec<_> = loaded.iter().map(|r| r.train_id.as_str()).collect();
        assert_eq!(ids, vec!["R1", "R2", "R3"]);
    }
}
