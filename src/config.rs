//! Collector configuration.
//!
//! Loaded from a JSON file:
//! ```json
//! {
//!   "date_start": "2025-08-01",
//!   "date_end": "2025-08-31",
//!   "routes": [["PAD", "BRI"], ["VIC", "GTW"]],
//!   "time_windows": [["0600", "0859"], ["0900", "1159"]],
//!   "row_cap": 1000,
//!   "workers": 4
//! }
//! ```
//! The date range is required; every other field has a default. The API key is
//! read from the environment, never from this file.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::fetch::RetryPolicy;
use crate::model::{FetchKey, Route, TimeWindow};

pub const DEFAULT_BASE_URL: &str =
    "https://api1.raildata.org.uk/1010-historical-service-performance-_hsp_v1/api/v1";

/// Environment variable holding the upstream API key.
pub const API_KEY_ENV: &str = "RDM_API_KEY";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("at least one route is required")]
    NoRoutes,
    #[error("at least one time window is required")]
    NoWindows,
    #[error("date_end {end} is before date_start {start}")]
    DateOrder { start: NaiveDate, end: NaiveDate },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("requests_per_second must be a positive number, got {0}")]
    Rate(f64),
}

#[derive(Debug, Clone, Deserialize)]
pub struct CollectorConfig {
    pub date_start: NaiveDate,
    pub date_end: NaiveDate,
    #[serde(default = "default_routes")]
    pub routes: Vec<Route>,
    #[serde(default = "default_windows")]
    pub time_windows: Vec<TimeWindow>,

    /// Listing size at or above which a response is treated as truncated.
    #[serde(default = "default_row_cap")]
    pub row_cap: usize,
    /// Windows this narrow are never split further.
    #[serde(default = "default_min_window_minutes")]
    pub min_window_minutes: u16,
    /// Services looked up per key. Larger listings are sampled down,
    /// reproducibly for a given key. Unset looks up every service.
    #[serde(default)]
    pub rid_cap_per_slice: Option<usize>,

    /// Keys processed in parallel.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Upstream requests in flight at once, across all workers.
    #[serde(default = "default_workers")]
    pub max_in_flight: usize,
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,
    #[serde(default = "default_burst")]
    pub burst: u32,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_output_root")]
    pub output_root: PathBuf,
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,

    /// Minimum samples for a percentile group to be emitted.
    #[serde(default = "default_min_observations")]
    pub min_observations: usize,
    /// Coverage check threshold per (route, hour, day) cell.
    #[serde(default = "default_qa_min_obs_per_cell")]
    pub qa_min_obs_per_cell: usize,
}

fn default_row_cap() -> usize {
    1_000
}

fn default_min_window_minutes() -> u16 {
    15
}

fn default_workers() -> usize {
    4
}

fn default_requests_per_second() -> f64 {
    2.0
}

fn default_burst() -> u32 {
    1
}

fn default_request_timeout_secs() -> u64 {
    90
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_user_agent() -> String {
    format!("rail-buffer/{}", env!("CARGO_PKG_VERSION"))
}

fn default_output_root() -> PathBuf {
    PathBuf::from("data")
}

fn default_state_path() -> PathBuf {
    PathBuf::from("state/state.json")
}

fn default_min_observations() -> usize {
    3
}

fn default_qa_min_obs_per_cell() -> usize {
    8
}

/// Primary routes: airport links and the Great Western main line.
fn default_routes() -> Vec<Route> {
    [
        ("VIC", "GTW"),
        ("PAD", "HXX"),
        ("PAD", "HWX"),
        ("PAD", "HWY"),
        ("EXD", "PAD"),
        ("PLY", "PAD"),
        ("PAD", "BRI"),
    ]
    .iter()
    .map(|(o, d)| Route::new(o, d))
    .collect()
}

/// Eight 3-hour buckets covering the whole day.
fn default_windows() -> Vec<TimeWindow> {
    (0..8u16)
        .filter_map(|i| TimeWindow::new(i * 180, i * 180 + 179).ok())
        .collect()
}

impl CollectorConfig {
    /// Defaults for everything but the date range.
    pub fn new(date_start: NaiveDate, date_end: NaiveDate) -> Self {
        Self {
            date_start,
            date_end,
            routes: default_routes(),
            time_windows: default_windows(),
            row_cap: default_row_cap(),
            min_window_minutes: default_min_window_minutes(),
            rid_cap_per_slice: None,
            workers: default_workers(),
            max_in_flight: default_workers(),
            requests_per_second: default_requests_per_second(),
            burst: default_burst(),
            retry: RetryPolicy::default(),
            request_timeout_secs: default_request_timeout_secs(),
            base_url: default_base_url(),
            user_agent: default_user_agent(),
            output_root: default_output_root(),
            state_path: default_state_path(),
            min_observations: default_min_observations(),
            qa_min_obs_per_cell: default_qa_min_obs_per_cell(),
        }
    }

    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file '{path}'"))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("parsing config file '{path}'"))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.routes.is_empty() {
            return Err(ConfigError::NoRoutes);
        }
        if self.time_windows.is_empty() {
            return Err(ConfigError::NoWindows);
        }
        if self.date_end < self.date_start {
            return Err(ConfigError::DateOrder {
                start: self.date_start,
                end: self.date_end,
            });
        }
        for (name, value) in [
            ("row_cap", self.row_cap),
            ("workers", self.workers),
            ("max_in_flight", self.max_in_flight),
            ("min_window_minutes", usize::from(self.min_window_minutes)),
            ("retry.max_attempts", self.retry.max_attempts as usize),
            ("min_observations", self.min_observations),
            ("rid_cap_per_slice", self.rid_cap_per_slice.unwrap_or(1)),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        if !self.requests_per_second.is_finite() || self.requests_per_second <= 0.0 {
            return Err(ConfigError::Rate(self.requests_per_second));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn dates(&self) -> Vec<NaiveDate> {
        self.date_start
            .iter_days()
            .take_while(|d| *d <= self.date_end)
            .collect()
    }

    /// Cartesian product of dates, routes and windows, in that nesting order.
    /// A route or window configured twice (routes compare case-insensitively)
    /// is planned once, at its first position.
    pub fn fetch_keys(&self) -> Vec<FetchKey> {
        let mut seen = HashSet::new();
        let mut keys =
            Vec::with_capacity(self.dates().len() * self.routes.len() * self.time_windows.len());
        for date in self.dates() {
            for route in &self.routes {
                for window in &self.time_windows {
                    let key = FetchKey::new(route.clone(), date, *window);
                    if seen.insert(key.id()) {
                        keys.push(key);
                    }
                }
            }
        }
        keys
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.output_root.join("raw_delays")
    }

    pub fn daily_dir(&self) -> PathBuf {
        self.output_root.join("daily")
    }

    /// One JSON log per key, overwritten on every attempt.
    pub fn slice_log_dir(&self) -> PathBuf {
        self.output_root.join("logs").join("slices")
    }

    pub fn percentile_table_path(&self) -> PathBuf {
        self.output_root.join(crate::publish::PERCENTILE_TABLE_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> CollectorConfig {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config = parse(r#"{"date_start": "2025-08-01", "date_end": "2025-08-03"}"#);

        assert_eq!(config.routes.len(), 7);
        assert_eq!(config.time_windows.len(), 8);
        assert_eq!(config.time_windows[0].to_string(), "0000-0259");
        assert_eq!(config.time_windows[7].to_string(), "2100-2359");
        assert_eq!(config.row_cap, 1_000);
        assert_eq!(config.retry.max_attempts, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_dates_are_required() {
        for json in [
            r#"{}"#,
            r#"{"date_start": "2025-08-01"}"#,
            r#"{"date_end": "2025-08-01", "routes": [["PAD", "BRI"]]}"#,
        ] {
            let result: Result<CollectorConfig, _> = serde_json::from_str(json);
            let err = result.unwrap_err().to_string();
            assert!(err.contains("missing field"), "{json}: {err}");
        }
    }

    #[test]
    fn test_load_rejects_file_without_dates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"routes": [["PAD", "BRI"]], "row_cap": 500}"#).unwrap();

        let err = CollectorConfig::load(path.to_str().unwrap()).unwrap_err();
        assert!(format!("{err:#}").contains("date_start"));
    }

    #[test]
    fn test_new_matches_file_defaults() {
        let date = NaiveDate::from_ymd_opt(2025, 8, 1).unwrap();
        let built = CollectorConfig::new(date, date);
        let parsed = parse(r#"{"date_start": "2025-08-01", "date_end": "2025-08-01"}"#);

        assert_eq!(built.routes, parsed.routes);
        assert_eq!(built.time_windows, parsed.time_windows);
        assert_eq!(built.row_cap, parsed.row_cap);
        assert_eq!(built.max_in_flight, parsed.max_in_flight);
        assert_eq!(built.rid_cap_per_slice, None);
        assert_eq!(built.state_path, parsed.state_path);
    }

    #[test]
    fn test_duplicate_routes_and_windows_are_planned_once() {
        let config = parse(
            r#"{
                "date_start": "2025-08-01",
                "date_end": "2025-08-02",
                "routes": [["PAD", "BRI"], ["pad", "bri"], ["VIC", "GTW"]],
                "time_windows": [["0600", "0859"], ["0600", "0859"]]
            }"#,
        );

        let ids: Vec<_> = config.fetch_keys().iter().map(FetchKey::id).collect();
        assert_eq!(
            ids,
            vec![
                "2025-08-01_PAD_BRI_0600_0859",
                "2025-08-01_VIC_GTW_0600_0859",
                "2025-08-02_PAD_BRI_0600_0859",
                "2025-08-02_VIC_GTW_0600_0859",
            ]
        );
    }

    #[test]
    fn test_fetch_keys_is_cartesian_product() {
        let config = parse(
            r#"{
                "date_start": "2025-08-01",
                "date_end": "2025-08-03",
                "routes": [["PAD", "BRI"], ["VIC", "GTW"]],
                "time_windows": [["0600", "0859"], ["0900", "1159"]]
            }"#,
        );

        let keys = config.fetch_keys();
        assert_eq!(keys.len(), 3 * 2 * 2);
        assert_eq!(keys[0].id(), "2025-08-01_PAD_BRI_0600_0859");
        assert_eq!(keys[11].id(), "2025-08-03_VIC_GTW_0900_1159");
    }

    #[test]
    fn test_partial_retry_policy_keeps_defaults() {
        let config = parse(
            r#"{"date_start": "2025-08-01", "date_end": "2025-08-01", "retry": {"max_attempts": 2}}"#,
        );
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.base_delay_ms, 1_000);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = parse(r#"{"date_start": "2025-08-05", "date_end": "2025-08-01"}"#);
        assert!(matches!(config.validate(), Err(ConfigError::DateOrder { .. })));

        config.date_end = config.date_start;
        config.row_cap = 0;
        assert_eq!(config.validate(), Err(ConfigError::Zero("row_cap")));

        config.row_cap = 10;
        config.requests_per_second = 0.0;
        assert_eq!(config.validate(), Err(ConfigError::Rate(0.0)));

        config.requests_per_second = 1.0;
        config.rid_cap_per_slice = Some(0);
        assert_eq!(config.validate(), Err(ConfigError::Zero("rid_cap_per_slice")));

        config.rid_cap_per_slice = Some(200);
        config.routes.clear();
        assert_eq!(config.validate(), Err(ConfigError::NoRoutes));
    }

    #[test]
    fn test_bad_window_fails_to_parse() {
        let result: Result<CollectorConfig, _> = serde_json::from_str(
            r#"{"date_start": "2025-08-01", "date_end": "2025-08-01", "time_windows": [["0900", "0600"]]}"#,
        );
        assert!(result.is_err());
    }
}
