//! Quality gates over collected data: observation coverage per cell, and
//! percentile ordering in a built table.

use serde::Serialize;
use std::collections::HashMap;

use crate::model::{DelayRecord, PercentileGroup, Route};

/// Share of sparse cells above which the data set fails the check.
const MAX_SPARSE_SHARE: f64 = 0.5;

/// Observation coverage over (route, hour, day of week) cells.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoverageReport {
    pub total_rows: usize,
    pub cells: usize,
    pub sparse_cells: usize,
    pub min_obs_per_cell: usize,
    pub passed: bool,
}

impl CoverageReport {
    /// Fails when there are no rows, or when more than half of the cells
    /// have fewer than `min_obs_per_cell` observations.
    pub fn from_records(records: &[DelayRecord], min_obs_per_cell: usize) -> Self {
        let mut cells: HashMap<(Route, u8, u8), usize> = HashMap::new();
        for record in records {
            *cells
                .entry((record.route(), record.hour, record.day_of_week()))
                .or_insert(0) += 1;
        }

        let sparse_cells = cells.values().filter(|&&n| n < min_obs_per_cell).count();
        let passed =
            !cells.is_empty() && (sparse_cells as f64) <= cells.len() as f64 * MAX_SPARSE_SHARE;

        Self {
            total_rows: records.len(),
            cells: cells.len(),
            sparse_cells,
            min_obs_per_cell,
            passed,
        }
    }
}

/// Groups whose quantiles are out of order, i.e. not `p80 <= p90 <= p95`.
/// Linear interpolation over sorted samples cannot produce one, so any hit
/// means the table was damaged or built from bad input.
pub fn monotonicity_violations(groups: &[PercentileGroup]) -> Vec<&PercentileGroup> {
    groups
        .iter()
        .filter(|g| !(g.p80 <= g.p90 && g.p90 <= g.p95))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn records(hhmm: &str, count: usize) -> Vec<DelayRecord> {
        let date = NaiveDate::from_ymd_opt(2025, 8, 27).unwrap();
        (0..count)
            .map(|i| {
                DelayRecord::from_times(&Route::new("PAD", "BRI"), &format!("R{i}"), date, hhmm, hhmm)
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_empty_fails() {
        let report = CoverageReport::from_records(&[], 8);
        assert!(!report.passed);
        assert_eq!(report.cells, 0);
    }

    #[test]
    fn test_half_sparse_passes() {
        let mut rows = records("0700", 8);
        rows.extend(records("0800", 2));

        let report = CoverageReport::from_records(&rows, 8);
        assert_eq!(report.cells, 2);
        assert_eq!(report.sparse_cells, 1);
        assert!(report.passed);
    }

    #[test]
    fn test_mostly_sparse_fails() {
        let mut rows = records("0700", 8);
        rows.extend(records("0800", 2));
        rows.extend(records("0900", 1));

        let report = CoverageReport::from_records(&rows, 8);
        assert_eq!(report.sparse_cells, 2);
        assert!(!report.passed);
    }

    fn group(hour: u8, p80: f64, p90: f64, p95: f64) -> PercentileGroup {
        PercentileGroup {
            origin: "PAD".into(),
            destination: "BRI".into(),
            hour,
            day_of_week: 2,
            p80,
            p90,
            p95,
            observation_count: 10,
        }
    }

    #[test]
    fn test_monotonicity_violations() {
        let groups = vec![
            group(6, 1.0, 2.0, 3.0),
            group(7, 2.0, 2.0, 2.0),
            group(8, 4.0, 3.0, 5.0),
            group(9, -1.0, 0.5, 0.25),
            group(10, f64::NAN, 1.0, 2.0),
        ];

        let hours: Vec<_> = monotonicity_violations(&groups)
            .iter()
            .map(|g| g.hour)
            .collect();
        assert_eq!(hours, vec![8, 9, 10]);
    }

    #[test]
    fn test_engine_output_is_monotone() {
        let date = NaiveDate::from_ymd_opt(2025, 8, 27).unwrap();
        let route = Route::new("PAD", "BRI");
        let rows: Vec<_> = [-3, 0, 0, 1, 2, 2, 5, 9, 14, 40, 3, -1]
            .iter()
            .enumerate()
            .map(|(i, delay)| {
                let actual = crate::model::format_hhmm((480 + delay) as u16);
                DelayRecord::from_times(&route, &format!("R{i}"), date, "0800", &actual).unwrap()
            })
            .collect();

        let groups = crate::analyzers::PercentileEngine::new(3).build(&rows);

        assert_eq!(groups.len(), 1);
        assert!(monotonicity_violations(&groups).is_empty());
    }
}
