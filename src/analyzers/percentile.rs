//! Delay percentiles per (route, hour, day of week).

use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::analyzers::utility::{mean, quantile_sorted};
use crate::model::{DelayRecord, PercentileGroup, Route};

/// Groups delay samples by (route, hour, day of week) and computes
/// p80/p90/p95 per group.
///
/// Negative delays (early arrivals) are kept in the input, so quantiles can
/// be negative.
#[derive(Debug, Clone)]
pub struct PercentileEngine {
    min_observations: usize,
}

impl Default for PercentileEngine {
    fn default() -> Self {
        Self { min_observations: 3 }
    }
}

impl PercentileEngine {
    pub fn new(min_observations: usize) -> Self {
        Self {
            min_observations: min_observations.max(1),
        }
    }

    pub fn min_observations(&self) -> usize {
        self.min_observations
    }

    /// Recomputes every group from scratch. Groups with fewer than
    /// `min_observations` samples are left out. Output is sorted by
    /// (route, day_of_week, hour).
    #[tracing::instrument(skip(self, records), fields(records = records.len()))]
    pub fn build(&self, records: &[DelayRecord]) -> Vec<PercentileGroup> {
        let mut cells: BTreeMap<(Route, u8, u8), Vec<f64>> = BTreeMap::new();
        for record in records {
            cells
                .entry((record.route(), record.day_of_week(), record.hour))
                .or_default()
                .push(f64::from(record.delay_minutes));
        }

        let total_cells = cells.len();
        let mut groups = Vec::with_capacity(total_cells);

        for ((route, day_of_week, hour), mut delays) in cells {
            if delays.len() < self.min_observations {
                debug!(
                    route = %route,
                    day_of_week,
                    hour,
                    observations = delays.len(),
                    "Skipping sparse group"
                );
                continue;
            }

            delays.sort_by(f64::total_cmp);
            let (Some(p80), Some(p90), Some(p95)) = (
                quantile_sorted(&delays, 0.80),
                quantile_sorted(&delays, 0.90),
                quantile_sorted(&delays, 0.95),
            ) else {
                continue;
            };
            debug_assert!(p80 <= p90 && p90 <= p95);

            groups.push(PercentileGroup {
                origin: route.origin,
                destination: route.destination,
                hour,
                day_of_week,
                p80,
                p90,
                p95,
                observation_count: delays.len(),
            });
        }

        let counts: Vec<f64> = groups.iter().map(|g| g.observation_count as f64).collect();
        info!(
            groups = groups.len(),
            skipped = total_cells - groups.len(),
            avg_observations = mean(&counts),
            "Percentile groups built"
        );

        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    // 2025-08-25 is a Monday.
    fn record(route: (&str, &str), day: u32, scheduled: &str, delay: i32) -> DelayRecord {
        let date = NaiveDate::from_ymd_opt(2025, 8, day).unwrap();
        let mut r = DelayRecord::from_times(
            &Route::new(route.0, route.1),
            "R",
            date,
            scheduled,
            scheduled,
        )
        .unwrap();
        r.delay_minutes = delay;
        r
    }

    #[test]
    fn test_groups_by_route_hour_and_day() {
        let mut records = Vec::new();
        for delay in 1..=10 {
            records.push(record(("PAD", "BRI"), 25, "0712", delay));
        }
        for delay in [0, 2, 4] {
            records.push(record(("PAD", "BRI"), 26, "0712", delay));
        }

        let groups = PercentileEngine::new(3).build(&records);

        assert_eq!(groups.len(), 2);
        let monday = &groups[0];
        assert_eq!(monday.day_of_week, 0);
        assert_eq!(monday.hour, 7);
        assert_eq!(monday.observation_count, 10);
        assert!((monday.p80 - 8.2).abs() < 1e-9);
        assert!((monday.p90 - 9.1).abs() < 1e-9);
        assert!((monday.p95 - 9.55).abs() < 1e-9);

        assert_eq!(groups[1].day_of_week, 1);
        assert_eq!(groups[1].observation_count, 3);
    }

    #[test]
    fn test_sparse_groups_are_omitted() {
        let records = vec![
            record(("PAD", "BRI"), 25, "0712", 3),
            record(("PAD", "BRI"), 25, "0722", 5),
        ];

        assert!(PercentileEngine::new(3).build(&records).is_empty());
        assert_eq!(PercentileEngine::new(2).build(&records).len(), 1);
    }

    #[test]
    fn test_negative_delays_are_not_clamped() {
        let records: Vec<_> = [-5, -4, -3, -2, -1]
            .iter()
            .map(|d| record(("VIC", "GTW"), 25, "0900", *d))
            .collect();

        let groups = PercentileEngine::new(3).build(&records);

        assert!(groups[0].p95 < 0.0);
    }

    #[test]
    fn test_output_order_and_invariants() {
        let mut records = Vec::new();
        for (route, day, hhmm) in [
            (("VIC", "GTW"), 26, "1800"),
            (("PAD", "BRI"), 26, "0700"),
            (("PAD", "BRI"), 25, "1800"),
            (("PAD", "BRI"), 25, "0700"),
        ] {
            for delay in [0, 1, 1, 3, 8, 20] {
                records.push(record(route, day, hhmm, delay));
            }
        }

        let groups = PercentileEngine::new(3).build(&records);
        let order: Vec<_> = groups
            .iter()
            .map(|g| (g.origin.as_str(), g.day_of_week, g.hour))
            .collect();

        assert_eq!(
            order,
            vec![("PAD", 0, 7), ("PAD", 0, 18), ("PAD", 1, 7), ("VIC", 1, 18)]
        );
        for g in &groups {
            assert!(g.p80 <= g.p90 && g.p90 <= g.p95);
            assert!(g.observation_count >= 3);
        }
    }

    #[test]
    fn test_rebuild_is_deterministic() {
        let records: Vec<_> = (0..20)
            .map(|i| record(("PAD", "BRI"), 25 + (i % 3), "0815", i as i32 * 2 - 5))
            .collect();

        let engine = PercentileEngine::new(3);
        assert_eq!(engine.build(&records), engine.build(&records));
    }
}
