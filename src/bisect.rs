//! Works around the upstream row cap by halving windows whose responses may
//! have been truncated.

use std::collections::HashSet;
use tracing::{debug, warn};

use crate::fetch::{FetchFailure, RetryingFetcher, ServiceClient};
use crate::model::{FetchKey, TimeWindow};

/// Every service listed for one key, across all sub-windows.
#[derive(Debug, Default)]
pub struct BisectOutcome {
    /// RIDs in window order. A service listed by two sub-windows appears once.
    pub rids: Vec<String>,
    /// Sub-windows fetched, one per successful request.
    pub windows_fetched: usize,
    /// Deepest split level reached. The root window is depth 0.
    pub max_depth: u32,
    /// Windows still at the cap at minimum granularity. Their data may be
    /// undercounted.
    pub floor_windows: Vec<TimeWindow>,
}

pub struct WindowBisector<'a, C> {
    fetcher: &'a RetryingFetcher<C>,
    row_cap: usize,
    min_window_minutes: u16,
}

/// Number of halvings before a window of `width` minutes is no wider than
/// `min_window_minutes`, i.e. `ceil(log2(width / min))` under the split rule
/// `[start, mid]`, `[mid + 1, end]`.
pub fn depth_limit(width: u16, min_window_minutes: u16) -> u32 {
    let min = min_window_minutes.max(1);
    let mut width = width;
    let mut depth = 0;
    while width > min {
        width /= 2;
        depth += 1;
    }
    depth
}

impl<'a, C: ServiceClient> WindowBisector<'a, C> {
    pub fn new(fetcher: &'a RetryingFetcher<C>, row_cap: usize, min_window_minutes: u16) -> Self {
        Self {
            fetcher,
            row_cap,
            min_window_minutes,
        }
    }

    /// Lists the key's window, splitting any sub-window whose listing
    /// reaches the cap. RIDs come back in window order. Any sub-window
    /// failing fails the whole key.
    #[tracing::instrument(skip(self), fields(key = %key))]
    pub async fn collect(&self, key: &FetchKey) -> Result<BisectOutcome, FetchFailure> {
        let limit = depth_limit(key.window.width(), self.min_window_minutes);
        let mut outcome = BisectOutcome::default();
        let mut stack = vec![(key.window, 0u32)];
        let mut seen = HashSet::new();
        let mut keep = |outcome: &mut BisectOutcome, rids: Vec<String>| {
            for rid in rids {
                if seen.insert(rid.clone()) {
                    outcome.rids.push(rid);
                }
            }
        };

        while let Some((window, depth)) = stack.pop() {
            let sub_key = key.with_window(window);
            let rows = self.fetcher.fetch_with_retry(&sub_key).await?;

            outcome.windows_fetched += 1;
            outcome.max_depth = outcome.max_depth.max(depth);

            if rows.returned < self.row_cap {
                keep(&mut outcome, rows.rids);
                continue;
            }

            let splittable = window.width() > self.min_window_minutes && depth < limit;
            match window.split() {
                Some((left, right)) if splittable => {
                    debug!(
                        window = %window,
                        returned = rows.returned,
                        row_cap = self.row_cap,
                        depth,
                        "Row cap reached, splitting window"
                    );
                    // Right first so the left half is fetched next.
                    stack.push((right, depth + 1));
                    stack.push((left, depth + 1));
                }
                _ => {
                    warn!(
                        window = %window,
                        returned = rows.returned,
                        row_cap = self.row_cap,
                        "Row cap reached at minimum granularity, keeping capped result"
                    );
                    outcome.floor_windows.push(window);
                    keep(&mut outcome, rows.rids);
                }
            }
        }

        Ok(outcome)
    }
}
