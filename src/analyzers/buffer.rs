//! Maps a risk tolerance onto a buffer time using a group's quantiles.
//!
//! The curve is piecewise linear through `(80, p80)`, `(90, p90)` and
//! `(95, p95)`. Below 80 the first segment is extended; above 95 the second
//! one is. `recommend` never clamps; [`RiskQuery`] carries optional bounds
//! for callers that want them.

use crate::model::PercentileGroup;

pub const MIN_RISK_TOLERANCE: f64 = 80.0;
pub const MAX_RISK_TOLERANCE: f64 = 99.0;

/// `lo * (1 - t) + hi * t`, which returns `lo` exactly at `t = 0` and `hi`
/// exactly at `t = 1`.
fn lerp(lo: f64, hi: f64, t: f64) -> f64 {
    lo * (1.0 - t) + hi * t
}

/// Recommended buffer, in minutes, for `risk_tolerance` (a percentile).
pub fn recommend(group: &PercentileGroup, risk_tolerance: f64) -> f64 {
    if risk_tolerance <= 90.0 {
        lerp(group.p80, group.p90, (risk_tolerance - 80.0) / 10.0)
    } else {
        lerp(group.p90, group.p95, (risk_tolerance - 90.0) / 5.0)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RiskError {
    #[error("risk tolerance {0} is outside [{MIN_RISK_TOLERANCE}, {MAX_RISK_TOLERANCE}]")]
    OutOfRange(f64),
    #[error("floor {floor} is above cap {cap}")]
    Bounds { floor: f64, cap: f64 },
}

/// A validated buffer request.
#[derive(Debug, Clone, PartialEq)]
pub struct RiskQuery {
    risk_tolerance: f64,
    floor: Option<f64>,
    cap: Option<f64>,
}

impl RiskQuery {
    pub fn new(risk_tolerance: f64) -> Result<Self, RiskError> {
        if !(MIN_RISK_TOLERANCE..=MAX_RISK_TOLERANCE).contains(&risk_tolerance) {
            return Err(RiskError::OutOfRange(risk_tolerance));
        }
        Ok(Self {
            risk_tolerance,
            floor: None,
            cap: None,
        })
    }

    /// Optional lower and upper bounds applied after interpolation.
    pub fn with_bounds(mut self, floor: Option<f64>, cap: Option<f64>) -> Result<Self, RiskError> {
        if let (Some(floor), Some(cap)) = (floor, cap) {
            if floor > cap {
                return Err(RiskError::Bounds { floor, cap });
            }
        }
        self.floor = floor;
        self.cap = cap;
        Ok(self)
    }

    pub fn risk_tolerance(&self) -> f64 {
        self.risk_tolerance
    }

    pub fn resolve(&self, group: &PercentileGroup) -> f64 {
        let mut minutes = recommend(group, self.risk_tolerance);
        if let Some(floor) = self.floor {
            minutes = minutes.max(floor);
        }
        if let Some(cap) = self.cap {
            minutes = minutes.min(cap);
        }
        minutes
    }
}
