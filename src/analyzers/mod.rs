//! Delay statistics.
//!
//! Percentile groups per (route, hour, day of week), the buffer curve
//! interpolated over them, and quality checks on the collected samples and
//! the built table.

pub mod buffer;
pub mod coverage;
pub mod percentile;
pub mod utility;

pub use buffer::{RiskQuery, recommend};
pub use percentile::PercentileEngine;
