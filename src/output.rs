//! Percentile table persistence and lookup.

use anyhow::{Context, Result};
use csv::WriterBuilder;
use serde::Serialize;
use std::fs::{self, File};
use std::path::Path;
use tracing::{debug, info};

use crate::model::{PercentileGroup, Route};

/// Logs any serializable value as pretty-printed JSON.
pub fn print_json(value: &impl Serialize) -> Result<()> {
    info!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Writes the percentile table, replacing any previous one.
pub fn write_table(path: &Path, groups: &[PercentileGroup]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    debug!(path = %path.display(), groups = groups.len(), "Writing percentile table");

    let file = File::create(path).with_context(|| format!("creating '{}'", path.display()))?;
    let mut writer = WriterBuilder::new().has_headers(true).from_writer(file);
    if groups.is_empty() {
        writer.write_record([
            "origin",
            "destination",
            "hour",
            "day_of_week",
            "p80",
            "p90",
            "p95",
            "observation_count",
        ])?;
    }
    for group in groups {
        writer.serialize(group)?;
    }
    writer.flush()?;

    Ok(())
}

pub fn load_table(path: &Path) -> Result<Vec<PercentileGroup>> {
    let file = File::open(path).with_context(|| format!("opening '{}'", path.display()))?;
    let mut rdr = csv::Reader::from_reader(file);

    let mut groups = Vec::new();
    for result in rdr.deserialize() {
        let group: PercentileGroup = result?;
        groups.push(group);
    }
    Ok(groups)
}

pub fn find_group<'a>(
    groups: &'a [PercentileGroup],
    route: &Route,
    hour: u8,
    day_of_week: u8,
) -> Option<&'a PercentileGroup> {
    groups.iter().find(|g| {
        g.origin == route.origin
            && g.destination == route.destination
            && g.hour == hour
            && g.day_of_week == day_of_week
    })
}
