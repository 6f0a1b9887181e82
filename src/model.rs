//! Core data types shared by the collection pipeline and the statistics engine.

use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;

const MINUTES_PER_DAY: i32 = 24 * 60;

/// Errors raised while parsing clock times, routes and windows.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid HHMM clock time '{0}'")]
    ClockTime(String),
    #[error("invalid time window {start}-{end}: end is before start")]
    WindowOrder { start: String, end: String },
    #[error("invalid route '{0}': expected ORIGIN,DEST")]
    Route(String),
}

/// Parses an `HHMM` string into minutes since midnight.
pub fn parse_hhmm(value: &str) -> Result<u16, ParseError> {
    let value = value.trim();
    if value.len() != 4 || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::ClockTime(value.to_string()));
    }
    let hours: u16 = value[..2]
        .parse()
        .map_err(|_| ParseError::ClockTime(value.to_string()))?;
    let minutes: u16 = value[2..]
        .parse()
        .map_err(|_| ParseError::ClockTime(value.to_string()))?;
    if hours > 23 || minutes > 59 {
        return Err(ParseError::ClockTime(value.to_string()));
    }
    Ok(hours * 60 + minutes)
}

/// Formats minutes since midnight as `HHMM`.
pub fn format_hhmm(minutes: u16) -> String {
    format!("{:02}{:02}", minutes / 60, minutes % 60)
}

/// Day-type tag the performance service filters on.
pub fn days_tag(date: NaiveDate) -> &'static str {
    match date.weekday() {
        Weekday::Sat => "SATURDAY",
        Weekday::Sun => "SUNDAY",
        _ => "WEEKDAY",
    }
}

/// An (origin, destination) station pair, stored as upper-case CRS codes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "(String, String)", into = "(String, String)")]
pub struct Route {
    pub origin: String,
    pub destination: String,
}

impl Route {
    pub fn new(origin: &str, destination: &str) -> Self {
        Self {
            origin: origin.trim().to_ascii_uppercase(),
            destination: destination.trim().to_ascii_uppercase(),
        }
    }

    /// Parses the `ORIGIN,DEST` form used on the command line.
    pub fn parse(value: &str) -> Result<Self, ParseError> {
        match value.split_once(',') {
            Some((o, d)) if !o.trim().is_empty() && !d.trim().is_empty() => Ok(Self::new(o, d)),
            _ => Err(ParseError::Route(value.to_string())),
        }
    }
}

impl TryFrom<(String, String)> for Route {
    type Error = ParseError;

    fn try_from((origin, destination): (String, String)) -> Result<Self, Self::Error> {
        if origin.trim().is_empty() || destination.trim().is_empty() {
            return Err(ParseError::Route(format!("{origin},{destination}")));
        }
        Ok(Self::new(&origin, &destination))
    }
}

impl From<Route> for (String, String) {
    fn from(route: Route) -> Self {
        (route.origin, route.destination)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.origin, self.destination)
    }
}

/// A clock-time interval within one day, `[start, end]` inclusive, in minutes
/// since midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "(String, String)", into = "(String, String)")]
pub struct TimeWindow {
    start: u16,
    end: u16,
}

impl TimeWindow {
    pub fn new(start: u16, end: u16) -> Result<Self, ParseError> {
        if end < start || end >= MINUTES_PER_DAY as u16 {
            return Err(ParseError::WindowOrder {
                start: format_hhmm(start),
                end: format_hhmm(end),
            });
        }
        Ok(Self { start, end })
    }

    /// Parses a pair of `HHMM` strings.
    pub fn parse(start: &str, end: &str) -> Result<Self, ParseError> {
        Self::new(parse_hhmm(start)?, parse_hhmm(end)?)
    }

    /// Parses the `HHMM,HHMM` form used on the command line.
    pub fn parse_pair(value: &str) -> Result<Self, ParseError> {
        let (start, end) = value
            .split_once(',')
            .ok_or_else(|| ParseError::ClockTime(value.to_string()))?;
        Self::parse(&format!("{:0>4}", start.trim()), &format!("{:0>4}", end.trim()))
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn end(&self) -> u16 {
        self.end
    }

    /// Width in minutes, `end - start`.
    pub fn width(&self) -> u16 {
        self.end - self.start
    }

    pub fn contains(&self, minute: u16) -> bool {
        (self.start..=self.end).contains(&minute)
    }

    /// Halves the window at its midpoint into `[start, mid]` and `[mid + 1, end]`.
    ///
    /// Returns `None` for a single-minute window, which cannot be split.
    pub fn split(&self) -> Option<(TimeWindow, TimeWindow)> {
        if self.width() == 0 {
            return None;
        }
        let mid = (self.start + self.end) / 2;
        Some((
            TimeWindow {
                start: self.start,
                end: mid,
            },
            TimeWindow {
                start: mid + 1,
                end: self.end,
            },
        ))
    }
}

impl TryFrom<(String, String)> for TimeWindow {
    type Error = ParseError;

    fn try_from((start, end): (String, String)) -> Result<Self, Self::Error> {
        Self::parse(&start, &end)
    }
}

impl From<TimeWindow> for (String, String) {
    fn from(window: TimeWindow) -> Self {
        (format_hhmm(window.start), format_hhmm(window.end))
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", format_hhmm(self.start), format_hhmm(self.end))
    }
}

/// One unit of collection work. Also the idempotency and resume key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FetchKey {
    pub route: Route,
    pub date: NaiveDate,
    pub window: TimeWindow,
}

impl FetchKey {
    pub fn new(route: Route, date: NaiveDate, window: TimeWindow) -> Self {
        Self {
            route,
            date,
            window,
        }
    }

    /// The same route and date scoped to a different window.
    pub fn with_window(&self, window: TimeWindow) -> Self {
        Self {
            route: self.route.clone(),
            date: self.date,
            window,
        }
    }

    /// Stable string form, `{date}_{origin}_{dest}_{start}_{end}`.
    pub fn id(&self) -> String {
        format!(
            "{}_{}_{}_{}_{}",
            self.date.format("%Y-%m-%d"),
            self.route.origin,
            self.route.destination,
            format_hhmm(self.window.start),
            format_hhmm(self.window.end)
        )
    }
}

impl fmt::Display for FetchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id())
    }
}

/// A single observed arrival.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayRecord {
    pub origin: String,
    pub destination: String,
    pub train_id: String,
    pub date: NaiveDate,
    pub scheduled_arrival: String,
    pub actual_arrival: String,
    pub delay_minutes: i32,
    pub hour: u8,
}

impl DelayRecord {
    /// Builds a record from `HHMM` scheduled and actual arrival times.
    ///
    /// `delay_minutes` is `actual - scheduled` and may be negative for early
    /// arrivals. A difference beyond twelve hours is read as a midnight
    /// crossing.
    pub fn from_times(
        route: &Route,
        train_id: &str,
        date: NaiveDate,
        scheduled: &str,
        actual: &str,
    ) -> Result<Self, ParseError> {
        let scheduled_min = parse_hhmm(scheduled)?;
        let actual_min = parse_hhmm(actual)?;

        let mut delay = i32::from(actual_min) - i32::from(scheduled_min);
        if delay > MINUTES_PER_DAY / 2 {
            delay -= MINUTES_PER_DAY;
        } else if delay < -MINUTES_PER_DAY / 2 {
            delay += MINUTES_PER_DAY;
        }

        Ok(Self {
            origin: route.origin.clone(),
            destination: route.destination.clone(),
            train_id: train_id.to_string(),
            date,
            scheduled_arrival: format_hhmm(scheduled_min),
            actual_arrival: format_hhmm(actual_min),
            delay_minutes: delay,
            hour: (scheduled_min / 60) as u8,
        })
    }

    pub fn route(&self) -> Route {
        Route::new(&self.origin, &self.destination)
    }

    /// 0 = Monday .. 6 = Sunday.
    pub fn day_of_week(&self) -> u8 {
        self.date.weekday().num_days_from_monday() as u8
    }
}

/// Delay quantiles for one (route, hour, day-of-week) cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PercentileGroup {
    pub origin: String,
    pub destination: String,
    pub hour: u8,
    pub day_of_week: u8,
    pub p80: f64,
    pub p90: f64,
    pub p95: f64,
    pub observation_count: usize,
}

impl PercentileGroup {
    pub fn route(&self) -> Route {
        Route::new(&self.origin, &self.destination)
    }
}
