use anyhow::{bail, Result};
use chrono::{Days, Duration, NaiveDate};
use serde::{Deserialize, Serialize};

// ── City ──────────────────────────────────────────────────────────────────────

/// A monitored location. `name` is the unique key across the run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct City {
    pub name: String,
    pub noaa_station_id: String,
    pub eia_ba_code: Option<String>, // None → no energy data
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

impl City {
    /// Filename-friendly form of the name: "New York" → "new_york".
    pub fn slug(&self) -> String {
        self.name.trim().to_lowercase().replace(' ', "_")
    }
}

// ── Date range ────────────────────────────────────────────────────────────────

/// Inclusive calendar date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if start > end {
            bail!("Invalid date range: start {} is after end {}", start, end);
        }
        Ok(Self { start, end })
    }

    /// The `days` days ending on `today` (inclusive on both ends).
    pub fn last_days(today: NaiveDate, days: u32) -> Result<Self> {
        let Some(start) = today.checked_sub_days(Days::new(u64::from(days))) else {
            bail!("Cannot go back {} days from {}: date out of range", days, today);
        };
        Ok(Self { start, end: today })
    }

    /// Just the day before `today`.
    pub fn yesterday(today: NaiveDate) -> Self {
        let d = today - Duration::days(1);
        Self { start: d, end: d }
    }

    pub fn num_days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    /// Split into consecutive sub-ranges spanning at most `max_span_days` days each.
    /// The chunks cover the range exactly once, in chronological order.
    pub fn chunks(&self, max_span_days: u32) -> Vec<DateRange> {
        let span = i64::from(max_span_days.max(1));
        let mut out = Vec::new();
        let mut cursor = self.start;

        while cursor <= self.end {
            let chunk_end = (cursor + Duration::days(span - 1)).min(self.end);
            out.push(DateRange { start: cursor, end: chunk_end });
            cursor = chunk_end + Duration::days(1);
        }
        out
    }
}

impl std::fmt::Display for DateRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_to_{}", self.start, self.end)
    }
}

// ── Raw provider records ──────────────────────────────────────────────────────

/// NOAA daily-summaries record: one (date, datatype) measurement, metric units.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawWeatherObservation {
    pub date: String, // "2024-01-01T00:00:00"
    pub datatype: String,
    // NOAA occasionally reports a measurement with a null value.
    #[serde(default)]
    pub value: Option<f64>,
}

/// EIA regional-demand record. `value` arrives as a number, a numeric
/// string, null, or garbage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawEnergyObservation {
    pub period: String,
    #[serde(default)]
    pub value: serde_json::Value,
}

// ── Normalized daily rows ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DailyWeatherRow {
    pub date: NaiveDate,
    pub tmax_f: Option<f64>,
    pub tmin_f: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DailyEnergyRow {
    pub date: NaiveDate,
    pub energy_mwh: f64,
}

// ── Master table row ──────────────────────────────────────────────────────────

/// One row of a per-city table and of the master table.
/// A placeholder row has no date and no measurements.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MasterRow {
    pub city: String,
    pub date: Option<NaiveDate>,
    pub tmax_f: Option<f64>,
    pub tmin_f: Option<f64>,
    pub energy_mwh: Option<f64>,
}

impl MasterRow {
    pub fn placeholder(city: impl Into<String>) -> Self {
        Self {
            city: city.into(),
            date: None,
            tmax_f: None,
            tmin_f: None,
            energy_mwh: None,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.date.is_none()
    }
}

/// Everything one city produced in the current run.
#[derive(Debug, Clone, PartialEq)]
pub struct CityTable {
    pub city: String,
    pub rows: Vec<MasterRow>,
}
