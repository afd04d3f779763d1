use super::{parse_date, round2, Normalized};
use crate::models::{DailyWeatherRow, RawWeatherObservation};
use crate::quality::{Level, QualityWarning};
use chrono::NaiveDate;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::warn;

fn celsius_to_fahrenheit(c: f64) -> f64 {
    round2(c * 9.0 / 5.0 + 32.0)
}

/// One pivot cell. `filled` tells a reported null apart from no report.
#[derive(Default)]
struct Cell {
    filled: bool,
    value: Option<f64>,
}

#[derive(Default)]
struct DayCell {
    tmax: Cell,
    tmin: Cell,
}

/// Turn raw NOAA records (°C) into one row per date with TMAX/TMIN in °F.
///
/// Duplicated (date, datatype) pairs are reported and the first occurrence
/// kept. A pivot that still finds two values for one cell drops the table
/// and reports an ERROR. Days where min > max are reported, never corrected.
pub fn normalize_weather(source: &str, raw: &[RawWeatherObservation]) -> Normalized<DailyWeatherRow> {
    if raw.is_empty() {
        return Normalized::empty();
    }

    let mut warnings = Vec::new();

    // ── Dates ─────────────────────────────────────────────────────────────────
    let mut dated = Vec::with_capacity(raw.len());
    for rec in raw {
        match parse_date(&rec.date) {
            Some(date) => dated.push((date, rec)),
            None => {
                warn!("{}: unparseable weather date {:?}", source, rec.date);
                warnings.push(QualityWarning::new(
                    source,
                    "Date Parsing",
                    Level::Error,
                    format!("Unparseable date {:?} in weather data; table dropped.", rec.date),
                    json!({ "date": rec.date, "datatype": rec.datatype }),
                ));
                return Normalized::failed(warnings);
            }
        }
    }

    // ── Duplicates ────────────────────────────────────────────────────────────
    let mut counts: HashMap<(NaiveDate, &str), usize> = HashMap::new();
    for (date, rec) in &dated {
        *counts.entry((*date, rec.datatype.as_str())).or_default() += 1;
    }

    if counts.values().any(|&n| n > 1) {
        let mut dups: Vec<_> = dated
            .iter()
            .filter(|(date, rec)| counts[&(*date, rec.datatype.as_str())] > 1)
            .map(|(_, rec)| *rec)
            .collect();
        dups.sort_by(|a, b| (parse_date(&a.date), &a.datatype).cmp(&(parse_date(&b.date), &b.datatype)));

        warn!("{}: duplicate weather data points found, keeping first entry", source);
        warnings.push(QualityWarning::new(
            source,
            "Duplicate Raw Data",
            Level::Warning,
            "Duplicate weather data points found. This can cause processing errors. Taking first entry.",
            json!(dups),
        ));

        let mut seen = HashSet::new();
        dated.retain(|(date, rec)| seen.insert((*date, rec.datatype.clone())));
    }

    // ── Pivot ─────────────────────────────────────────────────────────────────
    let mut days: BTreeMap<NaiveDate, DayCell> = BTreeMap::new();
    for (date, rec) in &dated {
        let cell = days.entry(*date).or_default();
        let slot = match rec.datatype.trim().to_uppercase().as_str() {
            "TMAX" => &mut cell.tmax,
            "TMIN" => &mut cell.tmin,
            _ => continue,
        };

        if slot.filled {
            let err = format!("duplicate {} value on {}", rec.datatype.trim(), date);
            warn!("{}: could not pivot weather data: {}", source, err);
            warnings.push(QualityWarning::new(
                source,
                "Data Pivoting",
                Level::Error,
                format!(
                    "Could not pivot data, likely due to duplicate TMAX/TMIN values for a single day. Error: {}",
                    err
                ),
                json!({}),
            ));
            return Normalized::failed(warnings);
        }
        *slot = Cell { filled: true, value: rec.value };
    }

    // ── Convert + validate ────────────────────────────────────────────────────
    let rows: Vec<DailyWeatherRow> = days
        .into_iter()
        .map(|(date, cell)| DailyWeatherRow {
            date,
            tmax_f: cell.tmax.value.map(celsius_to_fahrenheit),
            tmin_f: cell.tmin.value.map(celsius_to_fahrenheit),
        })
        .collect();

    for row in &rows {
        if let (Some(tmax), Some(tmin)) = (row.tmax_f, row.tmin_f) {
            if tmin > tmax {
                let issue = format!("Date {}: TMIN ({}°F) > TMAX ({}°F).", row.date, tmin, tmax);
                warn!("{}: {}", source, issue);
                warnings.push(QualityWarning::new(
                    source,
                    "Temperature Logic",
                    Level::Warning,
                    issue,
                    json!({ "date": row.date.to_string(), "tmin_f": tmin, "tmax_f": tmax }),
                ));
            }
        }
    }

    Normalized {
        rows: Some(rows),
        warnings,
    }
}
