use super::{coerce_number, parse_date, round2, Normalized};
use crate::models::{DailyEnergyRow, RawEnergyObservation};
use crate::quality::{Level, QualityWarning};
use chrono::NaiveDate;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Sum EIA readings per calendar day. Non-numeric values count as missing;
/// negative daily totals are reported but kept.
pub fn normalize_energy(source: &str, raw: &[RawEnergyObservation]) -> Normalized<DailyEnergyRow> {
    if raw.is_empty() {
        return Normalized::empty();
    }

    let mut warnings = Vec::new();
    let mut totals: BTreeMap<NaiveDate, f64> = BTreeMap::new();
    let mut coerced = 0usize;

    for rec in raw {
        let Some(date) = parse_date(&rec.period) else {
            warn!("{}: unparseable energy period {:?}", source, rec.period);
            warnings.push(QualityWarning::new(
                source,
                "Period Parsing",
                Level::Error,
                format!("Unparseable period {:?} in energy data; table dropped.", rec.period),
                json!({ "period": rec.period, "value": rec.value }),
            ));
            return Normalized::failed(warnings);
        };

        let total = totals.entry(date).or_insert(0.0);
        match coerce_number(&rec.value) {
            Some(v) => *total += v,
            None => coerced += 1,
        }
    }

    if coerced > 0 {
        debug!("{}: {} non-numeric energy values treated as missing", source, coerced);
    }

    let rows: Vec<DailyEnergyRow> = totals
        .into_iter()
        .map(|(date, total)| DailyEnergyRow {
            date,
            energy_mwh: round2(total),
        })
        .collect();

    for row in rows.iter().filter(|r| r.energy_mwh < 0.0) {
        let issue = format!(
            "Date {}: Negative energy consumption detected ({} MWh).",
            row.date, row.energy_mwh
        );
        warn!("{}: {}", source, issue);
        warnings.push(QualityWarning::new(
            source,
            "Negative Energy",
            Level::Warning,
            issue,
            json!({ "date": row.date.to_string(), "energy_mwh": row.energy_mwh }),
        ));
    }

    Normalized {
        rows: Some(rows),
        warnings,
    }
}
