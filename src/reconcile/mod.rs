//! Folds the tables produced in a run into the persisted master table.
//!
//! Guarantees on the output:
//! - at most one row per (city, date); rows from this run replace older ones
//! - only configured cities appear
//! - every configured city has at least one row (a placeholder if needed)
//! - ordered by (city, date), placeholder (null date) first
//!
//! Pure function of its inputs: the same inputs give the same rows.

use crate::models::{CityTable, MasterRow};
use crate::quality::{Level, QualityLedger, QualityWarning};
use chrono::NaiveDate;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

const SOURCE: &str = "master_table";

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    pub rows: Vec<MasterRow>,
    /// Cities dropped because they are no longer configured.
    pub pruned: Vec<String>,
    /// Configured cities that only have a placeholder row.
    pub placeholders: Vec<String>,
}

pub fn reconcile(
    existing: Vec<MasterRow>,
    run_tables: Vec<CityTable>,
    configured: &[String],
    ledger: &QualityLedger,
) -> Reconciled {
    let configured_set: BTreeSet<&str> = configured.iter().map(String::as_str).collect();

    if run_tables.is_empty() {
        warn!("No per-city tables were produced in this run");
    }

    // Old rows first, then this run's: a later insert wins the key.
    let mut by_key: BTreeMap<(String, Option<NaiveDate>), MasterRow> = BTreeMap::new();
    let old_rows = existing.len();
    let new_rows = run_tables.iter().map(|t| t.rows.len()).sum::<usize>();

    let run_rows = run_tables.into_iter().flat_map(|t| t.rows);
    for row in existing.into_iter().chain(run_rows) {
        // Placeholders are recomputed below.
        if row.is_placeholder() {
            continue;
        }
        by_key.insert((row.city.clone(), row.date), row);
    }
    info!(
        "Upserted {} existing + {} new rows into {} unique (city, date) keys",
        old_rows,
        new_rows,
        by_key.len()
    );

    // ── Stale cities ──────────────────────────────────────────────────────────
    let stale: BTreeSet<String> = by_key
        .keys()
        .filter(|(city, _)| !configured_set.contains(city.as_str()))
        .map(|(city, _)| city.clone())
        .collect();

    if !stale.is_empty() {
        by_key.retain(|(city, _), _| !stale.contains(city));
        let names: Vec<&str> = stale.iter().map(String::as_str).collect();
        info!("Dropping cities no longer configured: {}", names.join(", "));
        ledger.record(QualityWarning::new(
            SOURCE,
            "Stale City Pruning",
            Level::Info,
            format!("Removed rows for cities no longer configured: {}", names.join(", ")),
            json!({ "cities": names }),
        ));
    }

    // ── Coverage ──────────────────────────────────────────────────────────────
    let present: BTreeSet<&str> = by_key.keys().map(|(city, _)| city.as_str()).collect();
    let missing: Vec<String> = configured_set
        .iter()
        .filter(|c| !present.contains(*c))
        .map(|c| c.to_string())
        .collect();

    if !missing.is_empty() {
        info!("Adding placeholder records for cities without data: {}", missing.join(", "));
        ledger.record(QualityWarning::new(
            SOURCE,
            "Missing City Data",
            Level::Warning,
            format!("No data available for configured cities: {}", missing.join(", ")),
            json!({ "cities": missing }),
        ));
        for city in &missing {
            by_key.insert((city.clone(), None), MasterRow::placeholder(city.as_str()));
        }
    }

    Reconciled {
        rows: by_key.into_values().collect(),
        pruned: stale.into_iter().collect(),
        placeholders: missing,
    }
}
