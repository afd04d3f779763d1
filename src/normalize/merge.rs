use crate::models::{CityTable, DailyEnergyRow, DailyWeatherRow, MasterRow};
use chrono::NaiveDate;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Outer-join a city's weather and energy tables on date.
///
/// Either side may be missing or empty; the result always has the full
/// schema, the city stamped on every row, and rows ordered by date. With
/// nothing on either side the table is empty and the reconciler will give
/// the city a placeholder row.
pub fn merge_city(
    city: &str,
    weather: Option<Vec<DailyWeatherRow>>,
    energy: Option<Vec<DailyEnergyRow>>,
) -> CityTable {
    let weather = weather.unwrap_or_default();
    let energy = energy.unwrap_or_default();

    match (weather.is_empty(), energy.is_empty()) {
        (false, false) => info!("{}: merged weather and energy data", city),
        (false, true) => info!("{}: weather-only data", city),
        (true, false) => info!("{}: energy-only data", city),
        (true, true) => info!("{}: no data processed, placeholder table", city),
    }

    let mut by_date: BTreeMap<NaiveDate, MasterRow> = BTreeMap::new();

    for w in weather {
        let row = by_date.entry(w.date).or_insert_with(|| empty_row(city, w.date));
        row.tmax_f = w.tmax_f;
        row.tmin_f = w.tmin_f;
    }
    for e in energy {
        let row = by_date.entry(e.date).or_insert_with(|| empty_row(city, e.date));
        row.energy_mwh = Some(e.energy_mwh);
    }

    debug!("{}: {} merged rows", city, by_date.len());
    CityTable {
        city: city.to_string(),
        rows: by_date.into_values().collect(),
    }
}

fn empty_row(city: &str, date: NaiveDate) -> MasterRow {
    MasterRow {
        date: Some(date),
        ..MasterRow::placeholder(city)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jan(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    fn weather(day: u32, tmax: f64, tmin: f64) -> DailyWeatherRow {
        DailyWeatherRow { date: jan(day), tmax_f: Some(tmax), tmin_f: Some(tmin) }
    }

    fn energy(day: u32, mwh: f64) -> DailyEnergyRow {
        DailyEnergyRow { date: jan(day), energy_mwh: mwh }
    }

    #[test]
    fn test_outer_join_keeps_every_date() {
        let table = merge_city(
            "Austin",
            Some(vec![weather(1, 60.0, 40.0), weather(2, 61.0, 41.0)]),
            Some(vec![energy(2, 900.0), energy(3, 950.0)]),
        );

        assert_eq!(table.city, "Austin");
        let dates: Vec<_> = table.rows.iter().map(|r| r.date.unwrap()).collect();
        assert_eq!(dates, vec![jan(1), jan(2), jan(3)]);

        assert_eq!(table.rows[0].energy_mwh, None);
        assert_eq!(table.rows[1].tmax_f, Some(61.0));
        assert_eq!(table.rows[1].energy_mwh, Some(900.0));
        assert_eq!(table.rows[2].tmax_f, None);
        assert!(table.rows.iter().all(|r| r.city == "Austin"));
    }

    #[test]
    fn test_weather_only_has_null_energy() {
        let table = merge_city("Denver", Some(vec![weather(1, 30.0, 10.0), weather(2, 35.0, 12.0)]), None);
        assert_eq!(table.rows.len(), 2);
        assert!(table.rows.iter().all(|r| r.energy_mwh.is_none()));
    }

    #[test]
    fn test_energy_only_and_empty_weather() {
        let table = merge_city("Boise", Some(vec![]), Some(vec![energy(5, 12.5)]));
        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.rows[0].tmax_f, None);
        assert_eq!(table.rows[0].tmin_f, None);
        assert_eq!(table.rows[0].energy_mwh, Some(12.5));
    }

    #[test]
    fn test_nothing_gives_empty_table() {
        let table = merge_city("Nome", None, None);
        assert_eq!(table.city, "Nome");
        assert!(table.rows.is_empty());
    }
}
