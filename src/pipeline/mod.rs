//! Pipeline orchestrator: fetch → normalize → merge per city, then reconcile.
//!
//! ## Run
//!
//! 1. Validate configuration (missing URLs or credentials abort here).
//! 2. For each configured city, in its own task bounded by a semaphore:
//!    weather and energy are fetched side by side and normalized separately
//!    before being merged into one city table. A task holds its permit for
//!    `city_delay_ms` after finishing, so with `concurrency = 1` cities are
//!    processed one after another with a fixed pause between them.
//!    Each provider has a single rate limiter shared by every task.
//! 3. A failed or panicking city task is recorded as CRITICAL and the city
//!    falls back to a placeholder.
//! 4. All city tables are reconciled into the master table, which is
//!    replaced in one step, and the quality report is written.

use crate::config::AppConfig;
use crate::fetch::http_client::HttpClient;
use crate::fetch::{region_is_skipped, EiaClient, EnergySource, NoaaClient, WeatherSource};
use crate::models::{City, CityTable, DateRange};
use crate::normalize::{merge_city, normalize_energy, normalize_weather};
use crate::quality::{Level, QualityLedger, QualityWarning};
use crate::reconcile::reconcile;
use crate::storage::MasterStore;
use anyhow::{Context, Result};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

pub struct Pipeline {
    config: AppConfig,
    weather: Arc<dyn WeatherSource>,
    energy: Arc<dyn EnergySource>,
}

impl Pipeline {
    /// Build the pipeline with the NOAA and EIA clients. Fails on
    /// configuration faults before anything is fetched.
    pub fn new(config: AppConfig) -> Result<Self> {
        config.validate()?;

        let policy = config.retry_policy();
        let weather = NoaaClient::new(
            &config.weather,
            HttpClient::new(&config.http, policy.clone()).context("Failed to build NOAA client")?,
            config.http.jitter_ms,
        );
        let energy = EiaClient::new(
            &config.energy,
            HttpClient::new(&config.http, policy).context("Failed to build EIA client")?,
            config.http.jitter_ms,
        );

        Ok(Self::with_sources(config, Arc::new(weather), Arc::new(energy)))
    }

    pub fn with_sources(
        config: AppConfig,
        weather: Arc<dyn WeatherSource>,
        energy: Arc<dyn EnergySource>,
    ) -> Self {
        Self { config, weather, energy }
    }

    pub async fn run(&self, range: DateRange) -> Result<PipelineStats> {
        let cities = self.config.cities();
        info!(
            "=== Processing {} cities from {} to {} ===",
            cities.len(),
            range.start,
            range.end
        );

        let ledger = Arc::new(QualityLedger::new());
        let sem = Arc::new(Semaphore::new(self.config.pipeline.concurrency.max(1)));
        let city_delay = Duration::from_millis(self.config.pipeline.city_delay_ms);
        let mut handles = Vec::new();

        // ── 1. Per-city fetch / normalize / merge ─────────────────────────────
        for city in &cities {
            let city = city.clone();
            let name = city.name.clone();
            let weather = Arc::clone(&self.weather);
            let energy = Arc::clone(&self.energy);
            let ledger = Arc::clone(&ledger);
            let sem = Arc::clone(&sem);

            let handle = tokio::spawn(async move {
                let _permit = sem.acquire().await?;

                let table = process_city(&city, range, weather.as_ref(), energy.as_ref(), &ledger).await;
                info!("{}: {} rows", city.name, table.rows.len());

                // Courtesy pause to both providers before the next city.
                tokio::time::sleep(city_delay).await;
                Ok::<CityTable, anyhow::Error>(table)
            });

            handles.push((name, handle));
        }

        let mut tables = Vec::with_capacity(handles.len());
        let mut failed = Vec::new();

        for (name, handle) in handles {
            let failure = match handle.await {
                Ok(Ok(table)) => {
                    tables.push(table);
                    continue;
                }
                Ok(Err(e)) => format!("{:#}", e),
                Err(e) => format!("task failed: {}", e),
            };

            error!("An unrecoverable error occurred while processing {}: {}. Skipping.", name, failure);
            ledger.record(QualityWarning::new(
                name.as_str(),
                "City Processing Loop",
                Level::Critical,
                "The pipeline failed to process this city due to an unhandled exception.",
                json!(failure),
            ));
            failed.push(name);
        }

        // ── 2. Reconcile into the master table ────────────────────────────────
        info!("=== Combining {} city tables into the master table ===", tables.len());
        let configured: Vec<String> = cities.iter().map(|c| c.name.clone()).collect();
        let store = MasterStore::open(self.config.master_path());

        let saved = store.load().and_then(|existing| {
            let reconciled = reconcile(existing, tables, &configured, &ledger);
            store.save(&reconciled.rows)?;
            Ok(reconciled)
        });

        // ── 3. Quality report, even when the save failed ──────────────────────
        ledger
            .write_report(&self.config.report_path())
            .context("Failed to write the data quality report")?;

        let reconciled = saved.context("Failed to combine and save the master table")?;

        let stats = PipelineStats {
            cities_processed: cities.len(),
            rows_written: reconciled.rows.len(),
            placeholder_cities: reconciled.placeholders.len(),
            pruned_cities: reconciled.pruned.len(),
            warnings: ledger.count_at_least(Level::Warning),
            failed_cities: failed,
        };

        info!(
            "=== Done: {} cities | {} rows | {} placeholders | {} pruned | {} warnings | {} failed ===",
            stats.cities_processed,
            stats.rows_written,
            stats.placeholder_cities,
            stats.pruned_cities,
            stats.warnings,
            stats.failed_cities.len(),
        );

        Ok(stats)
    }
}

/// Fetch, normalize and merge one city. Source failures are recorded and the
/// city continues with whatever the other source produced.
async fn process_city(
    city: &City,
    range: DateRange,
    weather: &dyn WeatherSource,
    energy: &dyn EnergySource,
    ledger: &QualityLedger,
) -> CityTable {
    let weather_src = format!("noaa_{}_{}", city.slug(), range);
    let energy_src = format!("eia_{}_{}", city.slug(), range);
    let region = city.eia_ba_code.as_deref();

    if region_is_skipped(region) {
        info!("Skipping EIA data for {}: no valid region code (found: {:?})", city.name, region);
        ledger.record(QualityWarning::new(
            energy_src.as_str(),
            "Energy Region Skipped",
            Level::Info,
            format!("No energy region configured for {}; energy columns left empty.", city.name),
            json!({ "eia_ba_code": region }),
        ));
    }

    info!("Fetching data for {} (station {}, region {:?})", city.name, city.noaa_station_id, region);
    let (weather_raw, energy_raw) = tokio::join!(
        weather.fetch_weather(&city.noaa_station_id, range),
        energy.fetch_energy(region, range),
    );

    let weather_rows = match weather_raw {
        Ok(raw) => {
            let out = normalize_weather(&weather_src, &raw);
            ledger.extend(out.warnings);
            out.rows
        }
        Err(e) => {
            warn!("Failed to fetch NOAA data for {}: {}", city.name, e);
            ledger.record(fetch_failure(&weather_src, "Weather Fetch", &city.noaa_station_id, &e));
            None
        }
    };

    let energy_rows = match energy_raw {
        Ok(raw) => {
            let out = normalize_energy(&energy_src, &raw);
            ledger.extend(out.warnings);
            out.rows
        }
        Err(e) => {
            warn!("Failed to fetch EIA data for {}: {}", city.name, e);
            ledger.record(fetch_failure(&energy_src, "Energy Fetch", region.unwrap_or_default(), &e));
            None
        }
    };

    merge_city(&city.name, weather_rows, energy_rows)
}

fn fetch_failure(source: &str, check: &str, id: &str, err: &dyn std::error::Error) -> QualityWarning {
    QualityWarning::new(
        source,
        check,
        Level::Error,
        format!("Fetch for {} failed; no data from this source for the run.", id),
        json!({ "id": id, "error": err.to_string() }),
    )
}

#[derive(Debug)]
pub struct PipelineStats {
    pub cities_processed: usize,
    pub rows_written: usize,
    pub placeholder_cities: usize,
    pub pruned_cities: usize,
    /// Ledger entries at WARNING or above.
    pub warnings: usize,
    pub failed_cities: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CityEntry;
    use crate::fetch::http_client::FetchError;
    use crate::models::{MasterRow, RawEnergyObservation, RawWeatherObservation};
    use crate::storage::read_rows;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use httpmock::prelude::*;
    use reqwest::StatusCode;
    use tokio_test::assert_ok;

    struct FakeWeather;

    #[async_trait]
    impl WeatherSource for FakeWeather {
        async fn fetch_weather(
            &self,
            station_id: &str,
            _range: DateRange,
        ) -> Result<Vec<RawWeatherObservation>, FetchError> {
            match station_id {
                "PANIC" => panic!("station parser blew up"),
                "MISSING" => Err(FetchError::Client {
                    status: StatusCode::NOT_FOUND,
                    body: "no such station".into(),
                }),
                _ => Ok(vec![
                    RawWeatherObservation { date: "2024-01-01T00:00:00".into(), datatype: "TMAX".into(), value: Some(10.0) },
                    RawWeatherObservation { date: "2024-01-01T00:00:00".into(), datatype: "TMIN".into(), value: Some(15.0) },
                    RawWeatherObservation { date: "2024-01-02T00:00:00".into(), datatype: "TMAX".into(), value: Some(0.0) },
                ]),
            }
        }
    }

    struct FakeEnergy;

    #[async_trait]
    impl EnergySource for FakeEnergy {
        async fn fetch_energy(
            &self,
            region: Option<&str>,
            _range: DateRange,
        ) -> Result<Vec<RawEnergyObservation>, FetchError> {
            if region_is_skipped(region) {
                return Ok(vec![]);
            }
            Ok(vec![
                RawEnergyObservation { period: "2024-01-02".into(), value: json!("100") },
                RawEnergyObservation { period: "2024-01-03".into(), value: json!(-5) },
            ])
        }
    }

    fn city(name: &str, station: &str, region: Option<&str>) -> CityEntry {
        CityEntry {
            name: Some(name.into()),
            noaa_station_id: Some(station.into()),
            eia_ba_code: region.map(Into::into),
            ..Default::default()
        }
    }

    fn config_in(dir: &std::path::Path, cities: Vec<CityEntry>) -> AppConfig {
        let mut cfg = AppConfig::from_toml_str("").unwrap();
        cfg.storage.output_dir = dir.to_path_buf();
        cfg.pipeline.city_delay_ms = 0;
        cfg.pipeline.concurrency = 2;
        cfg.cities = cities;
        cfg
    }

    fn range() -> DateRange {
        DateRange::new(
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 3).unwrap(),
        )
        .unwrap()
    }

    fn load_master(cfg: &AppConfig) -> Vec<MasterRow> {
        read_rows(std::fs::File::open(cfg.master_path()).unwrap()).unwrap()
    }

    fn load_report(cfg: &AppConfig) -> Vec<QualityWarning> {
        serde_json::from_slice(&std::fs::read(cfg.report_path()).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_failures_are_isolated_per_city() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config_in(
            dir.path(),
            vec![
                city("Austin", "OK", Some("ERCO")),
                city("Boom", "PANIC", Some("ERCO")),
                city("Lost", "MISSING", Some("n/a")),
                city("Denver", "OK", None),
            ],
        );

        let pipeline = Pipeline::with_sources(cfg.clone(), Arc::new(FakeWeather), Arc::new(FakeEnergy));
        let stats = assert_ok!(pipeline.run(range()).await);

        assert_eq!(stats.cities_processed, 4);
        assert_eq!(stats.failed_cities, vec!["Boom".to_string()]);
        assert_eq!(stats.placeholder_cities, 2);

        let master = load_master(&cfg);
        let austin: Vec<_> = master.iter().filter(|r| r.city == "Austin").collect();
        assert_eq!(austin.len(), 3);
        assert_eq!(austin[0].tmax_f, Some(50.0));
        assert_eq!(austin[0].energy_mwh, None);
        assert_eq!(austin[1].energy_mwh, Some(100.0));
        assert_eq!(austin[2].tmax_f, None);

        assert!(master.iter().filter(|r| r.city == "Denver").all(|r| r.energy_mwh.is_none()));
        assert_eq!(master.iter().filter(|r| r.city == "Boom").count(), 1);
        assert_eq!(master.iter().filter(|r| r.city == "Lost").count(), 1);
        assert!(master.iter().filter(|r| r.city == "Lost").all(|r| r.is_placeholder()));

        let report = load_report(&cfg);
        let checks = |check: &str| report.iter().filter(|w| w.check == check).count();
        assert_eq!(checks("City Processing Loop"), 1);
        assert_eq!(checks("Weather Fetch"), 1);
        assert_eq!(checks("Energy Region Skipped"), 2);
        assert_eq!(checks("Temperature Logic"), 2);
        assert_eq!(checks("Negative Energy"), 1);
        assert!(report
            .iter()
            .filter(|w| w.check == "Energy Region Skipped")
            .all(|w| w.level == Level::Info));
        let critical = report.iter().find(|w| w.level == Level::Critical).unwrap();
        assert_eq!(critical.file, "Boom");
    }

    #[tokio::test]
    async fn test_rerun_upserts_and_prunes() {
        let dir = tempfile::tempdir().unwrap();
        let first = config_in(dir.path(), vec![city("Austin", "OK", None), city("Old", "OK", None)]);
        Pipeline::with_sources(first, Arc::new(FakeWeather), Arc::new(FakeEnergy))
            .run(range())
            .await
            .unwrap();

        let second = config_in(dir.path(), vec![city("Austin", "OK", Some("ERCO"))]);
        let stats = Pipeline::with_sources(second.clone(), Arc::new(FakeWeather), Arc::new(FakeEnergy))
            .run(range())
            .await
            .unwrap();

        assert_eq!(stats.pruned_cities, 1);
        let master = load_master(&second);
        assert!(master.iter().all(|r| r.city == "Austin"));
        assert_eq!(master.len(), 3);
        assert_eq!(master[1].energy_mwh, Some(100.0));
    }

    #[test]
    fn test_missing_credentials_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config_in(dir.path(), vec![]);
        cfg.weather.base_url = "http://localhost".into();
        cfg.energy.base_url = "http://localhost".into();
        assert!(Pipeline::new(cfg).is_err());
    }

    #[tokio::test]
    async fn test_end_to_end_against_mock_providers() {
        let server = MockServer::start_async().await;
        let noaa = server
            .mock_async(|when, then| {
                when.method(GET).path("/cdo/data").header("token", "t").query_param("stationid", "GHCND:A");
                then.status(200).json_body(json!({
                    "results": [
                        { "date": "2024-01-01T00:00:00", "datatype": "TMAX", "value": 20.0 },
                        { "date": "2024-01-01T00:00:00", "datatype": "TMIN", "value": 5.0 }
                    ]
                }));
            })
            .await;
        let eia = server
            .mock_async(|when, then| {
                when.method(GET).path("/eia").query_param("api_key", "k");
                then.status(500).body("upstream down");
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config_in(dir.path(), vec![city("Alpha", "GHCND:A", Some("PJM"))]);
        cfg.weather.base_url = server.url("/cdo");
        cfg.weather.token = Some("t".into());
        cfg.weather.page_delay_ms = 0;
        cfg.energy.base_url = server.url("/eia");
        cfg.energy.api_key = Some("k".into());
        cfg.energy.page_delay_ms = 0;
        cfg.http.min_backoff_ms = 1;
        cfg.http.max_backoff_ms = 2;

        let pipeline = assert_ok!(Pipeline::new(cfg.clone()));
        let stats = assert_ok!(pipeline.run(range()).await);
        assert_eq!(stats.rows_written, 1);
        noaa.assert_hits_async(1).await;
        eia.assert_hits_async(3).await;

        let master = load_master(&cfg);
        assert_eq!(master[0].tmax_f, Some(68.0));
        assert_eq!(master[0].tmin_f, Some(41.0));
        assert_eq!(master[0].energy_mwh, None);

        let report = load_report(&cfg);
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].check, "Energy Fetch");
    }
}
