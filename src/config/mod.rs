use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::fetch::http_client::RetryPolicy;
use crate::models::City;

/// Top-level application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub weather: WeatherConfig,
    #[serde(default)]
    pub energy: EnergyConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub cities: Vec<CityEntry>,
}

/// NOAA CDO daily-summaries provider
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WeatherConfig {
    #[serde(default)]
    pub base_url: String,

    /// Falls back to `NOAA_TOKEN` from the environment.
    #[serde(default)]
    pub token: Option<String>,

    #[serde(default = "default_weather_page_limit")]
    pub page_limit: usize,

    #[serde(default = "default_max_span_days")]
    pub max_span_days: u32,

    #[serde(default = "default_page_delay_ms")]
    pub page_delay_ms: u64,

    #[serde(default = "default_datatypes")]
    pub datatypes: Vec<String>,
}

/// EIA regional-demand provider
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EnergyConfig {
    #[serde(default)]
    pub base_url: String,

    /// Falls back to `EIA_API_KEY` from the environment.
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_energy_page_length")]
    pub page_length: usize,

    #[serde(default = "default_page_delay_ms")]
    pub page_delay_ms: u64,
}

/// Outbound HTTP behaviour shared by both providers
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_min_backoff_ms")]
    pub min_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default)]
    pub jitter_ms: u64,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    #[serde(default = "default_master_file")]
    pub master_file: String,

    #[serde(default = "default_report_file")]
    pub report_file: String,
}

/// Pipeline configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_city_delay_ms")]
    pub city_delay_ms: u64,

    #[serde(default = "default_history_days")]
    pub default_history_days: u32,
}

/// A `[[cities]]` entry exactly as written. Validated into a [`City`] by
/// [`AppConfig::cities`].
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CityEntry {
    pub name: Option<String>,
    pub noaa_station_id: Option<String>,
    pub eia_ba_code: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

fn default_weather_page_limit() -> usize {
    1000
}
fn default_max_span_days() -> u32 {
    365
}
fn default_page_delay_ms() -> u64 {
    200
}
fn default_datatypes() -> Vec<String> {
    vec!["TMAX".to_string(), "TMIN".to_string()]
}
fn default_energy_page_length() -> usize {
    5000
}
fn default_timeout_secs() -> u64 {
    20
}
fn default_user_agent() -> String {
    "energy-weather-etl/0.1 (daily weather and demand research)".to_string()
}
fn default_max_attempts() -> u32 {
    3
}
fn default_min_backoff_ms() -> u64 {
    2000
}
fn default_max_backoff_ms() -> u64 {
    10_000
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("data/output")
}
fn default_master_file() -> String {
    "master_energy_weather_data.csv".to_string()
}
fn default_report_file() -> String {
    "data_quality_report.json".to_string()
}
fn default_concurrency() -> usize {
    1
}
fn default_city_delay_ms() -> u64 {
    1000
}
fn default_history_days() -> u32 {
    365
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            token: None,
            page_limit: default_weather_page_limit(),
            max_span_days: default_max_span_days(),
            page_delay_ms: default_page_delay_ms(),
            datatypes: default_datatypes(),
        }
    }
}

impl Default for EnergyConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: None,
            page_length: default_energy_page_length(),
            page_delay_ms: default_page_delay_ms(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
            max_attempts: default_max_attempts(),
            min_backoff_ms: default_min_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter_ms: 0,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            master_file: default_master_file(),
            report_file: default_report_file(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            city_delay_ms: default_city_delay_ms(),
            default_history_days: default_history_days(),
        }
    }
}

// ── Loader ───────────────────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from `<dir>/default.toml`, `<dir>/local.toml` and
    /// `ENERGY_ETL__*` environment overrides. Credentials missing from the
    /// files are taken from `NOAA_TOKEN` / `EIA_API_KEY`.
    pub fn load(config_dir: &Path) -> Result<Self> {
        dotenv::dotenv().ok();

        let cfg = config::Config::builder()
            .add_source(
                config::File::from(config_dir.join("default"))
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::File::from(config_dir.join("local"))
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(config::Environment::with_prefix("ENERGY_ETL").separator("__"))
            .build()
            .context("Failed to read configuration")?;

        let mut app_cfg: AppConfig = cfg
            .try_deserialize()
            .context("Malformed configuration")?;
        app_cfg.fill_credentials_from_env();
        Ok(app_cfg)
    }

    /// Parse a TOML document directly (no files, no environment).
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?;
        Ok(cfg.try_deserialize()?)
    }

    fn fill_credentials_from_env(&mut self) {
        if blank(&self.weather.token) {
            self.weather.token = std::env::var("NOAA_TOKEN").ok();
        }
        if blank(&self.energy.api_key) {
            self.energy.api_key = std::env::var("EIA_API_KEY").ok();
        }
        self.weather.token = self.weather.token.take().map(|t| t.trim().to_string());
        self.energy.api_key = self.energy.api_key.take().map(|k| k.trim().to_string());
    }

    /// Fatal configuration faults: checked before any fetch begins.
    pub fn validate(&self) -> Result<()> {
        if self.weather.base_url.trim().is_empty() || self.energy.base_url.trim().is_empty() {
            bail!("One or more API base URLs are missing (weather.base_url, energy.base_url)");
        }
        if blank(&self.weather.token) || blank(&self.energy.api_key) {
            bail!("Missing API credentials (NOAA_TOKEN, EIA_API_KEY)");
        }
        if self.weather.page_limit == 0 || self.energy.page_length == 0 {
            bail!("Page sizes must be greater than zero");
        }
        if self.http.max_attempts == 0 {
            bail!("http.max_attempts must be at least 1");
        }
        Ok(())
    }

    /// Valid cities in configuration order. Entries without a name or a
    /// weather station, and repeated names, are skipped with a warning.
    pub fn cities(&self) -> Vec<City> {
        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(self.cities.len());

        for (i, entry) in self.cities.iter().enumerate() {
            let name = entry.name.as_deref().map(str::trim).unwrap_or("");
            let station = entry.noaa_station_id.as_deref().map(str::trim).unwrap_or("");

            if name.is_empty() || station.is_empty() {
                warn!(
                    "Skipping city entry #{}: missing required keys (name={:?}, noaa_station_id={:?})",
                    i + 1,
                    entry.name,
                    entry.noaa_station_id
                );
                continue;
            }
            if !seen.insert(name.to_string()) {
                warn!("Skipping city entry #{}: duplicate name {:?}", i + 1, name);
                continue;
            }

            out.push(City {
                name: name.to_string(),
                noaa_station_id: station.to_string(),
                eia_ba_code: entry.eia_ba_code.as_ref().map(|c| c.trim().to_string()),
                lat: entry.lat,
                lon: entry.lon,
            });
        }
        out
    }

    pub fn master_path(&self) -> PathBuf {
        self.storage.output_dir.join(&self.storage.master_file)
    }

    pub fn report_path(&self) -> PathBuf {
        self.storage.output_dir.join(&self.storage.report_file)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.http.max_attempts,
            min_delay: std::time::Duration::from_millis(self.http.min_backoff_ms),
            max_delay: std::time::Duration::from_millis(self.http.max_backoff_ms),
            jitter: self.http.jitter_ms > 0,
        }
    }
}

fn blank(v: &Option<String>) -> bool {
    v.as_deref().map(|s| s.trim().is_empty()).unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [weather]
        base_url = "https://www.ncei.noaa.gov/cdo-web/api/v2"
        token = " abc "

        [energy]
        base_url = "https://api.eia.gov/v2/electricity/rto/daily-region-data/data/"
        api_key = "key"
        page_length = 100

        [pipeline]
        concurrency = 4

        [[cities]]
        name = "New York"
        noaa_station_id = "GHCND:USW00094728"
        eia_ba_code = "NYIS"
        lat = 40.78
        lon = -73.97

        [[cities]]
        name = "Nowhere"

        [[cities]]
        name = "Phoenix"
        noaa_station_id = "GHCND:USW00023183"

        [[cities]]
        name = "New York"
        noaa_station_id = "GHCND:DUPLICATE"
    "#;

    #[test]
    fn test_parse_and_defaults() {
        let cfg = AppConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(cfg.energy.page_length, 100);
        assert_eq!(cfg.weather.page_limit, 1000);
        assert_eq!(cfg.weather.max_span_days, 365);
        assert_eq!(cfg.weather.datatypes, vec!["TMAX", "TMIN"]);
        assert_eq!(cfg.http.max_attempts, 3);
        assert_eq!(cfg.pipeline.concurrency, 4);
        assert_eq!(cfg.pipeline.city_delay_ms, 1000);
        assert_eq!(cfg.master_path(), PathBuf::from("data/output/master_energy_weather_data.csv"));
    }

    #[test]
    fn test_malformed_and_duplicate_cities_skipped() {
        let cfg = AppConfig::from_toml_str(SAMPLE).unwrap();
        let cities = cfg.cities();
        let names: Vec<_> = cities.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["New York", "Phoenix"]);
        assert_eq!(cities[0].noaa_station_id, "GHCND:USW00094728");
        assert_eq!(cities[1].eia_ba_code, None);
    }

    #[test]
    fn test_validate_requires_urls_and_credentials() {
        let mut cfg = AppConfig::from_toml_str(SAMPLE).unwrap();
        assert!(cfg.validate().is_ok());

        cfg.energy.api_key = Some("  ".into());
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::from_toml_str(SAMPLE).unwrap();
        cfg.weather.base_url.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_retry_policy_from_http_section() {
        let cfg = AppConfig::from_toml_str(SAMPLE).unwrap();
        let policy = cfg.retry_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.min_delay.as_millis(), 2000);
        assert_eq!(policy.max_delay.as_millis(), 10_000);
        assert!(!policy.jitter);
    }
}
