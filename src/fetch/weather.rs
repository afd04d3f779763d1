//! NOAA CDO v2 daily-summaries client.
//!
//! The provider rejects windows longer than a year and serves at most
//! `limit` records per call, so a fetch is a sequence of date chunks, each
//! walked page by page with a 1-based `offset`.

use super::http_client::{FetchError, FetchRequest, HttpClient, RateLimiter};
use super::WeatherSource;
use crate::config::WeatherConfig;
use crate::models::{DateRange, RawWeatherObservation};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
struct DataPage {
    // An empty result set comes back as `{}`.
    #[serde(default)]
    results: Vec<RawWeatherObservation>,
}

pub struct NoaaClient {
    client: HttpClient,
    limiter: RateLimiter,
    endpoint: String,
    token: String,
    page_limit: usize,
    max_span_days: u32,
    datatypes: Vec<String>,
}

impl NoaaClient {
    pub fn new(config: &WeatherConfig, client: HttpClient, jitter_ms: u64) -> Self {
        Self {
            client,
            limiter: RateLimiter::new(Duration::from_millis(config.page_delay_ms), jitter_ms),
            endpoint: format!("{}/data", config.base_url.trim_end_matches('/')),
            token: config.token.clone().unwrap_or_default(),
            page_limit: config.page_limit,
            max_span_days: config.max_span_days,
            datatypes: config.datatypes.clone(),
        }
    }

    fn page_request(&self, station_id: &str, chunk: DateRange, offset: usize) -> FetchRequest {
        let mut req = FetchRequest::get(&self.endpoint)
            .header("token", &self.token)
            .param("datasetid", "GHCND")
            .param("stationid", station_id)
            .param("startdate", chunk.start)
            .param("enddate", chunk.end)
            .param("limit", self.page_limit)
            .param("offset", offset);
        for dt in &self.datatypes {
            req = req.param("datatypeid", dt);
        }
        req.param("units", "metric")
    }

    async fn fetch_chunk(
        &self,
        station_id: &str,
        chunk: DateRange,
    ) -> Result<Vec<RawWeatherObservation>, FetchError> {
        let mut records = Vec::new();
        let mut offset = 1usize;

        loop {
            self.limiter.wait().await;
            debug!("{}: requesting {} offset {}", station_id, chunk, offset);

            let page: DataPage = self
                .client
                .get_json(&self.page_request(station_id, chunk, offset))
                .await?;

            let n = page.results.len();
            records.extend(page.results);

            if n == 0 || n < self.page_limit {
                break;
            }
            offset += n;
        }

        Ok(records)
    }
}

#[async_trait]
impl WeatherSource for NoaaClient {
    async fn fetch_weather(
        &self,
        station_id: &str,
        range: DateRange,
    ) -> Result<Vec<RawWeatherObservation>, FetchError> {
        let mut all = Vec::new();

        for chunk in range.chunks(self.max_span_days) {
            info!("Fetching NOAA chunk for {} from {} to {}", station_id, chunk.start, chunk.end);
            match self.fetch_chunk(station_id, chunk).await {
                Ok(records) => all.extend(records),
                Err(e) => {
                    warn!("NOAA fetch for {} abandoned at chunk {}: {}", station_id, chunk, e);
                    return Err(e);
                }
            }
        }

        info!("{}: {} weather records", station_id, all.len());
        Ok(all)
    }
}
