use super::http_client::{FetchError, FetchRequest, HttpClient, RateLimiter};
use super::EnergySource;
use crate::config::EnergyConfig;
use crate::models::{DateRange, RawEnergyObservation};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    response: DataPage,
}

#[derive(Debug, Default, Deserialize)]
struct DataPage {
    #[serde(default)]
    data: Vec<RawEnergyObservation>,
}

/// True when a configured region code means "no energy data for this city".
pub fn region_is_skipped(region: Option<&str>) -> bool {
    match region.map(|r| r.trim().to_uppercase()) {
        None => true,
        Some(r) => r.is_empty() || r == "NONE" || r == "N/A" || r == "NULL",
    }
}

/// EIA v2 regional demand client. No span limit, so one paginated sequence
/// per fetch with a 0-based `offset`.
pub struct EiaClient {
    client: HttpClient,
    limiter: RateLimiter,
    endpoint: String,
    api_key: String,
    page_length: usize,
}

impl EiaClient {
    pub fn new(config: &EnergyConfig, client: HttpClient, jitter_ms: u64) -> Self {
        Self {
            client,
            limiter: RateLimiter::new(Duration::from_millis(config.page_delay_ms), jitter_ms),
            endpoint: config.base_url.clone(),
            api_key: config.api_key.clone().unwrap_or_default(),
            page_length: config.page_length,
        }
    }

    fn page_request(&self, region: &str, range: DateRange, offset: usize) -> FetchRequest {
        FetchRequest::get(&self.endpoint)
            .param("api_key", &self.api_key)
            .param("frequency", "daily")
            .param("data[0]", "value")
            .param("facets[respondent][]", region)
            .param("start", range.start)
            .param("end", range.end)
            .param("sort[0][column]", "period")
            .param("sort[0][direction]", "asc")
            .param("offset", offset)
            .param("length", self.page_length)
    }
}

#[async_trait]
impl EnergySource for EiaClient {
    async fn fetch_energy(
        &self,
        region: Option<&str>,
        range: DateRange,
    ) -> Result<Vec<RawEnergyObservation>, FetchError> {
        let region = match region {
            Some(r) if !region_is_skipped(Some(r)) => r.trim(),
            _ => {
                debug!("No usable region code ({:?}); skipping EIA fetch", region);
                return Ok(Vec::new());
            }
        };

        info!("Fetching EIA data for {} from {} to {}", region, range.start, range.end);

        let mut all = Vec::new();
        let mut offset = 0usize;

        loop {
            self.limiter.wait().await;

            let page: Envelope = match self
                .client
                .get_json(&self.page_request(region, range, offset))
                .await
            {
                Ok(p) => p,
                Err(e) => {
                    warn!("EIA fetch for {} abandoned at offset {}: {}", region, offset, e);
                    return Err(e);
                }
            };

            let n = page.response.data.len();
            all.extend(page.response.data);

            if n == 0 || n < self.page_length {
                break;
            }
            offset += n;
        }

        info!("{}: {} energy records", region, all.len());
        Ok(all)
    }
}
