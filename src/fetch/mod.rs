pub mod energy;
pub mod http_client;
pub mod weather;

use crate::models::{DateRange, RawEnergyObservation, RawWeatherObservation};
use async_trait::async_trait;

use self::http_client::FetchError;

pub use self::energy::{region_is_skipped, EiaClient};
pub use self::weather::NoaaClient;

// ── Source traits ─────────────────────────────────────────────────────────────

/// Daily weather observations for one station.
#[async_trait]
pub trait WeatherSource: Send + Sync {
    /// Every observation for `station_id` within `range`, or the first
    /// terminal failure. Never a truncated set.
    async fn fetch_weather(
        &self,
        station_id: &str,
        range: DateRange,
    ) -> Result<Vec<RawWeatherObservation>, FetchError>;
}

/// Electricity demand observations for one balancing region.
#[async_trait]
pub trait EnergySource: Send + Sync {
    /// Every observation for `region` within `range`. A missing or
    /// placeholder region yields an empty result without any request.
    async fn fetch_energy(
        &self,
        region: Option<&str>,
        range: DateRange,
    ) -> Result<Vec<RawEnergyObservation>, FetchError>;
}
