use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::StationInfo;
use crate::error::{NowcastError, Result};
use crate::fetch::{HttpClient, fetch_bytes};
use crate::services::observation_api::{FetchWindow, ObservationSource};
use crate::table::TimeSeriesTable;

/// Pollutants requested from the air-quality API.
pub const AIR_VARIABLES: &[&str] = &[
    "carbon_monoxide",
    "pm10",
    "pm2_5",
    "nitrogen_dioxide",
    "ozone",
    "sulphur_dioxide",
];

/// Weather variables requested from the archive and forecast APIs.
pub const WEATHER_VARIABLES: &[&str] = &[
    "temperature_2m",
    "relative_humidity_2m",
    "dew_point_2m",
    "precipitation",
    "surface_pressure",
    "cloud_cover",
    "wind_speed_10m",
    "wind_direction_10m",
];

#[derive(Deserialize)]
struct HourlyResponse {
    hourly: HourlyBlock,
}

#[derive(Deserialize)]
struct HourlyBlock {
    time: Vec<i64>,
    #[serde(flatten)]
    series: BTreeMap<String, Vec<Option<f64>>>,
}

#[derive(Deserialize)]
struct ErrorBody {
    reason: String,
}

/// One Open-Meteo endpoint queried for a fixed station and variable list.
pub struct OpenMeteoSource {
    client: Arc<dyn HttpClient>,
    name: String,
    endpoint: String,
    variables: Vec<String>,
    latitude: f64,
    longitude: f64,
}

impl OpenMeteoSource {
    pub fn new(
        client: Arc<dyn HttpClient>,
        name: impl Into<String>,
        endpoint: impl Into<String>,
        variables: &[&str],
        station: &StationInfo,
    ) -> Self {
        Self {
            client,
            name: name.into(),
            endpoint: endpoint.into(),
            variables: variables.iter().map(|v| v.to_string()).collect(),
            latitude: station.lat,
            longitude: station.lon,
        }
    }

    pub fn air_quality(client: Arc<dyn HttpClient>, base_url: &str, station: &StationInfo) -> Self {
        Self::new(
            client,
            "air-quality",
            format!("{}/v1/air-quality", base_url.trim_end_matches('/')),
            AIR_VARIABLES,
            station,
        )
    }

    pub fn weather_archive(client: Arc<dyn HttpClient>, base_url: &str, station: &StationInfo) -> Self {
        Self::new(
            client,
            "weather-archive",
            format!("{}/v1/archive", base_url.trim_end_matches('/')),
            WEATHER_VARIABLES,
            station,
        )
    }

    pub fn weather_forecast(client: Arc<dyn HttpClient>, base_url: &str, station: &StationInfo) -> Self {
        Self::new(
            client,
            "weather-forecast",
            format!("{}/v1/forecast", base_url.trim_end_matches('/')),
            WEATHER_VARIABLES,
            station,
        )
    }

    fn request_url(&self, window: &FetchWindow) -> Result<String> {
        let mut params = vec![
            ("latitude", self.latitude.to_string()),
            ("longitude", self.longitude.to_string()),
            ("hourly", self.variables.join(",")),
            ("timeformat", "unixtime".to_string()),
            ("timezone", "GMT".to_string()),
        ];
        params.extend(window.query_pairs());

        reqwest::Url::parse_with_params(&self.endpoint, &params)
            .map(String::from)
            .map_err(|e| NowcastError::fetch(&self.name, format!("invalid endpoint: {e}")))
    }

    fn parse(&self, body: &[u8]) -> Result<TimeSeriesTable> {
        let response: HourlyResponse = serde_json::from_slice(body)
            .map_err(|e| NowcastError::fetch(&self.name, format!("unexpected payload: {e}")))?;
        let HourlyBlock { time, series } = response.hourly;

        for variable in &self.variables {
            if !series.contains_key(variable) {
                warn!(source = %self.name, variable, "Variable missing from response");
            }
        }

        let mut table = TimeSeriesTable::new(self.variables.iter().map(String::as_str));
        for (idx, &unix) in time.iter().enumerate() {
            let ts = DateTime::from_timestamp(unix, 0).ok_or_else(|| {
                NowcastError::fetch(&self.name, format!("timestamp out of range: {unix}"))
            })?;
            let values = self
                .variables
                .iter()
                .map(|v| series.get(v).and_then(|col| col.get(idx).copied().flatten()))
                .collect();
            table.insert_row(ts, values);
        }
        Ok(table)
    }
}

#[async_trait]
impl ObservationSource for OpenMeteoSource {
    fn name(&self) -> &str {
        &self.name
    }

    #[tracing::instrument(skip(self), fields(source = %self.name))]
    async fn fetch(&self, window: &FetchWindow) -> Result<TimeSeriesTable> {
        if window.is_empty() {
            return Ok(TimeSeriesTable::new(self.variables.iter().map(String::as_str)));
        }

        let url = self.request_url(window)?;
        let fetched = fetch_bytes(&self.client, &url).await?;

        if !fetched.status.is_success() {
            let message = match serde_json::from_slice::<ErrorBody>(&fetched.body) {
                Ok(err) => err.reason,
                Err(_) => format!(
                    "status {}: {}",
                    fetched.status,
                    String::from_utf8_lossy(&fetched.body)
                ),
            };
            return Err(NowcastError::fetch(&self.name, message));
        }

        let table = self.parse(&fetched.body)?;
        let table = match window.hour_bounds() {
            Some((start, end)) => table.reindex_hourly(start, end),
            None => table,
        };
        debug!(rows = table.len(), "Fetched hourly series");
        Ok(table)
    }
}
