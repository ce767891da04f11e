//! Station data: cached CSV history merged with freshly fetched series.
//!
//! [`StationStore::current`] serves a merged view cached for a short TTL.
//! Building it fetches the archive gap (end of the cached CSVs up to
//! yesterday) and the real-time window, then merges base → archive →
//! real-time. A failed fetch never fails the build: the previous good view
//! stands in for the missing part and a warning is recorded.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use moka::future::Cache;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::{Settings, StationInfo};
use crate::error::{NowcastError, Result};
use crate::fetch::HttpClient;
use crate::infra::openmeteo::OpenMeteoSource;
use crate::merge::merge_tables;
use crate::models::TARGET_COLUMN;
use crate::services::observation_api::{FetchWindow, ObservationSource};
use crate::table::{TimeSeriesTable, floor_hour};

pub const TEMPERATURE_COLUMN: &str = "temperature_2m";
pub const HUMIDITY_COLUMN: &str = "relative_humidity_2m";
pub const WIND_COLUMN: &str = "wind_speed_10m";

/// Real-time window: the last days of observations plus provider forecasts.
const LIVE_WINDOW: FetchWindow = FetchWindow::Recent {
    past_days: 2,
    forecast_days: 1,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurrentConditions {
    pub pm25: f64,
    pub temperature: Option<f64>,
    pub relative_humidity: Option<f64>,
    pub wind_speed: Option<f64>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryPoint {
    pub timestamp: DateTime<Utc>,
    pub pm25: Option<f64>,
}

/// Merged air and weather tables at one point in time.
#[derive(Debug, Clone, Default)]
pub struct StationData {
    pub air: TimeSeriesTable,
    pub weather: TimeSeriesTable,
    pub refreshed_at: DateTime<Utc>,
    pub warnings: Vec<String>,
}

impl StationData {
    /// Latest hour with a PM2.5 reading.
    pub fn last_observed(&self) -> Option<DateTime<Utc>> {
        self.air.last_observed(TARGET_COLUMN).map(|(ts, _)| ts)
    }

    /// Air rows joined with the weather observed at the same hours.
    pub fn model_frame(&self) -> TimeSeriesTable {
        self.air.left_join(&self.weather)
    }

    pub fn current_conditions(&self) -> Result<CurrentConditions> {
        let (last_updated, pm25) = self.air.last_observed(TARGET_COLUMN).ok_or_else(|| {
            NowcastError::InvalidData("no PM2.5 observations available".into())
        })?;
        let observed_weather = self.weather.truncate_after(last_updated);
        let latest = |column: &str| observed_weather.last_observed(column).map(|(_, v)| v);

        Ok(CurrentConditions {
            pm25,
            temperature: latest(TEMPERATURE_COLUMN),
            relative_humidity: latest(HUMIDITY_COLUMN),
            wind_speed: latest(WIND_COLUMN),
            last_updated,
        })
    }

    /// PM2.5 for the trailing `hours` up to the last observation.
    pub fn history(&self, hours: usize) -> Vec<HistoryPoint> {
        let Some(last) = self.last_observed() else {
            return Vec::new();
        };
        let idx = self.air.column_index(TARGET_COLUMN);
        self.air
            .truncate_after(last)
            .tail(hours)
            .iter()
            .map(|(timestamp, row)| HistoryPoint {
                timestamp,
                pm25: idx.and_then(|i| row[i]),
            })
            .collect()
    }
}

/// Upstream sources used to extend the cached CSVs.
#[derive(Clone)]
pub struct LiveSources {
    pub air: Arc<dyn ObservationSource>,
    pub weather_archive: Arc<dyn ObservationSource>,
    pub weather_forecast: Arc<dyn ObservationSource>,
}

impl LiveSources {
    pub fn open_meteo(client: Arc<dyn HttpClient>, settings: &Settings, station: &StationInfo) -> Self {
        let endpoints = &settings.endpoints;
        Self {
            air: Arc::new(OpenMeteoSource::air_quality(
                client.clone(),
                &endpoints.air_quality,
                station,
            )),
            weather_archive: Arc::new(OpenMeteoSource::weather_archive(
                client.clone(),
                &endpoints.archive,
                station,
            )),
            weather_forecast: Arc::new(OpenMeteoSource::weather_forecast(
                client,
                &endpoints.forecast,
                station,
            )),
        }
    }
}

pub struct StationStore {
    station: StationInfo,
    base_air: TimeSeriesTable,
    base_weather: TimeSeriesTable,
    sources: Option<LiveSources>,
    archive_lookback_days: i64,
    live: Cache<(), Arc<StationData>>,
    last_good: RwLock<Option<Arc<StationData>>>,
}

/// Reads a cached CSV, treating a missing file as an empty table.
fn load_base(path: &Path) -> Result<TimeSeriesTable> {
    if !path.exists() {
        warn!(path = %path.display(), "Cached CSV not found, starting empty");
        return Ok(TimeSeriesTable::default());
    }
    TimeSeriesTable::from_csv_path(path)
}

fn collect(
    source: &dyn ObservationSource,
    result: Result<TimeSeriesTable>,
    warnings: &mut Vec<String>,
) -> Option<TimeSeriesTable> {
    match result {
        Ok(table) => Some(table),
        Err(e) => {
            warn!(source = source.name(), error = %e, "Fetch failed, using last good data");
            warnings.push(format!("Could not refresh {} data: {e}", source.name()));
            None
        }
    }
}

impl StationStore {
    pub fn new(
        station: StationInfo,
        base_air: TimeSeriesTable,
        base_weather: TimeSeriesTable,
        sources: Option<LiveSources>,
        live_ttl: Duration,
        archive_lookback_days: i64,
    ) -> Self {
        Self {
            station,
            base_air,
            base_weather,
            sources,
            archive_lookback_days,
            live: Cache::builder()
                .max_capacity(1)
                .time_to_live(live_ttl)
                .build(),
            last_good: RwLock::new(None),
        }
    }

    /// Loads station info and cached CSVs from `settings.data_dir`; live
    /// sources are attached when `settings.live_fetch` is on.
    #[tracing::instrument(skip_all, fields(data_dir = %settings.data_dir.display()))]
    pub fn load(settings: &Settings, client: Arc<dyn HttpClient>) -> Result<Self> {
        let info_path = settings.info_path();
        let station = if info_path.exists() {
            StationInfo::load(&info_path)?
        } else {
            warn!(path = %info_path.display(), "Station info not found, using default station");
            StationInfo::default()
        };

        let base_air = load_base(&settings.air_csv())?;
        let base_weather = load_base(&settings.weather_csv())?;
        info!(
            air_rows = base_air.len(),
            weather_rows = base_weather.len(),
            live = settings.live_fetch,
            "Station data loaded"
        );

        let sources = settings
            .live_fetch
            .then(|| LiveSources::open_meteo(client, settings, &station));

        Ok(Self::new(
            station,
            base_air,
            base_weather,
            sources,
            settings.live_ttl,
            settings.archive_lookback_days,
        ))
    }

    pub fn station(&self) -> &StationInfo {
        &self.station
    }

    /// Days between the end of `base` and yesterday, bounded by the lookback.
    fn archive_window(&self, base: &TimeSeriesTable, today: NaiveDate) -> FetchWindow {
        let end = today - TimeDelta::days(1);
        let earliest = today - TimeDelta::days(self.archive_lookback_days.max(0));
        let start = base
            .last_timestamp()
            .map(|ts| ts.date_naive())
            .map_or(earliest, |d| d.max(earliest));
        FetchWindow::Range { start, end }
    }

    /// Merged view, rebuilt at most once per TTL.
    pub async fn current(&self) -> Arc<StationData> {
        self.live.get_with((), self.build()).await
    }

    /// Drops the cached view and rebuilds it.
    pub async fn refresh(&self) -> Arc<StationData> {
        self.live.invalidate(&()).await;
        self.current().await
    }

    #[tracing::instrument(skip(self))]
    async fn build(&self) -> Arc<StationData> {
        let now = Utc::now();
        let Some(sources) = &self.sources else {
            return Arc::new(StationData {
                air: self.base_air.clone(),
                weather: self.base_weather.clone(),
                refreshed_at: now,
                warnings: Vec::new(),
            });
        };

        // The cached CSVs may end on different days.
        let air_window = self.archive_window(&self.base_air, now.date_naive());
        let weather_window = self.archive_window(&self.base_weather, now.date_naive());
        let (air_archive, air_live, weather_archive, weather_live) = tokio::join!(
            sources.air.fetch(&air_window),
            sources.air.fetch(&LIVE_WINDOW),
            sources.weather_archive.fetch(&weather_window),
            sources.weather_forecast.fetch(&LIVE_WINDOW),
        );

        let mut warnings = Vec::new();
        let air_archive = collect(sources.air.as_ref(), air_archive, &mut warnings);
        // Air quality rows past the current hour are provider model output.
        let air_live = collect(sources.air.as_ref(), air_live, &mut warnings)
            .map(|t| t.truncate_after(floor_hour(now)));
        let weather_archive =
            collect(sources.weather_archive.as_ref(), weather_archive, &mut warnings);
        let weather_live =
            collect(sources.weather_forecast.as_ref(), weather_live, &mut warnings);

        let previous = self.last_good.read().await.clone();
        let (air_start, weather_start) = match (&previous, warnings.is_empty()) {
            (Some(prev), false) => (&prev.air, &prev.weather),
            _ => (&self.base_air, &self.base_weather),
        };

        let data = Arc::new(StationData {
            air: merge_tables(air_start, air_archive.iter().chain(air_live.iter())),
            weather: merge_tables(
                weather_start,
                weather_archive.iter().chain(weather_live.iter()),
            ),
            refreshed_at: now,
            warnings,
        });

        info!(
            air_rows = data.air.len(),
            weather_rows = data.weather.len(),
            last_observed = ?data.last_observed(),
            warnings = data.warnings.len(),
            "Station data rebuilt"
        );
        *self.last_good.write().await = Some(data.clone());
        data
    }
}


#[cfg(test)]
mod tests {
    use super::testing::StaticSource;
    use super::*;

    fn hours_ago(h: i64) -> DateTime<Utc> {
        floor_hour(Utc::now()) - TimeDelta::hours(h)
    }

    fn air(rows: &[(i64, f64)]) -> TimeSeriesTable {
        let mut t = TimeSeriesTable::new([TARGET_COLUMN]);
        for (h, v) in rows {
            t.insert_row(hours_ago(*h), vec![Some(*v)]);
        }
        t
    }

    fn weather(rows: &[(i64, f64)]) -> TimeSeriesTable {
        let mut t = TimeSeriesTable::new([TEMPERATURE_COLUMN, HUMIDITY_COLUMN, WIND_COLUMN]);
        for (h, v) in rows {
            t.insert_row(hours_ago(*h), vec![Some(*v), Some(70.0), Some(2.5)]);
        }
        t
    }

    fn store(
        air_source: Arc<StaticSource>,
        weather_source: Arc<StaticSource>,
    ) -> StationStore {
        StationStore::new(
            StationInfo::default(),
            air(&[(5, 30.0), (4, 31.0), (3, 32.0)]),
            weather(&[(5, 20.0), (4, 21.0), (3, 22.0)]),
            Some(LiveSources {
                air: air_source,
                weather_archive: weather_source.clone(),
                weather_forecast: weather_source,
            }),
            Duration::from_secs(300),
            30,
        )
    }

    #[tokio::test]
    async fn test_live_rows_override_base_and_future_air_is_dropped() {
        let live_air = air(&[(3, 40.0), (1, 42.0), (-2, 99.0)]);
        let live_weather = weather(&[(1, 23.0), (-2, 25.0)]);
        let store = store(
            StaticSource::ok("air", live_air),
            StaticSource::ok("weather", live_weather),
        );

        let data = store.current().await;
        assert!(data.warnings.is_empty());
        assert_eq!(data.air.get(hours_ago(3), TARGET_COLUMN), Some(40.0));
        assert_eq!(data.air.get(hours_ago(5), TARGET_COLUMN), Some(30.0));
        assert_eq!(data.air.row(hours_ago(-2)), None);
        assert_eq!(data.weather.get(hours_ago(-2), TEMPERATURE_COLUMN), Some(25.0));
        assert_eq!(data.last_observed(), Some(hours_ago(1)));
    }

    #[tokio::test]
    async fn test_failed_fetch_degrades_with_warning() {
        let store = store(
            StaticSource::failing("air"),
            StaticSource::ok("weather", weather(&[(1, 23.0)])),
        );

        let data = store.current().await;
        assert_eq!(data.warnings.len(), 2);
        assert!(data.warnings[0].contains("air"));
        assert_eq!(data.last_observed(), Some(hours_ago(3)));
        assert_eq!(data.weather.get(hours_ago(1), TEMPERATURE_COLUMN), Some(23.0));
    }

    #[tokio::test]
    async fn test_view_is_cached_until_refresh() {
        let air_source = StaticSource::ok("air", air(&[(1, 42.0)]));
        let store = store(air_source.clone(), StaticSource::ok("weather", weather(&[])));

        store.current().await;
        store.current().await;
        assert_eq!(air_source.calls(), 2);

        store.refresh().await;
        assert_eq!(air_source.calls(), 4);
    }

    #[tokio::test]
    async fn test_without_sources_serves_base() {
        let store = StationStore::new(
            StationInfo::default(),
            air(&[(2, 12.0)]),
            weather(&[(2, 19.0)]),
            None,
            Duration::from_secs(300),
            30,
        );
        let data = store.current().await;
        assert_eq!(data.last_observed(), Some(hours_ago(2)));
        assert!(data.warnings.is_empty());
    }

    #[test]
    fn test_current_conditions_ignore_future_weather() {
        let data = StationData {
            air: air(&[(3, 30.0), (2, 35.5)]),
            weather: weather(&[(3, 20.0), (2, 21.0), (-1, 30.0)]),
            refreshed_at: Utc::now(),
            warnings: Vec::new(),
        };
        let conditions = data.current_conditions().unwrap();
        assert_eq!(conditions.pm25, 35.5);
        assert_eq!(conditions.temperature, Some(21.0));
        assert_eq!(conditions.relative_humidity, Some(70.0));
        assert_eq!(conditions.last_updated, hours_ago(2));

        assert!(StationData::default().current_conditions().is_err());
    }

    #[test]
    fn test_history_slice() {
        let rows: Vec<(i64, f64)> = (1..=100).map(|h| (h, h as f64)).collect();
        let data = StationData {
            air: air(&rows),
            ..StationData::default()
        };
        let history = data.history(48);
        assert_eq!(history.len(), 48);
        assert_eq!(history.last().unwrap().timestamp, hours_ago(1));
        assert_eq!(history.first().unwrap().pm25, Some(48.0));
    }

    #[test]
    fn test_archive_window_bounded_by_lookback() {
        let store = StationStore::new(
            StationInfo::default(),
            TimeSeriesTable::default(),
            TimeSeriesTable::default(),
            None,
            Duration::from_secs(1),
            7,
        );
        let today = NaiveDate::from_ymd_opt(2025, 12, 10).unwrap();
        assert_eq!(
            store.archive_window(&TimeSeriesTable::default(), today),
            FetchWindow::Range {
                start: NaiveDate::from_ymd_opt(2025, 12, 3).unwrap(),
                end: NaiveDate::from_ymd_opt(2025, 12, 9).unwrap(),
            }
        );
    }

    #[tokio::test]
    async fn test_weather_archive_starts_where_cached_weather_ends() {
        let day = |d: i64| Utc::now().date_naive() - TimeDelta::days(d);
        let at_noon = |d: i64| {
            day(d)
                .and_hms_opt(12, 0, 0)
                .unwrap()
                .and_utc()
        };
        let mut base_air = TimeSeriesTable::new([TARGET_COLUMN]);
        base_air.insert_row(at_noon(2), vec![Some(30.0)]);
        let mut base_weather = TimeSeriesTable::new([TEMPERATURE_COLUMN]);
        base_weather.insert_row(at_noon(6), vec![Some(20.0)]);

        let air_source = StaticSource::ok("air", air(&[]));
        let archive_source = StaticSource::ok("weather archive", weather(&[]));
        let store = StationStore::new(
            StationInfo::default(),
            base_air,
            base_weather,
            Some(LiveSources {
                air: air_source.clone(),
                weather_archive: archive_source.clone(),
                weather_forecast: StaticSource::ok("weather forecast", weather(&[])),
            }),
            Duration::from_secs(300),
            30,
        );
        store.current().await;

        assert_eq!(
            air_source.archive_windows(),
            vec![FetchWindow::Range {
                start: day(2),
                end: day(1)
            }]
        );
        assert_eq!(
            archive_source.archive_windows(),
            vec![FetchWindow::Range {
                start: day(6),
                end: day(1)
            }]
        );
    }
}
