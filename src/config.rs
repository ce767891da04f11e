//! Runtime settings and station metadata.
//!
//! Settings come from environment variables (a `.env` file is loaded by the
//! binary via `dotenvy`), each with a default. Station coordinates come from
//! `<data_dir>/info.json`.

use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{NowcastError, Result};

pub const DEFAULT_AIR_QUALITY_URL: &str = "https://air-quality-api.open-meteo.com";
pub const DEFAULT_ARCHIVE_URL: &str = "https://archive-api.open-meteo.com";
pub const DEFAULT_FORECAST_URL: &str = "https://api.open-meteo.com";

/// The monitoring station being forecast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationInfo {
    #[serde(default = "default_station_name")]
    pub name: String,
    #[serde(alias = "latitude")]
    pub lat: f64,
    #[serde(alias = "longitude")]
    pub lon: f64,
}

fn default_station_name() -> String {
    "Hanoi University of Science and Technology (HUST)".to_string()
}

impl Default for StationInfo {
    fn default() -> Self {
        Self {
            name: default_station_name(),
            lat: 21.0045,
            lon: 105.8433,
        }
    }
}

impl StationInfo {
    #[tracing::instrument(skip_all, fields(path = %path.display()))]
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let info: Self = serde_json::from_str(&raw)?;
        if !(-90.0..=90.0).contains(&info.lat) || !(-180.0..=180.0).contains(&info.lon) {
            return Err(NowcastError::InvalidData(format!(
                "station coordinates out of range: {}, {}",
                info.lat, info.lon
            )));
        }
        debug!(name = %info.name, lat = info.lat, lon = info.lon, "Loaded station info");
        Ok(info)
    }
}

/// Base URLs of the upstream APIs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub air_quality: String,
    pub archive: String,
    pub forecast: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            air_quality: DEFAULT_AIR_QUALITY_URL.to_string(),
            archive: DEFAULT_ARCHIVE_URL.to_string(),
            forecast: DEFAULT_FORECAST_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub model_dir: PathBuf,
    pub host: String,
    pub port: u16,
    /// How long fetched live data is reused.
    pub live_ttl: Duration,
    /// How long a refit model is reused.
    pub refit_ttl: Duration,
    /// Time budget for one refit.
    pub refit_budget: Duration,
    pub refit_enabled: bool,
    /// When off, only the cached CSVs are used.
    pub live_fetch: bool,
    pub fit_window_hours: usize,
    pub archive_lookback_days: i64,
    pub api_key: Option<String>,
    pub endpoints: Endpoints,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            model_dir: PathBuf::from("models"),
            host: "127.0.0.1".to_string(),
            port: 8080,
            live_ttl: Duration::from_secs(300),
            refit_ttl: Duration::from_secs(3600),
            refit_budget: Duration::from_secs(20),
            refit_enabled: true,
            live_fetch: true,
            fit_window_hours: 24 * 30,
            archive_lookback_days: 30,
            api_key: None,
            endpoints: Endpoints::default(),
        }
    }
}

fn parse_var<T: FromStr>(key: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| NowcastError::InvalidData(format!("{key}={raw}: {e}")))
}

fn parse_flag(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(NowcastError::InvalidData(format!(
            "{key}={other}: expected a boolean"
        ))),
    }
}

impl Settings {
    /// Reads settings from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads settings through `lookup`, falling back to defaults for unset
    /// or empty keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut settings = Self::default();

        if let Some(v) = get("DATA_DIR") {
            settings.data_dir = PathBuf::from(v);
        }
        if let Some(v) = get("MODEL_DIR") {
            settings.model_dir = PathBuf::from(v);
        }
        if let Some(v) = get("HOST") {
            settings.host = v;
        }
        if let Some(v) = get("PORT") {
            settings.port = parse_var("PORT", &v)?;
        }
        if let Some(v) = get("LIVE_TTL_SECS") {
            settings.live_ttl = Duration::from_secs(parse_var("LIVE_TTL_SECS", &v)?);
        }
        if let Some(v) = get("REFIT_TTL_SECS") {
            settings.refit_ttl = Duration::from_secs(parse_var("REFIT_TTL_SECS", &v)?);
        }
        if let Some(v) = get("REFIT_BUDGET_SECS") {
            settings.refit_budget = Duration::from_secs(parse_var("REFIT_BUDGET_SECS", &v)?);
        }
        if let Some(v) = get("REFIT_ENABLED") {
            settings.refit_enabled = parse_flag("REFIT_ENABLED", &v)?;
        }
        if let Some(v) = get("LIVE_FETCH") {
            settings.live_fetch = parse_flag("LIVE_FETCH", &v)?;
        }
        if let Some(v) = get("FIT_WINDOW_HOURS") {
            settings.fit_window_hours = parse_var("FIT_WINDOW_HOURS", &v)?;
            if settings.fit_window_hours == 0 {
                return Err(NowcastError::InvalidData(
                    "FIT_WINDOW_HOURS must be positive".into(),
                ));
            }
        }
        if let Some(v) = get("ARCHIVE_LOOKBACK_DAYS") {
            settings.archive_lookback_days = parse_var("ARCHIVE_LOOKBACK_DAYS", &v)?;
        }
        settings.api_key = get("OPEN_METEO_API_KEY");
        if let Some(v) = get("OPEN_METEO_AIR_QUALITY_URL") {
            settings.endpoints.air_quality = v;
        }
        if let Some(v) = get("OPEN_METEO_ARCHIVE_URL") {
            settings.endpoints.archive = v;
        }
        if let Some(v) = get("OPEN_METEO_FORECAST_URL") {
            settings.endpoints.forecast = v;
        }

        Ok(settings)
    }

    pub fn cleaned_dir(&self) -> PathBuf {
        self.data_dir.join("processed").join("cleaned")
    }

    pub fn air_csv(&self) -> PathBuf {
        self.cleaned_dir().join("cleaned_air.csv")
    }

    pub fn weather_csv(&self) -> PathBuf {
        self.cleaned_dir().join("cleaned_weather.csv")
    }

    pub fn info_path(&self) -> PathBuf {
        self.data_dir.join("info.json")
    }

    /// Socket address for `host` and `port`; IPv6 hosts may be bracketed.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        let host = self.host.trim_start_matches('[').trim_end_matches(']');
        let ip: IpAddr = host
            .parse()
            .map_err(|e| NowcastError::InvalidData(format!("bind address '{}': {e}", self.host)))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::net::Ipv6Addr;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let settings = Settings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(
            settings.air_csv(),
            PathBuf::from("data/processed/cleaned/cleaned_air.csv")
        );
        assert_eq!(settings.info_path(), PathBuf::from("data/info.json"));
        assert_eq!(settings.live_ttl, Duration::from_secs(300));
        assert_eq!(settings.refit_budget, Duration::from_secs(20));
    }

    #[test]
    fn test_overrides() {
        let settings = Settings::from_lookup(lookup(&[
            ("DATA_DIR", "/srv/aq"),
            ("PORT", "9000"),
            ("REFIT_ENABLED", "false"),
            ("LIVE_FETCH", "0"),
            ("REFIT_TTL_SECS", "60"),
            ("FIT_WINDOW_HOURS", "168"),
            ("OPEN_METEO_API_KEY", "k"),
            ("OPEN_METEO_ARCHIVE_URL", "http://localhost:1234"),
            ("HOST", ""),
        ]))
        .unwrap();

        assert_eq!(settings.data_dir, PathBuf::from("/srv/aq"));
        assert_eq!(settings.port, 9000);
        assert!(!settings.refit_enabled);
        assert!(!settings.live_fetch);
        assert_eq!(settings.refit_ttl, Duration::from_secs(60));
        assert_eq!(settings.fit_window_hours, 168);
        assert_eq!(settings.api_key.as_deref(), Some("k"));
        assert_eq!(settings.endpoints.archive, "http://localhost:1234");
        assert_eq!(settings.host, "127.0.0.1");
        assert_eq!(settings.bind_addr().unwrap().port(), 9000);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(Settings::from_lookup(lookup(&[("PORT", "http")])).is_err());
        assert!(Settings::from_lookup(lookup(&[("REFIT_ENABLED", "maybe")])).is_err());
        assert!(Settings::from_lookup(lookup(&[("FIT_WINDOW_HOURS", "0")])).is_err());
    }

    #[test]
    fn test_station_info_load() {
        let path = std::env::temp_dir().join(format!("aq_nowcast_info_{}.json", std::process::id()));
        fs::write(&path, r#"{"lat": 21.0045, "lon": 105.8433, "datetime_from": "2024-01-01"}"#)
            .unwrap();
        let info = StationInfo::load(&path).unwrap();
        assert_eq!(info.lat, 21.0045);
        assert_eq!(info.name, default_station_name());

        fs::write(&path, r#"{"latitude": 123.0, "longitude": 0.0}"#).unwrap();
        assert!(matches!(
            StationInfo::load(&path),
            Err(NowcastError::InvalidData(_))
        ));
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_bind_addr_accepts_ipv6() {
        for host in ["::1", "[::1]"] {
            let settings = Settings {
                host: host.to_string(),
                port: 8080,
                ..Settings::default()
            };
            assert_eq!(
                settings.bind_addr().unwrap(),
                SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 8080)
            );
        }

        let named = Settings {
            host: "dashboard.local".to_string(),
            ..Settings::default()
        };
        assert!(matches!(named.bind_addr(), Err(NowcastError::InvalidData(_))));
    }
}
