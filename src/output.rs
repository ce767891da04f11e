//! Output formatting and persistence for forecasts.
//!
//! Supports the forecast table export, pretty JSON logging, and appending
//! issued forecasts to a CSV log.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use csv::WriterBuilder;
use serde::Serialize;
use tracing::{debug, info};

use crate::aqi::AqiCategory;
use crate::error::Result;
use crate::models::{ForecastResult, ModelKind, ModelOrigin};

const TABLE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M";

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// One row of the forecast table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForecastRow {
    #[serde(rename = "Time")]
    pub time: String,
    #[serde(rename = "PM2.5 (μg/m³)")]
    pub pm25: f64,
    #[serde(rename = "Lower Bound")]
    pub lower: f64,
    #[serde(rename = "Upper Bound")]
    pub upper: f64,
    #[serde(rename = "AQI Category")]
    pub category: AqiCategory,
}

/// Table rows, values rounded to two decimals. The category follows the
/// rounded concentration.
pub fn forecast_rows(forecast: &ForecastResult) -> Vec<ForecastRow> {
    forecast
        .points
        .iter()
        .map(|point| {
            let pm25 = round2(point.mean);
            ForecastRow {
                time: point.timestamp.format(TABLE_TIME_FORMAT).to_string(),
                pm25,
                lower: round2(point.lower),
                upper: round2(point.upper),
                category: AqiCategory::classify(pm25.max(0.0)),
            }
        })
        .collect()
}

/// Writes the forecast table as CSV.
pub fn write_forecast_csv<W: Write>(writer: W, forecast: &ForecastResult) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);
    for row in forecast_rows(forecast) {
        wtr.serialize(row)?;
    }
    wtr.flush()?;
    Ok(())
}

/// Suggested download name for an export issued at `now`.
pub fn export_file_name(now: DateTime<Utc>) -> String {
    format!("hanoi_pm25_forecast_{}.csv", now.format("%Y%m%d_%H%M"))
}

/// Logs a serializable value as pretty-printed JSON.
pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    info!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// A forecast hour as recorded in the forecast log.
#[derive(Debug, Clone, Serialize)]
struct ForecastRecord {
    issued_at: DateTime<Utc>,
    model: ModelKind,
    refit: bool,
    step: usize,
    timestamp: DateTime<Utc>,
    mean: f64,
    lower: f64,
    upper: f64,
    category: AqiCategory,
}

/// Appends every hour of `forecast` as a row to a CSV file.
///
/// Creates the file with headers if it does not already exist.
pub fn append_forecast(path: &Path, forecast: &ForecastResult, issued_at: DateTime<Utc>) -> Result<()> {
    let file_exists = path.exists();
    debug!(path = %path.display(), file_exists, "Appending forecast records");

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().append(true).create(true).open(path)?;

    let mut writer = WriterBuilder::new()
        .has_headers(!file_exists)
        .from_writer(file);

    for (step, point) in forecast.points.iter().enumerate() {
        writer.serialize(ForecastRecord {
            issued_at,
            model: forecast.model,
            refit: matches!(forecast.origin, ModelOrigin::Refit { .. }),
            step: step + 1,
            timestamp: point.timestamp,
            mean: point.mean,
            lower: point.lower,
            upper: point.upper,
            category: AqiCategory::classify(point.mean.max(0.0)),
        })?;
    }
    writer.flush()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ForecastPoint;
    use chrono::{TimeDelta, TimeZone};
    use std::env;
    use std::fs;
    use std::path::PathBuf;

    fn temp_path(name: &str) -> PathBuf {
        env::temp_dir().join(format!("{}_{}", std::process::id(), name))
    }

    fn forecast() -> ForecastResult {
        let start = Utc.with_ymd_and_hms(2025, 12, 7, 9, 0, 0).unwrap();
        ForecastResult {
            model: ModelKind::Ets,
            origin: ModelOrigin::Pretrained,
            confidence_level: 0.95,
            points: [24.996, 51.234, 95.0]
                .iter()
                .enumerate()
                .map(|(i, &mean)| ForecastPoint {
                    timestamp: start + TimeDelta::hours(i as i64 + 1),
                    mean,
                    lower: mean - 4.0,
                    upper: mean + 4.0,
                })
                .collect(),
        }
    }

    #[test]
    fn test_forecast_rows_round_and_classify() {
        let rows = forecast_rows(&forecast());
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].time, "2025-12-07 10:00");
        assert_eq!(rows[0].pm25, 25.0);
        assert_eq!(rows[0].category, AqiCategory::Good);
        assert_eq!(rows[1].lower, 47.23);
        assert_eq!(rows[2].category, AqiCategory::Unhealthy);
    }

    #[test]
    fn test_forecast_csv_has_table_headers() {
        let mut out = Vec::new();
        write_forecast_csv(&mut out, &forecast()).unwrap();
        let text = String::from_utf8(out).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("Time,PM2.5 (μg/m³),Lower Bound,Upper Bound,AQI Category")
        );
        assert_eq!(lines.next(), Some("2025-12-07 10:00,25.0,21.0,29.0,Good"));
        assert_eq!(text.lines().count(), 4);
    }

    #[test]
    fn test_export_file_name() {
        let now = Utc.with_ymd_and_hms(2025, 12, 7, 9, 5, 0).unwrap();
        assert_eq!(export_file_name(now), "hanoi_pm25_forecast_20251207_0905.csv");
    }

    #[test]
    fn test_print_json_does_not_panic() {
        print_json(&forecast()).unwrap();
    }

    #[test]
    fn test_append_forecast_writes_header_once() {
        let path = temp_path("aq_nowcast_test_header.csv");
        let _ = fs::remove_file(&path);

        let issued = Utc::now();
        append_forecast(&path, &forecast(), issued).unwrap();
        append_forecast(&path, &forecast(), issued).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let header_count = content.lines().filter(|l| l.starts_with("issued_at")).count();
        assert_eq!(header_count, 1);
        // 1 header + 2 × 3 forecast hours
        assert_eq!(content.lines().count(), 7);

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_append_forecast_creates_parent_dir() {
        let dir = temp_path("aq_nowcast_test_dir");
        let _ = fs::remove_dir_all(&dir);
        let path = dir.join("forecasts.csv");

        append_forecast(&path, &forecast(), Utc::now()).unwrap();
        assert!(path.exists());

        fs::remove_dir_all(&dir).unwrap();
    }
}
