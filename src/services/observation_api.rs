//! Trait and types for upstream providers of hourly observations.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, TimeDelta, Utc};

use crate::error::Result;
use crate::table::TimeSeriesTable;

/// Which hours a fetch should cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchWindow {
    /// Whole days from `start` through `end`, both inclusive (archive data).
    Range { start: NaiveDate, end: NaiveDate },
    /// Days relative to today (real-time data, including provider forecasts).
    Recent { past_days: u32, forecast_days: u32 },
}

impl FetchWindow {
    /// Query parameters understood by Open-Meteo style APIs.
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        match self {
            Self::Range { start, end } => vec![
                ("start_date", start.format("%Y-%m-%d").to_string()),
                ("end_date", end.format("%Y-%m-%d").to_string()),
            ],
            Self::Recent {
                past_days,
                forecast_days,
            } => vec![
                ("past_days", past_days.to_string()),
                ("forecast_days", forecast_days.to_string()),
            ],
        }
    }

    /// First and last hour covered by a `Range`; `None` for `Recent`.
    pub fn hour_bounds(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        match self {
            Self::Range { start, end } => {
                let first = start.and_time(NaiveTime::MIN).and_utc();
                let last = end.and_time(NaiveTime::MIN).and_utc() + TimeDelta::hours(23);
                Some((first, last))
            }
            Self::Recent { .. } => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Range { start, end } if start > end)
    }
}

/// Abstraction over a provider of hourly series for one station.
#[async_trait]
pub trait ObservationSource: Send + Sync {
    /// Short name used in logs and warnings.
    fn name(&self) -> &str;

    /// Fetches the hourly series for `window`, one column per variable.
    async fn fetch(&self, window: &FetchWindow) -> Result<TimeSeriesTable>;
}
