//! Forecasting models for the PM2.5 series.
//!
//! Four model families are supported, each behind a variant of
//! [`FittedModel`]:
//!
//! - **ETS**: `augurs` exponential smoothing, damped trend allowed (univariate)
//! - **ARIMA**: autoregressive integrated moving average (univariate)
//! - **ARIMAX**: ARIMA with weather regressors
//! - **VAR**: vector autoregression over pollutants and weather
//!
//! A fitted model carries the [`ModelSpec`] it was estimated with, so a
//! persisted model can be refit on fresh data with identical settings.

pub mod arima;
pub mod ets;
pub mod linalg;
pub mod registry;
pub mod var;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, NowcastError};
use crate::table::TimeSeriesTable;

pub use arima::{ArimaModel, ArimaSpec, ArimaxModel, ArimaxSpec};
pub use ets::{EtsModel, EtsSpec};
pub use registry::{ModelHandle, ModelInfo, ModelRegistry};
pub use var::{VarModel, VarSpec};

/// Column forecast by every model.
pub const TARGET_COLUMN: &str = "pm2_5";
/// Longest supported forecast horizon, in hours.
pub const MAX_HORIZON: usize = 6;
/// Two-sided 95% normal quantile.
pub const Z_95: f64 = 1.959_963_984_540_054;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ModelKind {
    Ets,
    Arima,
    Arimax,
    Var,
}

impl ModelKind {
    pub const ALL: [ModelKind; 4] = [
        ModelKind::Ets,
        ModelKind::Arima,
        ModelKind::Arimax,
        ModelKind::Var,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Ets => "ETS",
            Self::Arima => "ARIMA",
            Self::Arimax => "ARIMAX",
            Self::Var => "VAR",
        }
    }

    /// Directory holding this kind's artifact.
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Ets => "ets",
            Self::Arima => "arima",
            Self::Arimax => "arimax",
            Self::Var => "var",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Ets => "Exponential Smoothing (univariate)",
            Self::Arima => "AutoRegressive Integrated Moving Average",
            Self::Arimax => "ARIMA with weather features",
            Self::Var => "Vector AutoRegression over pollutants and weather",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ModelKind {
    type Err = NowcastError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| NowcastError::UnknownModel(s.to_string()))
    }
}

/// Number of hourly steps to forecast, within `1..=MAX_HORIZON`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Horizon(usize);

impl Horizon {
    pub fn new(steps: usize) -> Result<Self, NowcastError> {
        if (1..=MAX_HORIZON).contains(&steps) {
            Ok(Self(steps))
        } else {
            Err(NowcastError::InvalidHorizon {
                requested: steps,
                max: MAX_HORIZON,
            })
        }
    }

    pub fn get(self) -> usize {
        self.0
    }
}

impl Default for Horizon {
    fn default() -> Self {
        Self(MAX_HORIZON)
    }
}

/// Where the model behind a forecast came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelOrigin {
    Pretrained,
    Refit { fitted_at: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForecastPoint {
    pub timestamp: DateTime<Utc>,
    pub mean: f64,
    pub lower: f64,
    pub upper: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForecastResult {
    pub model: ModelKind,
    pub origin: ModelOrigin,
    pub confidence_level: f64,
    pub points: Vec<ForecastPoint>,
}

impl ForecastResult {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn next_hour(&self) -> Option<&ForecastPoint> {
        self.points.first()
    }
}

/// Point forecasts with their standard errors, on the original scale.
#[derive(Debug, Clone, PartialEq)]
pub struct PointForecast {
    pub mean: Vec<f64>,
    pub std_err: Vec<f64>,
}

/// Bookkeeping shared by every fitted model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitSummary {
    pub fitted_at: DateTime<Utc>,
    /// Last timestamp of the training data; forecasts start one hour later.
    pub last_timestamp: DateTime<Utc>,
    pub observations: usize,
    pub sigma2: f64,
}

/// Common behaviour of the concrete fitted models.
pub trait Forecaster {
    fn summary(&self) -> &FitSummary;

    /// Forecasts `steps` hours past the end of the training data.
    ///
    /// `context` holds rows observed after training (e.g. weather forecasts)
    /// that models with exogenous inputs may read.
    fn forecast_steps(
        &self,
        steps: usize,
        context: Option<&TimeSeriesTable>,
    ) -> Result<PointForecast, ModelError>;
}

/// Estimation settings for one model variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "UPPERCASE")]
pub enum ModelSpec {
    Ets(EtsSpec),
    Arima(ArimaSpec),
    Arimax(ArimaxSpec),
    Var(VarSpec),
}

impl ModelSpec {
    /// Default settings used when training from scratch.
    pub fn default_for(kind: ModelKind) -> Self {
        match kind {
            ModelKind::Ets => Self::Ets(EtsSpec::default()),
            ModelKind::Arima => Self::Arima(ArimaSpec::default()),
            ModelKind::Arimax => Self::Arimax(ArimaxSpec::default()),
            ModelKind::Var => Self::Var(VarSpec::default()),
        }
    }

    pub fn kind(&self) -> ModelKind {
        match self {
            Self::Ets(_) => ModelKind::Ets,
            Self::Arima(_) => ModelKind::Arima,
            Self::Arimax(_) => ModelKind::Arimax,
            Self::Var(_) => ModelKind::Var,
        }
    }

    /// Fits the model on the trailing `window` hours of `data`.
    pub fn fit(&self, data: &TimeSeriesTable, window: usize) -> Result<FittedModel, ModelError> {
        if window == 0 {
            return Err(ModelError::InvalidParameter {
                name: "window".into(),
                reason: "fit window must be at least one hour".into(),
            });
        }
        Ok(match self {
            Self::Ets(spec) => FittedModel::Ets(EtsModel::fit(spec, data, window)?),
            Self::Arima(spec) => FittedModel::Arima(ArimaModel::fit(spec, data, window)?),
            Self::Arimax(spec) => FittedModel::Arimax(ArimaxModel::fit(spec, data, window)?),
            Self::Var(spec) => FittedModel::Var(VarModel::fit(spec, data, window)?),
        })
    }
}

/// Training rows for `target`: trailing unobserved hours dropped, then the
/// last `window` rows kept.
pub(crate) fn training_frame(
    data: &TimeSeriesTable,
    target: &str,
    window: usize,
) -> Result<(TimeSeriesTable, DateTime<Utc>), ModelError> {
    let frame = data.trim_trailing_missing(target).tail(window);
    let last = frame
        .last_timestamp()
        .ok_or_else(|| ModelError::MissingColumn(target.to_string()))?;
    Ok((frame, last))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "UPPERCASE")]
pub enum FittedModel {
    Ets(EtsModel),
    Arima(ArimaModel),
    Arimax(ArimaxModel),
    Var(VarModel),
}

impl FittedModel {
    pub fn kind(&self) -> ModelKind {
        match self {
            Self::Ets(_) => ModelKind::Ets,
            Self::Arima(_) => ModelKind::Arima,
            Self::Arimax(_) => ModelKind::Arimax,
            Self::Var(_) => ModelKind::Var,
        }
    }

    pub fn spec(&self) -> ModelSpec {
        match self {
            Self::Ets(m) => ModelSpec::Ets(m.spec.clone()),
            Self::Arima(m) => ModelSpec::Arima(m.spec.clone()),
            Self::Arimax(m) => ModelSpec::Arimax(m.spec.clone()),
            Self::Var(m) => ModelSpec::Var(m.spec.clone()),
        }
    }

    fn forecaster(&self) -> &dyn Forecaster {
        match self {
            Self::Ets(m) => m,
            Self::Arima(m) => m,
            Self::Arimax(m) => m,
            Self::Var(m) => m,
        }
    }

    pub fn summary(&self) -> &FitSummary {
        self.forecaster().summary()
    }

    pub fn last_timestamp(&self) -> DateTime<Utc> {
        self.summary().last_timestamp
    }

    /// Forecasts `horizon` hours with 95% bounds.
    ///
    /// Timestamps start one hour after the training data ends.
    pub fn forecast(
        &self,
        horizon: Horizon,
        origin: ModelOrigin,
        context: Option<&TimeSeriesTable>,
    ) -> Result<ForecastResult, ModelError> {
        let steps = horizon.get();
        let raw = self.forecaster().forecast_steps(steps, context)?;
        if raw.mean.len() != steps || raw.std_err.len() != steps {
            return Err(ModelError::NumericalError(format!(
                "{} produced {} values for {steps} steps",
                self.kind(),
                raw.mean.len()
            )));
        }
        if raw
            .mean
            .iter()
            .chain(&raw.std_err)
            .any(|v| !v.is_finite())
        {
            return Err(ModelError::ConvergenceFailure(format!(
                "{} forecast is not finite",
                self.kind()
            )));
        }

        let last = self.last_timestamp();
        let points = raw
            .mean
            .into_iter()
            .zip(raw.std_err)
            .enumerate()
            .map(|(h, (mean, se))| {
                let half_width = Z_95 * se.abs();
                ForecastPoint {
                    timestamp: last + TimeDelta::hours(h as i64 + 1),
                    mean,
                    lower: mean - half_width,
                    upper: mean + half_width,
                }
            })
            .collect();

        Ok(ForecastResult {
            model: self.kind(),
            origin,
            confidence_level: 0.95,
            points,
        })
    }
}
