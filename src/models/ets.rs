//! Exponential smoothing backed by `augurs`.
//!
//! [`AutoETS`] searches additive-error models (no trend, additive trend or
//! damped trend) and keeps the one with the lowest AICc. The fitted state
//! from `augurs` cannot be serialised, so the artifact stores the training
//! window and the search is replayed when forecasting. The search is
//! deterministic, so a reloaded artifact forecasts the same values.

use augurs::Forecast;
use augurs::ets::AutoETS;
use augurs::prelude::*;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{FitSummary, Forecaster, PointForecast, TARGET_COLUMN, Z_95, training_frame};
use crate::error::ModelError;
use crate::table::TimeSeriesTable;

const MIN_OBSERVATIONS: usize = 10;
const INTERVAL_LEVEL: f64 = 0.95;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EtsSpec {
    pub target: String,
    /// Allow trend components. Damping is chosen by the search.
    pub trend: bool,
}

impl Default for EtsSpec {
    fn default() -> Self {
        Self {
            target: TARGET_COLUMN.to_string(),
            trend: true,
        }
    }
}

impl EtsSpec {
    /// `augurs` model search string: error, trend, season.
    fn search_spec(&self) -> &'static str {
        if self.trend { "AZN" } else { "ANN" }
    }

    fn predict(&self, series: &[f64], steps: usize) -> Result<Forecast, ModelError> {
        let mut search = AutoETS::new(1, self.search_spec()).map_err(|e| {
            ModelError::InvalidParameter {
                name: "trend".into(),
                reason: e.to_string(),
            }
        })?;
        let fitted = search
            .fit(series)
            .map_err(|e| ModelError::ConvergenceFailure(format!("ETS fit: {e}")))?;
        fitted
            .predict(steps, INTERVAL_LEVEL)
            .map_err(|e| ModelError::ConvergenceFailure(format!("ETS predict: {e}")))
    }
}

/// Standard errors implied by symmetric 95% prediction intervals.
fn standard_errors(forecast: &Forecast) -> Result<Vec<f64>, ModelError> {
    let intervals = forecast.intervals.as_ref().ok_or_else(|| {
        ModelError::ConvergenceFailure("ETS forecast has no prediction intervals".into())
    })?;
    Ok(intervals
        .lower
        .iter()
        .zip(&intervals.upper)
        .map(|(lower, upper)| (upper - lower) / (2.0 * Z_95))
        .collect())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtsModel {
    pub spec: EtsSpec,
    /// Training window, oldest first.
    pub series: Vec<f64>,
    pub summary: FitSummary,
}

impl EtsModel {
    pub fn fit(spec: &EtsSpec, data: &TimeSeriesTable, window: usize) -> Result<Self, ModelError> {
        let (frame, last_timestamp) = training_frame(data, &spec.target, window)?;
        let series = frame.filled_column(&spec.target)?;
        if series.len() < MIN_OBSERVATIONS {
            return Err(ModelError::InsufficientData {
                required: MIN_OBSERVATIONS,
                actual: series.len(),
            });
        }

        let one_step = spec.predict(&series, 1)?;
        let std_err = standard_errors(&one_step)?;
        let sigma2 = std_err.first().map_or(0.0, |se| se * se);
        if !sigma2.is_finite() {
            return Err(ModelError::ConvergenceFailure(
                "ETS fit produced a non-finite variance".into(),
            ));
        }
        debug!(observations = series.len(), sigma2, "ETS fitted");

        Ok(Self {
            spec: spec.clone(),
            summary: FitSummary {
                fitted_at: Utc::now(),
                last_timestamp,
                observations: series.len(),
                sigma2,
            },
            series,
        })
    }
}

impl Forecaster for EtsModel {
    fn summary(&self) -> &FitSummary {
        &self.summary
    }

    fn forecast_steps(
        &self,
        steps: usize,
        _context: Option<&TimeSeriesTable>,
    ) -> Result<PointForecast, ModelError> {
        let forecast = self.spec.predict(&self.series, steps)?;
        let std_err = standard_errors(&forecast)?;
        Ok(PointForecast {
            mean: forecast.point,
            std_err,
        })
    }
}
