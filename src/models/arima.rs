//! ARIMA(p, d, q) and ARIMAX estimated with the Hannan–Rissanen procedure.
//!
//! The series is differenced `d` times. A long autoregression on the
//! differenced series supplies residual estimates, which then act as the
//! moving-average regressors in a second least-squares pass:
//!
//! ```text
//! w_t = c + Σ φ_i w_{t-i} + Σ θ_j e_{t-j} + Σ β_k x_{k,t} + e_t
//! ```
//!
//! Forecasts are produced on the differenced scale and integrated back.
//! Prediction variance uses the ψ-weights of `φ(B)(1 − B)^d`.

use chrono::{TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use super::linalg::{self, difference, dot};
use super::{FitSummary, Forecaster, PointForecast, TARGET_COLUMN, training_frame};
use crate::error::ModelError;
use crate::table::TimeSeriesTable;

/// Weather regressors used by the default ARIMAX.
pub const DEFAULT_EXOG: [&str; 3] = ["temperature_2m", "relative_humidity_2m", "wind_speed_10m"];

const MAX_DIFFERENCING: usize = 2;
const MAX_ORDER: usize = 24;
const LONG_AR_MIN: usize = 8;
/// Residual degrees of freedom required beyond the parameter count.
const MIN_DOF: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArimaSpec {
    pub target: String,
    pub p: usize,
    pub d: usize,
    pub q: usize,
}

impl Default for ArimaSpec {
    fn default() -> Self {
        Self {
            target: TARGET_COLUMN.to_string(),
            p: 2,
            d: 1,
            q: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArimaxSpec {
    pub target: String,
    pub p: usize,
    pub d: usize,
    pub q: usize,
    pub exog: Vec<String>,
}

impl Default for ArimaxSpec {
    fn default() -> Self {
        Self {
            target: TARGET_COLUMN.to_string(),
            p: 2,
            d: 0,
            q: 1,
            exog: DEFAULT_EXOG.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Estimated coefficients and the state needed to forecast from the end of
/// the training data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmaState {
    pub d: usize,
    pub intercept: f64,
    pub ar: Vec<f64>,
    pub ma: Vec<f64>,
    pub exog: Vec<f64>,
    /// Last `p` differenced values, oldest first.
    pub recent: Vec<f64>,
    /// Last `q` residuals, oldest first.
    pub residuals: Vec<f64>,
    /// Last value of the series at each differencing level `0..d`.
    pub level_tails: Vec<f64>,
    pub sigma2: f64,
}

fn check_orders(p: usize, d: usize, q: usize) -> Result<(), ModelError> {
    if d > MAX_DIFFERENCING {
        return Err(ModelError::InvalidParameter {
            name: "d".into(),
            reason: format!("differencing order must be at most {MAX_DIFFERENCING}"),
        });
    }
    for (name, order) in [("p", p), ("q", q)] {
        if order > MAX_ORDER {
            return Err(ModelError::InvalidParameter {
                name: name.into(),
                reason: format!("order must be at most {MAX_ORDER}"),
            });
        }
    }
    Ok(())
}

/// Hannan–Rissanen estimation. `exog` holds one column per regressor,
/// aligned with `series`.
fn fit_arma(
    series: &[f64],
    exog: &[Vec<f64>],
    p: usize,
    d: usize,
    q: usize,
) -> Result<ArmaState, ModelError> {
    let w = difference(series, d);
    let xd: Vec<Vec<f64>> = exog.iter().map(|col| difference(col, d)).collect();
    let n = w.len();

    let long_order = if q > 0 { (p + q).max(LONG_AR_MIN) } else { 0 };
    let start = long_order + p.max(q);
    let params = 1 + p + q + xd.len();
    let required = d + start + params + MIN_DOF;
    if series.len() < required {
        return Err(ModelError::InsufficientData {
            required,
            actual: series.len(),
        });
    }

    // Stage 1: innovations from a long autoregression.
    let mut innovations = vec![0.0; n];
    if q > 0 {
        let design: Vec<Vec<f64>> = (long_order..n)
            .map(|t| {
                let mut row = Vec::with_capacity(1 + long_order + xd.len());
                row.push(1.0);
                row.extend((1..=long_order).map(|i| w[t - i]));
                row.extend(xd.iter().map(|col| col[t]));
                row
            })
            .collect();
        let fit = linalg::ols(&design, &w[long_order..])?;
        innovations[long_order..].copy_from_slice(&fit.residuals);
    }

    // Stage 2: regress on AR lags, lagged innovations and regressors.
    let design: Vec<Vec<f64>> = (start..n)
        .map(|t| {
            let mut row = Vec::with_capacity(params);
            row.push(1.0);
            row.extend((1..=p).map(|i| w[t - i]));
            row.extend((1..=q).map(|j| innovations[t - j]));
            row.extend(xd.iter().map(|col| col[t]));
            row
        })
        .collect();
    let fit = linalg::ols(&design, &w[start..])?;

    let coefficients = &fit.coefficients;
    let ar = coefficients[1..=p].to_vec();
    let ma = coefficients[1 + p..1 + p + q].to_vec();
    let exog_coef = coefficients[1 + p + q..].to_vec();

    Ok(ArmaState {
        d,
        intercept: coefficients[0],
        ar,
        ma,
        exog: exog_coef,
        recent: w[n - p..].to_vec(),
        residuals: fit.residuals[fit.residuals.len() - q..].to_vec(),
        level_tails: (0..d)
            .map(|level| difference(series, level).last().copied().unwrap_or_default())
            .collect(),
        sigma2: fit.sigma2,
    })
}

impl ArmaState {
    /// Coefficients of `φ(B)(1 − B)^d` written as `1 − Σ a_i Bⁱ`.
    fn integrated_ar(&self) -> Vec<f64> {
        let mut poly = Vec::with_capacity(self.ar.len() + 1);
        poly.push(1.0);
        poly.extend(self.ar.iter().map(|a| -a));
        for _ in 0..self.d {
            let mut next = vec![0.0; poly.len() + 1];
            for (i, c) in poly.iter().enumerate() {
                next[i] += c;
                next[i + 1] -= c;
            }
            poly = next;
        }
        poly[1..].iter().map(|c| -c).collect()
    }

    fn psi_weights(&self, count: usize) -> Vec<f64> {
        let phi = self.integrated_ar();
        let mut psi = Vec::with_capacity(count);
        for j in 0..count {
            if j == 0 {
                psi.push(1.0);
                continue;
            }
            let ma = self.ma.get(j - 1).copied().unwrap_or(0.0);
            let ar: f64 = (1..=j.min(phi.len())).map(|i| phi[i - 1] * psi[j - i]).sum();
            psi.push(ma + ar);
        }
        psi
    }

    /// `exog_diff` holds one already-differenced regressor row per step.
    fn forecast(&self, steps: usize, exog_diff: &[Vec<f64>]) -> PointForecast {
        let p = self.ar.len();
        let q = self.ma.len();
        let mut history = self.recent.clone();
        let mut shocks = self.residuals.clone();

        let mut differenced = Vec::with_capacity(steps);
        for h in 0..steps {
            let ar: f64 = (1..=p).map(|i| self.ar[i - 1] * history[history.len() - i]).sum();
            let ma: f64 = (1..=q).map(|j| self.ma[j - 1] * shocks[shocks.len() - j]).sum();
            let regression = exog_diff.get(h).map_or(0.0, |row| dot(&self.exog, row));
            let value = self.intercept + ar + ma + regression;

            history.push(value);
            shocks.push(0.0);
            differenced.push(value);
        }

        let mut mean = differenced;
        for level in (0..self.d).rev() {
            let mut acc = self.level_tails[level];
            for v in mean.iter_mut() {
                acc += *v;
                *v = acc;
            }
        }

        let psi = self.psi_weights(steps);
        let mut cumulative = 0.0;
        let std_err = psi
            .iter()
            .map(|w| {
                cumulative += w * w;
                (self.sigma2 * cumulative).sqrt()
            })
            .collect();

        PointForecast { mean, std_err }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArimaModel {
    pub spec: ArimaSpec,
    pub state: ArmaState,
    pub summary: FitSummary,
}

impl ArimaModel {
    pub fn fit(spec: &ArimaSpec, data: &TimeSeriesTable, window: usize) -> Result<Self, ModelError> {
        check_orders(spec.p, spec.d, spec.q)?;
        let (frame, last_timestamp) = training_frame(data, &spec.target, window)?;
        let series = frame.filled_column(&spec.target)?;
        let state = fit_arma(&series, &[], spec.p, spec.d, spec.q)?;

        Ok(Self {
            spec: spec.clone(),
            summary: FitSummary {
                fitted_at: Utc::now(),
                last_timestamp,
                observations: series.len(),
                sigma2: state.sigma2,
            },
            state,
        })
    }
}

impl Forecaster for ArimaModel {
    fn summary(&self) -> &FitSummary {
        &self.summary
    }

    fn forecast_steps(
        &self,
        steps: usize,
        _context: Option<&TimeSeriesTable>,
    ) -> Result<PointForecast, ModelError> {
        Ok(self.state.forecast(steps, &[]))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArimaxModel {
    pub spec: ArimaxSpec,
    pub state: ArmaState,
    /// Last `d + 1` regressor rows (levels), oldest first.
    pub exog_tail: Vec<Vec<f64>>,
    pub summary: FitSummary,
}

impl ArimaxModel {
    pub fn fit(spec: &ArimaxSpec, data: &TimeSeriesTable, window: usize) -> Result<Self, ModelError> {
        check_orders(spec.p, spec.d, spec.q)?;
        if spec.exog.is_empty() {
            return Err(ModelError::InvalidParameter {
                name: "exog".into(),
                reason: "at least one regressor is required".into(),
            });
        }

        let (frame, last_timestamp) = training_frame(data, &spec.target, window)?;
        let series = frame.filled_column(&spec.target)?;
        let exog = spec
            .exog
            .iter()
            .map(|name| frame.filled_column(name))
            .collect::<Result<Vec<_>, _>>()?;

        let state = fit_arma(&series, &exog, spec.p, spec.d, spec.q)?;
        let tail_start = series.len() - (spec.d + 1);
        let exog_tail = (tail_start..series.len())
            .map(|t| exog.iter().map(|col| col[t]).collect())
            .collect();

        Ok(Self {
            spec: spec.clone(),
            summary: FitSummary {
                fitted_at: Utc::now(),
                last_timestamp,
                observations: series.len(),
                sigma2: state.sigma2,
            },
            state,
            exog_tail,
        })
    }

    /// Regressor levels for each forecast hour: taken from `context` when it
    /// has a reading, otherwise the previous hour's value is held.
    fn future_exog(&self, steps: usize, context: Option<&TimeSeriesTable>) -> Vec<Vec<f64>> {
        let mut previous = self.exog_tail.last().cloned().unwrap_or_default();
        let last = self.summary.last_timestamp;

        (1..=steps)
            .map(|h| {
                let ts = last + TimeDelta::hours(h as i64);
                let row: Vec<f64> = self
                    .spec
                    .exog
                    .iter()
                    .zip(&previous)
                    .map(|(name, prev)| context.and_then(|c| c.get(ts, name)).unwrap_or(*prev))
                    .collect();
                previous = row.clone();
                row
            })
            .collect()
    }
}

impl Forecaster for ArimaxModel {
    fn summary(&self) -> &FitSummary {
        &self.summary
    }

    fn forecast_steps(
        &self,
        steps: usize,
        context: Option<&TimeSeriesTable>,
    ) -> Result<PointForecast, ModelError> {
        let future = self.future_exog(steps, context);
        let d = self.state.d;
        let known = &self.exog_tail[self.exog_tail.len() - d..];

        let columns = self.spec.exog.len();
        let diffed_columns: Vec<Vec<f64>> = (0..columns)
            .map(|j| {
                let levels: Vec<f64> = known.iter().chain(&future).map(|row| row[j]).collect();
                difference(&levels, d)
            })
            .collect();
        let exog_diff: Vec<Vec<f64>> = (0..steps)
            .map(|h| diffed_columns.iter().map(|col| col[h]).collect())
            .collect();

        Ok(self.state.forecast(steps, &exog_diff))
    }
}
