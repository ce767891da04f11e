//! Vector autoregression over PM2.5, PM10 and weather.
//!
//! Each equation is estimated by least squares on a shared design. The lag
//! order is picked by AIC on a common estimation sample, then the model is
//! re-estimated on every usable row at that order.

use chrono::Utc;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::arima::DEFAULT_EXOG;
use super::linalg;
use super::{FitSummary, Forecaster, PointForecast, TARGET_COLUMN, training_frame};
use crate::error::ModelError;
use crate::table::TimeSeriesTable;

const MIN_DOF: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarSpec {
    pub target: String,
    pub columns: Vec<String>,
    pub max_lags: usize,
}

impl Default for VarSpec {
    fn default() -> Self {
        let mut columns = vec![TARGET_COLUMN.to_string(), "pm10".to_string()];
        columns.extend(DEFAULT_EXOG.iter().map(|s| s.to_string()));
        Self {
            target: TARGET_COLUMN.to_string(),
            columns,
            max_lags: 6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VarModel {
    pub spec: VarSpec,
    pub lag_order: usize,
    pub intercept: DVector<f64>,
    /// `coefficients[i][(row, col)]`: effect of `col` at lag `i + 1` on `row`.
    pub coefficients: Vec<DMatrix<f64>>,
    /// Last `lag_order` observations, oldest first.
    pub tail: Vec<DVector<f64>>,
    /// Residual covariance.
    pub sigma_u: DMatrix<f64>,
    pub summary: FitSummary,
}

/// Rows `[1, y_{t-1}', ..., y_{t-lags}']` for `t` in `from..`.
fn lagged_design(rows: &[DVector<f64>], lags: usize, from: usize) -> DMatrix<f64> {
    let k = rows.first().map_or(0, |r| r.len());
    DMatrix::from_fn(rows.len() - from, 1 + lags * k, |r, c| {
        if c == 0 {
            1.0
        } else {
            let lag = (c - 1) / k + 1;
            rows[from + r - lag][(c - 1) % k]
        }
    })
}

fn targets(rows: &[DVector<f64>], from: usize, k: usize) -> DMatrix<f64> {
    DMatrix::from_fn(rows.len() - from, k, |r, j| rows[from + r][j])
}

/// Residual cross-product `U'U / divisor`.
fn residual_covariance(residuals: &DMatrix<f64>, divisor: f64) -> DMatrix<f64> {
    residuals.tr_mul(residuals) / divisor
}

impl VarModel {
    pub fn fit(spec: &VarSpec, data: &TimeSeriesTable, window: usize) -> Result<Self, ModelError> {
        let target_index = spec
            .columns
            .iter()
            .position(|c| *c == spec.target)
            .ok_or_else(|| ModelError::InvalidParameter {
                name: "columns".into(),
                reason: format!("must include the target '{}'", spec.target),
            })?;
        if spec.max_lags == 0 {
            return Err(ModelError::InvalidParameter {
                name: "max_lags".into(),
                reason: "at least one lag is required".into(),
            });
        }

        let (frame, last_timestamp) = training_frame(data, &spec.target, window)?;
        let columns = spec
            .columns
            .iter()
            .map(|name| frame.filled_column(name))
            .collect::<Result<Vec<_>, _>>()?;
        let k = columns.len();
        let n = frame.len();
        let rows: Vec<DVector<f64>> = (0..n)
            .map(|t| DVector::from_fn(k, |j, _| columns[j][t]))
            .collect();

        let required = spec.max_lags + 1 + k + MIN_DOF;
        if n < required {
            return Err(ModelError::InsufficientData {
                required,
                actual: n,
            });
        }

        let sample = n - spec.max_lags;
        let y = targets(&rows, spec.max_lags, k);
        let mut best: Option<(usize, f64)> = None;
        for p in 1..=spec.max_lags {
            if sample < 1 + p * k + MIN_DOF {
                break;
            }
            let design = lagged_design(&rows, p, spec.max_lags);
            let Ok(fit) = linalg::ols_multi(&design, &y) else {
                continue;
            };
            let det = residual_covariance(&fit.residuals, sample as f64).determinant();
            if det <= 0.0 || !det.is_finite() {
                continue;
            }
            let aic = det.ln() + 2.0 * (p * k * k) as f64 / sample as f64;
            debug!(lags = p, aic, "VAR lag candidate");
            if best.is_none_or(|(_, b)| aic < b) {
                best = Some((p, aic));
            }
        }

        let (p, _) = best.ok_or_else(|| {
            ModelError::ConvergenceFailure("no lag order produced a usable covariance".into())
        })?;

        let fit = linalg::ols_multi(&lagged_design(&rows, p, p), &targets(&rows, p, k))?;
        let dof = (n - p).saturating_sub(1 + p * k).max(1);
        let sigma_u = residual_covariance(&fit.residuals, dof as f64);

        // Coefficient columns are equations; row blocks are lags.
        let intercept = fit.coefficients.row(0).transpose();
        let coefficients = (0..p)
            .map(|i| fit.coefficients.rows(1 + i * k, k).transpose())
            .collect();

        Ok(Self {
            spec: spec.clone(),
            lag_order: p,
            intercept,
            coefficients,
            tail: rows[n - p..].to_vec(),
            summary: FitSummary {
                fitted_at: Utc::now(),
                last_timestamp,
                observations: n,
                sigma2: sigma_u[(target_index, target_index)],
            },
            sigma_u,
        })
    }

    fn target_index(&self) -> usize {
        self.spec
            .columns
            .iter()
            .position(|c| *c == self.spec.target)
            .unwrap_or(0)
    }

    /// Forecast paths for every variable, one vector per step.
    pub fn forecast_all(&self, steps: usize) -> Vec<DVector<f64>> {
        let mut history = self.tail.clone();
        let mut out = Vec::with_capacity(steps);
        for _ in 0..steps {
            let mut next = self.intercept.clone();
            for (i, a) in self.coefficients.iter().enumerate() {
                next += a * &history[history.len() - 1 - i];
            }
            history.push(next.clone());
            out.push(next);
        }
        out
    }

    /// Moving-average matrices `Φ_0 .. Φ_{count-1}`.
    fn phi_matrices(&self, count: usize) -> Vec<DMatrix<f64>> {
        let k = self.intercept.len();
        let mut phis: Vec<DMatrix<f64>> = Vec::with_capacity(count);
        for s in 0..count {
            if s == 0 {
                phis.push(DMatrix::identity(k, k));
                continue;
            }
            let mut acc = DMatrix::zeros(k, k);
            for i in 1..=s.min(self.lag_order) {
                acc += &phis[s - i] * &self.coefficients[i - 1];
            }
            phis.push(acc);
        }
        phis
    }
}

impl Forecaster for VarModel {
    fn summary(&self) -> &FitSummary {
        &self.summary
    }

    fn forecast_steps(
        &self,
        steps: usize,
        _context: Option<&TimeSeriesTable>,
    ) -> Result<PointForecast, ModelError> {
        let target = self.target_index();
        let mean = self
            .forecast_all(steps)
            .iter()
            .map(|row| row[target])
            .collect();

        let k = self.intercept.len();
        let mut mse = DMatrix::<f64>::zeros(k, k);
        let std_err = self
            .phi_matrices(steps)
            .iter()
            .map(|phi| {
                mse += phi * &self.sigma_u * phi.transpose();
                mse[(target, target)].max(0.0).sqrt()
            })
            .collect();

        Ok(PointForecast { mean, std_err })
    }
}
