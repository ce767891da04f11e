//! Least-squares estimation on `nalgebra` matrices.

use nalgebra::DMatrix;

use crate::error::ModelError;

/// Ordinary least squares estimates for one equation.
#[derive(Debug, Clone, PartialEq)]
pub struct OlsFit {
    pub coefficients: Vec<f64>,
    pub residuals: Vec<f64>,
    /// Residual variance, degrees-of-freedom adjusted when possible.
    pub sigma2: f64,
}

/// OLS estimates for several equations sharing one design matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiOlsFit {
    /// One column of coefficients per equation.
    pub coefficients: DMatrix<f64>,
    /// One column of residuals per equation.
    pub residuals: DMatrix<f64>,
}

/// Solves `design · B ≈ targets` through the SVD of the design.
///
/// Rank-deficient designs are rejected instead of silently returning the
/// minimum-norm solution.
pub fn ols_multi(design: &DMatrix<f64>, targets: &DMatrix<f64>) -> Result<MultiOlsFit, ModelError> {
    let (n, k) = design.shape();
    if n == 0 || k == 0 {
        return Err(ModelError::InsufficientData {
            required: 1,
            actual: n,
        });
    }
    if n < k {
        return Err(ModelError::InsufficientData {
            required: k,
            actual: n,
        });
    }
    if targets.nrows() != n {
        return Err(ModelError::NumericalError(format!(
            "design has {n} rows but targets have {}",
            targets.nrows()
        )));
    }

    let svd = design.clone().svd(true, true);
    let largest = svd.singular_values.iter().copied().fold(0.0, f64::max);
    let tolerance = largest * n.max(k) as f64 * f64::EPSILON;
    if svd.rank(tolerance) < k {
        return Err(ModelError::NumericalError("singular design matrix".into()));
    }

    let coefficients = svd
        .solve(targets, tolerance)
        .map_err(|e| ModelError::NumericalError(e.to_string()))?;
    if coefficients.iter().any(|c| !c.is_finite()) {
        return Err(ModelError::ConvergenceFailure(
            "non-finite regression coefficients".into(),
        ));
    }
    let residuals = targets - design * &coefficients;

    Ok(MultiOlsFit {
        coefficients,
        residuals,
    })
}

/// Single-equation OLS on row-major design rows.
pub fn ols(design: &[Vec<f64>], y: &[f64]) -> Result<OlsFit, ModelError> {
    let n = design.len();
    let k = design.first().map_or(0, Vec::len);
    if design.iter().any(|row| row.len() != k) || y.len() != n {
        return Err(ModelError::NumericalError("dimension mismatch".into()));
    }
    let x = DMatrix::from_fn(n, k, |i, j| design[i][j]);
    let targets = DMatrix::from_column_slice(n, 1, y);

    let fit = ols_multi(&x, &targets)?;
    let residuals: Vec<f64> = fit.residuals.iter().copied().collect();
    let dof = if n > k { (n - k) as f64 } else { n as f64 };
    let sigma2 = residuals.iter().map(|r| r * r).sum::<f64>() / dof;

    Ok(OlsFit {
        coefficients: fit.coefficients.iter().copied().collect(),
        residuals,
        sigma2,
    })
}

pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Applies `order`-fold first differencing.
pub fn difference(data: &[f64], order: usize) -> Vec<f64> {
    let mut result = data.to_vec();
    for _ in 0..order {
        result = result.windows(2).map(|w| w[1] - w[0]).collect();
    }
    result
}
