use crate::types::{FypError, IcKind};
use linfa::dataset::Dataset;
use linfa::traits::Fit;
use linfa_linear::LinearRegression;
use nalgebra::DMatrix;
use ndarray::{Array1, Array2};

/// Result of a single least-squares regression.
#[derive(Clone, Debug)]
pub struct OlsFit {
    /// Slope coefficients, one per design column.
    pub coeffs: Vec<f64>,
    pub intercept: f64,
    pub with_intercept: bool,
    pub residuals: Array1<f64>,
    /// Sum of squared residuals.
    pub ssr: f64,
    pub rmse: f64,
    pub r2: f64,
    pub n_rows: usize,
}

impl OlsFit {
    /// Number of estimated parameters, intercept included.
    pub fn n_params(&self) -> usize {
        self.coeffs.len() + usize::from(self.with_intercept)
    }

    pub fn df_resid(&self) -> usize {
        self.n_rows.saturating_sub(self.n_params())
    }
}

/// Regress `y` on the columns of `x` using Linfa.
///
/// # Errors
/// Returns `FypError::LengthMismatch` if row counts differ,
/// `FypError::InsufficientData` if there are no residual degrees of freedom and
/// `FypError::NumericalInstability` if the solve fails or yields non-finite values.
pub fn fit_ols(x: &Array2<f64>, y: &Array1<f64>, intercept: bool) -> Result<OlsFit, FypError> {
    let rows = x.nrows();
    if rows != y.len() {
        return Err(FypError::LengthMismatch);
    }
    let n_params = x.ncols() + usize::from(intercept);
    if rows <= n_params {
        return Err(FypError::InsufficientData {
            needed: n_params + 1,
            available: rows,
        });
    }

    let dataset = Dataset::new(x.clone(), y.clone());
    let fitted = LinearRegression::new()
        .with_intercept(intercept)
        .fit(&dataset)
        .map_err(|e| FypError::NumericalInstability(format!("{:?}", e)))?;

    let coeffs = fitted.params().to_vec();
    let intercept_value = if intercept { fitted.intercept() } else { 0.0 };
    if coeffs.iter().any(|c| !c.is_finite()) || !intercept_value.is_finite() {
        return Err(FypError::NumericalInstability(
            "least-squares solution is not finite".to_string(),
        ));
    }

    let y_hat = x.dot(&Array1::from(coeffs.clone())) + intercept_value;
    let residuals = y - &y_hat;
    let ssr = residuals.iter().map(|r| r * r).sum::<f64>();
    let (rmse, r2) = compute_metrics(y, &y_hat);

    Ok(OlsFit {
        coeffs,
        intercept: intercept_value,
        with_intercept: intercept,
        residuals,
        ssr,
        rmse,
        r2,
        n_rows: rows,
    })
}

/// Standard errors of the slope coefficients of `fit`.
///
/// Uses the classical estimate `s² (X'X)⁻¹` with the intercept column included
/// in `X` when the fit has one.
pub fn coefficient_std_errors(x: &Array2<f64>, fit: &OlsFit) -> Result<Vec<f64>, FypError> {
    let (rows, cols) = x.dim();
    let offset = usize::from(fit.with_intercept);
    let design = DMatrix::from_fn(rows, cols + offset, |i, j| {
        if j < offset {
            1.0
        } else {
            x[[i, j - offset]]
        }
    });
    let xtx_inv = (design.transpose() * &design)
        .try_inverse()
        .ok_or_else(|| FypError::NumericalInstability("singular design matrix".to_string()))?;
    let df = fit.df_resid();
    if df == 0 {
        return Err(FypError::InsufficientData {
            needed: fit.n_params() + 1,
            available: fit.n_rows,
        });
    }
    let s2 = fit.ssr / df as f64;
    (0..cols)
        .map(|j| {
            let var = s2 * xtx_inv[(j + offset, j + offset)];
            if var.is_finite() && var >= 0.0 {
                Ok(var.sqrt())
            } else {
                Err(FypError::NumericalInstability(format!(
                    "non-positive coefficient variance {}",
                    var
                )))
            }
        })
        .collect()
}

/// Compute RMSE and R².
pub(crate) fn compute_metrics(y_actual: &Array1<f64>, y_pred: &Array1<f64>) -> (f64, f64) {
    let n = y_actual.len() as f64;

    let ss_res: f64 = y_actual
        .iter()
        .zip(y_pred.iter())
        .map(|(a, b)| (a - b).powi(2))
        .sum();
    let rmse = (ss_res / n).sqrt();

    let y_mean = y_actual.mean().unwrap_or(0.0);
    let ss_tot: f64 = y_actual.iter().map(|&v| (v - y_mean).powi(2)).sum();
    let r2 = 1.0 - ss_res / ss_tot.max(1e-12);

    (rmse, r2)
}

/// Gaussian information criterion from a residual sum of squares.
///
/// `n ln(RSS/n)` plus `2k` (AIC) or `k ln n` (BIC).
pub(crate) fn ic_value_from_rss(rss: f64, k: usize, n: usize, kind: IcKind) -> f64 {
    let n_f = n as f64;
    let fit_term = n_f * (rss.max(f64::MIN_POSITIVE) / n_f).ln();
    let penalty = match kind {
        IcKind::Aic => 2.0 * k as f64,
        IcKind::Bic => k as f64 * n_f.ln(),
    };
    fit_term + penalty
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_ols_simple() {
        let x = Array2::from_shape_vec((5, 1), vec![1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        let y = Array1::from(vec![2.0, 4.0, 6.0, 8.0, 10.0]);
        let fit = fit_ols(&x, &y, false).unwrap();
        assert_abs_diff_eq!(fit.coeffs[0], 2.0, epsilon = 1e-8);
        assert_eq!(fit.intercept, 0.0);
        assert!(fit.ssr < 1e-12);
    }

    #[test]
    fn test_ols_with_intercept() {
        let x = Array2::from_shape_vec((6, 1), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let y = Array1::from(vec![3.0, 5.0, 7.0, 9.0, 11.0, 13.0]);
        let fit = fit_ols(&x, &y, true).unwrap();
        assert_abs_diff_eq!(fit.intercept, 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(fit.coeffs[0], 2.0, epsilon = 1e-6);
        assert!(fit.r2 > 0.999);
        assert_eq!(fit.n_params(), 2);
    }

    #[test]
    fn test_ols_insufficient_rows() {
        let x = Array2::from_shape_vec((2, 2), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let y = Array1::from(vec![1.0, 2.0]);
        let result = fit_ols(&x, &y, true);
        assert!(matches!(result, Err(FypError::InsufficientData { .. })));
    }

    #[test]
    fn test_ols_length_mismatch() {
        let x = Array2::from_shape_vec((3, 1), vec![1.0, 2.0, 3.0]).unwrap();
        let y = Array1::from(vec![1.0, 2.0]);
        assert!(matches!(
            fit_ols(&x, &y, true),
            Err(FypError::LengthMismatch)
        ));
    }

    #[test]
    fn test_std_errors_match_closed_form() {
        // Slope standard error for simple regression: s / sqrt(Sxx).
        let xs = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let ys = [1.1, 1.9, 3.2, 3.8, 5.1, 6.2];
        let x = Array2::from_shape_vec((6, 1), xs.to_vec()).unwrap();
        let y = Array1::from(ys.to_vec());
        let fit = fit_ols(&x, &y, true).unwrap();
        let se = coefficient_std_errors(&x, &fit).unwrap();

        let mean = xs.iter().sum::<f64>() / 6.0;
        let sxx: f64 = xs.iter().map(|v| (v - mean).powi(2)).sum();
        let s = (fit.ssr / 4.0).sqrt();
        assert_abs_diff_eq!(se[0], s / sxx.sqrt(), epsilon = 1e-8);
    }

    #[test]
    fn test_ic_penalties() {
        let aic = ic_value_from_rss(10.0, 3, 50, IcKind::Aic);
        let bic = ic_value_from_rss(10.0, 3, 50, IcKind::Bic);
        let base = 50.0 * (10.0f64 / 50.0).ln();
        assert_abs_diff_eq!(aic, base + 6.0, epsilon = 1e-12);
        assert_abs_diff_eq!(bic, base + 3.0 * 50f64.ln(), epsilon = 1e-12);
    }
}
