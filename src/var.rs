use nalgebra::DMatrix;
use ndarray::{s, Array1, Array2};
use statrs::distribution::{ContinuousCDF, Normal};

use crate::data::lagged_rows;
use crate::ols::fit_ols;
use crate::types::FypError;

/// Fitting primitive behind the grid search.
///
/// Implementations estimate a VAR(`order`) with a constant on the rows of
/// `endog`, with optional contemporaneous exogenous regressors.
pub trait VarEstimator: Send + Sync {
    fn fit(
        &self,
        endog: &Array2<f64>,
        exog: Option<&Array2<f64>>,
        order: usize,
    ) -> Result<VarFit, FypError>;
}

/// Equation-by-equation least squares.
#[derive(Clone, Copy, Debug, Default)]
pub struct OlsVarEstimator;

impl VarEstimator for OlsVarEstimator {
    fn fit(
        &self,
        endog: &Array2<f64>,
        exog: Option<&Array2<f64>>,
        order: usize,
    ) -> Result<VarFit, FypError> {
        if order == 0 {
            return Err(FypError::InvalidConfig("VAR order must be positive".to_string()));
        }
        let (n, k) = endog.dim();
        if k == 0 {
            return Err(FypError::EmptyInput);
        }
        let m = exog.map_or(0, |x| x.ncols());
        if let Some(x) = exog {
            if x.nrows() != n {
                return Err(FypError::LengthMismatch);
            }
        }
        let n_obs = lagged_rows(n, order, k * order + m + 1)?;

        let mut design = Array2::<f64>::zeros((n_obs, k * order + m));
        for r in 0..n_obs {
            let t = order + r;
            for l in 1..=order {
                for j in 0..k {
                    design[[r, (l - 1) * k + j]] = endog[[t - l, j]];
                }
            }
            if let Some(x) = exog {
                for j in 0..m {
                    design[[r, k * order + j]] = x[[t, j]];
                }
            }
        }

        let mut lag_coefs = vec![Array2::<f64>::zeros((k, k)); order];
        let mut exog_coefs = Array2::<f64>::zeros((k, m));
        let mut intercept = Array1::<f64>::zeros(k);
        let mut residuals = Array2::<f64>::zeros((n_obs, k));
        for i in 0..k {
            let y = endog.slice(s![order.., i]).to_owned();
            let fit = fit_ols(&design, &y, true)?;
            intercept[i] = fit.intercept;
            for (l, coefs) in lag_coefs.iter_mut().enumerate() {
                for j in 0..k {
                    coefs[[i, j]] = fit.coeffs[l * k + j];
                }
            }
            for j in 0..m {
                exog_coefs[[i, j]] = fit.coeffs[k * order + j];
            }
            residuals.column_mut(i).assign(&fit.residuals);
        }

        let cross = residuals.t().dot(&residuals);
        let df = (n_obs - (k * order + m + 1)) as f64;
        let sigma_u = &cross / df;
        let sigma_mle = &cross / n_obs as f64;

        let ld = log_det(&sigma_mle)?;
        let free_params = (order * k * k + k * (m + 1)) as f64;
        let nobs = n_obs as f64;
        let aic = ld + 2.0 / nobs * free_params;
        let bic = ld + nobs.ln() / nobs * free_params;

        Ok(VarFit {
            order,
            lag_coefs,
            intercept,
            exog_coefs,
            sigma_u,
            residuals,
            n_obs,
            aic,
            bic,
        })
    }
}

fn log_det(matrix: &Array2<f64>) -> Result<f64, FypError> {
    let n = matrix.nrows();
    let det = DMatrix::from_fn(n, n, |i, j| matrix[[i, j]]).determinant();
    if !det.is_finite() || det <= 0.0 {
        return Err(FypError::NumericalInstability(format!(
            "residual covariance is singular (det = {:e})",
            det
        )));
    }
    Ok(det.ln())
}

/// Fitted VAR model.
#[derive(Clone, Debug)]
pub struct VarFit {
    pub order: usize,
    /// `lag_coefs[l][[i, j]]`: effect of variable `j` at lag `l + 1` on equation `i`.
    pub lag_coefs: Vec<Array2<f64>>,
    pub intercept: Array1<f64>,
    /// `k x m` exogenous coefficients.
    pub exog_coefs: Array2<f64>,
    /// Degrees-of-freedom adjusted residual covariance.
    pub sigma_u: Array2<f64>,
    pub residuals: Array2<f64>,
    pub n_obs: usize,
    pub aic: f64,
    pub bic: f64,
}

/// Point forecast with symmetric normal bands.
#[derive(Clone, Debug)]
pub struct VarForecast {
    pub point: Array2<f64>,
    pub lower: Array2<f64>,
    pub upper: Array2<f64>,
}

impl VarFit {
    pub fn n_endog(&self) -> usize {
        self.intercept.len()
    }

    pub fn n_exog(&self) -> usize {
        self.exog_coefs.ncols()
    }

    /// Iterate the fitted recursion `steps` periods past the end of `history`.
    ///
    /// `history` needs at least `order` rows; `future_exog` needs `steps`
    /// rows when the model has exogenous regressors.
    pub fn forecast(
        &self,
        history: &Array2<f64>,
        steps: usize,
        future_exog: Option<&Array2<f64>>,
    ) -> Result<Array2<f64>, FypError> {
        let k = self.n_endog();
        let m = self.n_exog();
        if history.ncols() != k {
            return Err(FypError::LengthMismatch);
        }
        if history.nrows() < self.order {
            return Err(FypError::InsufficientData {
                needed: self.order,
                available: history.nrows(),
            });
        }
        if m > 0 {
            match future_exog {
                Some(x) if x.ncols() == m && x.nrows() >= steps => {}
                Some(x) if x.ncols() != m => return Err(FypError::LengthMismatch),
                _ => {
                    return Err(FypError::InsufficientData {
                        needed: steps,
                        available: future_exog.map_or(0, |x| x.nrows()),
                    })
                }
            }
        }

        let mut path: Vec<Array1<f64>> = (history.nrows() - self.order..history.nrows())
            .map(|t| history.row(t).to_owned())
            .collect();
        let mut out = Array2::<f64>::zeros((steps, k));
        for h in 0..steps {
            let mut next = self.intercept.clone();
            for (l, coefs) in self.lag_coefs.iter().enumerate() {
                next += &coefs.dot(&path[path.len() - 1 - l]);
            }
            if let Some(x) = future_exog.filter(|_| m > 0) {
                next += &self.exog_coefs.dot(&x.row(h));
            }
            if next.iter().any(|v| !v.is_finite()) {
                return Err(FypError::NumericalInstability(format!(
                    "forecast diverged at step {}",
                    h + 1
                )));
            }
            out.row_mut(h).assign(&next);
            path.push(next);
        }
        Ok(out)
    }

    /// Moving-average coefficients `Φ₀ = I, Φᵢ = Σⱼ Φᵢ₋ⱼ Aⱼ` for `i < steps`.
    pub fn ma_coefficients(&self, steps: usize) -> Vec<Array2<f64>> {
        let k = self.n_endog();
        let mut phis: Vec<Array2<f64>> = Vec::with_capacity(steps);
        for i in 0..steps {
            if i == 0 {
                phis.push(Array2::eye(k));
                continue;
            }
            let mut phi = Array2::<f64>::zeros((k, k));
            for j in 1..=i.min(self.order) {
                phi += &phis[i - j].dot(&self.lag_coefs[j - 1]);
            }
            phis.push(phi);
        }
        phis
    }

    /// Forecast MSE matrices `Σ Φᵢ Σᵤ Φᵢ'` for horizons `1..=steps`.
    pub fn forecast_mse(&self, steps: usize) -> Vec<Array2<f64>> {
        let k = self.n_endog();
        let mut acc = Array2::<f64>::zeros((k, k));
        self.ma_coefficients(steps)
            .iter()
            .map(|phi| {
                acc += &phi.dot(&self.sigma_u).dot(&phi.t());
                acc.clone()
            })
            .collect()
    }

    /// Point forecast with `1 - alpha` normal bands from the MSE matrices.
    pub fn forecast_interval(
        &self,
        history: &Array2<f64>,
        steps: usize,
        future_exog: Option<&Array2<f64>>,
        alpha: f64,
    ) -> Result<VarForecast, FypError> {
        if !(0.0..1.0).contains(&alpha) || alpha == 0.0 {
            return Err(FypError::InvalidConfig(format!(
                "interval alpha {} outside (0, 1)",
                alpha
            )));
        }
        let point = self.forecast(history, steps, future_exog)?;
        let q = Normal::new(0.0, 1.0)
            .map_err(|e| FypError::NumericalInstability(format!("{:?}", e)))?
            .inverse_cdf(1.0 - alpha / 2.0);
        let mut lower = point.clone();
        let mut upper = point.clone();
        for (h, mse) in self.forecast_mse(steps).iter().enumerate() {
            for i in 0..self.n_endog() {
                let half = q * mse[[i, i]].max(0.0).sqrt();
                lower[[h, i]] -= half;
                upper[[h, i]] += half;
            }
        }
        Ok(VarForecast {
            point,
            lower,
            upper,
        })
    }
}
