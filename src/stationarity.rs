use std::collections::BTreeMap;
use std::io::{Read, Write};

use chrono::NaiveDate;
use ndarray::{Array1, Array2};
use rayon::prelude::*;
use statrs::function::erf::erfc;
use tracing::{debug, info, warn};

use crate::data::TimeSeriesTable;
use crate::defaults::{MIN_ADF_OBS, YOY_PERIODS};
use crate::ols::{coefficient_std_errors, fit_ols, ic_value_from_rss};
use crate::preprocess::difference;
use crate::types::{AdvisorOptions, FypError, IcKind, RecipeRecord, StationarityRecipe};

// MacKinnon (2010) response-surface bounds and coefficients, constant-only regression.
const TAU_MAX: f64 = 2.74;
const TAU_MIN: f64 = -18.83;
const TAU_STAR: f64 = -1.61;
const TAU_SMALLP: [f64; 3] = [2.1659, 1.4412, 0.038269];
const TAU_LARGEP: [f64; 4] = [1.7339, 0.93202, -0.12745, -0.010368];

const VARIANCE_EPS: f64 = 1e-12;

/// Outcome of an augmented Dickey-Fuller test with a constant.
#[derive(Clone, Copy, Debug)]
pub struct AdfOutcome {
    pub statistic: f64,
    pub p_value: f64,
    /// Lagged differences chosen by the information criterion.
    pub used_lag: usize,
    pub n_obs: usize,
}

/// Augmented Dickey-Fuller unit-root test, constant only, AIC lag selection.
///
/// The lag search runs all candidates on the common sample of the largest lag;
/// the chosen lag is then refitted on its full sample.
///
/// # Errors
/// Returns `FypError::InsufficientData` for series shorter than the test can
/// handle and `FypError::NumericalInstability` for degenerate regressions.
pub fn adf_test(series: &[f64]) -> Result<AdfOutcome, FypError> {
    adf_test_with_ic(series, IcKind::Aic)
}

/// [`adf_test`] with the lag chosen by `ic` instead of AIC.
pub fn adf_test_with_ic(series: &[f64], ic: IcKind) -> Result<AdfOutcome, FypError> {
    let n = series.len();
    if n < MIN_ADF_OBS {
        return Err(FypError::InsufficientData {
            needed: MIN_ADF_OBS,
            available: n,
        });
    }
    let schwert = (12.0 * (n as f64 / 100.0).powf(0.25)).ceil() as usize;
    let maxlag = schwert.min(n / 2 - 2);
    let diffs = difference(series, 1);

    let mut best: Option<(f64, usize)> = None;
    for lags in 0..=maxlag {
        let (x, y) = adf_design(series, &diffs, lags, maxlag);
        let fit = fit_ols(&x, &y, true)?;
        let value = ic_value_from_rss(fit.ssr, fit.n_params(), fit.n_rows, ic);
        if best.map_or(true, |(b, _)| value < b) {
            best = Some((value, lags));
        }
    }
    let used_lag = best.map(|(_, l)| l).unwrap_or(0);

    let (x, y) = adf_design(series, &diffs, used_lag, used_lag);
    let fit = fit_ols(&x, &y, true)?;
    let se = coefficient_std_errors(&x, &fit)?;
    if se[0] <= 0.0 {
        return Err(FypError::NumericalInstability(
            "zero standard error on the level term".to_string(),
        ));
    }
    let statistic = fit.coeffs[0] / se[0];

    Ok(AdfOutcome {
        statistic,
        p_value: mackinnon_p(statistic),
        used_lag,
        n_obs: fit.n_rows,
    })
}

/// Regression of Δyₜ on yₜ₋₁ and `lags` lagged differences, starting at row `start`.
fn adf_design(levels: &[f64], diffs: &[f64], lags: usize, start: usize) -> (Array2<f64>, Array1<f64>) {
    let rows = diffs.len() - start;
    let mut x = Array2::<f64>::zeros((rows, lags + 1));
    let mut y = Array1::<f64>::zeros(rows);
    for r in 0..rows {
        let t = start + r;
        y[r] = diffs[t];
        x[[r, 0]] = levels[t];
        for j in 1..=lags {
            x[[r, j]] = diffs[t - j];
        }
    }
    (x, y)
}

/// MacKinnon approximate p-value of an ADF statistic.
pub fn mackinnon_p(statistic: f64) -> f64 {
    if statistic > TAU_MAX {
        return 1.0;
    }
    if statistic < TAU_MIN {
        return 0.0;
    }
    let coefs: &[f64] = if statistic <= TAU_STAR {
        &TAU_SMALLP
    } else {
        &TAU_LARGEP
    };
    let z = coefs.iter().rev().fold(0.0, |acc, c| acc * statistic + c);
    0.5 * erfc(-z / std::f64::consts::SQRT_2)
}

/// Sample autocorrelations for lags `0..=nlags`.
pub fn autocorrelation(series: &[f64], nlags: usize) -> Vec<f64> {
    let n = series.len();
    if n == 0 {
        return Vec::new();
    }
    let mean = series.iter().sum::<f64>() / n as f64;
    let denom: f64 = series.iter().map(|v| (v - mean).powi(2)).sum();
    (0..=nlags.min(n - 1))
        .map(|k| {
            if denom <= VARIANCE_EPS {
                return if k == 0 { 1.0 } else { 0.0 };
            }
            let num: f64 = (k..n)
                .map(|t| (series[t] - mean) * (series[t - k] - mean))
                .sum();
            num / denom
        })
        .collect()
}

/// Partial autocorrelations for lags `0..=nlags` via Durbin-Levinson.
pub fn partial_autocorrelation(series: &[f64], nlags: usize) -> Vec<f64> {
    let acf = autocorrelation(series, nlags);
    if acf.is_empty() {
        return acf;
    }
    let mut pacf = vec![1.0];
    let mut phi: Vec<f64> = Vec::new();
    let mut v: f64 = 1.0;
    for k in 1..acf.len() {
        let num = acf[k] - phi.iter().enumerate().map(|(j, p)| p * acf[k - 1 - j]).sum::<f64>();
        let a = if v.abs() > VARIANCE_EPS { num / v } else { 0.0 };
        let next: Vec<f64> = phi
            .iter()
            .enumerate()
            .map(|(j, p)| p - a * phi[k - 2 - j])
            .chain(std::iter::once(a))
            .collect();
        phi = next;
        v *= 1.0 - a * a;
        pacf.push(a);
    }
    pacf
}

fn has_variance(values: &[f64]) -> bool {
    let n = values.len() as f64;
    if values.is_empty() {
        return false;
    }
    let mean = values.iter().sum::<f64>() / n;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n > VARIANCE_EPS
}

/// Power-of-ten divisor bringing the mean magnitude near one.
pub fn normalization_scale(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 1.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    if !mean.is_finite() || mean == 0.0 {
        return 1.0;
    }
    10f64.powf(mean.abs().log10().round())
}

/// Derives a [`StationarityRecipe`] per feature from repeated ADF tests.
#[derive(Clone, Debug, Default)]
pub struct StationarityAdvisor {
    pub options: AdvisorOptions,
}

impl StationarityAdvisor {
    pub fn new(options: AdvisorOptions) -> Self {
        Self { options }
    }

    /// Recipe for one feature from its observed `(date, value)` pairs.
    ///
    /// Features the test cannot resolve get the differencing ceiling.
    pub fn derive_recipe(
        &self,
        name: &str,
        series: &[(NaiveDate, f64)],
    ) -> Result<StationarityRecipe, FypError> {
        let opts = &self.options;
        if opts.min_differences > opts.max_differences {
            return Err(FypError::InvalidConfig(format!(
                "min_differences {} exceeds max_differences {}",
                opts.min_differences, opts.max_differences
            )));
        }
        let periods = if opts.yoy_columns.iter().any(|c| c == name) {
            YOY_PERIODS
        } else {
            1
        };
        let all: Vec<f64> = series.iter().map(|(_, v)| *v).collect();
        let can_log = !all.is_empty() && all.iter().all(|v| *v > 0.0);
        let scale = if can_log { 1.0 } else { normalization_scale(&all) };

        let tested: Vec<f64> = series
            .iter()
            .filter(|(d, _)| opts.test_until.map_or(true, |until| *d <= until))
            .map(|(_, v)| if can_log { v.ln() } else { v / scale })
            .collect();

        let n_differences = self.differences_needed(name, tested, periods)?;
        let recipe = StationarityRecipe {
            can_log,
            n_differences,
            normalize: !can_log,
            scale,
            periods,
        };
        debug!(feature = name, ?recipe, "derived recipe");
        Ok(recipe)
    }

    fn differences_needed(
        &self,
        name: &str,
        mut values: Vec<f64>,
        periods: usize,
    ) -> Result<usize, FypError> {
        let opts = &self.options;
        let ceiling = if opts.single_difference_columns.iter().any(|c| c == name) {
            opts.max_differences.min(1)
        } else {
            opts.max_differences
        };
        let floor = opts.min_differences.min(ceiling);
        for d in 0..=ceiling {
            if d > 0 {
                values = difference(&values, periods);
            }
            if d < floor {
                continue;
            }
            if values.len() >= MIN_ADF_OBS && !has_variance(&values) {
                return Ok(d);
            }
            match adf_test_with_ic(&values, opts.lag_ic) {
                Ok(outcome) if outcome.p_value < opts.alpha => return Ok(d),
                Ok(_) => {}
                Err(e) if e.is_recoverable() => {
                    warn!(
                        feature = name,
                        differences = d,
                        error = %e,
                        fallback = ceiling,
                        "unit-root test could not run, using differencing ceiling"
                    );
                    return Ok(ceiling);
                }
                Err(e) => return Err(e),
            }
        }
        warn!(
            feature = name,
            fallback = ceiling,
            "unit root never rejected, using differencing ceiling"
        );
        Ok(ceiling)
    }

    /// Recipes for every column of `table`, in name order.
    pub fn derive_guide(&self, table: &TimeSeriesTable) -> Result<StationarityGuide, FypError> {
        let names = table.column_names();
        let recipes = names
            .par_iter()
            .map(|name| -> Result<(String, StationarityRecipe), FypError> {
                let series = table.observed(name)?;
                Ok((name.clone(), self.derive_recipe(name, &series)?))
            })
            .collect::<Result<Vec<_>, FypError>>()?;
        let guide = StationarityGuide {
            recipes: recipes.into_iter().collect(),
        };
        info!(
            features = guide.len(),
            logged = guide.recipes.values().filter(|r| r.can_log).count(),
            "derived stationarity guide"
        );
        Ok(guide)
    }
}

/// Feature name to recipe, in name order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StationarityGuide {
    recipes: BTreeMap<String, StationarityRecipe>,
}

impl StationarityGuide {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, recipe: StationarityRecipe) -> Result<(), FypError> {
        recipe.validate()?;
        self.recipes.insert(name.to_string(), recipe);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&StationarityRecipe, FypError> {
        self.recipes
            .get(name)
            .ok_or_else(|| FypError::UnknownColumn(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &StationarityRecipe)> {
        self.recipes.iter()
    }

    pub fn len(&self) -> usize {
        self.recipes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recipes.is_empty()
    }

    pub fn write_csv<W: Write>(&self, writer: W) -> Result<(), FypError> {
        let mut wtr = csv::Writer::from_writer(writer);
        for (name, recipe) in &self.recipes {
            wtr.serialize(RecipeRecord::new(name, recipe))?;
        }
        wtr.flush()?;
        Ok(())
    }

    pub fn read_csv<R: Read>(reader: R) -> Result<Self, FypError> {
        let mut rdr = csv::Reader::from_reader(reader);
        let mut guide = Self::new();
        for record in rdr.deserialize::<RecipeRecord>() {
            let (name, recipe): (String, StationarityRecipe) = record?.try_into()?;
            guide.recipes.insert(name, recipe);
        }
        Ok(guide)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integration_tests::{quarterly_dates, random_walk, white_noise};
    use approx::assert_abs_diff_eq;

    fn dated(values: &[f64]) -> Vec<(NaiveDate, f64)> {
        quarterly_dates(values.len())
            .into_iter()
            .zip(values.iter().copied())
            .collect()
    }

    #[test]
    fn test_mackinnon_bounds_and_continuity() {
        assert_eq!(mackinnon_p(3.0), 1.0);
        assert_eq!(mackinnon_p(-20.0), 0.0);
        // Both polynomials meet near the switch point.
        let below = mackinnon_p(TAU_STAR - 1e-9);
        let above = mackinnon_p(TAU_STAR + 1e-9);
        assert!((below - above).abs() < 0.01);
        // Familiar 5% critical value for the constant-only case.
        assert_abs_diff_eq!(mackinnon_p(-2.86), 0.05, epsilon = 0.01);
    }

    #[test]
    fn test_adf_rejects_white_noise() {
        let noise = white_noise(200, 7);
        let outcome = adf_test(&noise).unwrap();
        assert!(outcome.p_value < 0.01, "p = {}", outcome.p_value);
    }

    #[test]
    fn test_adf_short_series() {
        let result = adf_test(&[1.0, 2.0, 3.0]);
        assert!(matches!(result, Err(FypError::InsufficientData { .. })));
    }

    #[test]
    fn test_white_noise_needs_no_differencing() {
        let noise: Vec<f64> = white_noise(160, 11).iter().map(|v| v + 5.0).collect();
        let recipe = StationarityAdvisor::default()
            .derive_recipe("Noise", &dated(&noise))
            .unwrap();
        assert_eq!(recipe.n_differences, 0);
    }

    #[test]
    fn test_integrated_series_within_ceiling() {
        let walk = random_walk(160, 3);
        let integrated: Vec<f64> = walk
            .iter()
            .scan(0.0, |acc, v| {
                *acc += v;
                Some(*acc)
            })
            .collect();
        let recipe = StationarityAdvisor::default()
            .derive_recipe("Twice", &dated(&integrated))
            .unwrap();
        assert!(recipe.n_differences >= 1);
        assert!(recipe.n_differences <= 2);
    }

    #[test]
    fn test_random_walk_differenced_within_ceiling() {
        let walk: Vec<f64> = random_walk(160, 23).iter().map(|v| v + 50.0).collect();
        let recipe = StationarityAdvisor::default()
            .derive_recipe("Walk", &dated(&walk))
            .unwrap();
        assert!(recipe.n_differences >= 1);
        assert!(recipe.n_differences <= 2);
    }

    #[test]
    fn test_single_difference_columns_capped_at_one() {
        let opts = AdvisorOptions {
            single_difference_columns: vec!["SalesBase".into()],
            ..Default::default()
        };
        let advisor = StationarityAdvisor::new(opts);
        let short = dated(&[1.0, 2.0, 4.0]);
        assert_eq!(advisor.derive_recipe("SalesBase", &short).unwrap().n_differences, 1);
        assert_eq!(advisor.derive_recipe("CPI", &short).unwrap().n_differences, 2);

        let twice: Vec<f64> = random_walk(160, 3)
            .iter()
            .scan(0.0, |acc, v| {
                *acc += v;
                Some(*acc)
            })
            .collect();
        let recipe = advisor.derive_recipe("SalesBase", &dated(&twice)).unwrap();
        assert_eq!(recipe.n_differences, 1);
    }

    #[test]
    fn test_bic_lag_no_longer_than_aic() {
        let noise = white_noise(200, 7);
        let aic = adf_test_with_ic(&noise, IcKind::Aic).unwrap();
        let bic = adf_test_with_ic(&noise, IcKind::Bic).unwrap();
        assert!(bic.used_lag <= aic.used_lag);
        assert!(bic.p_value < 0.01);

        let opts = AdvisorOptions {
            lag_ic: IcKind::Bic,
            ..Default::default()
        };
        let shifted: Vec<f64> = noise.iter().map(|v| v + 5.0).collect();
        let recipe = StationarityAdvisor::new(opts)
            .derive_recipe("Noise", &dated(&shifted))
            .unwrap();
        assert_eq!(recipe.n_differences, 0);
    }

    #[test]
    fn test_recipe_log_or_normalize() {
        let positive: Vec<f64> = (0..40).map(|i| 100.0 + i as f64).collect();
        let recipe = StationarityAdvisor::default()
            .derive_recipe("Base", &dated(&positive))
            .unwrap();
        assert!(recipe.can_log && !recipe.normalize);

        let mixed: Vec<f64> = (0..40).map(|i| 3000.0 * ((i % 2) as f64 - 0.4)).collect();
        let recipe = StationarityAdvisor::default()
            .derive_recipe("Spread", &dated(&mixed))
            .unwrap();
        assert!(recipe.normalize && !recipe.can_log);
        assert_eq!(recipe.scale, 100.0);
    }

    #[test]
    fn test_short_series_falls_back_to_ceiling() {
        let recipe = StationarityAdvisor::default()
            .derive_recipe("Tiny", &dated(&[1.0, 2.0, 4.0]))
            .unwrap();
        assert_eq!(recipe.n_differences, 2);
    }

    #[test]
    fn test_constant_series_is_stationary() {
        let recipe = StationarityAdvisor::default()
            .derive_recipe("Flat", &dated(&[5.0; 30]))
            .unwrap();
        assert_eq!(recipe.n_differences, 0);
    }

    #[test]
    fn test_min_differences_and_yoy() {
        let opts = AdvisorOptions {
            min_differences: 1,
            yoy_columns: vec!["Noise".into()],
            ..Default::default()
        };
        let noise: Vec<f64> = white_noise(120, 5).iter().map(|v| v + 10.0).collect();
        let recipe = StationarityAdvisor::new(opts)
            .derive_recipe("Noise", &dated(&noise))
            .unwrap();
        assert!(recipe.n_differences >= 1);
        assert_eq!(recipe.periods, 4);
    }

    #[test]
    fn test_acf_pacf() {
        let phi = 0.6;
        let noise = white_noise(2000, 19);
        let mut ar = vec![0.0; noise.len()];
        for t in 1..noise.len() {
            ar[t] = phi * ar[t - 1] + noise[t];
        }
        let acf = autocorrelation(&ar, 3);
        let pacf = partial_autocorrelation(&ar, 3);
        assert_eq!(acf[0], 1.0);
        assert_abs_diff_eq!(acf[1], phi, epsilon = 0.08);
        assert_abs_diff_eq!(pacf[1], acf[1], epsilon = 1e-12);
        assert!(pacf[2].abs() < 0.1);
    }

    #[test]
    fn test_guide_csv_round_trip() {
        let mut guide = StationarityGuide::new();
        guide.insert("CPI", StationarityRecipe::logged(1, 1)).unwrap();
        guide
            .insert("Rate", StationarityRecipe::normalized(10.0, 0, 4))
            .unwrap();
        let mut buf = Vec::new();
        guide.write_csv(&mut buf).unwrap();
        let back = StationarityGuide::read_csv(buf.as_slice()).unwrap();
        assert_eq!(back, guide);
        assert!(matches!(back.get("GDP"), Err(FypError::UnknownColumn(_))));
    }

    #[test]
    fn test_guide_rejects_negative_differences() {
        let csv = "variable,can_log,n_differences,normalize,scale,periods\nCPI,true,-1,false,1.0,1\n";
        let result = StationarityGuide::read_csv(csv.as_bytes());
        assert!(matches!(result, Err(FypError::InvalidRecipe(_))));
    }
}
