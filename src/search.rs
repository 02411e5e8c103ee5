use std::cmp::Ordering;
use std::io::{Read, Write};

use chrono::NaiveDate;
use ndarray::{concatenate, s, Array2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::causality::CausalityMatrix;
use crate::data::{seasonal_dummies, Frequency, TimeSeriesTable};
use crate::preprocess::Preprocessor;
use crate::selection::possible_exog;
use crate::types::{FitConfiguration, FypError, GridSpec};
use crate::var::{OlsVarEstimator, VarEstimator, VarFit};

/// One scored grid-search trial.
#[derive(Clone, Debug)]
pub struct FitResult {
    pub config: FitConfiguration,
    /// Model fitted on every scaled row up to the cutoff.
    pub model: VarFit,
    /// AIC of `model`.
    pub information_criterion: f64,
    /// Target MAPE over all held-out periods, in levels.
    pub mape: f64,
    pub split_mapes: Vec<f64>,
}

impl AsRef<FitConfiguration> for FitResult {
    fn as_ref(&self) -> &FitConfiguration {
        &self.config
    }
}

/// Training and test row ranges of an expanding-window split.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Split {
    pub train_end: usize,
    pub test_end: usize,
}

/// Expanding-window splits holding out the last `n_splits` blocks of `n / (n_splits + 1)` rows.
pub fn time_series_splits(n: usize, n_splits: usize) -> Result<Vec<Split>, FypError> {
    if n_splits == 0 {
        return Err(FypError::InvalidConfig("n_splits must be positive".to_string()));
    }
    let test_size = n / (n_splits + 1);
    if test_size == 0 {
        return Err(FypError::InsufficientData {
            needed: n_splits + 1,
            available: n,
        });
    }
    Ok((0..n_splits)
        .map(|i| {
            let train_end = n - (n_splits - i) * test_size;
            Split {
                train_end,
                test_end: train_end + test_size,
            }
        })
        .collect())
}

/// All `size`-element combinations of `pool`, in lexicographic index order.
pub(crate) fn combinations(pool: &[String], size: usize) -> Vec<Vec<String>> {
    fn visit(
        start: usize,
        pool: &[String],
        size: usize,
        current: &mut Vec<String>,
        out: &mut Vec<Vec<String>>,
    ) {
        if current.len() == size {
            out.push(current.clone());
            return;
        }
        for idx in start..pool.len() {
            current.push(pool[idx].clone());
            visit(idx + 1, pool, size, current, out);
            current.pop();
        }
    }
    let mut out = Vec::new();
    if size <= pool.len() {
        visit(0, pool, size, &mut Vec::with_capacity(size), &mut out);
    }
    out
}

fn sorted_unique<T: Ord + Clone>(values: &[T]) -> Vec<T> {
    let mut out = values.to_vec();
    out.sort();
    out.dedup();
    out
}

/// Exogenous regressors of a trial: scaled exog columns, then seasonal dummies at `freq`.
pub(crate) fn exog_design(
    scaled: &TimeSeriesTable,
    config: &FitConfiguration,
    freq: Frequency,
) -> Result<Option<Array2<f64>>, FypError> {
    let mut blocks = Vec::new();
    if !config.exog_cols.is_empty() {
        blocks.push(scaled.dense_matrix(&config.exog_cols)?);
    }
    if config.seasonal_dummies {
        blocks.push(seasonal_dummies(scaled.dates(), freq));
    }
    match blocks.len() {
        0 => Ok(None),
        _ => {
            let views: Vec<_> = blocks.iter().map(|b| b.view()).collect();
            concatenate(Axis(1), &views)
                .map(Some)
                .map_err(|e| FypError::Schema(format!("exogenous design: {}", e)))
        }
    }
}

/// Raw columns of a trial, resampled to quarters when the configuration asks.
pub(crate) fn trial_columns(
    table: &TimeSeriesTable,
    config: &FitConfiguration,
) -> Result<TimeSeriesTable, FypError> {
    let raw = table.select(&config.columns())?;
    if config.model_quarters {
        raw.to_quarterly()
    } else {
        Ok(raw)
    }
}

/// Raw history of a trial up to its cutoff.
pub(crate) fn trial_history(
    table: &TimeSeriesTable,
    config: &FitConfiguration,
) -> Result<TimeSeriesTable, FypError> {
    trial_columns(&table.until(config.max_fit_date), config)
}

/// Scale `raw` and return it with its sampling frequency.
///
/// # Errors
/// Returns `FypError::InsufficientData` when a missing value leaves a hole
/// inside the scaled rows.
pub(crate) fn scaled_trial(
    preprocessor: &Preprocessor,
    raw: &TimeSeriesTable,
) -> Result<(TimeSeriesTable, Frequency), FypError> {
    let freq = raw.frequency()?;
    let scaled = preprocessor.transform_table(raw)?;
    scaled.ensure_contiguous(freq)?;
    Ok((scaled, freq))
}

/// Brute-force VAR model selection scored by time-series cross-validation.
#[derive(Clone, Debug, Default)]
pub struct GridSearchEngine<E = OlsVarEstimator> {
    estimator: E,
}

impl GridSearchEngine<OlsVarEstimator> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<E: VarEstimator> GridSearchEngine<E> {
    pub fn with_estimator(estimator: E) -> Self {
        Self { estimator }
    }

    pub fn estimator(&self) -> &E {
        &self.estimator
    }

    /// Deterministic list of trials for `grid`.
    ///
    /// Endogenous sets come first (target plus name-sorted subsets of the
    /// pool, smallest first), then causality-gated exogenous subsets, then
    /// orders, cutoffs, quarterly and seasonal options.
    pub fn enumerate(
        &self,
        table: &TimeSeriesTable,
        causality: &CausalityMatrix,
        grid: &GridSpec,
    ) -> Result<Vec<FitConfiguration>, FypError> {
        if !table.has_column(&grid.target) {
            return Err(FypError::UnknownColumn(grid.target.clone()));
        }
        if grid.orders.is_empty() || grid.orders.contains(&0) {
            return Err(FypError::InvalidConfig(
                "orders must be non-empty and positive".to_string(),
            ));
        }
        if grid.n_splits == 0 {
            return Err(FypError::InvalidConfig("n_splits must be positive".to_string()));
        }

        let others: Vec<String> = sorted_unique(&grid.other_endog_pool)
            .into_iter()
            .filter(|c| *c != grid.target)
            .collect();
        let orders = sorted_unique(&grid.orders);
        let cutoffs: Vec<NaiveDate> = if grid.cutoff_dates.is_empty() {
            vec![table.last_date().ok_or(FypError::EmptyInput)?]
        } else {
            sorted_unique(&grid.cutoff_dates)
        };
        let flags = |options: &[bool]| {
            if options.is_empty() {
                vec![false]
            } else {
                sorted_unique(options)
            }
        };
        let quarterly = flags(&grid.quarterly_options);
        let seasonal = flags(&grid.seasonal_options);

        let mut configs = Vec::new();
        for size in 0..=grid.max_other_endog.min(others.len()) {
            for subset in combinations(&others, size) {
                let mut endog_cols = vec![grid.target.clone()];
                endog_cols.extend(subset);
                let gated = possible_exog(causality, &endog_cols, &grid.exog_pool, grid.alpha)?;
                for exog_size in 0..=grid.max_exog.min(gated.len()) {
                    for exog_cols in combinations(&gated, exog_size) {
                        for &order in &orders {
                            for &max_fit_date in &cutoffs {
                                for &model_quarters in &quarterly {
                                    for &seasonal_dummies in &seasonal {
                                        configs.push(FitConfiguration {
                                            endog_cols: endog_cols.clone(),
                                            exog_cols: exog_cols.clone(),
                                            order,
                                            max_fit_date,
                                            model_quarters,
                                            seasonal_dummies,
                                        });
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }

        if let Some(cap) = grid.max_trials {
            if configs.len() > cap {
                warn!(enumerated = configs.len(), cap, "truncating grid to max_trials");
                configs.truncate(cap);
            }
        }
        Ok(configs)
    }

    /// Fit and cross-validate one trial.
    pub fn evaluate(
        &self,
        table: &TimeSeriesTable,
        preprocessor: &Preprocessor,
        config: &FitConfiguration,
        n_splits: usize,
    ) -> Result<FitResult, FypError> {
        let raw = trial_history(table, config)?;
        let (scaled, freq) = scaled_trial(preprocessor, &raw)?;
        let endog = scaled.dense_matrix(&config.endog_cols)?;
        let exog = exog_design(&scaled, config, freq)?;

        let model = self.estimator.fit(&endog, exog.as_ref(), config.order)?;
        let target = config.target();

        let mut split_mapes = Vec::with_capacity(n_splits);
        let mut total_error = 0.0;
        let mut total_count = 0usize;
        for split in time_series_splits(scaled.len(), n_splits)? {
            let (train, test) = (split.train_end, split.test_end);
            let fold_exog = exog.as_ref().map(|x| x.slice(s![..train, ..]).to_owned());
            let future_exog = exog.as_ref().map(|x| x.slice(s![train..test, ..]).to_owned());
            let train_endog = endog.slice(s![..train, ..]).to_owned();

            let fold = self
                .estimator
                .fit(&train_endog, fold_exog.as_ref(), config.order)?;
            let path = fold.forecast(&train_endog, test - train, future_exog.as_ref())?;

            let dates = &scaled.dates()[train..test];
            let forecast: Vec<(NaiveDate, f64)> = dates
                .iter()
                .copied()
                .zip(path.column(0).iter().copied())
                .collect();
            let levels = preprocessor.inverse_forecast(target, &forecast, &raw.before(dates[0]))?;

            let mut fold_error = 0.0;
            for (date, predicted) in &levels {
                let actual = raw.value_at(target, *date).ok_or_else(|| {
                    FypError::Schema(format!("{} has no actual value at {}", target, date))
                })?;
                if actual == 0.0 {
                    return Err(FypError::NumericalInstability(format!(
                        "{} is zero at {}, MAPE undefined",
                        target, date
                    )));
                }
                fold_error += ((predicted - actual) / actual).abs();
            }
            split_mapes.push(fold_error / levels.len() as f64);
            total_error += fold_error;
            total_count += levels.len();
        }

        let mape = total_error / total_count as f64;
        if !mape.is_finite() {
            return Err(FypError::NumericalInstability(format!(
                "non-finite MAPE for order {}",
                config.order
            )));
        }
        Ok(FitResult {
            config: config.clone(),
            information_criterion: model.aic,
            model,
            mape,
            split_mapes,
        })
    }

    /// Run every trial in parallel and rank by MAPE, then AIC, then enumeration order.
    ///
    /// # Errors
    /// Trial-local `InsufficientData` and `NumericalInstability` are skipped;
    /// any other error aborts. Returns `FypError::NoViableFit` if nothing survives.
    pub fn search(
        &self,
        table: &TimeSeriesTable,
        preprocessor: &Preprocessor,
        causality: &CausalityMatrix,
        grid: &GridSpec,
    ) -> Result<Vec<FitResult>, FypError> {
        let configs = self.enumerate(table, causality, grid)?;
        let trials = configs.len();
        info!(trials, series = grid.target.as_str(), "starting grid search");

        let outcomes: Vec<Result<FitResult, FypError>> = configs
            .par_iter()
            .map(|config| self.evaluate(table, preprocessor, config, grid.n_splits))
            .collect();

        let mut results = Vec::with_capacity(trials);
        let mut skipped = 0usize;
        for (config, outcome) in configs.iter().zip(outcomes) {
            match outcome {
                Ok(result) => results.push(result),
                Err(e) if e.is_recoverable() => {
                    skipped += 1;
                    debug!(?config, error = %e, "trial skipped");
                }
                Err(e) => return Err(e),
            }
        }
        if results.is_empty() {
            return Err(FypError::NoViableFit { trials });
        }

        results.sort_by(|a, b| {
            a.mape
                .partial_cmp(&b.mape)
                .unwrap_or(Ordering::Equal)
                .then_with(|| {
                    a.information_criterion
                        .partial_cmp(&b.information_criterion)
                        .unwrap_or(Ordering::Equal)
                })
        });
        info!(
            fitted = results.len(),
            skipped,
            best_mape = results[0].mape,
            "grid search finished"
        );
        Ok(results)
    }
}

/// Flat summary of a ranked [`FitResult`]; list columns are `;`-joined.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FitRecord {
    pub rank: usize,
    pub target: String,
    pub endog_cols: String,
    pub exog_cols: String,
    pub order: usize,
    pub max_fit_date: NaiveDate,
    pub model_quarters: bool,
    pub seasonal_dummies: bool,
    pub aic: f64,
    pub mape: f64,
}

fn split_list(joined: &str) -> Vec<String> {
    joined
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl FitRecord {
    pub fn new(rank: usize, result: &FitResult) -> Self {
        Self {
            rank,
            target: result.config.target().to_string(),
            endog_cols: result.config.endog_cols.join(";"),
            exog_cols: result.config.exog_cols.join(";"),
            order: result.config.order,
            max_fit_date: result.config.max_fit_date,
            model_quarters: result.config.model_quarters,
            seasonal_dummies: result.config.seasonal_dummies,
            aic: result.information_criterion,
            mape: result.mape,
        }
    }

    pub fn configuration(&self) -> Result<FitConfiguration, FypError> {
        let endog_cols = split_list(&self.endog_cols);
        if endog_cols.first() != Some(&self.target) {
            return Err(FypError::Schema(format!(
                "fit record {} does not lead with its target {}",
                self.rank, self.target
            )));
        }
        Ok(FitConfiguration {
            endog_cols,
            exog_cols: split_list(&self.exog_cols),
            order: self.order,
            max_fit_date: self.max_fit_date,
            model_quarters: self.model_quarters,
            seasonal_dummies: self.seasonal_dummies,
        })
    }
}

pub fn write_fit_records<W: Write>(writer: W, results: &[FitResult]) -> Result<(), FypError> {
    let mut wtr = csv::Writer::from_writer(writer);
    for (rank, result) in results.iter().enumerate() {
        wtr.serialize(FitRecord::new(rank + 1, result))?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn read_fit_records<R: Read>(reader: R) -> Result<Vec<FitRecord>, FypError> {
    let mut rdr = csv::Reader::from_reader(reader);
    rdr.deserialize()
        .map(|r| r.map_err(FypError::from))
        .collect()
}
