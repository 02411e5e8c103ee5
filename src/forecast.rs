use std::collections::BTreeMap;
use std::io::Write;

use chrono::{Datelike, NaiveDate};
use ndarray::{concatenate, Array2, Axis};
use tracing::{info, warn};

use crate::data::{
    month_gap, period_start, seasonal_dummies, shift_months, Frequency, TimeSeriesTable,
};
use crate::preprocess::Preprocessor;
use crate::search::{exog_design, scaled_trial, trial_columns, trial_history};
use crate::types::{FitConfiguration, ForecastOptions, FypError};
use crate::var::{OlsVarEstimator, VarEstimator};

/// Fiscal years end June 30: July 2023 through June 2024 is fiscal 2024.
pub fn fiscal_year(date: NaiveDate) -> i32 {
    if date.month() >= 7 {
        date.year() + 1
    } else {
        date.year()
    }
}

/// Sum dated values by fiscal year.
pub fn aggregate_to_fiscal_year(values: &[(NaiveDate, f64)]) -> BTreeMap<i32, f64> {
    let mut totals = BTreeMap::new();
    for (date, value) in values {
        *totals.entry(fiscal_year(*date)).or_insert(0.0) += value;
    }
    totals
}

/// Plan-horizon forecast of one target, in levels.
#[derive(Clone, Debug)]
pub struct ForecastTable {
    pub target: String,
    /// Future periods and their (averaged) level forecasts.
    pub periods: Vec<(NaiveDate, f64)>,
    /// Model-space forecast of the best fit.
    pub scaled: Vec<(NaiveDate, f64)>,
    /// History plus forecast, summed by fiscal year.
    pub fiscal_years: BTreeMap<i32, f64>,
    /// Configurations that contributed, best first.
    pub configurations: Vec<FitConfiguration>,
}

impl ForecastTable {
    pub fn fiscal_year_total(&self, year: i32) -> Option<f64> {
        self.fiscal_years.get(&year).copied()
    }

    /// Totals for `years` consecutive fiscal years starting at `start`.
    pub fn plan_totals(&self, start: i32, years: usize) -> Vec<(i32, Option<f64>)> {
        (0..years as i32)
            .map(|i| (start + i, self.fiscal_year_total(start + i)))
            .collect()
    }

    /// Write `fiscal_year,<target>` rows.
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<(), FypError> {
        let mut wtr = csv::Writer::from_writer(writer);
        wtr.write_record(["fiscal_year", self.target.as_str()])?;
        for (year, total) in &self.fiscal_years {
            wtr.write_record([year.to_string(), total.to_string()])?;
        }
        wtr.flush()?;
        Ok(())
    }
}

struct FitForecast {
    levels: Vec<(NaiveDate, f64)>,
    scaled: Vec<(NaiveDate, f64)>,
    fiscal_years: BTreeMap<i32, f64>,
}

/// Refits ranked configurations and turns them into a plan forecast.
#[derive(Clone, Debug, Default)]
pub struct ForecastAssembler<E = OlsVarEstimator> {
    estimator: E,
}

impl ForecastAssembler<OlsVarEstimator> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<E: VarEstimator> ForecastAssembler<E> {
    pub fn with_estimator(estimator: E) -> Self {
        Self { estimator }
    }

    /// Forecast `target` through the last period of fiscal year
    /// `plan_start_year + horizon_years - 1`.
    ///
    /// `fits` are ranked best first. `future_exog` supplies raw exogenous
    /// values beyond the history; observed history takes precedence where
    /// both exist. Fits whose forecast periods differ from the best fit's are
    /// left out of the average.
    pub fn assemble<F: AsRef<FitConfiguration>>(
        &self,
        table: &TimeSeriesTable,
        preprocessor: &Preprocessor,
        fits: &[F],
        target: &str,
        future_exog: Option<&TimeSeriesTable>,
        opts: &ForecastOptions,
    ) -> Result<ForecastTable, FypError> {
        if opts.max_fits == 0 || opts.horizon_years == 0 {
            return Err(FypError::InvalidConfig(
                "max_fits and horizon_years must be positive".to_string(),
            ));
        }
        if fits.is_empty() {
            return Err(FypError::NoViableFit { trials: 0 });
        }
        let used = if opts.average { opts.max_fits } else { 1 };
        let last_fy = opts.plan_start_year + opts.horizon_years as i32 - 1;

        let mut forecasts: Vec<(FitConfiguration, FitForecast)> = Vec::new();
        for fit in fits.iter().take(used) {
            let config = fit.as_ref();
            if config.target() != target {
                return Err(FypError::InvalidConfig(format!(
                    "configuration targets {} instead of {}",
                    config.target(),
                    target
                )));
            }
            let forecast = self.forecast_one(table, preprocessor, config, future_exog, last_fy)?;
            forecasts.push((config.clone(), forecast));
        }

        let best_dates: Vec<NaiveDate> = forecasts[0].1.levels.iter().map(|(d, _)| *d).collect();
        let aligned: Vec<&(FitConfiguration, FitForecast)> = forecasts
            .iter()
            .filter(|(config, f)| {
                let same = f.levels.iter().map(|(d, _)| *d).eq(best_dates.iter().copied());
                if !same {
                    warn!(?config, "forecast periods differ from the best fit, not averaged");
                }
                same
            })
            .collect();
        let n = aligned.len() as f64;

        let periods = best_dates
            .iter()
            .enumerate()
            .map(|(i, d)| (*d, aligned.iter().map(|(_, f)| f.levels[i].1).sum::<f64>() / n))
            .collect();

        let mut fiscal_years: BTreeMap<i32, f64> = BTreeMap::new();
        let mut counts: BTreeMap<i32, usize> = BTreeMap::new();
        for (_, f) in &aligned {
            for (year, total) in &f.fiscal_years {
                *fiscal_years.entry(*year).or_insert(0.0) += total;
                *counts.entry(*year).or_insert(0) += 1;
            }
        }
        for (year, total) in fiscal_years.iter_mut() {
            *total /= counts[year] as f64;
        }

        info!(
            series = target,
            fits = aligned.len(),
            periods = best_dates.len(),
            last_fiscal_year = last_fy,
            "assembled forecast"
        );
        Ok(ForecastTable {
            target: target.to_string(),
            periods,
            scaled: forecasts[0].1.scaled.clone(),
            fiscal_years,
            configurations: aligned.iter().map(|(c, _)| c.clone()).collect(),
        })
    }

    fn forecast_one(
        &self,
        table: &TimeSeriesTable,
        preprocessor: &Preprocessor,
        config: &FitConfiguration,
        future_exog: Option<&TimeSeriesTable>,
        last_fy: i32,
    ) -> Result<FitForecast, FypError> {
        let fit_raw = trial_history(table, config)?;
        let (fit_scaled, freq) = scaled_trial(preprocessor, &fit_raw)?;
        let fit_exog = exog_design(&fit_scaled, config, freq)?;
        let fit_endog = fit_scaled.dense_matrix(&config.endog_cols)?;
        let model = self.estimator.fit(&fit_endog, fit_exog.as_ref(), config.order)?;

        // Fitted through the cutoff, seeded from everything observed after it.
        let raw = trial_columns(table, config)?;
        let (scaled, _) = scaled_trial(preprocessor, &raw)?;
        let endog = scaled.dense_matrix(&config.endog_cols)?;

        let last = scaled.last_date().ok_or(FypError::EmptyInput)?;
        let start = shift_months(last, freq.months() as i32)?;
        let horizon_end = NaiveDate::from_ymd_opt(last_fy, 6, 30)
            .map(|d| period_start(d, freq))
            .ok_or_else(|| FypError::InvalidConfig(format!("invalid fiscal year {}", last_fy)))?;
        let gap = month_gap(start, horizon_end);
        if gap < 0 {
            return Err(FypError::InvalidConfig(format!(
                "plan horizon ends {} before the forecast starts {}",
                horizon_end, start
            )));
        }
        let steps = gap as usize / freq.months() as usize + 1;
        let dates = (0..steps)
            .map(|i| shift_months(start, (i as u32 * freq.months()) as i32))
            .collect::<Result<Vec<_>, _>>()?;

        let future = self.future_exog(table, preprocessor, config, future_exog, &dates, freq)?;
        let path = model.forecast(&endog, steps, future.as_ref())?;

        let target = config.target();
        let scaled_path: Vec<(NaiveDate, f64)> =
            dates.iter().copied().zip(path.column(0).iter().copied()).collect();
        let levels = preprocessor.inverse_forecast(target, &scaled_path, &raw)?;

        let mut combined = raw.before(start).observed(target)?;
        combined.extend(levels.iter().copied());
        Ok(FitForecast {
            fiscal_years: aggregate_to_fiscal_year(&combined),
            levels,
            scaled: scaled_path,
        })
    }

    fn future_exog(
        &self,
        table: &TimeSeriesTable,
        preprocessor: &Preprocessor,
        config: &FitConfiguration,
        supplied: Option<&TimeSeriesTable>,
        dates: &[NaiveDate],
        freq: Frequency,
    ) -> Result<Option<Array2<f64>>, FypError> {
        let mut blocks = Vec::new();
        if !config.exog_cols.is_empty() {
            let mut raw = table.select(&config.exog_cols)?;
            if let Some(extra) = supplied {
                raw = raw.merge_with(&extra.select(&config.exog_cols)?)?;
            }
            if config.model_quarters {
                raw = raw.to_quarterly()?;
            }
            let scaled = preprocessor.transform_table(&raw)?;
            let mut block = Array2::<f64>::zeros((dates.len(), config.exog_cols.len()));
            for (j, name) in config.exog_cols.iter().enumerate() {
                for (i, date) in dates.iter().enumerate() {
                    block[[i, j]] = scaled.value_at(name, *date).ok_or_else(|| {
                        FypError::Schema(format!("no future value for {} at {}", name, date))
                    })?;
                }
            }
            blocks.push(block);
        }
        if config.seasonal_dummies {
            blocks.push(seasonal_dummies(dates, freq));
        }
        if blocks.is_empty() {
            return Ok(None);
        }
        let views: Vec<_> = blocks.iter().map(|b| b.view()).collect();
        concatenate(Axis(1), &views)
            .map(Some)
            .map_err(|e| FypError::Schema(format!("future exogenous design: {}", e)))
    }
}
