use chrono::NaiveDate;
use tracing::debug;

use crate::data::{shift_months, TimeSeriesTable};
use crate::stationarity::StationarityGuide;
use crate::types::{FypError, StationarityRecipe};

/// `values[t] - values[t - periods]`, dropping the first `periods` values.
pub fn difference(values: &[f64], periods: usize) -> Vec<f64> {
    if periods == 0 || values.len() <= periods {
        return Vec::new();
    }
    (periods..values.len())
        .map(|t| values[t] - values[t - periods])
        .collect()
}

fn to_model_space(value: f64, recipe: &StationarityRecipe) -> Result<f64, FypError> {
    if recipe.can_log {
        if value <= 0.0 {
            return Err(FypError::InvalidRecipe(format!(
                "cannot take the log of non-positive value {}",
                value
            )));
        }
        Ok(value.ln())
    } else {
        Ok(value / recipe.scale)
    }
}

/// Forward transform: log or rescale, then difference `n_differences` times.
///
/// The output is `recipe.warmup()` values shorter than the input.
pub fn transform(raw: &[f64], recipe: &StationarityRecipe) -> Result<Vec<f64>, FypError> {
    recipe.validate()?;
    let mut values = raw
        .iter()
        .map(|v| to_model_space(*v, recipe))
        .collect::<Result<Vec<_>, _>>()?;
    for _ in 0..recipe.n_differences {
        values = difference(&values, recipe.periods);
    }
    Ok(values)
}

/// Invert [`transform`] for values that directly follow `anchor`.
///
/// `anchor` holds raw levels immediately preceding `scaled[0]`; only its last
/// `recipe.warmup()` values are used.
///
/// # Errors
/// Returns `FypError::InvalidRecipe` for an invalid recipe or an unusable
/// anchor and `FypError::NumericalInstability` if the levels overflow.
pub fn inverse_transform(
    scaled: &[f64],
    recipe: &StationarityRecipe,
    anchor: &[f64],
) -> Result<Vec<f64>, FypError> {
    recipe.validate()?;
    let need = recipe.warmup();
    if anchor.len() < need {
        return Err(FypError::InvalidRecipe(format!(
            "anchor has {} values, {} required",
            anchor.len(),
            need
        )));
    }
    let base = anchor[anchor.len() - need..]
        .iter()
        .map(|v| to_model_space(*v, recipe))
        .collect::<Result<Vec<_>, _>>()?;

    // tails[k] is the anchor differenced k times.
    let mut tails: Vec<Vec<f64>> = Vec::with_capacity(recipe.n_differences);
    if recipe.n_differences > 0 {
        tails.push(base);
        for k in 1..recipe.n_differences {
            let next = difference(&tails[k - 1], recipe.periods);
            tails.push(next);
        }
    }

    let p = recipe.periods;
    let mut values = scaled.to_vec();
    for tail in tails.iter().rev() {
        let mut history: Vec<f64> = tail[tail.len() - p..].to_vec();
        for v in &values {
            let level = v + history[history.len() - p];
            history.push(level);
        }
        values = history.split_off(p);
    }

    values
        .into_iter()
        .map(|v| {
            let level = if recipe.can_log { v.exp() } else { v * recipe.scale };
            if level.is_finite() {
                Ok(level)
            } else {
                Err(FypError::NumericalInstability(format!(
                    "inverse transform overflowed from {}",
                    v
                )))
            }
        })
        .collect()
}

/// Forward transform that keeps positions; missing inputs or warm-up rows become `None`.
pub fn transform_column(
    values: &[Option<f64>],
    recipe: &StationarityRecipe,
) -> Result<Vec<Option<f64>>, FypError> {
    recipe.validate()?;
    let mut out = values
        .iter()
        .map(|v| v.map(|x| to_model_space(x, recipe)).transpose())
        .collect::<Result<Vec<_>, _>>()?;
    let p = recipe.periods;
    for _ in 0..recipe.n_differences {
        out = (0..out.len())
            .map(|t| match (t.checked_sub(p).and_then(|s| out[s]), out[t]) {
                (Some(prev), Some(cur)) => Some(cur - prev),
                _ => None,
            })
            .collect();
    }
    Ok(out)
}

/// Applies a [`StationarityGuide`] to tables and inverts forecasts back to levels.
#[derive(Clone, Debug)]
pub struct Preprocessor {
    guide: StationarityGuide,
}

impl Preprocessor {
    pub fn new(guide: StationarityGuide) -> Self {
        Self { guide }
    }

    pub fn guide(&self) -> &StationarityGuide {
        &self.guide
    }

    pub fn recipe(&self, name: &str) -> Result<&StationarityRecipe, FypError> {
        self.guide.get(name)
    }

    /// Transform every column and keep the rows where all of them are present.
    pub fn transform_table(&self, table: &TimeSeriesTable) -> Result<TimeSeriesTable, FypError> {
        let mut scaled = TimeSeriesTable::new(table.dates().to_vec())?;
        for name in table.column_names() {
            let recipe = self.recipe(&name)?;
            scaled.insert_column(&name, transform_column(table.column(&name)?, recipe)?)?;
        }
        let complete = scaled.complete_rows();
        debug!(
            rows_in = table.len(),
            rows_out = complete.len(),
            "transformed table"
        );
        Ok(complete)
    }

    /// Invert a dated model-space forecast of `column` using raw `history` as anchor.
    ///
    /// The anchor is the last `warmup` raw values dated before the first
    /// forecast date; they must be observed and the forecast must start on the
    /// period right after them.
    pub fn inverse_forecast(
        &self,
        column: &str,
        forecast: &[(NaiveDate, f64)],
        history: &TimeSeriesTable,
    ) -> Result<Vec<(NaiveDate, f64)>, FypError> {
        let recipe = self.recipe(column)?;
        let Some(&(first, _)) = forecast.first() else {
            return Ok(Vec::new());
        };
        let need = recipe.warmup();
        let prior = history.before(first);
        let raw = prior.column(column)?;
        if raw.len() < need {
            return Err(FypError::InvalidRecipe(format!(
                "{}: {} history rows before {}, {} required",
                column,
                raw.len(),
                first,
                need
            )));
        }
        if need > 0 {
            if let Some(last) = prior.last_date() {
                let step = prior.frequency().or_else(|_| history.frequency())?.months();
                if shift_months(last, step as i32)? != first {
                    return Err(FypError::Schema(format!(
                        "{}: forecast starting {} does not follow history ending {}",
                        column, first, last
                    )));
                }
            }
        }
        let anchor = raw[raw.len() - need..]
            .iter()
            .map(|v| {
                v.ok_or_else(|| {
                    FypError::InvalidRecipe(format!("{}: missing anchor value before {}", column, first))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let scaled: Vec<f64> = forecast.iter().map(|(_, v)| *v).collect();
        let levels = inverse_transform(&scaled, recipe, &anchor)?;
        Ok(forecast.iter().map(|(d, _)| *d).zip(levels).collect())
    }
}
