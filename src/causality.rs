use std::io::{Read, Write};

use ndarray::{Array1, Array2};
use rayon::prelude::*;
use statrs::distribution::{ChiSquared, ContinuousCDF, FisherSnedecor};
use tracing::{debug, info};

use crate::data::{lagged_rows, TimeSeriesTable};
use crate::defaults::UNTESTED_SENTINEL;
use crate::ols::fit_ols;
use crate::types::{CausalityOptions, FypError, GrangerTest};

const SSR_EPS: f64 = 1e-14;

/// Result of one Granger test at a fixed lag.
#[derive(Clone, Copy, Debug)]
pub struct GrangerOutcome {
    pub statistic: f64,
    pub p_value: f64,
    pub lag: usize,
}

/// Test whether lags of `cause` improve a regression of `effect` on its own lags.
///
/// Both regressions include a constant and use the rows `lag..n`.
///
/// # Errors
/// Returns `FypError::LengthMismatch` for unequal inputs,
/// `FypError::InsufficientData` when the unrestricted model has no residual
/// degrees of freedom and `FypError::NumericalInstability` for a perfect fit.
pub fn granger_test(
    cause: &[f64],
    effect: &[f64],
    lag: usize,
    test: GrangerTest,
) -> Result<GrangerOutcome, FypError> {
    if cause.len() != effect.len() {
        return Err(FypError::LengthMismatch);
    }
    if lag == 0 {
        return Err(FypError::InvalidConfig("Granger lag must be positive".to_string()));
    }
    let rows = lagged_rows(effect.len(), lag, 2 * lag + 1)?;

    let mut x_r = Array2::<f64>::zeros((rows, lag));
    let mut x_u = Array2::<f64>::zeros((rows, 2 * lag));
    let mut y = Array1::<f64>::zeros(rows);
    for r in 0..rows {
        let t = lag + r;
        y[r] = effect[t];
        for j in 1..=lag {
            x_r[[r, j - 1]] = effect[t - j];
            x_u[[r, j - 1]] = effect[t - j];
            x_u[[r, lag + j - 1]] = cause[t - j];
        }
    }

    let restricted = fit_ols(&x_r, &y, true)?;
    let unrestricted = fit_ols(&x_u, &y, true)?;
    if unrestricted.ssr <= SSR_EPS {
        return Err(FypError::NumericalInstability(
            "unrestricted Granger regression fits exactly".to_string(),
        ));
    }
    let gain = (restricted.ssr - unrestricted.ssr).max(0.0) / unrestricted.ssr;
    let df_resid = unrestricted.df_resid() as f64;

    let (statistic, p_value) = match test {
        GrangerTest::SsrChi2 => {
            let stat = rows as f64 * gain;
            let dist = ChiSquared::new(lag as f64)
                .map_err(|e| FypError::NumericalInstability(format!("{:?}", e)))?;
            (stat, dist.sf(stat))
        }
        GrangerTest::SsrF => {
            let stat = gain * df_resid / lag as f64;
            let dist = FisherSnedecor::new(lag as f64, df_resid)
                .map_err(|e| FypError::NumericalInstability(format!("{:?}", e)))?;
            (stat, dist.sf(stat))
        }
    };

    Ok(GrangerOutcome {
        statistic,
        p_value,
        lag,
    })
}

/// Why an ordered pair carries no p-value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UntestedReason {
    SameFeature,
    /// Fewer joint observations than the lag search requires.
    InsufficientData,
    /// No lag produced a usable regression.
    Degenerate,
    /// Loaded from a file, which does not keep the reason.
    Unrecorded,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CausalityCell {
    /// Minimum p-value over lags and the lag that achieved it (0 when loaded from a file).
    Tested { p_value: f64, best_lag: usize },
    Untested(UntestedReason),
}

impl CausalityCell {
    pub fn p_value(&self) -> Option<f64> {
        match self {
            CausalityCell::Tested { p_value, .. } => Some(*p_value),
            CausalityCell::Untested(_) => None,
        }
    }
}

/// Tested ordered pair with its minimum p-value.
#[derive(Clone, Debug, PartialEq)]
pub struct CausalityEntry {
    pub cause: String,
    pub effect: String,
    pub min_p_value: f64,
}

/// Pairwise Granger p-values. Rows are causes, columns are effects.
#[derive(Clone, Debug, PartialEq)]
pub struct CausalityMatrix {
    features: Vec<String>,
    cells: Vec<CausalityCell>,
}

impl CausalityMatrix {
    /// Test every ordered pair of columns in `table`.
    pub fn compute(table: &TimeSeriesTable, opts: &CausalityOptions) -> Result<Self, FypError> {
        if opts.max_lag == 0 {
            return Err(FypError::InvalidConfig("max_lag must be positive".to_string()));
        }
        let table = match opts.cutoff {
            Some(cutoff) => table.until(cutoff),
            None => table.clone(),
        };
        let features = table.column_names();
        let k = features.len();
        let pairs: Vec<(usize, usize)> = (0..k).flat_map(|i| (0..k).map(move |j| (i, j))).collect();

        let cells = pairs
            .par_iter()
            .map(|&(i, j)| {
                if i == j {
                    return Ok(CausalityCell::Untested(UntestedReason::SameFeature));
                }
                pair_cell(&table, &features[i], &features[j], opts)
            })
            .collect::<Result<Vec<_>, FypError>>()?;

        let tested = cells.iter().filter(|c| c.p_value().is_some()).count();
        info!(
            features = k,
            tested,
            untested = k * k.saturating_sub(1) - tested,
            "computed causality matrix"
        );
        Ok(Self { features, cells })
    }

    pub fn features(&self) -> &[String] {
        &self.features
    }

    fn index(&self, name: &str) -> Result<usize, FypError> {
        self.features
            .iter()
            .position(|f| f == name)
            .ok_or_else(|| FypError::UnknownColumn(name.to_string()))
    }

    pub fn cell(&self, cause: &str, effect: &str) -> Result<&CausalityCell, FypError> {
        let i = self.index(cause)?;
        let j = self.index(effect)?;
        Ok(&self.cells[i * self.features.len() + j])
    }

    pub fn p_value(&self, cause: &str, effect: &str) -> Result<Option<f64>, FypError> {
        Ok(self.cell(cause, effect)?.p_value())
    }

    /// Tested and below `alpha`. Untested pairs are never significant.
    pub fn is_significant(&self, cause: &str, effect: &str, alpha: f64) -> Result<bool, FypError> {
        Ok(self.p_value(cause, effect)?.is_some_and(|p| p < alpha))
    }

    pub fn entries(&self) -> Vec<CausalityEntry> {
        let k = self.features.len();
        self.cells
            .iter()
            .enumerate()
            .filter_map(|(idx, cell)| {
                cell.p_value().map(|p| CausalityEntry {
                    cause: self.features[idx / k].clone(),
                    effect: self.features[idx % k].clone(),
                    min_p_value: p,
                })
            })
            .collect()
    }

    /// Square CSV, `-1` marking untested pairs.
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<(), FypError> {
        let mut wtr = csv::Writer::from_writer(writer);
        let mut header = vec!["cause".to_string()];
        header.extend(self.features.iter().cloned());
        wtr.write_record(&header)?;
        let k = self.features.len();
        for (i, name) in self.features.iter().enumerate() {
            let mut record = vec![name.clone()];
            record.extend(
                self.cells[i * k..(i + 1) * k]
                    .iter()
                    .map(|c| c.p_value().unwrap_or(UNTESTED_SENTINEL).to_string()),
            );
            wtr.write_record(&record)?;
        }
        wtr.flush()?;
        Ok(())
    }

    pub fn read_csv<R: Read>(reader: R) -> Result<Self, FypError> {
        let mut rdr = csv::Reader::from_reader(reader);
        let features: Vec<String> = rdr.headers()?.iter().skip(1).map(str::to_string).collect();
        let k = features.len();
        let mut cells = Vec::with_capacity(k * k);
        for (i, record) in rdr.records().enumerate() {
            let record = record?;
            let row_name = record.get(0).unwrap_or_default();
            if features.get(i).map(String::as_str) != Some(row_name) || record.len() != k + 1 {
                return Err(FypError::Schema(format!(
                    "causality row {} ('{}') does not match the header",
                    i, row_name
                )));
            }
            for (j, raw) in record.iter().skip(1).enumerate() {
                let value: f64 = raw.trim().parse().map_err(|e| {
                    FypError::Schema(format!("bad p-value '{}': {}", raw, e))
                })?;
                cells.push(if i == j {
                    CausalityCell::Untested(UntestedReason::SameFeature)
                } else if value < 0.0 {
                    CausalityCell::Untested(UntestedReason::Unrecorded)
                } else {
                    CausalityCell::Tested {
                        p_value: value,
                        best_lag: 0,
                    }
                });
            }
        }
        if cells.len() != k * k {
            return Err(FypError::Schema(format!(
                "causality table has {} cells, expected {}",
                cells.len(),
                k * k
            )));
        }
        Ok(Self { features, cells })
    }
}

fn pair_cell(
    table: &TimeSeriesTable,
    cause: &str,
    effect: &str,
    opts: &CausalityOptions,
) -> Result<CausalityCell, FypError> {
    let (xs, ys): (Vec<f64>, Vec<f64>) = table
        .column(cause)?
        .iter()
        .zip(table.column(effect)?)
        .filter_map(|(x, y)| Some(((*x)?, (*y)?)))
        .unzip();
    if xs.len() < opts.min_observations() {
        debug!(cause, effect, observations = xs.len(), "pair too short");
        return Ok(CausalityCell::Untested(UntestedReason::InsufficientData));
    }

    let mut best: Option<(f64, usize)> = None;
    for lag in 1..=opts.max_lag {
        match granger_test(&xs, &ys, lag, opts.test) {
            Ok(outcome) => {
                if best.map_or(true, |(p, _)| outcome.p_value < p) {
                    best = Some((outcome.p_value, lag));
                }
            }
            Err(e) if e.is_recoverable() => {
                debug!(cause, effect, lag, error = %e, "granger lag skipped");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(match best {
        Some((p_value, best_lag)) => CausalityCell::Tested { p_value, best_lag },
        None => CausalityCell::Untested(UntestedReason::Degenerate),
    })
}

/// Pearson correlations between the columns of `table`, in name order.
///
/// Only fully observed rows are used; pairs involving a constant column are `NaN`.
pub fn feature_correlations(table: &TimeSeriesTable) -> Result<Array2<f64>, FypError> {
    let complete = table.complete_rows();
    let names = table.column_names();
    let data = complete.dense_matrix(&names)?;
    let n = data.nrows();
    if n < 2 {
        return Err(FypError::InsufficientData {
            needed: 2,
            available: n,
        });
    }
    let means = data.mean_axis(ndarray::Axis(0)).ok_or(FypError::EmptyInput)?;
    let centered = &data - &means;
    let cov = centered.t().dot(&centered);
    let k = names.len();
    Ok(Array2::from_shape_fn((k, k), |(i, j)| {
        let denom = (cov[[i, i]] * cov[[j, j]]).sqrt();
        if denom > 0.0 {
            cov[[i, j]] / denom
        } else {
            f64::NAN
        }
    }))
}
