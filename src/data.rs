use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};

use chrono::{Datelike, Months, NaiveDate};
use ndarray::Array2;
use tracing::info;

use crate::types::FypError;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Sampling frequency of a table, inferred from the gap between rows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Frequency {
    Monthly,
    Quarterly,
}

impl Frequency {
    pub fn months(self) -> u32 {
        match self {
            Frequency::Monthly => 1,
            Frequency::Quarterly => 3,
        }
    }

    pub fn periods_per_year(self) -> usize {
        12 / self.months() as usize
    }
}

/// Date-indexed table of named numeric columns with explicit missing values.
///
/// Dates are the first day of each period and strictly increasing. Columns are
/// kept in name order, which is the feature order used throughout the crate.
#[derive(Clone, Debug, PartialEq)]
pub struct TimeSeriesTable {
    dates: Vec<NaiveDate>,
    columns: BTreeMap<String, Vec<Option<f64>>>,
}

impl TimeSeriesTable {
    /// Create an empty-column table over `dates`.
    ///
    /// # Errors
    /// Returns `FypError::Schema` if dates are not strictly increasing.
    pub fn new(dates: Vec<NaiveDate>) -> Result<Self, FypError> {
        if let Some(pair) = dates.windows(2).find(|w| w[1] <= w[0]) {
            return Err(FypError::Schema(format!(
                "dates must be strictly increasing ({} then {})",
                pair[0], pair[1]
            )));
        }
        Ok(Self {
            dates,
            columns: BTreeMap::new(),
        })
    }

    pub fn from_columns(
        dates: Vec<NaiveDate>,
        columns: Vec<(String, Vec<Option<f64>>)>,
    ) -> Result<Self, FypError> {
        let mut table = Self::new(dates)?;
        for (name, values) in columns {
            table.insert_column(&name, values)?;
        }
        Ok(table)
    }

    /// Build a table where every value is observed.
    pub fn from_dense(
        dates: Vec<NaiveDate>,
        columns: Vec<(String, Vec<f64>)>,
    ) -> Result<Self, FypError> {
        let columns = columns
            .into_iter()
            .map(|(name, values)| (name, values.into_iter().map(Some).collect()))
            .collect();
        Self::from_columns(dates, columns)
    }

    /// Insert or replace a column.
    pub fn insert_column(&mut self, name: &str, values: Vec<Option<f64>>) -> Result<(), FypError> {
        if values.len() != self.dates.len() {
            return Err(FypError::LengthMismatch);
        }
        self.columns.insert(name.to_string(), values);
        Ok(())
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.keys().cloned().collect()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    pub fn column(&self, name: &str) -> Result<&[Option<f64>], FypError> {
        self.columns
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| FypError::UnknownColumn(name.to_string()))
    }

    /// Column values, failing if any are missing.
    pub fn dense_column(&self, name: &str) -> Result<Vec<f64>, FypError> {
        self.column(name)?
            .iter()
            .zip(&self.dates)
            .map(|(v, d)| {
                v.ok_or_else(|| FypError::Schema(format!("{} is missing a value at {}", name, d)))
            })
            .collect()
    }

    /// Observed `(date, value)` pairs of a column.
    pub fn observed(&self, name: &str) -> Result<Vec<(NaiveDate, f64)>, FypError> {
        Ok(self
            .dates
            .iter()
            .zip(self.column(name)?)
            .filter_map(|(d, v)| v.map(|x| (*d, x)))
            .collect())
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.dates.last().copied()
    }

    pub fn position(&self, date: NaiveDate) -> Option<usize> {
        self.dates.binary_search(&date).ok()
    }

    /// Infer the sampling frequency from the first two rows.
    pub fn frequency(&self) -> Result<Frequency, FypError> {
        if self.dates.len() < 2 {
            return Err(FypError::InsufficientData {
                needed: 2,
                available: self.dates.len(),
            });
        }
        match month_gap(self.dates[0], self.dates[1]) {
            1 => Ok(Frequency::Monthly),
            3 => Ok(Frequency::Quarterly),
            gap => Err(FypError::Schema(format!(
                "unsupported sampling gap of {} months",
                gap
            ))),
        }
    }

    /// Rows must be consecutive periods of `freq`.
    ///
    /// # Errors
    /// Returns `FypError::InsufficientData` with the periods the date span
    /// covers against the rows present.
    pub fn ensure_contiguous(&self, freq: Frequency) -> Result<(), FypError> {
        let (Some(first), Some(last)) = (self.dates.first(), self.dates.last()) else {
            return Ok(());
        };
        let needed = (month_gap(*first, *last) / freq.months() as i32) as usize + 1;
        if needed != self.dates.len() {
            return Err(FypError::InsufficientData {
                needed,
                available: self.dates.len(),
            });
        }
        Ok(())
    }

    fn filter_rows(&self, keep: impl Fn(usize, NaiveDate) -> bool) -> Self {
        let rows: Vec<usize> = self
            .dates
            .iter()
            .enumerate()
            .filter(|(i, d)| keep(*i, **d))
            .map(|(i, _)| i)
            .collect();
        Self {
            dates: rows.iter().map(|&i| self.dates[i]).collect(),
            columns: self
                .columns
                .iter()
                .map(|(name, values)| (name.clone(), rows.iter().map(|&i| values[i]).collect()))
                .collect(),
        }
    }

    /// Rows dated on or before `date`.
    pub fn until(&self, date: NaiveDate) -> Self {
        self.filter_rows(|_, d| d <= date)
    }

    /// Rows dated strictly before `date`.
    pub fn before(&self, date: NaiveDate) -> Self {
        self.filter_rows(|_, d| d < date)
    }

    /// Rows dated on or after `date`.
    pub fn from_date(&self, date: NaiveDate) -> Self {
        self.filter_rows(|_, d| d >= date)
    }

    /// Rows where every column is observed.
    pub fn complete_rows(&self) -> Self {
        self.filter_rows(|i, _| self.columns.values().all(|v| v[i].is_some()))
    }

    pub fn select(&self, names: &[String]) -> Result<Self, FypError> {
        let mut columns = BTreeMap::new();
        for name in names {
            columns.insert(name.clone(), self.column(name)?.to_vec());
        }
        Ok(Self {
            dates: self.dates.clone(),
            columns,
        })
    }

    /// Carry the last observation forward over gaps.
    pub fn forward_fill(&self) -> Self {
        let columns = self
            .columns
            .iter()
            .map(|(name, values)| {
                let mut last = None;
                let filled = values
                    .iter()
                    .map(|v| {
                        if v.is_some() {
                            last = *v;
                        }
                        last
                    })
                    .collect();
                (name.clone(), filled)
            })
            .collect();
        Self {
            dates: self.dates.clone(),
            columns,
        }
    }

    /// Quarterly means of the observed values in each quarter.
    ///
    /// A quarterly table is returned unchanged.
    pub fn to_quarterly(&self) -> Result<Self, FypError> {
        if self.frequency()? == Frequency::Quarterly {
            return Ok(self.clone());
        }
        let quarters: Vec<NaiveDate> = self
            .dates
            .iter()
            .map(|d| period_start(*d, Frequency::Quarterly))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let mut table = Self::new(quarters.clone())?;
        for (name, values) in &self.columns {
            let mut sums = vec![(0.0, 0usize); quarters.len()];
            for (date, value) in self.dates.iter().zip(values) {
                if let Some(x) = value {
                    let q = period_start(*date, Frequency::Quarterly);
                    if let Ok(idx) = quarters.binary_search(&q) {
                        sums[idx].0 += x;
                        sums[idx].1 += 1;
                    }
                }
            }
            let means = sums
                .into_iter()
                .map(|(s, n)| if n > 0 { Some(s / n as f64) } else { None })
                .collect();
            table.insert_column(name, means)?;
        }
        Ok(table)
    }

    /// Union of two tables by date.
    ///
    /// Where both tables hold a value for the same cell, `self` wins.
    pub fn merge_with(&self, other: &TimeSeriesTable) -> Result<Self, FypError> {
        let dates: Vec<NaiveDate> = self
            .dates
            .iter()
            .chain(other.dates.iter())
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let names: BTreeSet<&String> = self.columns.keys().chain(other.columns.keys()).collect();
        let mut merged = Self::new(dates.clone())?;
        for name in names {
            let values = dates
                .iter()
                .map(|d| self.value_at(name, *d).or_else(|| other.value_at(name, *d)))
                .collect();
            merged.insert_column(name, values)?;
        }
        Ok(merged)
    }

    pub fn value_at(&self, name: &str, date: NaiveDate) -> Option<f64> {
        let idx = self.position(date)?;
        self.columns.get(name).and_then(|v| v[idx])
    }

    /// Fully observed `rows x names` matrix.
    pub fn dense_matrix(&self, names: &[String]) -> Result<Array2<f64>, FypError> {
        let mut matrix = Array2::<f64>::zeros((self.len(), names.len()));
        for (j, name) in names.iter().enumerate() {
            for (i, value) in self.dense_column(name)?.into_iter().enumerate() {
                matrix[[i, j]] = value;
            }
        }
        Ok(matrix)
    }

    /// Write as `date,<col>...` with empty cells for missing values.
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<(), FypError> {
        let mut wtr = csv::Writer::from_writer(writer);
        let mut header = vec!["date".to_string()];
        header.extend(self.columns.keys().cloned());
        wtr.write_record(&header)?;
        for (i, date) in self.dates.iter().enumerate() {
            let mut record = vec![date.format(DATE_FORMAT).to_string()];
            record.extend(
                self.columns
                    .values()
                    .map(|v| v[i].map(|x| x.to_string()).unwrap_or_default()),
            );
            wtr.write_record(&record)?;
        }
        wtr.flush()?;
        Ok(())
    }

    pub fn read_csv<R: Read>(reader: R) -> Result<Self, FypError> {
        let mut rdr = csv::Reader::from_reader(reader);
        let names: Vec<String> = rdr.headers()?.iter().skip(1).map(str::to_string).collect();
        let mut dates = Vec::new();
        let mut values: Vec<Vec<Option<f64>>> = vec![Vec::new(); names.len()];
        for record in rdr.records() {
            let record = record?;
            let raw_date = record.get(0).unwrap_or_default();
            let date = NaiveDate::parse_from_str(raw_date.trim(), DATE_FORMAT)
                .map_err(|e| FypError::Schema(format!("bad date '{}': {}", raw_date, e)))?;
            dates.push(date);
            for (j, column) in values.iter_mut().enumerate() {
                let cell = record.get(j + 1).unwrap_or_default().trim();
                let value = if cell.is_empty() {
                    None
                } else {
                    Some(cell.parse::<f64>().map_err(|e| {
                        FypError::Schema(format!("bad value '{}' in {}: {}", cell, names[j], e))
                    })?)
                };
                column.push(value);
            }
        }
        Self::from_columns(dates, names.into_iter().zip(values).collect())
    }
}

/// Restrict to rows from `min_year` on and keep the features usable for modeling.
///
/// Features missing in the first remaining row are dropped, the rest are
/// forward-filled.
pub fn select_features(table: &TimeSeriesTable, min_year: i32) -> Result<TimeSeriesTable, FypError> {
    let start = NaiveDate::from_ymd_opt(min_year, 1, 1)
        .ok_or_else(|| FypError::InvalidConfig(format!("invalid minimum year {}", min_year)))?;
    let trimmed = table.from_date(start);
    if trimmed.is_empty() {
        return Err(FypError::EmptyInput);
    }
    let kept: Vec<String> = trimmed
        .columns
        .iter()
        .filter(|(_, values)| values[0].is_some())
        .map(|(name, _)| name.clone())
        .collect();
    let dropped = trimmed.columns.len() - kept.len();
    if dropped > 0 {
        info!(dropped, kept = kept.len(), "dropped features missing at start");
    }
    Ok(trimmed.select(&kept)?.forward_fill())
}

/// Whole months between two dates' periods.
pub fn month_gap(from: NaiveDate, to: NaiveDate) -> i32 {
    (to.year() - from.year()) * 12 + to.month() as i32 - from.month() as i32
}

pub fn shift_months(date: NaiveDate, months: i32) -> Result<NaiveDate, FypError> {
    let shifted = if months >= 0 {
        date.checked_add_months(Months::new(months as u32))
    } else {
        date.checked_sub_months(Months::new(months.unsigned_abs()))
    };
    shifted.ok_or_else(|| FypError::Schema(format!("{} shifted by {} months overflows", date, months)))
}

/// First day of the period containing `date`.
pub fn period_start(date: NaiveDate, freq: Frequency) -> NaiveDate {
    let span = freq.months();
    let month = (date.month0() / span) * span + 1;
    NaiveDate::from_ymd_opt(date.year(), month, 1).unwrap_or(date)
}

/// Row count left after dropping `lag` leading rows, checked against the parameter count.
///
/// # Errors
/// Returns `FypError::InsufficientData` if fewer than `n_params + 1` rows remain.
pub fn lagged_rows(n: usize, lag: usize, n_params: usize) -> Result<usize, FypError> {
    let needed = lag + n_params + 1;
    if n < needed {
        return Err(FypError::InsufficientData {
            needed,
            available: n,
        });
    }
    Ok(n - lag)
}

/// Drop-first period-of-year indicator columns for `dates`.
pub fn seasonal_dummies(dates: &[NaiveDate], freq: Frequency) -> Array2<f64> {
    let width = freq.periods_per_year() - 1;
    let mut dummies = Array2::<f64>::zeros((dates.len(), width));
    for (i, date) in dates.iter().enumerate() {
        let slot = (date.month0() / freq.months()) as usize;
        if slot > 0 {
            dummies[[i, slot - 1]] = 1.0;
        }
    }
    dummies
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, 1).unwrap()
    }

    fn monthly(n: usize) -> Vec<NaiveDate> {
        (0..n).map(|i| shift_months(ymd(2020, 1), i as i32).unwrap()).collect()
    }

    #[test]
    fn test_new_rejects_unsorted_dates() {
        let result = TimeSeriesTable::new(vec![ymd(2020, 4), ymd(2020, 1)]);
        assert!(matches!(result, Err(FypError::Schema(_))));
        let result = TimeSeriesTable::new(vec![ymd(2020, 1), ymd(2020, 1)]);
        assert!(matches!(result, Err(FypError::Schema(_))));
    }

    #[test]
    fn test_insert_length_mismatch() {
        let mut table = TimeSeriesTable::new(monthly(3)).unwrap();
        let result = table.insert_column("CPI", vec![Some(1.0)]);
        assert!(matches!(result, Err(FypError::LengthMismatch)));
    }

    #[test]
    fn test_unknown_column() {
        let table = TimeSeriesTable::new(monthly(3)).unwrap();
        assert!(matches!(
            table.column("GDP"),
            Err(FypError::UnknownColumn(_))
        ));
    }

    #[test]
    fn test_frequency_inference() {
        let table = TimeSeriesTable::new(monthly(4)).unwrap();
        assert_eq!(table.frequency().unwrap(), Frequency::Monthly);
        let table = TimeSeriesTable::new(vec![ymd(2020, 1), ymd(2020, 4)]).unwrap();
        assert_eq!(table.frequency().unwrap(), Frequency::Quarterly);
        let table = TimeSeriesTable::new(vec![ymd(2020, 1), ymd(2021, 1)]).unwrap();
        assert!(matches!(table.frequency(), Err(FypError::Schema(_))));
    }

    #[test]
    fn test_complete_rows_leave_a_hole() {
        let table = TimeSeriesTable::from_columns(
            monthly(5),
            vec![("CPI".into(), vec![Some(1.0), Some(2.0), None, Some(4.0), Some(5.0)])],
        )
        .unwrap();
        assert!(table.ensure_contiguous(Frequency::Monthly).is_ok());
        let complete = table.complete_rows();
        assert!(matches!(
            complete.ensure_contiguous(Frequency::Monthly),
            Err(FypError::InsufficientData { needed: 5, available: 4 })
        ));
        assert!(complete
            .from_date(ymd(2020, 4))
            .ensure_contiguous(Frequency::Monthly)
            .is_ok());
    }

    #[test]
    fn test_to_quarterly_means() {
        let values = (1..=6).map(|i| Some(i as f64)).collect();
        let table =
            TimeSeriesTable::from_columns(monthly(6), vec![("CPI".into(), values)]).unwrap();
        let quarterly = table.to_quarterly().unwrap();
        assert_eq!(quarterly.dates(), &[ymd(2020, 1), ymd(2020, 4)]);
        assert_eq!(quarterly.column("CPI").unwrap(), &[Some(2.0), Some(5.0)]);
    }

    #[test]
    fn test_forward_fill_and_select_features() {
        let dates = vec![ymd(1995, 1), ymd(1996, 1), ymd(1996, 4), ymd(1996, 7)];
        let table = TimeSeriesTable::from_columns(
            dates,
            vec![
                ("A".into(), vec![None, Some(1.0), None, Some(3.0)]),
                ("B".into(), vec![Some(1.0), None, Some(2.0), Some(2.0)]),
            ],
        )
        .unwrap();
        let selected = select_features(&table, 1996).unwrap();
        assert_eq!(selected.column_names(), vec!["A".to_string()]);
        assert_eq!(
            selected.column("A").unwrap(),
            &[Some(1.0), Some(1.0), Some(3.0)]
        );
    }

    #[test]
    fn test_merge_prefers_self() {
        let left =
            TimeSeriesTable::from_dense(vec![ymd(2020, 1)], vec![("X".into(), vec![1.0])]).unwrap();
        let right = TimeSeriesTable::from_dense(
            vec![ymd(2020, 1), ymd(2020, 4)],
            vec![("X".into(), vec![9.0, 2.0])],
        )
        .unwrap();
        let merged = left.merge_with(&right).unwrap();
        assert_eq!(merged.column("X").unwrap(), &[Some(1.0), Some(2.0)]);
    }

    #[test]
    fn test_csv_round_trip_keeps_missing() {
        let table = TimeSeriesTable::from_columns(
            monthly(3),
            vec![("WageBase".into(), vec![Some(1.5), None, Some(2.5)])],
        )
        .unwrap();
        let mut buf = Vec::new();
        table.write_csv(&mut buf).unwrap();
        let back = TimeSeriesTable::read_csv(buf.as_slice()).unwrap();
        assert_eq!(back, table);
    }

    #[test]
    fn test_period_start_and_dummies() {
        let d = NaiveDate::from_ymd_opt(2021, 8, 17).unwrap();
        assert_eq!(period_start(d, Frequency::Quarterly), ymd(2021, 7));
        assert_eq!(period_start(d, Frequency::Monthly), ymd(2021, 8));

        let dummies = seasonal_dummies(&[ymd(2021, 1), ymd(2021, 4), ymd(2021, 10)], Frequency::Quarterly);
        assert_eq!(dummies.dim(), (3, 3));
        assert_eq!(dummies.row(0).sum(), 0.0);
        assert_eq!(dummies[[1, 0]], 1.0);
        assert_eq!(dummies[[2, 2]], 1.0);
    }

    #[test]
    fn test_lagged_rows() {
        assert_eq!(lagged_rows(10, 2, 3).unwrap(), 8);
        assert!(matches!(
            lagged_rows(5, 2, 3),
            Err(FypError::InsufficientData { needed: 6, available: 5 })
        ));
    }
}
