//! Default constants for stationarity testing, causality, search and forecasting.

pub const DEFAULT_ALPHA: f64 = 0.05;
pub const DEFAULT_MAX_DIFFERENCES: usize = 2;
pub const DEFAULT_MIN_DIFFERENCES: usize = 0;
pub const YOY_PERIODS: usize = 4;
pub const DEFAULT_MAX_LAG: usize = 6;
pub const DEFAULT_MIN_OBS_BUFFER: usize = 8;
pub const DEFAULT_N_SPLITS: usize = 3;
pub const DEFAULT_MAX_EXOG: usize = 4;
pub const DEFAULT_MAX_OTHER_ENDOG: usize = 1;
pub const DEFAULT_MAX_FITS: usize = 1;
pub const DEFAULT_MIN_YEAR: i32 = 1996;
pub const PLAN_YEARS: usize = 5;
pub const UNTESTED_SENTINEL: f64 = -1.0;
pub const MIN_ADF_OBS: usize = 8;
pub const WAGE_PICA_SHARE: f64 = 0.015;
pub const NPT_PICA_SHARE: f64 = 0.02;
pub const PICA_START_YEAR: i32 = 1992;
