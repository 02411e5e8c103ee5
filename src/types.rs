use crate::defaults::{
    DEFAULT_ALPHA, DEFAULT_MAX_DIFFERENCES, DEFAULT_MAX_EXOG, DEFAULT_MAX_FITS, DEFAULT_MAX_LAG,
    DEFAULT_MAX_OTHER_ENDOG, DEFAULT_MIN_DIFFERENCES, DEFAULT_MIN_OBS_BUFFER, DEFAULT_N_SPLITS,
    PLAN_YEARS,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Per-feature transform that makes a series stationary.
///
/// A recipe either logs (`can_log`) or divides by a power-of-ten `scale`
/// (`normalize`), then differences `n_differences` times over `periods` rows.
///
/// # Example
/// ```
/// use fyp_forecast::StationarityRecipe;
/// let recipe = StationarityRecipe::logged(1, 1);
/// assert!(recipe.validate().is_ok());
/// assert_eq!(recipe.warmup(), 1);
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StationarityRecipe {
    pub can_log: bool,
    pub n_differences: usize,
    pub normalize: bool,
    /// Divisor applied when `normalize` is set; 1.0 otherwise.
    pub scale: f64,
    /// Differencing span: 1 for period-over-period, 4 for year-over-year on quarters.
    pub periods: usize,
}

impl StationarityRecipe {
    pub fn logged(n_differences: usize, periods: usize) -> Self {
        Self {
            can_log: true,
            n_differences,
            normalize: false,
            scale: 1.0,
            periods,
        }
    }

    pub fn normalized(scale: f64, n_differences: usize, periods: usize) -> Self {
        Self {
            can_log: false,
            n_differences,
            normalize: true,
            scale,
            periods,
        }
    }

    /// Number of leading observations consumed by differencing.
    pub fn warmup(&self) -> usize {
        self.n_differences * self.periods
    }

    /// Reject recipes that the preprocessor cannot apply or invert.
    pub fn validate(&self) -> Result<(), FypError> {
        if self.periods == 0 {
            return Err(FypError::InvalidRecipe(
                "differencing span must be positive".to_string(),
            ));
        }
        if self.can_log == self.normalize {
            return Err(FypError::InvalidRecipe(format!(
                "recipe must either log or normalize (can_log={}, normalize={})",
                self.can_log, self.normalize
            )));
        }
        if self.normalize && (!self.scale.is_finite() || self.scale == 0.0) {
            return Err(FypError::InvalidRecipe(format!(
                "normalization scale {} is not usable",
                self.scale
            )));
        }
        Ok(())
    }
}

/// Flat, persisted form of a recipe.
///
/// Counts are signed so that a malformed file surfaces as `InvalidRecipe`
/// instead of a parse failure.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecipeRecord {
    pub variable: String,
    pub can_log: bool,
    pub n_differences: i64,
    pub normalize: bool,
    pub scale: f64,
    pub periods: i64,
}

impl RecipeRecord {
    pub fn new(variable: &str, recipe: &StationarityRecipe) -> Self {
        Self {
            variable: variable.to_string(),
            can_log: recipe.can_log,
            n_differences: recipe.n_differences as i64,
            normalize: recipe.normalize,
            scale: recipe.scale,
            periods: recipe.periods as i64,
        }
    }
}

impl TryFrom<RecipeRecord> for (String, StationarityRecipe) {
    type Error = FypError;

    fn try_from(record: RecipeRecord) -> Result<Self, Self::Error> {
        if record.n_differences < 0 {
            return Err(FypError::InvalidRecipe(format!(
                "{}: negative difference count {}",
                record.variable, record.n_differences
            )));
        }
        if record.periods <= 0 {
            return Err(FypError::InvalidRecipe(format!(
                "{}: differencing span {} must be positive",
                record.variable, record.periods
            )));
        }
        let recipe = StationarityRecipe {
            can_log: record.can_log,
            n_differences: record.n_differences as usize,
            normalize: record.normalize,
            scale: record.scale,
            periods: record.periods as usize,
        };
        recipe.validate()?;
        Ok((record.variable, recipe))
    }
}

/// One grid-search trial. Immutable once enumerated.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FitConfiguration {
    /// Endogenous columns; the first entry is the forecast target.
    pub endog_cols: Vec<String>,
    pub exog_cols: Vec<String>,
    /// VAR lag order.
    pub order: usize,
    /// Last date included in the fit.
    pub max_fit_date: NaiveDate,
    /// Resample to quarterly means before fitting.
    pub model_quarters: bool,
    /// Add drop-first period-of-year dummies as exogenous regressors.
    pub seasonal_dummies: bool,
}

impl FitConfiguration {
    pub fn target(&self) -> &str {
        self.endog_cols.first().map(String::as_str).unwrap_or("")
    }

    /// Endogenous then exogenous column names.
    pub fn columns(&self) -> Vec<String> {
        self.endog_cols
            .iter()
            .chain(self.exog_cols.iter())
            .cloned()
            .collect()
    }
}

impl AsRef<FitConfiguration> for FitConfiguration {
    fn as_ref(&self) -> &FitConfiguration {
        self
    }
}

/// Information-criterion variants.
#[derive(Clone, Debug, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum IcKind {
    Bic,
    #[default]
    Aic,
}

/// Statistic used by the Granger test.
#[derive(Clone, Debug, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum GrangerTest {
    /// n·(SSRr − SSRu)/SSRu against χ²(lag).
    #[default]
    SsrChi2,
    /// Classical F test on the restriction.
    SsrF,
}

/// Options for deriving stationarity recipes.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvisorOptions {
    /// Significance level of the unit-root test.
    pub alpha: f64,
    /// Ceiling on differencing; unresolved features fall back to it.
    pub max_differences: usize,
    pub min_differences: usize,
    /// Features differenced year-over-year instead of period-over-period.
    pub yoy_columns: Vec<String>,
    /// Features never differenced more than once, typically tax bases.
    pub single_difference_columns: Vec<String>,
    /// Criterion picking the lagged differences of the unit-root regression.
    pub lag_ic: IcKind,
    /// Only observations on or before this date enter the unit-root test.
    pub test_until: Option<NaiveDate>,
}

impl Default for AdvisorOptions {
    fn default() -> Self {
        Self {
            alpha: DEFAULT_ALPHA,
            max_differences: DEFAULT_MAX_DIFFERENCES,
            min_differences: DEFAULT_MIN_DIFFERENCES,
            yoy_columns: Vec::new(),
            single_difference_columns: Vec::new(),
            lag_ic: IcKind::default(),
            test_until: None,
        }
    }
}

/// Options for the pairwise Granger matrix.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CausalityOptions {
    pub max_lag: usize,
    /// Last date included in the tests.
    pub cutoff: Option<NaiveDate>,
    pub test: GrangerTest,
    /// Pairs need at least `2 * max_lag + min_obs_buffer` joint observations.
    pub min_obs_buffer: usize,
}

impl Default for CausalityOptions {
    fn default() -> Self {
        Self {
            max_lag: DEFAULT_MAX_LAG,
            cutoff: None,
            test: GrangerTest::default(),
            min_obs_buffer: DEFAULT_MIN_OBS_BUFFER,
        }
    }
}

impl CausalityOptions {
    pub fn min_observations(&self) -> usize {
        2 * self.max_lag + self.min_obs_buffer
    }
}

/// Options for the endogenous-variable selector.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorOptions {
    pub alpha: f64,
    /// Also require the target to Granger-cause the candidate.
    pub require_feedback: bool,
}

impl Default for SelectorOptions {
    fn default() -> Self {
        Self {
            alpha: DEFAULT_ALPHA,
            require_feedback: false,
        }
    }
}

/// Parameter grid for the VAR model search.
///
/// Empty `cutoff_dates` means "the last date of the table"; empty option lists
/// mean `[false]`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GridSpec {
    pub target: String,
    pub other_endog_pool: Vec<String>,
    pub exog_pool: Vec<String>,
    pub orders: Vec<usize>,
    pub cutoff_dates: Vec<NaiveDate>,
    pub quarterly_options: Vec<bool>,
    pub seasonal_options: Vec<bool>,
    /// Granger significance level gating the exogenous pool.
    pub alpha: f64,
    pub max_exog: usize,
    pub max_other_endog: usize,
    /// Expanding-window folds used to score each trial.
    pub n_splits: usize,
    /// Hard cap on enumerated trials.
    pub max_trials: Option<usize>,
}

impl Default for GridSpec {
    fn default() -> Self {
        Self {
            target: String::new(),
            other_endog_pool: Vec::new(),
            exog_pool: Vec::new(),
            orders: vec![1, 2],
            cutoff_dates: Vec::new(),
            quarterly_options: vec![false],
            seasonal_options: vec![false],
            alpha: DEFAULT_ALPHA,
            max_exog: DEFAULT_MAX_EXOG,
            max_other_endog: DEFAULT_MAX_OTHER_ENDOG,
            n_splits: DEFAULT_N_SPLITS,
            max_trials: None,
        }
    }
}

/// Options for assembling the plan forecast.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ForecastOptions {
    /// First fiscal year of the plan.
    pub plan_start_year: i32,
    /// Number of ranked fits to use.
    pub max_fits: usize,
    /// Average the selected fits; otherwise use the best one only.
    pub average: bool,
    pub horizon_years: usize,
}

impl Default for ForecastOptions {
    fn default() -> Self {
        Self {
            plan_start_year: 2025,
            max_fits: DEFAULT_MAX_FITS,
            average: true,
            horizon_years: PLAN_YEARS,
        }
    }
}

/// Library error type.
#[derive(thiserror::Error, Debug)]
pub enum FypError {
    #[error("input lengths mismatch")]
    LengthMismatch,
    #[error("empty input")]
    EmptyInput,
    #[error("insufficient data: need {needed} observations, have {available}")]
    InsufficientData { needed: usize, available: usize },
    #[error("invalid stationarity recipe: {0}")]
    InvalidRecipe(String),
    #[error("numerical instability: {0}")]
    NumericalInstability(String),
    #[error("schema error: {0}")]
    Schema(String),
    #[error("no viable fit among {trials} trials")]
    NoViableFit { trials: usize },
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl FypError {
    /// Failures local to one causality pair or grid-search trial.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FypError::InsufficientData { .. } | FypError::NumericalInstability(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recipe_validation() {
        assert!(StationarityRecipe::logged(2, 1).validate().is_ok());
        assert!(StationarityRecipe::normalized(100.0, 1, 4).validate().is_ok());

        let zero_span = StationarityRecipe::logged(1, 0);
        assert!(matches!(
            zero_span.validate(),
            Err(FypError::InvalidRecipe(_))
        ));

        let both = StationarityRecipe {
            normalize: true,
            ..StationarityRecipe::logged(1, 1)
        };
        assert!(matches!(both.validate(), Err(FypError::InvalidRecipe(_))));

        let zero_scale = StationarityRecipe::normalized(0.0, 1, 1);
        assert!(matches!(
            zero_scale.validate(),
            Err(FypError::InvalidRecipe(_))
        ));
    }

    #[test]
    fn test_negative_differences_rejected() {
        let record = RecipeRecord {
            variable: "WageBase".to_string(),
            can_log: true,
            n_differences: -1,
            normalize: false,
            scale: 1.0,
            periods: 1,
        };
        let result: Result<(String, StationarityRecipe), _> = record.try_into();
        assert!(matches!(result, Err(FypError::InvalidRecipe(_))));
    }

    #[test]
    fn test_record_round_trip() {
        let recipe = StationarityRecipe::normalized(10.0, 2, 1);
        let record = RecipeRecord::new("UnemploymentRate", &recipe);
        let (name, back): (String, StationarityRecipe) = record.try_into().unwrap();
        assert_eq!(name, "UnemploymentRate");
        assert_eq!(back, recipe);
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(FypError::InsufficientData {
            needed: 10,
            available: 3
        }
        .is_recoverable());
        assert!(FypError::NumericalInstability("singular".into()).is_recoverable());
        assert!(!FypError::InvalidRecipe("bad".into()).is_recoverable());
        assert!(!FypError::Schema("bad".into()).is_recoverable());
    }

    #[test]
    fn test_fit_configuration_columns() {
        let config = FitConfiguration {
            endog_cols: vec!["SalesBase".into(), "CPI".into()],
            exog_cols: vec!["GDP".into()],
            order: 2,
            max_fit_date: NaiveDate::from_ymd_opt(2019, 12, 31).unwrap(),
            model_quarters: false,
            seasonal_dummies: false,
        };
        assert_eq!(config.target(), "SalesBase");
        assert_eq!(config.columns(), vec!["SalesBase", "CPI", "GDP"]);
    }
}
