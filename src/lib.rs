//! # fyp_forecast
//!
//! Forecasting of quarterly tax bases for a Five Year Plan.
//!
//! The pipeline runs in stages, each a plain function of value types:
//!
//! * **Stationarity**: [`StationarityAdvisor`] derives a log/normalize and
//!   differencing recipe per feature; [`Preprocessor`] applies and inverts it.
//! * **Causality**: [`CausalityMatrix`] holds pairwise Granger p-values;
//!   [`EndogenousVariableSelector`] and [`possible_exog`] read it.
//! * **Search**: [`GridSearchEngine`] fits every VAR configuration in the grid
//!   and ranks them by cross-validated MAPE.
//! * **Forecast**: [`ForecastAssembler`] refits the best configurations through
//!   the end of the plan and aggregates to fiscal years; [`PlanDetails`]
//!   converts bases to revenue and compares against the plan.
//!
//! ## Example
//!
//! ```
//! use fyp_forecast::{inverse_transform, transform, StationarityRecipe};
//!
//! let levels: Vec<f64> = (0..12).map(|i| 100.0 * 1.02f64.powi(i)).collect();
//! let recipe = StationarityRecipe::logged(1, 1);
//!
//! // Log growth rates, one value shorter than the input.
//! let scaled = transform(&levels, &recipe).unwrap();
//! assert_eq!(scaled.len(), levels.len() - 1);
//!
//! // Rebuild levels from the first observation.
//! let rebuilt = inverse_transform(&scaled, &recipe, &levels[..1]).unwrap();
//! assert!((rebuilt[10] - levels[11]).abs() < 1e-9);
//! ```

// Module declarations
pub mod causality;
pub mod data;
mod defaults;
pub mod forecast;
pub mod ols;
pub mod plan;
pub mod preprocess;
pub mod search;
pub mod selection;
pub mod stationarity;
mod types;
pub mod var;

// Re-export public types
pub use types::{
    AdvisorOptions, CausalityOptions, FitConfiguration, ForecastOptions, FypError, GrangerTest,
    GridSpec, IcKind, RecipeRecord, SelectorOptions, StationarityRecipe,
};

// Re-export main public functions
pub use causality::{granger_test, CausalityCell, CausalityMatrix, UntestedReason};
pub use data::{select_features, Frequency, TimeSeriesTable};
pub use defaults::DEFAULT_MIN_YEAR;
pub use forecast::{aggregate_to_fiscal_year, fiscal_year, ForecastAssembler, ForecastTable};
pub use ols::{fit_ols, OlsFit};
pub use plan::{BudgetComparison, PlanDetails, PlanKind, RateSchedule, TAX_NAMES};
pub use preprocess::{inverse_transform, transform, Preprocessor};
pub use search::{read_fit_records, write_fit_records, FitRecord, FitResult, GridSearchEngine};
pub use selection::{possible_exog, CandidateEndogenousSet, EndogenousVariableSelector};
pub use stationarity::{adf_test, adf_test_with_ic, StationarityAdvisor, StationarityGuide};
pub use var::{OlsVarEstimator, VarEstimator, VarFit, VarForecast};

#[cfg(test)]
pub(crate) mod integration_tests {
    use super::*;
    use chrono::{Months, NaiveDate};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeMap;

    /// Quarter starts from 2000-01-01.
    pub(crate) fn quarterly_dates(n: usize) -> Vec<NaiveDate> {
        let start = NaiveDate::from_ymd_opt(2000, 1, 1).unwrap();
        (0..n)
            .map(|i| start.checked_add_months(Months::new(3 * i as u32)).unwrap())
            .collect()
    }

    // Box-Muller draw from a seeded generator.
    fn gaussian(rng: &mut StdRng) -> f64 {
        let u1: f64 = 1.0 - rng.gen::<f64>();
        let u2: f64 = rng.gen::<f64>();
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
    }

    pub(crate) fn white_noise(n: usize, seed: u64) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n).map(|_| gaussian(&mut rng)).collect()
    }

    pub(crate) fn random_walk(n: usize, seed: u64) -> Vec<f64> {
        white_noise(n, seed)
            .into_iter()
            .scan(0.0, |acc, e| {
                *acc += e;
                Some(*acc)
            })
            .collect()
    }

    /// `a` is AR(1) noise; `b` follows `0.5 b[t-1] + 0.8 a[t-1] + e`.
    pub(crate) fn driven_pair(n: usize, seed: u64) -> (Vec<f64>, Vec<f64>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut a = vec![0.0; n];
        let mut b = vec![0.0; n];
        for t in 0..n {
            let (ea, eb) = (gaussian(&mut rng), gaussian(&mut rng));
            if t == 0 {
                a[t] = ea;
                b[t] = eb;
            } else {
                a[t] = 0.5 * a[t - 1] + ea;
                b[t] = 0.5 * b[t - 1] + 0.8 * a[t - 1] + eb;
            }
        }
        (a, b)
    }

    fn to_levels(growth: &[f64], start: f64) -> Vec<f64> {
        growth
            .iter()
            .scan(start, |acc, g| {
                *acc += 0.005 + 0.01 * g;
                Some(acc.exp())
            })
            .collect()
    }

    fn level_table(n: usize, seed: u64) -> TimeSeriesTable {
        let (driver, sales) = driven_pair(n, seed);
        let noise = white_noise(n, seed + 100);
        TimeSeriesTable::from_dense(
            quarterly_dates(n),
            vec![
                ("Employment".into(), to_levels(&driver, 5.0)),
                ("SalesBase".into(), to_levels(&sales, 7.0)),
                ("Rainfall".into(), noise.iter().map(|v| 30.0 + v).collect()),
            ],
        )
        .unwrap()
    }

    fn plan_for_sales(start: i32) -> PlanDetails {
        let years: Vec<i32> = (start..start + 5).collect();
        let mut revenues = BTreeMap::new();
        revenues.insert("Sales".to_string(), vec![25.0, 26.0, 27.0, 28.0, 29.0]);
        let mut rates = BTreeMap::new();
        rates.insert("Sales".to_string(), RateSchedule::Flat(vec![0.01; 5]));
        let plan = PlanDetails {
            kind: PlanKind::Proposed,
            fiscal_years: years,
            revenues,
            rates,
            resident_fractions: plan::ResidentFractions { wage: 0.6, npt: 0.5 },
            birt_splits: plan::BirtSplits {
                net_income_fraction: vec![60.0; 5],
            },
        };
        plan.validate().unwrap();
        plan
    }

    #[test]
    fn test_end_to_end_pipeline() {
        let table = level_table(80, 31);

        let guide = StationarityAdvisor::default().derive_guide(&table).unwrap();
        assert_eq!(guide.len(), 3);
        for (_, recipe) in guide.iter() {
            assert!(recipe.n_differences <= 2);
        }
        let preprocessor = Preprocessor::new(guide);
        let scaled = preprocessor.transform_table(&table).unwrap();

        let matrix = CausalityMatrix::compute(&scaled, &CausalityOptions::default()).unwrap();
        let candidates = EndogenousVariableSelector::default()
            .select("SalesBase", &matrix)
            .unwrap();

        let grid = GridSpec {
            target: "SalesBase".into(),
            other_endog_pool: candidates.names(),
            exog_pool: vec!["Rainfall".into()],
            orders: vec![1, 2],
            ..Default::default()
        };
        let engine = GridSearchEngine::new();
        let results = engine.search(&table, &preprocessor, &matrix, &grid).unwrap();
        assert!(!results.is_empty());
        for pair in results.windows(2) {
            assert!(pair[0].mape <= pair[1].mape);
        }

        let opts = ForecastOptions {
            plan_start_year: 2021,
            max_fits: 2,
            ..Default::default()
        };
        let forecast = ForecastAssembler::new()
            .assemble(&table, &preprocessor, &results, "SalesBase", None, &opts)
            .unwrap();
        let totals = forecast.plan_totals(2021, 5);
        assert_eq!(totals.len(), 5);
        for (year, total) in &totals {
            let total = total.unwrap_or_else(|| panic!("missing FY{year}"));
            assert!(total.is_finite() && total > 0.0);
        }

        let plan = plan_for_sales(2021);
        let revenue = plan
            .revenue_from_base("Sales", &forecast.fiscal_years)
            .unwrap();
        assert_eq!(revenue.len(), 5);
        let rows = plan.budget_comparison("Sales", &revenue).unwrap();
        assert_eq!(rows.len(), 5);
        assert!(rows.iter().all(|r| r.projected.is_some()));
    }

    #[test]
    fn test_selector_finds_driver_of_ar2_target() {
        let n = 40;
        let shocks = white_noise(n, 41);
        let noise = white_noise(n, 42);
        let unrelated = white_noise(n, 43);
        let mut driver = vec![0.0; n];
        let mut target = vec![0.0; n];
        for t in 0..n {
            driver[t] = shocks[t];
            if t >= 2 {
                driver[t] += 0.5 * driver[t - 1] - 0.3 * driver[t - 2];
            }
            if t >= 1 {
                target[t] = 0.2 * target[t - 1] + 0.9 * driver[t - 1] + 0.3 * noise[t];
            }
        }
        let table = TimeSeriesTable::from_dense(
            quarterly_dates(n),
            vec![
                ("Driver".into(), driver),
                ("Target".into(), target),
                ("Unrelated".into(), unrelated),
            ],
        )
        .unwrap();
        let opts = CausalityOptions {
            max_lag: 4,
            ..Default::default()
        };
        let matrix = CausalityMatrix::compute(&table, &opts).unwrap();
        let set = EndogenousVariableSelector::default()
            .select("Target", &matrix)
            .unwrap();
        let (_, p) = set
            .candidates
            .iter()
            .find(|(name, _)| name == "Driver")
            .expect("driver selected");
        assert!(*p < 0.05);
    }

    #[test]
    fn test_pipeline_is_deterministic() {
        let run = || {
            let table = level_table(64, 57);
            let guide = StationarityAdvisor::default().derive_guide(&table).unwrap();
            let preprocessor = Preprocessor::new(guide);
            let scaled = preprocessor.transform_table(&table).unwrap();
            let matrix = CausalityMatrix::compute(&scaled, &CausalityOptions::default()).unwrap();
            let grid = GridSpec {
                target: "SalesBase".into(),
                other_endog_pool: vec!["Employment".into(), "Rainfall".into()],
                orders: vec![1, 2],
                ..Default::default()
            };
            GridSearchEngine::new()
                .search(&table, &preprocessor, &matrix, &grid)
                .unwrap()
                .into_iter()
                .map(|r| (r.config, r.mape.to_bits(), r.information_criterion.to_bits()))
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_plan_schema_error_halts_before_modeling() {
        let mut plan = plan_for_sales(2021);
        plan.fiscal_years = vec![2021, 2022, 2023];
        assert!(matches!(plan.validate(), Err(FypError::Schema(_))));
        assert!(!FypError::Schema(String::new()).is_recoverable());
    }
}
