//! End-to-end run on synthetic monthly indicators: feature selection, quarterly
//! resampling, stationarity recipes, Granger screening, VAR grid search and a
//! Five Year Plan budget comparison for the Sales tax base.
//!
//! Set `RUST_LOG=fyp_forecast=debug` to follow skipped trials and fallbacks.
//!
//! Run with: cargo run --release --example tax_base_pipeline

use chrono::{Datelike, Months, NaiveDate};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

use fyp_forecast::{
    select_features, write_fit_records, AdvisorOptions, CausalityMatrix, CausalityOptions,
    EndogenousVariableSelector, ForecastAssembler, ForecastOptions, FypError, GridSearchEngine,
    GridSpec, PlanDetails, Preprocessor, StationarityAdvisor, TimeSeriesTable, DEFAULT_MIN_YEAR,
};

const PLAN: &str = r#"{
    "kind": "Proposed",
    "fiscal_years": [2025, 2026, 2027, 2028, 2029],
    "revenues": {"Sales": [310.0, 318.0, 326.0, 334.0, 342.0]},
    "rates": {"Sales": [0.02, 0.02, 0.02, 0.02, 0.02]},
    "resident_fractions": {"Wage": 0.6, "NPT": 0.5},
    "birt_splits": {"net_income_fraction": [60.0, 60.0, 60.0, 60.0, 60.0]}
}"#;

fn normal(rng: &mut StdRng) -> f64 {
    let u1: f64 = 1.0 - rng.gen::<f64>();
    let u2: f64 = rng.gen::<f64>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

/// Monthly levels from 1990 through 2024-03. CPI only starts in 1998 so that
/// feature selection has something to drop.
fn synthetic_monthly() -> Result<TimeSeriesTable, FypError> {
    let mut rng = StdRng::seed_from_u64(2024);
    let start = NaiveDate::from_ymd_opt(1990, 1, 1).ok_or(FypError::EmptyInput)?;
    let n = 411;
    let dates: Vec<NaiveDate> = (0..n)
        .filter_map(|i| start.checked_add_months(Months::new(i)))
        .collect();

    let (mut jobs, mut sales, mut rates) = (6.0_f64, 8.5_f64, 5.0_f64);
    let mut jobs_growth = 0.0;
    let (mut emp, mut base, mut rate, mut cpi) = (vec![], vec![], vec![], vec![]);
    for (i, date) in dates.iter().enumerate() {
        let shock = normal(&mut rng);
        let sales_growth = 0.002 + 0.6 * jobs_growth + 0.004 * normal(&mut rng);
        jobs_growth = 0.001 + 0.3 * jobs_growth + 0.003 * shock;
        jobs += jobs_growth;
        sales += sales_growth;
        rates = (rates + 0.05 * normal(&mut rng)).clamp(0.5, 12.0);

        emp.push(Some(jobs.exp()));
        base.push(Some(sales.exp()));
        rate.push(Some(rates));
        cpi.push((date.year() >= 1998).then(|| 100.0 * (0.002 * i as f64).exp()));
    }

    let mut table = TimeSeriesTable::new(dates)?;
    table.insert_column("Employment", emp)?;
    table.insert_column("SalesBase", base)?;
    table.insert_column("MortgageRate", rate)?;
    table.insert_column("CPI", cpi)?;
    Ok(table)
}

fn main() -> Result<(), FypError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let monthly = synthetic_monthly()?;
    let features = select_features(&monthly, DEFAULT_MIN_YEAR)?;
    println!("Kept features: {:?}", features.column_names());
    let quarterly = features.to_quarterly()?;

    let advisor = StationarityAdvisor::new(AdvisorOptions {
        single_difference_columns: vec!["SalesBase".into()],
        ..Default::default()
    });
    let guide = advisor.derive_guide(&quarterly)?;
    println!("\nStationarity guide:");
    guide.write_csv(std::io::stdout())?;

    let preprocessor = Preprocessor::new(guide);
    let scaled = preprocessor.transform_table(&quarterly)?;
    let matrix = CausalityMatrix::compute(&scaled, &CausalityOptions::default())?;
    println!("\nGranger p-values (row causes column):");
    matrix.write_csv(std::io::stdout())?;

    let candidates = EndogenousVariableSelector::default().select("SalesBase", &matrix)?;
    println!("\nEndogenous candidates: {:?}", candidates.candidates);

    let grid = GridSpec {
        target: "SalesBase".into(),
        other_endog_pool: candidates.names(),
        exog_pool: vec!["MortgageRate".into()],
        orders: vec![1, 2, 4],
        seasonal_options: vec![false, true],
        ..Default::default()
    };
    let results = GridSearchEngine::new().search(&quarterly, &preprocessor, &matrix, &grid)?;
    println!("\nTop fits:");
    write_fit_records(std::io::stdout(), &results[..results.len().min(5)])?;

    let opts = ForecastOptions {
        plan_start_year: 2025,
        max_fits: 3,
        ..Default::default()
    };
    let forecast = ForecastAssembler::new().assemble(
        &quarterly,
        &preprocessor,
        &results,
        "SalesBase",
        None,
        &opts,
    )?;

    let plan = PlanDetails::from_json_reader(PLAN.as_bytes())?;
    let revenue = plan.revenue_from_base("Sales", &forecast.fiscal_years)?;
    println!("\n{} budget comparison:", plan.label());
    println!("{:>6} {:>14} {:>14}", "FY", "Five Year Plan", "Forecast");
    for row in plan.budget_comparison("Sales", &revenue)? {
        let projected = row
            .projected
            .map(|v| format!("{v:.1}"))
            .unwrap_or_else(|| "-".to_string());
        println!("{:>6} {:>14.1} {:>14}", row.fiscal_year, row.five_year_plan, projected);
    }
    Ok(())
}
