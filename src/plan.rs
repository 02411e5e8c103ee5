//! Five Year Plan details: revenue projections, tax rates and the comparison
//! of forecast tax bases against the plan.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::Read;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::defaults::{NPT_PICA_SHARE, PICA_START_YEAR, PLAN_YEARS, WAGE_PICA_SHARE};
use crate::types::FypError;

/// Taxes a plan may carry revenues and rates for.
pub const TAX_NAMES: [&str; 7] = ["Amusement", "BIRT", "NPT", "Parking", "RTT", "Sales", "Wage"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanKind {
    Proposed,
    Adopted,
}

impl fmt::Display for PlanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanKind::Proposed => write!(f, "Proposed"),
            PlanKind::Adopted => write!(f, "Adopted"),
        }
    }
}

/// Rates for one tax: a single schedule, or named components such as
/// `resident`/`nonresident` or `gross_receipts`/`net_income`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RateSchedule {
    Flat(Vec<f64>),
    Components(BTreeMap<String, Vec<f64>>),
}

impl RateSchedule {
    pub fn component(&self, name: &str) -> Option<&[f64]> {
        match self {
            RateSchedule::Flat(rates) if name == "rate" => Some(rates),
            RateSchedule::Flat(_) => None,
            RateSchedule::Components(map) => map.get(name).map(Vec::as_slice),
        }
    }

    fn components(&self) -> Vec<(&str, &[f64])> {
        match self {
            RateSchedule::Flat(rates) => vec![("rate", rates.as_slice())],
            RateSchedule::Components(map) => {
                map.iter().map(|(k, v)| (k.as_str(), v.as_slice())).collect()
            }
        }
    }
}

/// Share of the Wage and NPT bases attributed to city residents.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResidentFractions {
    #[serde(rename = "Wage")]
    pub wage: f64,
    #[serde(rename = "NPT")]
    pub npt: f64,
}

/// BIRT revenue split between its net income and gross receipts parts, in percent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BirtSplits {
    pub net_income_fraction: Vec<f64>,
}

impl BirtSplits {
    pub fn gross_receipts_fraction(&self) -> Vec<f64> {
        self.net_income_fraction.iter().map(|f| 100.0 - f).collect()
    }
}

/// Plan revenue next to the revenue implied by a forecast base.
#[derive(Clone, Debug, PartialEq)]
pub struct BudgetComparison {
    pub fiscal_year: i32,
    /// Plan revenue; years outside the plan carry the projected value.
    pub five_year_plan: f64,
    pub projected: Option<f64>,
}

/// Details of a proposed or adopted Five Year Plan.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanDetails {
    pub kind: PlanKind,
    pub fiscal_years: Vec<i32>,
    pub revenues: BTreeMap<String, Vec<f64>>,
    pub rates: BTreeMap<String, RateSchedule>,
    pub resident_fractions: ResidentFractions,
    pub birt_splits: BirtSplits,
}

impl PlanDetails {
    /// Parse plan details from JSON and validate them.
    pub fn from_json_reader<R: Read>(reader: R) -> Result<Self, FypError> {
        let plan: PlanDetails =
            serde_json::from_reader(reader).map_err(|e| FypError::Schema(e.to_string()))?;
        plan.validate()?;
        debug!(plan = %plan.label(), "loaded plan details");
        Ok(plan)
    }

    /// Short label such as `FY25-FY29 Adopted`.
    pub fn label(&self) -> String {
        match (self.fiscal_years.first(), self.fiscal_years.last()) {
            (Some(first), Some(last)) => {
                format!("FY{:02}-FY{:02} {}", first % 100, last % 100, self.kind)
            }
            _ => format!("FY?? {}", self.kind),
        }
    }

    pub fn validate(&self) -> Result<(), FypError> {
        if self.fiscal_years.len() != PLAN_YEARS {
            return Err(FypError::Schema(format!(
                "'fiscal_years' should have length {PLAN_YEARS}"
            )));
        }
        if self.fiscal_years.windows(2).any(|w| w[1] != w[0] + 1) {
            return Err(FypError::Schema(
                "'fiscal_years' should be consecutive".to_string(),
            ));
        }
        for (name, values) in &self.revenues {
            check_tax_name(name)?;
            if values.len() != PLAN_YEARS {
                return Err(FypError::Schema(format!(
                    "revenues for {name} have the wrong length"
                )));
            }
        }
        for (name, schedule) in &self.rates {
            check_tax_name(name)?;
            for (component, values) in schedule.components() {
                if values.len() != PLAN_YEARS {
                    return Err(FypError::Schema(format!(
                        "rates for {name} ({component}) have the wrong length"
                    )));
                }
            }
        }
        let ResidentFractions { wage, npt } = self.resident_fractions;
        if !(0.0..=1.0).contains(&wage) || !(0.0..=1.0).contains(&npt) {
            return Err(FypError::Schema(
                "resident fractions should be between 0 and 1".to_string(),
            ));
        }
        let splits = &self.birt_splits.net_income_fraction;
        if splits.len() != PLAN_YEARS {
            return Err(FypError::Schema(format!(
                "'net_income_fraction' should have length {PLAN_YEARS}"
            )));
        }
        if splits.iter().any(|f| !(0.0..=100.0).contains(f)) {
            return Err(FypError::Schema(
                "'net_income_fraction' should be between 0 and 100".to_string(),
            ));
        }
        Ok(())
    }

    /// Plan revenues for `tax` keyed by fiscal year.
    pub fn projected_revenues(&self, tax: &str) -> Result<BTreeMap<i32, f64>, FypError> {
        check_tax_name(tax)?;
        let values = self
            .revenues
            .get(tax)
            .ok_or_else(|| FypError::UnknownColumn(format!("{tax} revenues")))?;
        Ok(self.by_year(values))
    }

    /// Rate applied to the whole `tax` base in each plan year.
    ///
    /// Resident/non-resident schedules are blended by the resident fraction
    /// after removing the PICA share from the resident rate.
    pub fn effective_rates(&self, tax: &str) -> Result<BTreeMap<i32, f64>, FypError> {
        let schedule = self.schedule(tax)?;
        if let Some(rates) = schedule.component("rate") {
            return Ok(self.by_year(rates));
        }
        let (Some(resident), Some(nonresident)) = (
            schedule.component("resident"),
            schedule.component("nonresident"),
        ) else {
            return Err(FypError::Schema(format!(
                "{tax} rates need 'rate' or 'resident'/'nonresident' columns"
            )));
        };
        let (fraction, pica_share) = match tax {
            "Wage" => (self.resident_fractions.wage, WAGE_PICA_SHARE),
            "NPT" => (self.resident_fractions.npt, NPT_PICA_SHARE),
            _ => {
                return Err(FypError::Schema(format!(
                    "no resident fraction for {tax}"
                )))
            }
        };
        Ok(self
            .fiscal_years
            .iter()
            .zip(resident.iter().zip(nonresident))
            .map(|(&year, (&res, &nonres))| {
                let res = if year >= PICA_START_YEAR {
                    res - pica_share
                } else {
                    res
                };
                (year, res * fraction + nonres * (1.0 - fraction))
            })
            .collect())
    }

    /// Revenue implied by fiscal-year base totals at the plan's effective rates.
    ///
    /// Only years present in both the base and the plan are returned.
    pub fn revenue_from_base(
        &self,
        tax: &str,
        base: &BTreeMap<i32, f64>,
    ) -> Result<BTreeMap<i32, f64>, FypError> {
        if tax == "BIRT" {
            return Err(FypError::InvalidConfig(
                "BIRT revenue combines two bases; use birt_revenue".to_string(),
            ));
        }
        let rates = self.effective_rates(tax)?;
        Ok(base
            .iter()
            .filter_map(|(year, b)| rates.get(year).map(|r| (*year, b * r)))
            .collect())
    }

    /// BIRT revenue from its gross receipts and net income bases.
    pub fn birt_revenue(
        &self,
        gross_receipts: &BTreeMap<i32, f64>,
        net_income: &BTreeMap<i32, f64>,
    ) -> Result<BTreeMap<i32, f64>, FypError> {
        let schedule = self.schedule("BIRT")?;
        let (Some(gr_rates), Some(ni_rates)) = (
            schedule.component("gross_receipts"),
            schedule.component("net_income"),
        ) else {
            return Err(FypError::Schema(
                "BIRT rates need 'gross_receipts' and 'net_income' columns".to_string(),
            ));
        };
        let gr_rates = self.by_year(gr_rates);
        let ni_rates = self.by_year(ni_rates);
        let mut out = BTreeMap::new();
        for year in &self.fiscal_years {
            if let (Some(gr), Some(ni), Some(gr_rate), Some(ni_rate)) = (
                gross_receipts.get(year),
                net_income.get(year),
                gr_rates.get(year),
                ni_rates.get(year),
            ) {
                out.insert(*year, gr * gr_rate + ni * ni_rate);
            }
        }
        Ok(out)
    }

    /// Split plan BIRT revenue into `(gross_receipts, net_income)` parts per year.
    pub fn birt_components(&self) -> Result<BTreeMap<i32, (f64, f64)>, FypError> {
        let revenue = self.projected_revenues("BIRT")?;
        Ok(self
            .fiscal_years
            .iter()
            .zip(&self.birt_splits.net_income_fraction)
            .filter_map(|(year, pct)| {
                revenue.get(year).map(|r| {
                    let ni = r * pct / 100.0;
                    (*year, (r - ni, ni))
                })
            })
            .collect())
    }

    /// Outer join of plan revenues with `projected` revenues by fiscal year.
    pub fn budget_comparison(
        &self,
        tax: &str,
        projected: &BTreeMap<i32, f64>,
    ) -> Result<Vec<BudgetComparison>, FypError> {
        let plan = self.projected_revenues(tax)?;
        let years: BTreeSet<i32> = plan.keys().chain(projected.keys()).copied().collect();
        Ok(years
            .into_iter()
            .filter_map(|year| {
                let proj = projected.get(&year).copied();
                let five_year_plan = plan.get(&year).copied().or(proj)?;
                Some(BudgetComparison {
                    fiscal_year: year,
                    five_year_plan,
                    projected: proj,
                })
            })
            .collect())
    }

    fn schedule(&self, tax: &str) -> Result<&RateSchedule, FypError> {
        check_tax_name(tax)?;
        self.rates
            .get(tax)
            .ok_or_else(|| FypError::UnknownColumn(format!("{tax} rates")))
    }

    fn by_year(&self, values: &[f64]) -> BTreeMap<i32, f64> {
        self.fiscal_years.iter().copied().zip(values.iter().copied()).collect()
    }
}

fn check_tax_name(name: &str) -> Result<(), FypError> {
    if TAX_NAMES.contains(&name) {
        Ok(())
    } else {
        Err(FypError::Schema(format!(
            "unknown tax '{name}'; valid names: {}",
            TAX_NAMES.join(", ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const PLAN_JSON: &str = r#"{
        "kind": "Adopted",
        "fiscal_years": [2025, 2026, 2027, 2028, 2029],
        "revenues": {
            "Wage": [100.0, 102.0, 104.0, 106.0, 108.0],
            "Sales": [50.0, 51.0, 52.0, 53.0, 54.0],
            "BIRT": [40.0, 40.0, 40.0, 40.0, 40.0]
        },
        "rates": {
            "Sales": [0.02, 0.02, 0.02, 0.02, 0.02],
            "Wage": {
                "resident": [0.0375, 0.0375, 0.037, 0.037, 0.0365],
                "nonresident": [0.0344, 0.0344, 0.034, 0.034, 0.0335]
            },
            "BIRT": {
                "gross_receipts": [0.001, 0.001, 0.001, 0.001, 0.001],
                "net_income": [0.058, 0.058, 0.057, 0.057, 0.056]
            }
        },
        "resident_fractions": {"Wage": 0.6, "NPT": 0.5},
        "birt_splits": {"net_income_fraction": [60.0, 60.0, 62.0, 62.0, 64.0]}
    }"#;

    fn plan() -> PlanDetails {
        PlanDetails::from_json_reader(PLAN_JSON.as_bytes()).unwrap()
    }

    #[test]
    fn test_load_and_label() {
        let plan = plan();
        assert_eq!(plan.kind, PlanKind::Adopted);
        assert_eq!(plan.label(), "FY25-FY29 Adopted");
        assert_eq!(plan.birt_splits.gross_receipts_fraction()[4], 36.0);
    }

    #[test]
    fn test_invalid_kind_rejected() {
        let bad = PLAN_JSON.replace("Adopted", "Draft");
        assert!(matches!(
            PlanDetails::from_json_reader(bad.as_bytes()),
            Err(FypError::Schema(_))
        ));
    }

    #[test]
    fn test_validation_errors() {
        let mut p = plan();
        p.fiscal_years.pop();
        assert!(matches!(p.validate(), Err(FypError::Schema(_))));

        let mut p = plan();
        p.fiscal_years[2] = 2030;
        assert!(p.validate().is_err());

        let mut p = plan();
        p.revenues.insert("Sales".into(), vec![1.0; 4]);
        assert!(p.validate().is_err());

        let mut p = plan();
        p.revenues.insert("Tolls".into(), vec![1.0; 5]);
        assert!(p.validate().is_err());

        let mut p = plan();
        p.rates.insert("Parking".into(), RateSchedule::Flat(vec![0.2; 6]));
        assert!(p.validate().is_err());

        let mut p = plan();
        p.resident_fractions.npt = 1.5;
        assert!(p.validate().is_err());

        let mut p = plan();
        p.birt_splits.net_income_fraction[0] = 120.0;
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_flat_effective_rate() {
        let rates = plan().effective_rates("Sales").unwrap();
        assert_eq!(rates.len(), 5);
        assert_relative_eq!(rates[&2027], 0.02);
    }

    #[test]
    fn test_wage_rate_blends_and_removes_pica() {
        let rates = plan().effective_rates("Wage").unwrap();
        let expected = (0.0375 - 0.015) * 0.6 + 0.0344 * 0.4;
        assert_relative_eq!(rates[&2025], expected, epsilon = 1e-12);
    }

    #[test]
    fn test_missing_rates() {
        let p = plan();
        assert!(matches!(
            p.effective_rates("Parking"),
            Err(FypError::UnknownColumn(_))
        ));
        assert!(matches!(p.effective_rates("BIRT"), Err(FypError::Schema(_))));
        assert!(matches!(
            p.revenue_from_base("BIRT", &BTreeMap::new()),
            Err(FypError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_budget_comparison_outer_join() {
        let p = plan();
        let base: BTreeMap<i32, f64> = [(2024, 2400.0), (2025, 2500.0), (2026, 2600.0)]
            .into_iter()
            .collect();
        let revenue = p.revenue_from_base("Sales", &base).unwrap();
        // 2024 has no plan rate.
        assert_eq!(revenue.len(), 2);
        assert_relative_eq!(revenue[&2025], 50.0);

        let mut projected = revenue.clone();
        projected.insert(2024, 47.0);
        let rows = p.budget_comparison("Sales", &projected).unwrap();
        assert_eq!(rows.len(), 6);
        assert_eq!(rows[0].fiscal_year, 2024);
        assert_relative_eq!(rows[0].five_year_plan, 47.0);
        assert_relative_eq!(rows[2].projected.unwrap(), 52.0);
        assert_relative_eq!(rows[2].five_year_plan, 51.0);
        assert_eq!(rows[5].projected, None);
    }

    #[test]
    fn test_birt_revenue_and_components() {
        let p = plan();
        let gr: BTreeMap<i32, f64> = [(2025, 10_000.0)].into_iter().collect();
        let ni: BTreeMap<i32, f64> = [(2025, 500.0)].into_iter().collect();
        let revenue = p.birt_revenue(&gr, &ni).unwrap();
        assert_relative_eq!(revenue[&2025], 10.0 + 29.0, epsilon = 1e-9);

        let parts = p.birt_components().unwrap();
        let (gross, net) = parts[&2025];
        assert_relative_eq!(gross, 16.0, epsilon = 1e-12);
        assert_relative_eq!(net, 24.0, epsilon = 1e-12);
    }
}
