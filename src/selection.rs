use std::cmp::Ordering;

use tracing::debug;

use crate::causality::CausalityMatrix;
use crate::types::{FypError, SelectorOptions};

/// Candidate endogenous regressors for one target, strongest first.
#[derive(Clone, Debug, PartialEq)]
pub struct CandidateEndogenousSet {
    pub target: String,
    /// `(feature, p_value)` of `feature -> target`, ascending p-value then name.
    pub candidates: Vec<(String, f64)>,
}

impl CandidateEndogenousSet {
    pub fn names(&self) -> Vec<String> {
        self.candidates.iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

/// Picks endogenous partners for a target from a [`CausalityMatrix`].
#[derive(Clone, Debug, Default)]
pub struct EndogenousVariableSelector {
    pub options: SelectorOptions,
}

impl EndogenousVariableSelector {
    pub fn new(options: SelectorOptions) -> Self {
        Self { options }
    }

    /// Features whose tested `feature -> target` p-value is below `alpha`.
    ///
    /// With `require_feedback`, `target -> feature` must be significant as well.
    pub fn select(
        &self,
        target: &str,
        matrix: &CausalityMatrix,
    ) -> Result<CandidateEndogenousSet, FypError> {
        let alpha = self.options.alpha;
        // Validates the target name even when no candidate qualifies.
        matrix.cell(target, target)?;

        let mut candidates = Vec::new();
        for feature in matrix.features() {
            if feature == target {
                continue;
            }
            let Some(p) = matrix.p_value(feature, target)? else {
                continue;
            };
            if p >= alpha {
                continue;
            }
            if self.options.require_feedback && !matrix.is_significant(target, feature, alpha)? {
                debug!(
                    candidate = feature.as_str(),
                    endog = target,
                    "dropped one-way candidate"
                );
                continue;
            }
            candidates.push((feature.clone(), p));
        }
        candidates.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        Ok(CandidateEndogenousSet {
            target: target.to_string(),
            candidates,
        })
    }

    pub fn select_many(
        &self,
        targets: &[String],
        matrix: &CausalityMatrix,
    ) -> Result<Vec<CandidateEndogenousSet>, FypError> {
        targets.iter().map(|t| self.select(t, matrix)).collect()
    }
}

/// Pool members that Granger-cause every endogenous column without being caused by any.
///
/// Returned in name order. An empty `endog_cols` admits nothing.
pub fn possible_exog(
    matrix: &CausalityMatrix,
    endog_cols: &[String],
    exog_pool: &[String],
    alpha: f64,
) -> Result<Vec<String>, FypError> {
    if endog_cols.is_empty() {
        return Ok(Vec::new());
    }
    let mut allowed = Vec::new();
    for candidate in exog_pool {
        if endog_cols.contains(candidate) {
            continue;
        }
        let mut keep = true;
        for endog in endog_cols {
            if !matrix.is_significant(candidate, endog, alpha)?
                || matrix.is_significant(endog, candidate, alpha)?
            {
                keep = false;
                break;
            }
        }
        if keep {
            allowed.push(candidate.clone());
        }
    }
    allowed.sort();
    allowed.dedup();
    Ok(allowed)
}
