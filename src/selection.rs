//! Ranking of fitted combinations and selection of the circular candidate.

use crate::circularity::CircularityError;
use std::cmp::Ordering;

/// One fitted feature combination.
#[derive(Debug, Clone)]
pub struct FitResult<M> {
    pub combination: Vec<String>,
    pub model: M,
    /// Deviance explained as a whole percentage.
    pub deviance_explained_pct: i64,
    pub effective_dof: f64,
    /// Position of the combination in enumeration order.
    pub enumeration_index: usize,
}

/// Rounds a deviance-explained fraction to a whole percentage, ties to even.
pub fn deviance_explained_pct(fraction: f64) -> i64 {
    (fraction * 100.0).round_ties_even() as i64
}

/// Ranking order: higher deviance explained first, then lower effective dof,
/// then earlier enumeration.
pub fn rank_order<M>(a: &FitResult<M>, b: &FitResult<M>) -> Ordering {
    b.deviance_explained_pct
        .cmp(&a.deviance_explained_pct)
        .then_with(|| a.effective_dof.total_cmp(&b.effective_dof))
        .then_with(|| a.enumeration_index.cmp(&b.enumeration_index))
}

pub fn rank_results<M>(mut results: Vec<FitResult<M>>) -> Vec<FitResult<M>> {
    results.sort_by(rank_order);
    results
}

/// Returns the top of `ranking` after checking that no other combination with
/// the same deviance explained is simpler.
///
/// A violation (including a NaN effective dof) means the best-fitting model is
/// not the most parsimonious among equals and fails with
/// [`CircularityError::CircularityAssumption`].
pub fn select_candidate<M>(ranking: &[FitResult<M>]) -> Result<&FitResult<M>, CircularityError> {
    let best = ranking.first().ok_or_else(|| {
        CircularityError::InvalidInput("no fitted combinations to select from".to_string())
    })?;
    for other in ranking.iter().skip(1) {
        if other.deviance_explained_pct != best.deviance_explained_pct {
            continue;
        }
        if !(best.effective_dof <= other.effective_dof) {
            return Err(CircularityError::CircularityAssumption {
                best: best.combination.clone(),
                best_dof: best.effective_dof,
                other: other.combination.clone(),
                other_dof: other.effective_dof,
                deviance_explained_pct: best.deviance_explained_pct,
            });
        }
    }
    Ok(best)
}
