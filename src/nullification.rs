//! Detection of features whose fitted contribution is flat.

use crate::model::{AdditiveModel, ModelFitError};
use ndarray::ArrayView1;

/// Grid resolution used when sampling a term's partial dependence.
pub const DEFAULT_GRID_POINTS: usize = 100;

/// Population standard deviation (`ddof = 0`).
pub fn population_std(values: ArrayView1<'_, f64>) -> f64 {
    let Some(mean) = values.mean() else {
        return 0.0;
    };
    values.mapv(|v| (v - mean).powi(2)).mean().unwrap_or(0.0).sqrt()
}

/// Features of `full_model` whose partial dependence over their grid has a
/// standard deviation strictly below `threshold`, in `full_features` order.
///
/// Term `i` of `full_model` must be the term for `full_features[i]`.
pub fn check_nullification<M: AdditiveModel + ?Sized>(
    full_model: &M,
    full_features: &[String],
    threshold: f64,
) -> Result<Vec<String>, ModelFitError> {
    if full_model.num_terms() != full_features.len() {
        return Err(ModelFitError::InvalidInput(format!(
            "model has {} terms but {} features were given",
            full_model.num_terms(),
            full_features.len()
        )));
    }
    let mut nullified = Vec::new();
    for (term, feature) in full_features.iter().enumerate() {
        let grid = full_model.term_grid(term, DEFAULT_GRID_POINTS)?;
        let pdep = full_model.partial_dependence(term, grid.view())?;
        let spread = population_std(pdep.view());
        log::debug!("partial dependence std of '{feature}': {spread:.3e}");
        if spread < threshold {
            nullified.push(feature.clone());
        }
    }
    Ok(nullified)
}
